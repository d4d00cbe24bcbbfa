//! Recorded exchanges and their on-disk representation.

mod codec;
mod key;
mod record;
mod store;
mod yaml;

pub use codec::{FIXTURE_EXTENSION, canonical_url, to_file_name};
pub use key::{CacheKey, body_digest};
pub use record::{ExchangeRecord, HeaderList};
pub use store::FixtureStore;
pub use yaml::{DocumentWriter, ScalarStyle};
