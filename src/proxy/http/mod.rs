pub(crate) mod body;
pub(crate) mod codec;
pub(crate) mod limits;
mod respond;
mod server;

pub use limits::BodyTooLarge;
pub use respond::{respond_with_access_log, send_response, shutdown_stream};
pub use server::serve_connection;
