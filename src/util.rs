use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::time::{Instant, timeout};

#[derive(Debug, Error)]
#[error("timed out {context}")]
pub struct TimedOut {
    pub context: String,
}

/// Runs `future` under `duration`, turning both an elapsed deadline and an inner I/O error into
/// an `anyhow::Error` that names what was being attempted.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| TimedOut {
            context: context.clone(),
        })?
        .with_context(|| format!("failed while {context}"))
}

/// Time left before `deadline`, or an error naming the operation that ran out of time.
pub fn remaining_until(deadline: Instant, context: &str) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or_else(|| {
            TimedOut {
                context: context.to_string(),
            }
            .into()
        })
}
