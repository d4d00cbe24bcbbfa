use std::net::SocketAddr;

use anyhow::{Result, anyhow, ensure};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("body exceeds configured limit of {limit} bytes")]
pub struct BodyTooLarge {
    pub limit: usize,
    pub bytes_read: u64,
}

#[derive(Debug, Error)]
#[error("{section} exceeds configured limit of {limit} bytes")]
pub struct HeaderTooLarge {
    pub section: &'static str,
    pub limit: usize,
}

#[derive(Debug, Error)]
#[error("line from {peer} exceeds configured limit of {limit} bytes")]
pub struct LineTooLong {
    pub peer: SocketAddr,
    pub limit: usize,
}

/// Tracks cumulative payload bytes and enforces a configured limit.
pub struct BodySizeTracker {
    max_bytes: usize,
    total_bytes: u64,
}

impl BodySizeTracker {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            total_bytes: 0,
        }
    }

    pub fn record(&mut self, chunk_len: usize) -> Result<()> {
        if chunk_len == 0 {
            return Ok(());
        }
        let too_large = BodyTooLarge {
            limit: self.max_bytes,
            bytes_read: self.total_bytes,
        };
        self.total_bytes = self
            .total_bytes
            .checked_add(chunk_len as u64)
            .ok_or(too_large)?;
        if self.total_bytes > self.max_bytes as u64 {
            return Err(BodyTooLarge {
                limit: self.max_bytes,
                bytes_read: self.total_bytes,
            }
            .into());
        }
        Ok(())
    }
}

/// Enforces a maximum number of header bytes while parsing.
pub struct HeaderBudget {
    limit: usize,
    used: usize,
    section: &'static str,
}

impl HeaderBudget {
    pub fn new(limit: usize, section: &'static str) -> Result<Self> {
        ensure!(limit > 0, "header limit must be greater than zero");
        Ok(Self {
            limit,
            used: 0,
            section,
        })
    }

    pub fn record(&mut self, bytes: usize) -> Result<()> {
        self.used = self
            .used
            .checked_add(bytes)
            .ok_or_else(|| anyhow!("header size overflow"))?;
        if self.used > self.limit {
            return Err(self.exceeded().into());
        }
        Ok(())
    }

    pub fn exceeded(&self) -> HeaderTooLarge {
        HeaderTooLarge {
            section: self.section,
            limit: self.limit,
        }
    }

    /// Bytes still available, for capping the next line read.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_rejects_bytes_past_limit() {
        let mut tracker = BodySizeTracker::new(8);
        tracker.record(5).unwrap();
        tracker.record(3).unwrap();
        let err = tracker.record(1).expect_err("over limit");
        let too_large = err.downcast::<BodyTooLarge>().expect("typed error");
        assert_eq!(too_large.limit, 8);
        assert_eq!(too_large.bytes_read, 9);
    }

    #[test]
    fn budget_overflow_is_typed() {
        let mut budget = HeaderBudget::new(10, "test headers").unwrap();
        budget.record(6).unwrap();
        assert_eq!(budget.remaining(), 4);
        let err = budget.record(6).expect_err("over budget");
        assert_eq!(
            err.to_string(),
            "test headers exceeds configured limit of 10 bytes"
        );
        let too_large = err.downcast::<HeaderTooLarge>().expect("typed error");
        assert_eq!(too_large.limit, 10);
        assert!(HeaderBudget::new(0, "x").is_err());
    }
}
