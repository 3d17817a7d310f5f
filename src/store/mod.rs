//! Key-value storage backing the job queue.
//!
//! The queue keeps no in-process state; everything lives behind [`JobStore`],
//! which offers per-key values with expiry, lists, sets, and atomic batches.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, used by tests and single-node deployments
//! - [`RedisStore`]: shared Redis instance (feature `redis`)

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    PushBack {
        list: String,
        value: String,
    },
    PushFront {
        list: String,
        value: String,
    },
    /// Keep only `start..=stop` of the list (Redis `LTRIM` indexing).
    Trim {
        list: String,
        start: i64,
        stop: i64,
    },
    SetAdd {
        set: String,
        member: String,
    },
    SetRemove {
        set: String,
        member: String,
    },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Pop the head of `list`. A zero `timeout` returns immediately; otherwise
    /// waits up to `timeout` for an element to arrive.
    async fn pop_front(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>>;

    async fn list_len(&self, list: &str) -> StoreResult<usize>;

    /// Elements `start..=stop`; negative indices count from the end.
    async fn list_range(&self, list: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    async fn set_card(&self, set: &str) -> StoreResult<usize>;

    async fn set_members(&self, set: &str) -> StoreResult<Vec<String>>;

    async fn ping(&self) -> StoreResult<()>;

    /// Apply every op or none of them.
    async fn execute(&self, ops: Vec<StoreOp>) -> StoreResult<()>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        self.execute(vec![StoreOp::Set {
            key: key.to_string(),
            value,
            ttl: Some(ttl),
        }])
        .await
    }

    async fn set_add(&self, set: &str, member: &str) -> StoreResult<()> {
        self.execute(vec![StoreOp::SetAdd {
            set: set.to_string(),
            member: member.to_string(),
        }])
        .await
    }

    async fn set_remove(&self, set: &str, member: &str) -> StoreResult<()> {
        self.execute(vec![StoreOp::SetRemove {
            set: set.to_string(),
            member: member.to_string(),
        }])
        .await
    }
}

/// Resolve Redis-style inclusive `start..=stop` indices against `len`.
/// Returns `None` when the range selects nothing.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
