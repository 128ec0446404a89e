//! Shared window store contract and backends.
//!
//! The rate limiter never synchronizes callers in-process; every cross-request
//! race is resolved by the store evaluating a window atomically. Backends must
//! therefore provide:
//!
//! - atomic evaluation of one bucket ([`WindowStore::evaluate`]),
//! - pipelined evaluation of many independent buckets in one round trip,
//! - pipelined counter/set/list updates for telemetry,
//! - exact-key deletion and per-key expiry.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::{WindowOutcome, WindowRequest};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors talking to the shared store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store connection failed: {0}")]
    Connection(String),

    /// A command did not complete within the client-side timeout
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected a command
    #[error("store command failed: {0}")]
    Command(String),

    /// The store answered with something we cannot interpret
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// An independent write issued as part of a telemetry pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Increment an integer counter, creating it at zero
    Incr {
        /// Counter key
        key: String,
        /// Increment
        by: u64,
    },
    /// Add a member to an unordered set
    SetAdd {
        /// Set key
        key: String,
        /// Member to add
        member: String,
    },
    /// Push a value onto the head of a list
    ListPush {
        /// List key
        key: String,
        /// Value to push
        value: String,
    },
    /// Keep only the first `keep` elements of a list
    ListTrim {
        /// List key
        key: String,
        /// Number of elements to keep
        keep: usize,
    },
}

/// Operational contract of the shared window store.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Evaluate one admission atomically.
    async fn evaluate(&self, request: &WindowRequest) -> Result<WindowOutcome, StoreError>;

    /// Evaluate many independent admissions in one round trip.
    ///
    /// Each request is still atomic on its own bucket; there is no ordering
    /// between requests. Outcomes are returned in request order.
    async fn evaluate_batch(
        &self,
        requests: &[WindowRequest],
    ) -> Result<Vec<WindowOutcome>, StoreError>;

    /// Delete exact keys. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Apply independent writes in one round trip.
    async fn pipeline(&self, ops: &[StoreOp]) -> Result<(), StoreError>;

    /// Read integer counters (missing counters read as zero).
    async fn counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError>;

    /// Read set cardinalities (missing sets read as zero).
    async fn set_cardinalities(&self, keys: &[String]) -> Result<Vec<u64>, StoreError>;

    /// Read up to `count` elements from the head of a list.
    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError>;
}
