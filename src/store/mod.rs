use async_trait::async_trait;
use std::time::Duration;
use crate::error::StoreError;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Result of an atomic counter decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterValue {
    /// Value after the decrement. Zero means the key was deleted.
    Remaining(u64),
    /// The key did not exist.
    Absent,
    /// The stored value was not a number and has been deleted.
    Corrupt,
}

// --- Interface ---

/// Every operation the coordination layer performs against the shared store.
///
/// Each method is a single round trip and atomic on the store side. Anything
/// that reads and then writes shared state goes through one of the
/// conditional methods (`set_if_absent`, `delete_if_equals`,
/// `expire_if_equals`, `decrement_counter`) instead of a local read followed
/// by a separate write.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Values in the same order as `keys`; missing keys yield `None`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    /// Returns how many of the keys existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    // Lists. Producers push at the head, consumers pop at the tail.
    async fn push_head(&self, list: &str, value: &str) -> Result<(), StoreError>;
    async fn pop_tail(&self, list: &str) -> Result<Option<String>, StoreError>;
    /// Pops the tail of `source` and pushes it on the head of `destination` atomically.
    async fn pop_tail_push_head(&self, source: &str, destination: &str) -> Result<Option<String>, StoreError>;
    /// Removes one occurrence of `value`. Returns the number removed.
    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, StoreError>;
    async fn list_len(&self, list: &str) -> Result<usize, StoreError>;

    // Unordered sets.
    async fn set_add(&self, set: &str, member: &str) -> Result<(), StoreError>;
    async fn set_remove(&self, set: &str, member: &str) -> Result<(), StoreError>;
    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError>;

    // Sorted index (member -> score). Ranges are inclusive on both ends.
    async fn index_put(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError>;
    async fn index_range_desc(&self, index: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError>;
    async fn index_range_asc(&self, index: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError>;
    async fn index_remove(&self, index: &str, members: &[String]) -> Result<usize, StoreError>;
    async fn index_len(&self, index: &str) -> Result<usize, StoreError>;

    /// Decrements a numeric counter, deleting it when it reaches zero.
    async fn decrement_counter(&self, key: &str) -> Result<CounterValue, StoreError>;
}
