//! Store Backend: one capability trait, two implementations.
//!
//! [`StoreBackend`] is the single abstract interface every other component
//! talks to. No caller above this module is allowed to know whether it is
//! talking to Redis Streams or a JSON file — the choice is
//! configuration-only.

pub mod file;
pub mod remote;

use async_trait::async_trait;

use crate::error::Result;

/// One message read back from a channel: its raw bytes and the per-channel
/// sequence number it was published with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Raw envelope bytes, as passed to [`StoreBackend::publish`].
    pub data: Vec<u8>,
    /// Unix-epoch milliseconds at publish time.
    pub ts_millis: i64,
    /// Per-channel sequence number assigned by the store.
    pub seq: u64,
}

/// A lazily-advancing read cursor over one channel, scoped to one consumer.
/// Restartable: constructing a new cursor for the same `client_id` resumes
/// from the last acknowledged position recorded by the store.
#[async_trait]
pub trait SubscriptionCursor: Send + Sync {
    /// Reads any messages published since this cursor's last read, advancing
    /// the cursor past them. Returns an empty vector if none are available.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PowerModeError::Transport`],
    /// [`crate::error::PowerModeError::StoreBusy`], or
    /// [`crate::error::PowerModeError::StoreUnavailable`] per the backend's
    /// failure modes.
    async fn poll(&mut self) -> Result<Vec<StoredMessage>>;
}

/// The single capability set both store implementations expose.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Fire-and-forget publish; at-least-once delivery, per-channel
    /// best-effort ordering.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn publish(&self, channel: &str, bytes: &[u8]) -> Result<()>;

    /// Opens a restartable cursor over `channel` for `client_id`.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn subscribe(
        &self,
        channel: &str,
        client_id: &str,
    ) -> Result<Box<dyn SubscriptionCursor>>;

    /// Sets `key` to `bytes`, with an optional TTL.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn set(&self, key: &str, bytes: &[u8], ttl_seconds: Option<u64>) -> Result<()>;

    /// Reads `key`, or `None` if absent or lazily expired.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Compare-and-swap: sets `key` to `new` iff its current value equals
    /// `expected` (`None` meaning "absent"). Returns whether the swap
    /// happened. The coordinator lease is built entirely on this primitive.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool>;

    /// Sets one field of a hash.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn hset(&self, name: &str, field: &str, bytes: &[u8]) -> Result<()>;

    /// Reads one field of a hash.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn hget(&self, name: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// Reads every field of a hash.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn hgetall(&self, name: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Pushes `bytes` onto the head of a list.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn lpush(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Pops one value from the tail of a list, if any.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn rpop(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Reads a range `[start, stop]` of a list without removing elements.
    /// Negative indices count from the end, as in Redis `LRANGE`.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn lrange(&self, name: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;

    /// Appends an entry to an append-only stream (the activity ledger).
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn xadd(&self, stream: &str, bytes: &[u8]) -> Result<String>;

    /// Reads a range of stream entries between two ids (`"-"`/`"+"` meaning
    /// unbounded, as in Redis `XRANGE`).
    ///
    /// # Errors
    ///
    /// See [`SubscriptionCursor::poll`].
    async fn xrange(&self, stream: &str, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// True if this backend is the remote (networked) implementation.
    fn is_remote(&self) -> bool;
}
