#![deny(unsafe_code)]

//! Durable key-value cache shared by the chat store and preference layers.
//!
//! Keys are logically partitioned (conversation list, active id, one message
//! log per conversation) and every entry is independently removable. The
//! contract is deliberately lossy on failure: reads of corrupt entries fall
//! back and discard the entry, writes degrade to a logged no-op. Callers are
//! responsible for payload size.

pub mod dir;
pub mod memory;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use dir::DirCache;
pub use memory::MemoryCache;

/// String key-value store with enumerable keys.
///
/// Object-safe on purpose so the chat store can hold an `Arc<dyn Cache>`
/// and tests can swap the filesystem backend for an in-memory one.
pub trait Cache: Send + Sync {
    /// Returns the raw value for `key`, or `None` when absent.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`. Never fails; backends log and drop the
    /// write when the underlying medium refuses it.
    fn set(&self, key: &str, value: &str);

    /// Removes `key`. Removing an absent key is a no-op.
    fn remove(&self, key: &str);

    /// Returns every stored key, in no particular order.
    fn keys(&self) -> Vec<String>;
}

/// Reads a JSON entry, returning `fallback` when the key is absent.
///
/// A value that fails to decode is treated as corruption: the entry is
/// removed so the next read starts clean, and `fallback` is returned. This
/// never propagates an error to the caller.
pub fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str, fallback: T) -> T {
    let Some(raw) = cache.get(key) else {
        return fallback;
    };

    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(key, error = %error, "discarding corrupt cache entry");
            cache.remove(key);
            fallback
        }
    }
}

/// Writes a value as JSON. Serialization failures are logged and dropped so
/// a single unencodable record cannot poison the caller's commit path.
pub fn set_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(raw) => cache.set(key, &raw),
        Err(error) => {
            tracing::warn!(key, error = %error, "failed to encode cache entry");
        }
    }
}
