use std::path::Path;

use crate::{PoolId, Result};

/// Opaque token for a pool opened by the storage engine on one shard.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StorageHandle(u64);

impl StorageHandle {
    /// Wraps a token issued by a storage engine.
    #[must_use]
    pub const fn new(token: u64) -> Self {
        Self(token)
    }

    /// Returns the token issued by the storage engine.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// The local storage engine that persists pool data on this target.
///
/// Every shard opens its own handle to every pool it participates in. A handle is closed exactly
/// once, when the last reference to the shard-local child that owns it goes away.
#[cfg_attr(test, mockall::automock)]
pub trait StorageEngine: Send + Sync {
    /// Opens the pool stored in the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or does not contain the expected pool.
    fn open(&self, path: &Path, pool: PoolId) -> Result<StorageHandle>;

    /// Closes a handle previously returned by [`open()`][Self::open].
    fn close(&self, handle: StorageHandle);
}
