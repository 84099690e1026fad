use std::path::PathBuf;

use crate::{PoolId, Result, ShardId};

/// Locates the file that holds the part of a pool owned by a specific shard.
#[cfg_attr(test, mockall::automock)]
pub trait TargetFiles: Send + Sync {
    /// Returns the path of the storage file for `pool` on `shard`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be determined.
    fn resolve_path(&self, pool: PoolId, shard: ShardId) -> Result<PathBuf>;
}
