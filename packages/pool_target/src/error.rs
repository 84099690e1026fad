use thiserror::Error;

use crate::{Capabilities, HandleId, MapVersion, PoolId, ShardId};

/// Errors reported by pool target operations and by the external services they consult.
///
/// Conditions that indicate corrupted internal state (reference count underflow, a failed
/// teardown on a shard, removing a handle that is not in the table) are not represented here.
/// Those abort the operation with a panic instead.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A lookup that was not allowed to create anything did not find the pool.
    #[error("pool {0} is not cached on this target")]
    PoolNotFound(PoolId),

    /// A shard has no local child for a pool that was expected to be open there.
    #[error("pool {pool} is not open on shard {shard}")]
    ChildNotFound {
        /// The pool that was looked up.
        pool: PoolId,

        /// The shard that was consulted.
        shard: ShardId,
    },

    /// A handle with the same identifier already exists.
    #[error("pool handle {handle} already exists with capabilities {existing}")]
    AlreadyExists {
        /// The conflicting handle identifier.
        handle: HandleId,

        /// The capabilities of the handle that is already in the table.
        existing: Capabilities,
    },

    /// The request was malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Memory or another bounded resource ran out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The target file of a pool could not be located for a shard.
    #[error("cannot resolve the target file of pool {pool} for shard {shard}: {reason}")]
    TargetFile {
        /// The pool whose file was requested.
        pool: PoolId,

        /// The shard the file belongs to.
        shard: ShardId,

        /// Human-readable description supplied by the resolver.
        reason: String,
    },

    /// The storage engine failed to open a pool.
    #[error("storage engine failed to open pool {pool}: {reason}")]
    Storage {
        /// The pool that was being opened.
        pool: PoolId,

        /// Human-readable description supplied by the storage engine.
        reason: String,
    },

    /// A placement map buffer could not be decoded.
    #[error("cannot decode placement map version {version}: {reason}")]
    PlacementMap {
        /// The version the buffer claimed to carry.
        version: MapVersion,

        /// Human-readable description supplied by the codec.
        reason: String,
    },

    /// The group service rejected a request.
    #[error("group operation for pool {pool} failed: {reason}")]
    Group {
        /// The pool the group belongs to.
        pool: PoolId,

        /// Human-readable description supplied by the group service.
        reason: String,
    },

    /// A shard worker is no longer accepting work because the target is shutting down.
    #[error("shard {0} is not running")]
    ShardUnavailable(ShardId),
}

/// A specialized `Result` type for pool target operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T, E = Error> = std::result::Result<T, E>;
