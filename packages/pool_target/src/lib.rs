#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Pool and pool handle state of a storage target.
//!
//! A storage target serves the pools of a distributed storage system on a fixed set of shards,
//! each of which is a worker thread with its own storage engine handles. This package keeps track
//! of which pools are open on the target and which clients are connected to them, and keeps
//! every shard in step with that:
//!
//! * The [pool cache][ObjectCache] holds one [`Pool`] per pool identifier. The first lookup
//!   that supplies [`PoolCreateArgs`] opens the pool on every shard; releasing the last
//!   reference closes it on every shard again. Concurrent lookups of a missing pool open it once.
//! * The [`HandleTable`] holds the [`PoolHandle`] of every connected client. A handle keeps its
//!   pool cached for as long as the handle exists.
//! * Every shard has a [`ChildRegistry`] of the pools open on it, reachable only by running a
//!   task on the shard through [`ShardExecutor::run_on_all_shards()`].
//!
//! The control plane drives all of this with three requests: connect, disconnect and map update,
//! handled by [`PoolTarget::handle_connect()`], [`PoolTarget::handle_disconnect()`] and
//! [`PoolTarget::handle_update_map()`].
//!
//! # Example
//!
//! ```
//! use new_zealand::nz;
//! use pool_target::fake::FakeCollaborators;
//! use pool_target::{
//!     Capabilities, ConnectRequest, DisconnectRequest, HandleId, PoolId, PoolTarget,
//!     UpdateMapRequest,
//! };
//!
//! let fakes = FakeCollaborators::new();
//! let target = fakes
//!     .install(PoolTarget::builder())
//!     .shard_count(nz!(4))
//!     .build()
//!     .unwrap();
//!
//! let pool = PoolId::new(0x42);
//! let handle = HandleId::new(0x1);
//!
//! let connected = target.handle_connect(&ConnectRequest::new(
//!     pool,
//!     handle,
//!     Capabilities::READ_WRITE,
//!     1,
//! ));
//! assert!(connected.status().is_success());
//!
//! let updated = target.handle_update_map(&UpdateMapRequest::new(pool, 2));
//! assert!(updated.status().is_success());
//! assert_eq!(target.lookup_pool(pool).unwrap().map_version(), 2);
//!
//! let disconnected = target.handle_disconnect(&DisconnectRequest::new(pool, vec![handle]));
//! assert!(disconnected.status().is_success());
//! assert!(target.lookup_pool(pool).is_none());
//! ```
//!
//! # Failures
//!
//! Failures the control plane can act on (a pool that is not cached, a conflicting handle, a
//! storage open failure) are reported as [`Error`] and turned into a failed reply status by the
//! request handlers. Broken internal bookkeeping, such as a reference count underflow or a shard
//! that cannot close a pool, panics instead.

mod cache;
mod clients;
mod error;
mod handle;
mod handlers;
mod ids;
mod metrics;
mod pool;
mod rpc;
mod shard;
mod target;

pub mod fake;

pub use cache::*;
pub use clients::*;
pub use error::*;
pub use handle::*;
pub use ids::*;
pub use pool::*;
pub use rpc::*;
pub use shard::*;
pub use target::*;
