//! Execution shards and the state each of them owns.

mod child;
mod executor;

use std::cell::Cell;

pub use child::*;
pub use executor::*;

use crate::ShardId;

thread_local! {
    static CURRENT_SHARD: Cell<Option<ShardId>> = const { Cell::new(None) };
}

/// Returns the shard the current thread is the worker of, if any.
#[must_use]
pub fn current_shard() -> Option<ShardId> {
    CURRENT_SHARD.with(Cell::get)
}

/// State owned by one shard worker, handed to every task that runs on that shard.
#[derive(Debug)]
pub struct ShardContext {
    registry: ChildRegistry,
}

impl ShardContext {
    pub(crate) fn new(registry: ChildRegistry) -> Self {
        Self { registry }
    }

    /// The shard this context belongs to.
    #[must_use]
    pub fn shard(&self) -> ShardId {
        self.registry.shard()
    }

    /// The pools open on this shard.
    #[must_use]
    pub fn registry(&self) -> &ChildRegistry {
        &self.registry
    }

    /// The pools open on this shard, for tasks that open or close pools.
    #[must_use]
    pub fn registry_mut(&mut self) -> &mut ChildRegistry {
        &mut self.registry
    }
}
