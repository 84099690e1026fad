use std::num::NonZero;
use std::sync::Arc;
use std::thread;

use many_cpus::ProcessorSet;
use new_zealand::nz;
use tracing::{debug, error, warn};

use crate::{
    CacheRef, Error, GroupService, HandleId, HandleTable, ObjectCache, PlacementMapCodec, Pool,
    PoolCreateArgs, PoolHandle, PoolId, PoolServices, Result, ShardContext, ShardExecutor,
    StorageEngine, TargetFiles,
};

/// The pool and pool handle state of one storage target.
///
/// Owns the shard workers, the pool cache and the handle table, and serves the connect,
/// disconnect and map update requests that drive them (see the `handle_*` methods).
///
/// # Shutdown
///
/// Dropping the target (or calling [`shutdown()`][Self::shutdown]) unlinks every handle, evicts
/// every pool nobody else references and then stops the shard workers, which close whatever is
/// still open in their registries.
#[derive(Debug)]
pub struct PoolTarget {
    shards: Arc<ShardExecutor>,
    pools: Arc<ObjectCache<Pool>>,
    handles: HandleTable,
}

impl PoolTarget {
    /// Creates a builder for configuring the target.
    pub fn builder() -> PoolTargetBuilder {
        PoolTargetBuilder::new()
    }

    /// Number of shards pools are opened on.
    #[must_use]
    pub fn shard_count(&self) -> NonZero<usize> {
        self.shards.shard_count()
    }

    /// Returns the cached pool `id`, creating and opening it on every shard if it is missing and
    /// `args` is supplied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] if `args` is `None` and the pool is not cached, or the error
    /// that prevented the pool from being created.
    pub fn lookup_or_create_pool(
        &self,
        id: PoolId,
        args: Option<&PoolCreateArgs>,
    ) -> Result<CacheRef<Pool>> {
        self.pools.lookup_or_create(id, args).inspect_err(|error| {
            if args.is_none() {
                debug!(pool = %id, %error, "pool is not cached");
            } else {
                error!(pool = %id, %error, "failed to look up or create pool");
            }
        })
    }

    /// Returns the cached pool `id`, if it is cached.
    #[must_use]
    pub fn lookup_pool(&self, id: PoolId) -> Option<CacheRef<Pool>> {
        self.lookup_or_create_pool(id, None).ok()
    }

    /// Returns the connected handle `id`, if any.
    ///
    /// Pass the handle to [`HandleTable::release()`] (or drop it) when done.
    #[must_use]
    pub fn lookup_handle(&self, id: HandleId) -> Option<Arc<PoolHandle>> {
        self.handles.find(id)
    }

    /// The pool cache.
    #[must_use]
    pub fn pools(&self) -> &ObjectCache<Pool> {
        &self.pools
    }

    /// The handle table.
    #[must_use]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Runs `task` on every shard and waits for all of them. See
    /// [`ShardExecutor::run_on_all_shards()`].
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a shard.
    ///
    /// # Panics
    ///
    /// Panics if called from within a shard task.
    pub fn run_on_all_shards<F>(&self, task: F) -> Result<()>
    where
        F: Fn(&mut ShardContext) -> Result<()> + Send + Sync + 'static,
    {
        self.shards.run_on_all_shards(task)
    }

    /// Shuts the target down. Equivalent to dropping it.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for PoolTarget {
    #[cfg_attr(test, mutants::skip)] // Shutdown order is only observable through logs and fakes.
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }

        let purged_handles = self.handles.purge_all();
        let evicted_pools = self.pools.evict_idle();

        let remaining_pools = self.pools.len();
        if remaining_pools > 0 {
            // Whoever holds these will close them on release; the shards are gone by then.
            warn!(
                remaining_pools,
                "pools are still referenced while the pool target shuts down"
            );
        }

        self.shards.shutdown();

        debug!(purged_handles, evicted_pools, "pool target shut down");
    }
}

/// Builder for configuring a [`PoolTarget`].
///
/// The storage engine, target file resolver, placement map codec and group service must be
/// supplied. Everything else has a default.
#[derive(derive_more::Debug)]
#[must_use]
pub struct PoolTargetBuilder {
    shard_count: Option<NonZero<usize>>,
    pin_shards: bool,
    idle_pool_capacity: usize,

    #[debug(ignore)]
    storage: Option<Arc<dyn StorageEngine>>,

    #[debug(ignore)]
    target_files: Option<Arc<dyn TargetFiles>>,

    #[debug(ignore)]
    placement_maps: Option<Arc<dyn PlacementMapCodec>>,

    #[debug(ignore)]
    groups: Option<Arc<dyn GroupService>>,
}

impl PoolTargetBuilder {
    fn new() -> Self {
        Self {
            shard_count: None,
            pin_shards: true,
            idle_pool_capacity: 0,
            storage: None,
            target_files: None,
            placement_maps: None,
            groups: None,
        }
    }

    /// Sets the number of shards.
    ///
    /// Default is one shard per processor available to the process.
    pub fn shard_count(mut self, count: NonZero<usize>) -> Self {
        self.shard_count = Some(count);
        self
    }

    /// Sets whether each shard worker is pinned to its own processor.
    ///
    /// Default is `true`. If there are fewer processors than shards, the workers are not pinned.
    pub fn pin_shards(mut self, pin: bool) -> Self {
        self.pin_shards = pin;
        self
    }

    /// Sets how many unreferenced pools stay cached (and open on every shard) for reuse.
    ///
    /// Default is 0, which tears a pool down as soon as its last reference is released.
    pub fn idle_pool_capacity(mut self, capacity: usize) -> Self {
        self.idle_pool_capacity = capacity;
        self
    }

    /// Sets the storage engine that shards open pools with.
    pub fn storage(mut self, storage: Arc<dyn StorageEngine>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the resolver of per-shard pool file paths.
    pub fn target_files(mut self, target_files: Arc<dyn TargetFiles>) -> Self {
        self.target_files = Some(target_files);
        self
    }

    /// Sets the codec that decodes placement maps supplied at pool creation.
    pub fn placement_maps(mut self, placement_maps: Arc<dyn PlacementMapCodec>) -> Self {
        self.placement_maps = Some(placement_maps);
        self
    }

    /// Sets the service that forms and dissolves pool groups.
    pub fn groups(mut self, groups: Arc<dyn GroupService>) -> Self {
        self.groups = Some(groups);
        self
    }

    /// Starts the shard workers and builds the target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a collaborator was not supplied.
    pub fn build(self) -> Result<PoolTarget> {
        let storage = self.storage.ok_or_else(|| missing("storage engine"))?;
        let target_files = self.target_files.ok_or_else(|| missing("target file resolver"))?;
        let placement_maps = self
            .placement_maps
            .ok_or_else(|| missing("placement map codec"))?;
        let groups = self.groups.ok_or_else(|| missing("group service"))?;

        let shard_count = self.shard_count.unwrap_or_else(default_shard_count);

        let shards = Arc::new(ShardExecutor::new(
            shard_count,
            self.pin_shards,
            &storage,
            &target_files,
        ));

        let pools = Arc::new(ObjectCache::new(
            PoolServices::new(Arc::clone(&shards), placement_maps, groups),
            self.idle_pool_capacity,
        ));

        debug!(
            shard_count = shard_count.get(),
            idle_pool_capacity = self.idle_pool_capacity,
            "pool target started"
        );

        Ok(PoolTarget {
            shards,
            pools,
            handles: HandleTable::new(),
        })
    }
}

fn missing(collaborator: &str) -> Error {
    Error::InvalidInput(format!("pool target built without a {collaborator}"))
}

fn default_shard_count() -> NonZero<usize> {
    NonZero::new(ProcessorSet::default().len()).unwrap_or(nz!(1))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::fake::{FakeCollaborators, FakeStorage};

    assert_impl_all!(PoolTarget: Send, Sync);
    assert_impl_all!(PoolTargetBuilder: Send);

    const POOL: PoolId = PoolId::new(0x77);

    #[test]
    fn build_requires_every_collaborator() {
        let fakes = FakeCollaborators::new();

        let error = PoolTarget::builder()
            .storage(Arc::<FakeStorage>::clone(&fakes.storage))
            .build()
            .unwrap_err();

        assert!(matches!(error, Error::InvalidInput(message) if message.contains("target file")));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn builds_with_requested_shards() {
        let fakes = FakeCollaborators::new();
        let target = fakes
            .install(PoolTarget::builder())
            .shard_count(nz!(3))
            .pin_shards(false)
            .build()
            .unwrap();

        assert_eq!(target.shard_count(), nz!(3));
        assert!(target.pools().is_empty());
        assert!(target.handles().is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn lookup_pool_reports_missing_as_none() {
        let fakes = FakeCollaborators::new();
        let target = fakes
            .install(PoolTarget::builder())
            .shard_count(nz!(2))
            .pin_shards(false)
            .build()
            .unwrap();

        assert!(target.lookup_pool(POOL).is_none());

        let created = target
            .lookup_or_create_pool(POOL, Some(&PoolCreateArgs::new(1)))
            .unwrap();
        let found = target.lookup_pool(POOL).unwrap();

        assert!(CacheRef::ptr_eq(&created, &found));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn idle_pools_stay_open_until_shutdown() {
        let fakes = FakeCollaborators::new();
        let target = fakes
            .install(PoolTarget::builder())
            .shard_count(nz!(2))
            .pin_shards(false)
            .idle_pool_capacity(4)
            .build()
            .unwrap();

        drop(
            target
                .lookup_or_create_pool(POOL, Some(&PoolCreateArgs::new(1)))
                .unwrap(),
        );

        assert_eq!(target.pools().idle_count(), 1);
        assert_eq!(fakes.storage.open_count_for(POOL), 2);

        target.shutdown();

        assert_eq!(fakes.storage.open_count(), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn pool_outliving_target_is_closed_by_shard_shutdown() {
        let fakes = FakeCollaborators::new();
        let target = fakes
            .install(PoolTarget::builder())
            .shard_count(nz!(2))
            .pin_shards(false)
            .build()
            .unwrap();

        let pool = target
            .lookup_or_create_pool(POOL, Some(&PoolCreateArgs::new(1)))
            .unwrap();

        target.shutdown();
        assert_eq!(fakes.storage.open_count(), 0);

        // The shards are gone, so releasing the last reference only dissolves what is left.
        drop(pool);
        assert_eq!(fakes.storage.close_calls(), 2);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn default_shard_count_is_positive() {
        assert!(default_shard_count().get() >= 1);
    }
}
