use std::sync::Arc;

use nm::Event;
use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, error, warn};

use crate::metrics::{POOL_CREATE_FAILURES, POOLS_CREATED, POOLS_DESTROYED};
use crate::{
    Cacheable, Error, Group, GroupService, MapVersion, PlacementMap, PlacementMapCodec, PoolId,
    Result, ShardExecutor,
};

/// A pool as seen by this target.
///
/// At most one `Pool` exists per pool identifier. It is created by the pool cache on the first
/// lookup that supplies [`PoolCreateArgs`] and lives until the last reference is released and the
/// cache evicts it. While it lives, every shard has the pool open in its child registry.
#[derive(Debug)]
pub struct Pool {
    id: PoolId,
    map_version: RwLock<MapVersion>,

    // Both are fixed at creation. Only the state behind them may change.
    map: Option<Box<dyn PlacementMap>>,
    group: Option<Group>,
}

impl Pool {
    /// The identifier of the pool.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// The pool map version most recently propagated to this target.
    #[must_use]
    pub fn map_version(&self) -> MapVersion {
        *self.map_version.read()
    }

    /// Locks the pool-wide map version for an update.
    ///
    /// The guard is held while the new version is propagated to the shards, so concurrent
    /// updates of the same pool are serialized and readers never see the pool-wide version
    /// disagree with the shards once an update has completed.
    pub(crate) fn lock_map_version(&self) -> RwLockWriteGuard<'_, MapVersion> {
        self.map_version.write()
    }

    /// The placement map decoded when the pool was created, if a map was supplied.
    #[must_use]
    pub fn placement_map(&self) -> Option<&dyn PlacementMap> {
        self.map.as_deref()
    }

    /// The group formed for the pool, if one was requested at creation.
    #[must_use]
    pub fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }
}

/// What the pool cache needs to create a pool that is not cached yet.
#[derive(Clone, Debug, Default)]
pub struct PoolCreateArgs {
    map_buffer: Option<Box<[u8]>>,
    map_version: MapVersion,
    create_group: bool,
}

impl PoolCreateArgs {
    /// Arguments for a pool without a placement map or group, starting at `map_version`.
    #[must_use]
    pub fn new(map_version: MapVersion) -> Self {
        Self {
            map_buffer: None,
            map_version,
            create_group: false,
        }
    }

    /// Decodes the placement map of the pool from `buffer` when the pool is created.
    #[must_use]
    pub fn with_map(mut self, buffer: impl Into<Box<[u8]>>) -> Self {
        self.map_buffer = Some(buffer.into());
        self
    }

    /// Forms the group of the pool when it is created. Requires a placement map.
    #[must_use]
    pub fn with_group(mut self) -> Self {
        self.create_group = true;
        self
    }

    /// The map version the pool starts at.
    #[must_use]
    pub fn map_version(&self) -> MapVersion {
        self.map_version
    }
}

/// The collaborators the pool cache uses to bring pools up and down.
#[derive(derive_more::Debug)]
pub struct PoolServices {
    shards: Arc<ShardExecutor>,

    #[debug(ignore)]
    placement_maps: Arc<dyn PlacementMapCodec>,

    #[debug(ignore)]
    groups: Arc<dyn GroupService>,
}

impl PoolServices {
    pub(crate) fn new(
        shards: Arc<ShardExecutor>,
        placement_maps: Arc<dyn PlacementMapCodec>,
        groups: Arc<dyn GroupService>,
    ) -> Self {
        Self {
            shards,
            placement_maps,
            groups,
        }
    }

    /// The shards every pool is opened on.
    #[must_use]
    pub fn shards(&self) -> &ShardExecutor {
        &self.shards
    }
}

impl Cacheable for Pool {
    type Key = PoolId;
    type CreateArgs = PoolCreateArgs;
    type Context = PoolServices;

    fn create(id: PoolId, args: &PoolCreateArgs, services: &PoolServices) -> Result<Self> {
        create_pool(id, args, services)
            .inspect(|_| POOLS_CREATED.with(Event::observe_once))
            .inspect_err(|_| POOL_CREATE_FAILURES.with(Event::observe_once))
    }

    fn destroy(&self, services: &PoolServices) {
        debug!(pool = %self.id, "destroying pool");

        if let Some(group) = &self.group {
            if let Err(error) = services.groups.destroy_group(self.id, group) {
                // The group service reclaims groups of pools that are gone, nothing to undo here.
                error!(pool = %self.id, %group, %error, "failed to destroy pool group");
            }
        }

        close_on_all_shards(&services.shards, self.id);

        POOLS_DESTROYED.with(Event::observe_once);
    }

    fn key(&self) -> PoolId {
        self.id
    }

    fn not_found(key: PoolId) -> Error {
        Error::PoolNotFound(key)
    }
}

fn create_pool(id: PoolId, args: &PoolCreateArgs, services: &PoolServices) -> Result<Pool> {
    if args.create_group && args.map_buffer.is_none() {
        return Err(Error::InvalidInput(format!(
            "cannot form a group for pool {id} without a placement map"
        )));
    }

    debug!(pool = %id, map_version = args.map_version, "creating pool");

    let map = args
        .map_buffer
        .as_deref()
        .map(|buffer| services.placement_maps.decode(buffer, args.map_version))
        .transpose()?;

    let map_version = args.map_version;
    if let Err(error) = services.shards.run_on_all_shards(move |context| {
        context
            .registry_mut()
            .create_if_absent(id, map_version)
    }) {
        error!(pool = %id, %error, "failed to open pool on every shard");
        close_on_all_shards(&services.shards, id);
        return Err(error);
    }

    let group = match map.as_deref() {
        Some(map) if args.create_group => match services.groups.create_group(id, map) {
            Ok(group) => Some(group),
            Err(error) => {
                error!(pool = %id, %error, "failed to form pool group");
                close_on_all_shards(&services.shards, id);
                return Err(error);
            }
        },
        _ => None,
    };

    Ok(Pool {
        id,
        map_version: RwLock::new(map_version),
        map,
        group,
    })
}

/// Removes the pool from the registry of every shard.
///
/// # Panics
///
/// Panics if a running shard fails to remove the pool. Shards that have already stopped are
/// skipped, as they purged their registries on the way out.
fn close_on_all_shards(shards: &ShardExecutor, pool: PoolId) {
    let result = shards.run_on_all_shards(move |context| {
        context.registry_mut().delete(pool);
        Ok(())
    });

    match result {
        Ok(()) => {}
        Err(Error::ShardUnavailable(shard)) => {
            warn!(pool = %pool, shard, "shard already stopped before the pool was closed");
        }
        Err(error) => panic!("failed to close pool {pool} on every shard: {error}"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::fake::{FakeGroups, FakePlacementMaps, FakeStorage, FakeTargetFiles};
    use crate::{MockPlacementMapCodec, ObjectCache, StorageEngine, TargetFiles};

    assert_impl_all!(Pool: Send, Sync);
    assert_impl_all!(PoolServices: Send, Sync);

    const POOL: PoolId = PoolId::new(0x51);

    struct Harness {
        storage: Arc<FakeStorage>,
        groups: Arc<FakeGroups>,
        cache: Arc<ObjectCache<Pool>>,
    }

    fn harness(placement_maps: Arc<dyn PlacementMapCodec>) -> Harness {
        let storage = Arc::new(FakeStorage::new());
        let groups = Arc::new(FakeGroups::new());

        let engine: Arc<dyn StorageEngine> = Arc::<FakeStorage>::clone(&storage);
        let target_files: Arc<dyn TargetFiles> = Arc::new(FakeTargetFiles::new());
        let shards = Arc::new(ShardExecutor::new(nz!(3), false, &engine, &target_files));

        let services = PoolServices::new(shards, placement_maps, Arc::<FakeGroups>::clone(&groups));

        Harness {
            storage,
            groups,
            cache: Arc::new(ObjectCache::new(services, 0)),
        }
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn create_opens_every_shard_and_eviction_closes_them() {
        let harness = harness(Arc::new(FakePlacementMaps::new()));

        let pool = harness
            .cache
            .lookup_or_create(POOL, Some(&PoolCreateArgs::new(4)))
            .unwrap();

        assert_eq!(pool.id(), POOL);
        assert_eq!(pool.map_version(), 4);
        assert!(pool.placement_map().is_none());
        assert!(pool.group().is_none());
        assert_eq!(harness.storage.open_count_for(POOL), 3);

        pool.release();

        assert_eq!(harness.storage.open_count(), 0);
        assert_eq!(harness.storage.close_calls(), 3);
        assert!(harness.cache.lookup(POOL).is_err());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn group_is_formed_from_decoded_map_and_dissolved_on_eviction() {
        let harness = harness(Arc::new(FakePlacementMaps::new()));
        let args = PoolCreateArgs::new(9).with_map(vec![1, 2, 3]).with_group();

        let pool = harness.cache.lookup_or_create(POOL, Some(&args)).unwrap();

        assert_eq!(pool.placement_map().unwrap().version(), 9);
        assert!(pool.group().is_some());
        assert_eq!(harness.groups.live_groups(), 1);

        drop(pool);

        assert_eq!(harness.groups.live_groups(), 0);
        assert_eq!(harness.groups.destroy_calls(), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn group_without_map_is_rejected() {
        let mut codec = MockPlacementMapCodec::new();
        codec.expect_decode().never();
        let harness = harness(Arc::new(codec));

        let error = harness
            .cache
            .lookup_or_create(POOL, Some(&PoolCreateArgs::new(1).with_group()))
            .unwrap_err();

        assert!(matches!(error, Error::InvalidInput(_)));
        assert_eq!(harness.storage.open_calls(), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn decode_failure_opens_nothing() {
        let harness = harness(Arc::new(FakePlacementMaps::new()));

        let error = harness
            .cache
            .lookup_or_create(POOL, Some(&PoolCreateArgs::new(2).with_map(Vec::new())))
            .unwrap_err();

        assert!(matches!(error, Error::PlacementMap { version: 2, .. }));
        assert_eq!(harness.storage.open_calls(), 0);
        assert!(harness.cache.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn group_failure_rolls_back_shards() {
        let harness = harness(Arc::new(FakePlacementMaps::new()));
        harness.groups.fail_creates(true);

        let args = PoolCreateArgs::new(1).with_map(vec![7]).with_group();
        let error = harness
            .cache
            .lookup_or_create(POOL, Some(&args))
            .unwrap_err();

        assert!(matches!(error, Error::Group { pool, .. } if pool == POOL));
        assert_eq!(harness.storage.open_calls(), 3);
        assert_eq!(harness.storage.open_count(), 0);
        assert!(harness.cache.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shard_open_failure_rolls_back_other_shards() {
        let harness = harness(Arc::new(FakePlacementMaps::new()));
        harness.storage.fail_next_opens(1);

        let error = harness
            .cache
            .lookup_or_create(POOL, Some(&PoolCreateArgs::new(1)))
            .unwrap_err();

        assert!(matches!(error, Error::Storage { pool, .. } if pool == POOL));
        assert_eq!(harness.storage.open_count(), 0);
        assert!(harness.cache.is_empty());

        // Nothing was left behind, so the next attempt starts from scratch.
        let pool = harness
            .cache
            .lookup_or_create(POOL, Some(&PoolCreateArgs::new(1)))
            .unwrap();
        assert_eq!(harness.storage.open_count_for(pool.id()), 3);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn group_destroy_failure_does_not_block_eviction() {
        let harness = harness(Arc::new(FakePlacementMaps::new()));
        harness.groups.fail_destroys(true);

        let args = PoolCreateArgs::new(1).with_map(vec![7]).with_group();
        drop(harness.cache.lookup_or_create(POOL, Some(&args)).unwrap());

        assert_eq!(harness.groups.destroy_calls(), 1);
        assert_eq!(harness.storage.open_count(), 0);
        assert!(harness.cache.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn map_version_lock_blocks_readers_until_released() {
        let harness = harness(Arc::new(FakePlacementMaps::new()));
        let pool = harness
            .cache
            .lookup_or_create(POOL, Some(&PoolCreateArgs::new(3)))
            .unwrap();

        let mut version = pool.lock_map_version();
        assert_eq!(*version, 3);
        *version = 8;
        assert!(pool.map_version.try_read().is_none());
        drop(version);

        assert_eq!(pool.map_version(), 8);
    }
}
