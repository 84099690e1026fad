use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use foldhash::{HashMap, HashMapExt};
use tracing::{debug, trace};

use crate::{
    Error, MapVersion, PoolId, Result, ShardId, StorageEngine, StorageHandle, TargetFiles,
};

/// The part of a pool that is open on one shard.
///
/// A child owns the storage engine handle of its shard. The handle is closed when the last
/// reference to the child is dropped, which normally happens when the pool is evicted from the
/// pool cache and every shard deletes its child.
#[derive(derive_more::Debug)]
pub struct PoolChild {
    pool: PoolId,
    shard: ShardId,
    map_version: Cell<MapVersion>,
    storage: StorageHandle,

    #[debug(ignore)]
    engine: Arc<dyn StorageEngine>,
}

impl PoolChild {
    /// The pool this child belongs to.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// The shard this child is open on.
    #[must_use]
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// The pool map version last propagated to this shard.
    #[must_use]
    pub fn map_version(&self) -> MapVersion {
        self.map_version.get()
    }

    /// The storage engine handle owned by this child.
    #[must_use]
    pub fn storage(&self) -> StorageHandle {
        self.storage
    }
}

impl Drop for PoolChild {
    fn drop(&mut self) {
        debug!(pool = %self.pool, shard = self.shard, "destroying pool child");
        self.engine.close(self.storage);
    }
}

/// Registry of the pools that are open on one shard.
///
/// The registry lives on its shard's worker thread and is only ever touched from there, so the
/// children are shared with `Rc` and no locking is involved. The registry itself holds one
/// reference to every child; lookups hand out additional references that the caller drops (or
/// passes to [`release()`][Self::release]) when done.
#[derive(derive_more::Debug)]
pub struct ChildRegistry {
    shard: ShardId,
    children: HashMap<PoolId, Rc<PoolChild>>,

    #[debug(ignore)]
    engine: Arc<dyn StorageEngine>,

    #[debug(ignore)]
    target_files: Arc<dyn TargetFiles>,
}

impl ChildRegistry {
    pub(crate) fn new(
        shard: ShardId,
        engine: Arc<dyn StorageEngine>,
        target_files: Arc<dyn TargetFiles>,
    ) -> Self {
        Self {
            shard,
            children: HashMap::new(),
            engine,
            target_files,
        }
    }

    /// The shard this registry belongs to.
    #[must_use]
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Number of pools open on this shard.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether no pool is open on this shard.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns a new reference to the child of `pool`, if the pool is open on this shard.
    #[must_use]
    pub fn lookup(&self, pool: PoolId) -> Option<Rc<PoolChild>> {
        self.children.get(&pool).map(Rc::clone)
    }

    /// Gives back a reference obtained from [`lookup()`][Self::lookup].
    ///
    /// If this was the last reference, the storage handle of the child is closed.
    pub fn release(&self, child: Rc<PoolChild>) {
        if Rc::strong_count(&child) == 1 {
            trace!(pool = %child.pool, shard = self.shard, "releasing last reference to pool child");
        }

        drop(child);
    }

    /// Opens `pool` on this shard unless it is already open.
    ///
    /// # Errors
    ///
    /// Returns an error if the target file cannot be resolved or the storage engine fails to open
    /// it. Nothing is added to the registry in that case.
    pub fn create_if_absent(&mut self, pool: PoolId, map_version: MapVersion) -> Result<()> {
        if let Some(child) = self.lookup(pool) {
            self.release(child);
            return Ok(());
        }

        debug!(pool = %pool, shard = self.shard, "creating pool child");

        let path = self.target_files.resolve_path(pool, self.shard)?;
        let storage = self.engine.open(&path, pool)?;

        self.children.insert(
            pool,
            Rc::new(PoolChild {
                pool,
                shard: self.shard,
                map_version: Cell::new(map_version),
                storage,
                engine: Arc::clone(&self.engine),
            }),
        );

        Ok(())
    }

    /// Unlinks the child of `pool` from the registry and drops the registry's reference.
    ///
    /// Does nothing if the pool is not open on this shard. The storage handle stays open until any
    /// references still held by in-flight operations are gone.
    pub fn delete(&mut self, pool: PoolId) {
        let Some(child) = self.children.remove(&pool) else {
            return;
        };

        self.release(child);
    }

    /// Overwrites the cached map version of the child of `pool`, returning the previous version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChildNotFound`] if the pool is not open on this shard.
    pub fn update_map_version(&self, pool: PoolId, map_version: MapVersion) -> Result<MapVersion> {
        let child = self.lookup(pool).ok_or(Error::ChildNotFound {
            pool,
            shard: self.shard,
        })?;

        let previous = child.map_version.replace(map_version);

        debug!(
            pool = %pool,
            shard = self.shard,
            previous,
            map_version,
            "changed cached map version"
        );

        self.release(child);
        Ok(previous)
    }

    /// Unlinks and releases every child. Used when the shard shuts down.
    ///
    /// # Panics
    ///
    /// Panics if anything other than the registry still references a child, as that means some
    /// operation is still using the pool while the shard is going away.
    pub fn purge_all(&mut self) {
        for (pool, child) in self.children.drain() {
            let references = Rc::strong_count(&child);

            assert!(
                references == 1,
                "pool {pool} child on shard {} still has {references} references at shutdown",
                self.shard
            );

            drop(child);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::path::PathBuf;

    use mockall::Sequence;
    use mockall::predicate::eq;

    use super::*;
    use crate::{MockStorageEngine, MockTargetFiles};

    const POOL: PoolId = PoolId::new(0xAA);
    const SHARD: ShardId = 2;

    fn target_files() -> Arc<MockTargetFiles> {
        let mut target_files = MockTargetFiles::new();
        target_files
            .expect_resolve_path()
            .returning(|pool, shard| Ok(PathBuf::from(format!("/mnt/{pool}/vos-{shard}"))));
        Arc::new(target_files)
    }

    fn registry(engine: MockStorageEngine) -> ChildRegistry {
        ChildRegistry::new(SHARD, Arc::new(engine), target_files())
    }

    #[test]
    fn create_opens_once_and_close_follows_last_reference() {
        let mut engine = MockStorageEngine::new();
        let mut sequence = Sequence::new();

        engine
            .expect_open()
            .withf(|path, pool| {
                *pool == POOL
                    && path == PathBuf::from(format!("/mnt/{POOL}/vos-{SHARD}")).as_path()
            })
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(StorageHandle::new(11)));
        engine
            .expect_close()
            .with(eq(StorageHandle::new(11)))
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(());

        let mut registry = registry(engine);

        registry.create_if_absent(POOL, 3).unwrap();
        registry.create_if_absent(POOL, 4).unwrap();
        assert_eq!(registry.len(), 1);

        // The second create must not have overwritten the version.
        let child = registry.lookup(POOL).unwrap();
        assert_eq!(child.map_version(), 3);
        assert_eq!(child.storage(), StorageHandle::new(11));
        assert_eq!(child.shard(), SHARD);

        // Delete while a lookup reference is outstanding: the handle stays open until release.
        registry.delete(POOL);
        assert!(registry.is_empty());
        assert!(registry.lookup(POOL).is_none());
        assert_eq!(child.pool(), POOL);

        registry.release(child);
    }

    #[test]
    fn lookup_and_release_conserve_references() {
        let mut engine = MockStorageEngine::new();
        engine
            .expect_open()
            .returning(|_, _| Ok(StorageHandle::new(1)));
        engine.expect_close().times(1).return_const(());

        let mut registry = registry(engine);
        registry.create_if_absent(POOL, 1).unwrap();

        let first = registry.lookup(POOL).unwrap();
        let second = registry.lookup(POOL).unwrap();
        assert_eq!(Rc::strong_count(&first), 3);

        registry.release(first);
        registry.release(second);
        assert_eq!(Rc::strong_count(&registry.lookup(POOL).unwrap()), 2);

        registry.purge_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_open_leaves_registry_untouched() {
        let mut engine = MockStorageEngine::new();
        engine.expect_open().returning(|_, pool| {
            Err(Error::Storage {
                pool,
                reason: "no space".to_string(),
            })
        });
        engine.expect_close().never();

        let mut registry = registry(engine);

        let error = registry.create_if_absent(POOL, 1).unwrap_err();
        assert!(matches!(error, Error::Storage { pool, .. } if pool == POOL));
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_path_resolution_skips_open() {
        let mut engine = MockStorageEngine::new();
        engine.expect_open().never();

        let mut target_files = MockTargetFiles::new();
        target_files.expect_resolve_path().returning(|pool, shard| {
            Err(Error::TargetFile {
                pool,
                shard,
                reason: "not provisioned".to_string(),
            })
        });

        let mut registry = ChildRegistry::new(SHARD, Arc::new(engine), Arc::new(target_files));

        let error = registry.create_if_absent(POOL, 1).unwrap_err();
        assert!(matches!(error, Error::TargetFile { shard: SHARD, .. }));
    }

    #[test]
    fn update_map_version_overwrites_and_reports_previous() {
        let mut engine = MockStorageEngine::new();
        engine
            .expect_open()
            .returning(|_, _| Ok(StorageHandle::new(1)));
        engine.expect_close().return_const(());

        let mut registry = registry(engine);
        registry.create_if_absent(POOL, 5).unwrap();

        assert_eq!(registry.update_map_version(POOL, 9).unwrap(), 5);
        assert_eq!(registry.lookup(POOL).unwrap().map_version(), 9);

        let missing = PoolId::new(0xBB);
        assert_eq!(
            registry.update_map_version(missing, 9).unwrap_err(),
            Error::ChildNotFound {
                pool: missing,
                shard: SHARD
            }
        );
    }

    #[test]
    fn delete_of_unknown_pool_is_noop() {
        let mut engine = MockStorageEngine::new();
        engine.expect_close().never();

        let mut registry = registry(engine);
        registry.delete(POOL);

        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic]
    fn purge_with_outstanding_reference_panics() {
        let mut engine = MockStorageEngine::new();
        engine
            .expect_open()
            .returning(|_, _| Ok(StorageHandle::new(1)));
        engine.expect_close().return_const(());

        let mut registry = registry(engine);
        registry.create_if_absent(POOL, 1).unwrap();

        let _held = registry.lookup(POOL).unwrap();
        registry.purge_all();
    }
}
