//! In-memory implementations of the services a pool target consults.
//!
//! These keep just enough state to observe what the target did with them (which pools are open,
//! which groups exist) and can be told to fail, which makes them suitable for tests of code that
//! embeds a [`PoolTarget`][crate::PoolTarget].
//!
//! ```
//! use new_zealand::nz;
//! use pool_target::fake::FakeCollaborators;
//! use pool_target::{Capabilities, ConnectRequest, HandleId, PoolId, PoolTarget};
//!
//! let fakes = FakeCollaborators::new();
//! let target = fakes
//!     .install(PoolTarget::builder())
//!     .shard_count(nz!(2))
//!     .pin_shards(false)
//!     .build()
//!     .unwrap();
//!
//! let pool = PoolId::new(1);
//! let reply = target.handle_connect(&ConnectRequest::new(
//!     pool,
//!     HandleId::new(1),
//!     Capabilities::READ_WRITE,
//!     1,
//! ));
//!
//! assert!(reply.status().is_success());
//! assert_eq!(fakes.storage.open_count_for(pool), 2);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use foldhash::{HashMap, HashMapExt, HashSet, HashSetExt};
use parking_lot::Mutex;

use crate::{
    Error, Group, GroupService, MapVersion, PlacementMap, PlacementMapCodec, PoolId,
    PoolTargetBuilder, Result, ShardId, StorageEngine, StorageHandle, TargetFiles,
};

/// Storage engine that opens nothing and remembers which handles are open.
#[derive(Debug)]
pub struct FakeStorage {
    next_token: AtomicU64,
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
    failures_remaining: AtomicUsize,
    open: Mutex<HashMap<StorageHandle, PoolId>>,
}

impl FakeStorage {
    /// Creates a storage engine with nothing open.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Makes the next `count` open calls fail with [`Error::Storage`].
    pub fn fail_next_opens(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::Relaxed);
    }

    /// Number of open calls so far, including failed ones.
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::Relaxed)
    }

    /// Number of close calls so far.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Relaxed)
    }

    /// Number of handles currently open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Number of handles currently open for `pool`.
    #[must_use]
    pub fn open_count_for(&self, pool: PoolId) -> usize {
        self.open
            .lock()
            .values()
            .filter(|open_pool| **open_pool == pool)
            .count()
    }
}

impl Default for FakeStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for FakeStorage {
    fn open(&self, path: &Path, pool: PoolId) -> Result<StorageHandle> {
        self.open_calls.fetch_add(1, Ordering::Relaxed);

        let fail = self
            .failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();

        if fail {
            return Err(Error::Storage {
                pool,
                reason: format!("injected failure opening {}", path.display()),
            });
        }

        let handle = StorageHandle::new(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.open.lock().insert(handle, pool);

        Ok(handle)
    }

    fn close(&self, handle: StorageHandle) {
        self.close_calls.fetch_add(1, Ordering::Relaxed);

        let closed = self.open.lock().remove(&handle);
        assert!(
            closed.is_some(),
            "closed storage handle {} that is not open",
            handle.get()
        );
    }
}

/// Target file resolver that places every pool under a fixed root directory.
#[derive(Debug)]
pub struct FakeTargetFiles {
    root: PathBuf,
}

impl FakeTargetFiles {
    /// Creates a resolver rooted at `/srv/pool-target`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/srv/pool-target")
    }

    /// Creates a resolver rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for FakeTargetFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetFiles for FakeTargetFiles {
    fn resolve_path(&self, pool: PoolId, shard: ShardId) -> Result<PathBuf> {
        Ok(self.root.join(pool.to_string()).join(format!("vos-{shard}")))
    }
}

/// Placement map produced by [`FakePlacementMaps`].
#[derive(Debug)]
pub struct FakePlacementMap {
    version: MapVersion,
    len: usize,
}

impl FakePlacementMap {
    /// Size of the buffer the map was decoded from.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the map was decoded from an empty buffer. Never true, as those are rejected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PlacementMap for FakePlacementMap {
    fn version(&self) -> MapVersion {
        self.version
    }
}

/// Placement map codec that accepts any non-empty buffer.
#[derive(Debug, Default)]
pub struct FakePlacementMaps {
    decode_calls: AtomicUsize,
}

impl FakePlacementMaps {
    /// Creates the codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of decode calls so far.
    #[must_use]
    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::Relaxed)
    }
}

impl PlacementMapCodec for FakePlacementMaps {
    fn decode(&self, buffer: &[u8], version: MapVersion) -> Result<Box<dyn PlacementMap>> {
        self.decode_calls.fetch_add(1, Ordering::Relaxed);

        if buffer.is_empty() {
            return Err(Error::PlacementMap {
                version,
                reason: "empty buffer".to_string(),
            });
        }

        Ok(Box::new(FakePlacementMap {
            version,
            len: buffer.len(),
        }))
    }
}

/// Group service that keeps track of the groups it formed.
#[derive(Debug)]
pub struct FakeGroups {
    live: Mutex<HashSet<PoolId>>,
    create_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    fail_creates: AtomicBool,
    fail_destroys: AtomicBool,
}

impl FakeGroups {
    /// Creates a group service with no groups.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashSet::new()),
            create_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
            fail_destroys: AtomicBool::new(false),
        }
    }

    /// Makes every create call fail with [`Error::Group`] while set.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::Relaxed);
    }

    /// Makes every destroy call fail with [`Error::Group`] while set. The group is still
    /// forgotten, as a real group service would eventually reclaim it.
    pub fn fail_destroys(&self, fail: bool) {
        self.fail_destroys.store(fail, Ordering::Relaxed);
    }

    /// Number of create calls so far.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::Relaxed)
    }

    /// Number of destroy calls so far.
    #[must_use]
    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::Relaxed)
    }

    /// Number of groups formed and not yet destroyed.
    #[must_use]
    pub fn live_groups(&self) -> usize {
        self.live.lock().len()
    }
}

impl Default for FakeGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupService for FakeGroups {
    fn create_group(&self, pool: PoolId, map: &dyn PlacementMap) -> Result<Group> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);

        if self.fail_creates.load(Ordering::Relaxed) {
            return Err(Error::Group {
                pool,
                reason: "injected create failure".to_string(),
            });
        }

        self.live.lock().insert(pool);
        Ok(Group::new(format!("pool-{pool}-v{}", map.version())))
    }

    fn destroy_group(&self, pool: PoolId, _group: &Group) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::Relaxed);
        self.live.lock().remove(&pool);

        if self.fail_destroys.load(Ordering::Relaxed) {
            return Err(Error::Group {
                pool,
                reason: "injected destroy failure".to_string(),
            });
        }

        Ok(())
    }
}

/// One fake of every collaborator, ready to be installed into a [`PoolTargetBuilder`].
#[derive(Debug, Default)]
pub struct FakeCollaborators {
    /// The storage engine.
    pub storage: Arc<FakeStorage>,

    /// The target file resolver.
    pub target_files: Arc<FakeTargetFiles>,

    /// The placement map codec.
    pub placement_maps: Arc<FakePlacementMaps>,

    /// The group service.
    pub groups: Arc<FakeGroups>,
}

impl FakeCollaborators {
    /// Creates a fresh set of fakes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies every fake to `builder`.
    pub fn install(&self, builder: PoolTargetBuilder) -> PoolTargetBuilder {
        builder
            .storage(Arc::<FakeStorage>::clone(&self.storage))
            .target_files(Arc::<FakeTargetFiles>::clone(&self.target_files))
            .placement_maps(Arc::<FakePlacementMaps>::clone(&self.placement_maps))
            .groups(Arc::<FakeGroups>::clone(&self.groups))
    }
}
