use std::mem;
use std::sync::Arc;

use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{CacheRef, Capabilities, Error, HandleId, Pool, Result};

/// Typical number of concurrently connected handles, used to size the table up front.
const INITIAL_CAPACITY: usize = 16;

/// A connection grant issued to a client of a pool.
///
/// The handle keeps its pool cached for as long as the handle exists.
#[derive(Debug)]
pub struct PoolHandle {
    id: HandleId,
    capabilities: Capabilities,
    pool: CacheRef<Pool>,
}

impl PoolHandle {
    /// Creates a handle that holds `pool` until the handle is dropped.
    #[must_use]
    pub fn new(id: HandleId, capabilities: Capabilities, pool: CacheRef<Pool>) -> Self {
        Self {
            id,
            capabilities,
            pool,
        }
    }

    /// The identifier the client chose for the handle.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The capabilities the client connected with.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The pool the handle grants access to.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        debug!(handle = %self.id, pool = %self.pool.id(), "freeing pool handle");
    }
}

/// Table of the pool handles connected to this target, keyed by handle identifier.
///
/// Entries are shared as `Arc<PoolHandle>`: the table holds one reference and every
/// [`find()`][Self::find] hands out another. A handle (and with it, its pool reference) is freed
/// once it is unlinked from the table and every found reference has been released.
///
/// Handles are never dropped while the table lock is held, as dropping the last reference to a
/// pool tears the pool down on every shard.
#[derive(Debug)]
pub struct HandleTable {
    handles: Mutex<HashMap<HandleId, Arc<PoolHandle>>>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Links `handle` into the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] with the capabilities of the existing handle if the
    /// identifier is taken. The rejected handle is dropped.
    pub fn insert(&self, handle: PoolHandle) -> Result<()> {
        let mut handles = self.handles.lock();

        if let Some(existing) = handles.get(&handle.id) {
            let error = Error::AlreadyExists {
                handle: handle.id,
                existing: existing.capabilities,
            };

            drop(handles);
            drop(handle);
            return Err(error);
        }

        trace!(handle = %handle.id, "linking pool handle");
        handles.insert(handle.id, Arc::new(handle));
        Ok(())
    }

    /// Returns a new reference to the handle with identifier `id`, if it is in the table.
    #[must_use]
    pub fn find(&self, id: HandleId) -> Option<Arc<PoolHandle>> {
        self.handles.lock().get(&id).map(Arc::clone)
    }

    /// Unlinks the handle with identifier `id` and drops the table's reference to it.
    ///
    /// # Panics
    ///
    /// Panics if no handle with this identifier is in the table.
    pub fn remove(&self, id: HandleId) {
        let removed = self.handles.lock().remove(&id);

        let Some(handle) = removed else {
            panic!("pool handle {id} removed while not linked in the handle table");
        };

        trace!(handle = %id, "unlinked pool handle");
        drop(handle);
    }

    /// Unlinks `handle` if the table still holds it. Returns whether it was unlinked.
    ///
    /// A concurrent disconnect of the same handle may already have unlinked it, or even linked a
    /// new handle with the same identifier, which is left alone.
    pub fn remove_if_linked(&self, handle: &Arc<PoolHandle>) -> bool {
        let removed = {
            let mut handles = self.handles.lock();

            match handles.get(&handle.id) {
                Some(linked) if Arc::ptr_eq(linked, handle) => handles.remove(&handle.id),
                _ => None,
            }
        };

        removed.is_some()
    }

    /// Gives back a reference obtained from [`find()`][Self::find].
    ///
    /// If this was the last reference, the handle is freed and its pool reference released.
    pub fn release(handle: Arc<PoolHandle>) {
        if Arc::strong_count(&handle) == 1 {
            trace!(handle = %handle.id, "releasing last reference to pool handle");
        }

        drop(handle);
    }

    /// Unlinks every handle, returning how many there were.
    ///
    /// Handles still referenced elsewhere are freed when those references are released.
    pub fn purge_all(&self) -> usize {
        let purged = {
            let mut handles = self.handles.lock();
            let capacity = handles.capacity();
            mem::replace(&mut *handles, HashMap::with_capacity(capacity))
        };

        let count = purged.len();
        if count > 0 {
            debug!(count, "purging pool handles");
        }

        drop(purged);
        count
    }

    /// Number of handles in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether the table holds no handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}
