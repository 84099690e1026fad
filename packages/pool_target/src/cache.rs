use std::collections::VecDeque;
use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use foldhash::{HashMap, HashMapExt};
use parking_lot::{Condvar, Mutex, MutexGuard};
use scopeguard::ScopeGuard;
use tracing::trace;

use crate::{Error, Result};

/// A type whose instances can be stored in an [`ObjectCache`].
///
/// The cache calls [`create()`][Self::create] on a miss and [`destroy()`][Self::destroy] when an
/// unreferenced entry is evicted. Both are called without any cache lock held, so they may take as
/// long as they need, including fanning work out to other threads.
pub trait Cacheable: Send + Sync + Sized + 'static {
    /// Identifies an entry in the cache.
    type Key: Copy + Eq + Hash + Display + Debug + Send + Sync + 'static;

    /// Everything a caller must supply to create a missing entry.
    type CreateArgs;

    /// Shared state passed to every create and destroy call, owned by the cache.
    type Context: Send + Sync + 'static;

    /// Builds the entry for `key`.
    ///
    /// # Errors
    ///
    /// Any error is returned to the caller that requested the creation and nothing is cached.
    fn create(key: Self::Key, args: &Self::CreateArgs, context: &Self::Context) -> Result<Self>;

    /// Releases whatever [`create()`][Self::create] acquired. Called exactly once per created
    /// entry, after its last reference is gone.
    fn destroy(&self, context: &Self::Context);

    /// The key this entry was created for.
    fn key(&self) -> Self::Key;

    /// The error a pure lookup reports when `key` is not cached.
    fn not_found(key: Self::Key) -> Error;
}

enum Slot<T: Cacheable> {
    /// A caller is running `T::create()` for this key without the lock held.
    Creating,

    Resident {
        value: Arc<T>,
        refs: usize,
    },

    /// The entry is unreferenced and `T::destroy()` is running without the lock held.
    Destroying,
}

struct CacheState<T: Cacheable> {
    slots: HashMap<T::Key, Slot<T>>,

    /// Resident entries with no references, least recently released first.
    idle: VecDeque<T::Key>,
}

enum Probe<T> {
    Hit { value: Arc<T>, was_idle: bool },
    Wait,
    Miss,
}

/// Reference-counted object cache with at most one creation in flight per key.
///
/// Every entry is handed out as a [`CacheRef`]. When the last reference to an entry is dropped
/// the entry becomes idle. Up to `idle_capacity` idle entries are kept in the cache and revived by
/// later lookups; beyond that the least recently released idle entry is destroyed.
///
/// Callers racing to create the same key are serialized: the first runs [`Cacheable::create()`],
/// the rest wait and then share the result (or retry the creation themselves if it failed).
pub struct ObjectCache<T: Cacheable> {
    state: Mutex<CacheState<T>>,

    /// Signaled whenever a slot leaves the `Creating` or `Destroying` state.
    slot_changed: Condvar,

    context: T::Context,
    idle_capacity: usize,
}

impl<T: Cacheable> ObjectCache<T> {
    /// Creates an empty cache that keeps at most `idle_capacity` unreferenced entries.
    #[must_use]
    pub fn new(context: T::Context, idle_capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                idle: VecDeque::new(),
            }),
            slot_changed: Condvar::new(),
            context,
            idle_capacity,
        }
    }

    /// The context passed to every create and destroy call.
    #[must_use]
    pub fn context(&self) -> &T::Context {
        &self.context
    }

    /// Returns a reference to the entry for `key`, creating the entry from `args` if it is missing.
    ///
    /// With `args` set to `None` this is a pure lookup that never creates anything. An existing
    /// entry is returned as-is, whatever `args` says.
    ///
    /// # Errors
    ///
    /// Returns [`Cacheable::not_found()`] for a pure lookup miss, or the error of
    /// [`Cacheable::create()`] if creation fails.
    pub fn lookup_or_create(
        self: &Arc<Self>,
        key: T::Key,
        args: Option<&T::CreateArgs>,
    ) -> Result<CacheRef<T>> {
        let mut state = self.state.lock();

        loop {
            let probe = match state.slots.get_mut(&key) {
                Some(Slot::Resident { value, refs }) => {
                    *refs = refs
                        .checked_add(1)
                        .expect("reference count overflow is not a realistic scenario");

                    Probe::Hit {
                        value: Arc::clone(value),
                        was_idle: *refs == 1,
                    }
                }
                Some(Slot::Creating) => Probe::Wait,
                // Whoever is looking purely wants the live entry and this one is already gone.
                Some(Slot::Destroying) if args.is_none() => return Err(T::not_found(key)),
                Some(Slot::Destroying) => Probe::Wait,
                None => Probe::Miss,
            };

            match probe {
                Probe::Hit { value, was_idle } => {
                    debug_assert!(value.key() == key);

                    if was_idle {
                        state.idle.retain(|idle_key| *idle_key != key);
                    }

                    return Ok(CacheRef::new(Arc::clone(self), value));
                }
                Probe::Wait => self.slot_changed.wait(&mut state),
                Probe::Miss => break,
            }
        }

        let Some(args) = args else {
            return Err(T::not_found(key));
        };

        state.slots.insert(key, Slot::Creating);
        MutexGuard::unlocked(&mut state, || self.create_slot(key, args))
    }

    /// Returns a reference to the entry for `key` without creating it.
    ///
    /// # Errors
    ///
    /// Returns [`Cacheable::not_found()`] if the entry is not cached.
    pub fn lookup(self: &Arc<Self>, key: T::Key) -> Result<CacheRef<T>> {
        self.lookup_or_create(key, None)
    }

    fn create_slot(self: &Arc<Self>, key: T::Key, args: &T::CreateArgs) -> Result<CacheRef<T>> {
        // If creation panics, waiters must not be left staring at a `Creating` slot forever.
        let cleanup_guard = scopeguard::guard((), |()| {
            self.state.lock().slots.remove(&key);
            self.slot_changed.notify_all();
        });

        let created = T::create(key, args, &self.context);

        ScopeGuard::into_inner(cleanup_guard);

        let result = {
            let mut state = self.state.lock();

            match created {
                Ok(value) => {
                    trace!(%key, "created cache entry");

                    let value = Arc::new(value);
                    state.slots.insert(
                        key,
                        Slot::Resident {
                            value: Arc::clone(&value),
                            refs: 1,
                        },
                    );

                    Ok(CacheRef::new(Arc::clone(self), value))
                }
                Err(error) => {
                    state.slots.remove(&key);
                    Err(error)
                }
            }
        };

        self.slot_changed.notify_all();
        result
    }

    fn add_ref(&self, key: T::Key) {
        let mut state = self.state.lock();

        match state.slots.get_mut(&key) {
            Some(Slot::Resident { refs, .. }) if *refs > 0 => {
                *refs = refs
                    .checked_add(1)
                    .expect("reference count overflow is not a realistic scenario");
            }
            _ => panic!("cache entry {key} was cloned without an outstanding reference"),
        }
    }

    fn release(&self, key: T::Key) {
        let victims = {
            let mut state = self.state.lock();

            let Some(Slot::Resident { refs, .. }) = state.slots.get_mut(&key) else {
                panic!("released cache entry {key} which is not resident");
            };

            *refs = refs
                .checked_sub(1)
                .unwrap_or_else(|| panic!("reference count underflow on cache entry {key}"));

            if *refs > 0 {
                return;
            }

            state.idle.push_back(key);
            Self::take_idle_victims(&mut state, self.idle_capacity)
        };

        self.destroy_victims(victims);
    }

    /// Destroys every idle entry, returning how many were destroyed.
    pub fn evict_idle(&self) -> usize {
        let victims = Self::take_idle_victims(&mut self.state.lock(), 0);
        let count = victims.len();

        self.destroy_victims(victims);
        count
    }

    fn take_idle_victims(state: &mut CacheState<T>, keep: usize) -> Vec<Arc<T>> {
        let mut victims = Vec::new();

        while state.idle.len() > keep {
            let Some(key) = state.idle.pop_front() else {
                break;
            };

            match state.slots.insert(key, Slot::Destroying) {
                Some(Slot::Resident { value, refs: 0 }) => victims.push(value),
                _ => panic!("idle cache entry {key} was not an unreferenced resident"),
            }
        }

        victims
    }

    fn destroy_victims(&self, victims: Vec<Arc<T>>) {
        for value in victims {
            let key = value.key();

            // The slot is removed even if destroy panics, so waiters get to see the outcome.
            let removal_guard = scopeguard::guard((), |()| {
                self.state.lock().slots.remove(&key);
                self.slot_changed.notify_all();
            });

            trace!(%key, "destroying cache entry");
            value.destroy(&self.context);

            drop(value);
            drop(removal_guard);
        }
    }

    /// Number of entries that are resident in the cache, referenced or idle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Resident { .. }))
            .count()
    }

    /// Whether no entry is resident in the cache.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of resident entries that nobody references.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Number of outstanding references to the entry for `key`, or `None` if it is not resident.
    #[must_use]
    pub fn ref_count(&self, key: T::Key) -> Option<usize> {
        match self.state.lock().slots.get(&key) {
            Some(Slot::Resident { refs, .. }) => Some(*refs),
            _ => None,
        }
    }
}

impl<T: Cacheable> fmt::Debug for ObjectCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("ObjectCache")
            .field("slots", &state.slots.len())
            .field("idle", &state.idle.len())
            .field("idle_capacity", &self.idle_capacity)
            .finish_non_exhaustive()
    }
}

/// A counted reference to an entry of an [`ObjectCache`].
///
/// Dropping the reference gives it back to the cache. Cloning it takes another reference.
pub struct CacheRef<T: Cacheable> {
    cache: Arc<ObjectCache<T>>,
    value: Arc<T>,
}

impl<T: Cacheable> CacheRef<T> {
    fn new(cache: Arc<ObjectCache<T>>, value: Arc<T>) -> Self {
        Self { cache, value }
    }

    /// The key of the referenced entry.
    #[must_use]
    pub fn key(&self) -> T::Key {
        self.value.key()
    }

    /// Gives the reference back to the cache. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// Whether both references point to the same cached instance.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.value, &other.value)
    }
}

impl<T: Cacheable> Deref for CacheRef<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T: Cacheable> Clone for CacheRef<T> {
    fn clone(&self) -> Self {
        self.cache.add_ref(self.key());

        Self {
            cache: Arc::clone(&self.cache),
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: Cacheable> Drop for CacheRef<T> {
    fn drop(&mut self) {
        self.cache.release(self.value.key());
    }
}

impl<T: Cacheable> fmt::Debug for CacheRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRef")
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}
