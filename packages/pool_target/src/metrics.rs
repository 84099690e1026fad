//! Metrics for the pool target.
//!
//! Counters track pool and handle lifecycle events, the histogram tracks how long collective
//! operations take to fan out to every shard and come back. The events are per-thread to avoid
//! contention between request threads.

use nm::{Event, Magnitude};

/// Histogram buckets for collective operation duration in milliseconds.
///
/// Opening a pool on every shard touches storage, so we expect a long tail.
const COLLECTIVE_DURATION_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 50, 100, 500, 1000, 5000];

thread_local! {
    /// A pool was created and brought up on every shard.
    pub(crate) static POOLS_CREATED: Event = Event::builder()
        .name("pool_target_pools_created")
        .build();

    /// Creating a pool failed and any partial state was rolled back.
    pub(crate) static POOL_CREATE_FAILURES: Event = Event::builder()
        .name("pool_target_pool_create_failures")
        .build();

    /// A pool was evicted from the cache and torn down on every shard.
    pub(crate) static POOLS_DESTROYED: Event = Event::builder()
        .name("pool_target_pools_destroyed")
        .build();

    /// A client handle was inserted into the handle table.
    pub(crate) static HANDLES_CONNECTED: Event = Event::builder()
        .name("pool_target_handles_connected")
        .build();

    /// A client handle was removed from the handle table by a disconnect request.
    pub(crate) static HANDLES_DISCONNECTED: Event = Event::builder()
        .name("pool_target_handles_disconnected")
        .build();

    /// A connect request was answered with a non-success status.
    pub(crate) static CONNECTS_REJECTED: Event = Event::builder()
        .name("pool_target_connects_rejected")
        .build();

    /// A new map version was propagated to every shard.
    pub(crate) static MAP_UPDATES: Event = Event::builder()
        .name("pool_target_map_updates")
        .build();

    /// Time from starting a collective operation until every shard has reported back.
    ///
    /// The magnitude is the duration in milliseconds.
    pub(crate) static COLLECTIVE_DURATION_MS: Event = Event::builder()
        .name("pool_target_collective_duration_ms")
        .histogram(COLLECTIVE_DURATION_MS_BUCKETS)
        .build();
}
