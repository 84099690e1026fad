//! Requests and replies of the pool target RPCs.
//!
//! The transport that carries these is not part of this crate. Replies only carry a status code;
//! when a request is fanned out to several targets, the replies are combined with
//! [`Aggregate::aggregate()`], which sums the status codes so that the combined status is zero
//! exactly when every contributor succeeded.

use std::fmt;

use crate::{Capabilities, HandleId, MapVersion, PoolId, Result};

/// Status code carried by a reply. Zero means success.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ReplyStatus(u32);

impl ReplyStatus {
    /// Every contributor succeeded.
    pub const SUCCESS: Self = Self(0);

    /// The contribution of a single failed operation.
    pub const FAILURE: Self = Self(1);

    /// Wraps a status code received over the wire.
    #[must_use]
    pub const fn from_raw(code: u32) -> Self {
        Self(code)
    }

    /// The status a single contributor reports for the outcome of its operation.
    #[must_use]
    pub fn from_result<T>(result: &Result<T>) -> Self {
        if result.is_ok() {
            Self::SUCCESS
        } else {
            Self::FAILURE
        }
    }

    /// The raw status code.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether every contributor succeeded.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Combines replies from several contributors into one.
pub trait Aggregate {
    /// Folds `source` into `self`.
    fn aggregate(&mut self, source: &Self);
}

impl Aggregate for ReplyStatus {
    fn aggregate(&mut self, source: &Self) {
        // Saturating, so enough failures can never wrap around to success.
        self.0 = self.0.saturating_add(source.0);
    }
}

macro_rules! status_reply {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
        pub struct $name {
            status: ReplyStatus,
        }

        impl $name {
            /// Creates a reply carrying `status`.
            #[must_use]
            pub const fn new(status: ReplyStatus) -> Self {
                Self { status }
            }

            /// The status of the request, aggregated over every contributor.
            #[must_use]
            pub const fn status(&self) -> ReplyStatus {
                self.status
            }
        }

        impl Aggregate for $name {
            fn aggregate(&mut self, source: &Self) {
                self.status.aggregate(&source.status);
            }
        }

        impl From<ReplyStatus> for $name {
            fn from(status: ReplyStatus) -> Self {
                Self::new(status)
            }
        }
    };
}

status_reply! {
    /// Reply to a [`ConnectRequest`].
    ConnectReply
}

status_reply! {
    /// Reply to a [`DisconnectRequest`].
    DisconnectReply
}

status_reply! {
    /// Reply to an [`UpdateMapRequest`].
    UpdateMapReply
}

/// Asks the target to grant a client a handle to a pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectRequest {
    pool: PoolId,
    handle: HandleId,
    capabilities: Capabilities,
    map_version: MapVersion,
}

impl ConnectRequest {
    /// Creates a request to connect `handle` to `pool` with the given capabilities.
    ///
    /// `map_version` is the pool map version the control plane is at, used if the target has to
    /// bring the pool up.
    #[must_use]
    pub fn new(
        pool: PoolId,
        handle: HandleId,
        capabilities: Capabilities,
        map_version: MapVersion,
    ) -> Self {
        Self {
            pool,
            handle,
            capabilities,
            map_version,
        }
    }

    /// The pool to connect to.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// The identifier the client chose for its handle.
    #[must_use]
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// The capabilities the client asks for.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The pool map version known to the sender.
    #[must_use]
    pub fn map_version(&self) -> MapVersion {
        self.map_version
    }
}

/// Asks the target to drop a set of handles.
///
/// On the wire the handle list is a nullable array with a separate element count, and both are
/// carried here as received so that the handler can validate them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DisconnectRequest {
    pool: PoolId,
    handles: Option<Vec<HandleId>>,
    handle_count: u64,
}

impl DisconnectRequest {
    /// Creates a request to disconnect `handles` from `pool`.
    #[must_use]
    pub fn new(pool: PoolId, handles: Vec<HandleId>) -> Self {
        let handle_count = u64::try_from(handles.len())
            .expect("usize always fits in u64 on supported platforms");

        Self {
            pool,
            handles: Some(handles),
            handle_count,
        }
    }

    /// Creates a request from its wire form, where the handle array may be missing and the
    /// declared count is not guaranteed to match the array.
    #[must_use]
    pub fn from_wire(pool: PoolId, handles: Option<Vec<HandleId>>, handle_count: u64) -> Self {
        Self {
            pool,
            handles,
            handle_count,
        }
    }

    /// The pool the handles belong to.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// The handles to disconnect, in request order, or `None` if the array was missing.
    #[must_use]
    pub fn handles(&self) -> Option<&[HandleId]> {
        self.handles.as_deref()
    }

    /// The number of handles the sender declared.
    #[must_use]
    pub fn handle_count(&self) -> u64 {
        self.handle_count
    }
}

/// Tells the target that the map of a pool has moved to a new version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdateMapRequest {
    pool: PoolId,
    map_version: MapVersion,
}

impl UpdateMapRequest {
    /// Creates a request to move `pool` to `map_version`.
    #[must_use]
    pub fn new(pool: PoolId, map_version: MapVersion) -> Self {
        Self { pool, map_version }
    }

    /// The pool whose map changed.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// The new map version.
    #[must_use]
    pub fn map_version(&self) -> MapVersion {
        self.map_version
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn status_from_result() {
        assert_eq!(ReplyStatus::from_result(&Ok(())), ReplyStatus::SUCCESS);
        assert_eq!(
            ReplyStatus::from_result::<()>(&Err(Error::PoolNotFound(PoolId::new(1)))),
            ReplyStatus::FAILURE
        );
    }

    #[test]
    fn aggregation_sums_statuses() {
        let mut reply = ConnectReply::default();
        assert!(reply.status().is_success());

        reply.aggregate(&ConnectReply::new(ReplyStatus::SUCCESS));
        assert!(reply.status().is_success());

        reply.aggregate(&ConnectReply::new(ReplyStatus::FAILURE));
        reply.aggregate(&ConnectReply::new(ReplyStatus::from_raw(4)));
        assert_eq!(reply.status().get(), 5);
        assert!(!reply.status().is_success());
    }

    #[test]
    fn aggregation_saturates() {
        let mut reply = UpdateMapReply::from(ReplyStatus::from_raw(u32::MAX));
        reply.aggregate(&UpdateMapReply::from(ReplyStatus::FAILURE));

        assert_eq!(reply.status().get(), u32::MAX);
    }

    #[test]
    fn disconnect_request_counts_handles() {
        let request =
            DisconnectRequest::new(PoolId::new(1), vec![HandleId::new(1), HandleId::new(2)]);

        assert_eq!(request.handle_count(), 2);
        assert_eq!(request.handles().map(<[HandleId]>::len), Some(2));

        let wire = DisconnectRequest::from_wire(PoolId::new(1), None, 3);
        assert!(wire.handles().is_none());
        assert_eq!(wire.handle_count(), 3);
    }
}
