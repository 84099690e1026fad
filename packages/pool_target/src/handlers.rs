//! Handlers of the requests the control plane sends to a pool target.
//!
//! Every handler produces a reply, whatever happens. The reply only says whether the request
//! succeeded; the reason of a failure is logged here.

use std::mem;

use nm::Event;
use tracing::{debug, error, warn};

use crate::metrics::{CONNECTS_REJECTED, HANDLES_CONNECTED, HANDLES_DISCONNECTED, MAP_UPDATES};
use crate::{
    Capabilities, ConnectReply, ConnectRequest, DisconnectReply, DisconnectRequest, Error,
    HandleTable, PoolCreateArgs, PoolHandle, PoolTarget, ReplyStatus, Result, UpdateMapReply,
    UpdateMapRequest,
};

impl PoolTarget {
    /// Grants the handle in `request` to its client.
    ///
    /// Resending a connect request for a handle that is already connected with the same
    /// capabilities succeeds without changing anything. Reusing a connected handle identifier with
    /// different capabilities fails and leaves the connected handle as it is.
    pub fn handle_connect(&self, request: &ConnectRequest) -> ConnectReply {
        debug!(
            pool = %request.pool(),
            handle = %request.handle(),
            capabilities = %request.capabilities(),
            "handling connect request"
        );

        let result = self.connect(request);

        if let Err(error) = &result {
            CONNECTS_REJECTED.with(Event::observe_once);
            error!(
                pool = %request.pool(),
                handle = %request.handle(),
                %error,
                "connect request failed"
            );
        }

        let reply = ConnectReply::new(ReplyStatus::from_result(&result));

        debug!(
            pool = %request.pool(),
            handle = %request.handle(),
            status = %reply.status(),
            "replying to connect request"
        );

        reply
    }

    fn connect(&self, request: &ConnectRequest) -> Result<()> {
        if let Some(existing) = self.handles().find(request.handle()) {
            let capabilities = existing.capabilities();
            HandleTable::release(existing);

            return accept_resend(request, capabilities);
        }

        // The target never decodes a map for a connect, the pool must be creatable without one.
        let args = PoolCreateArgs::new(request.map_version());
        let pool = self.lookup_or_create_pool(request.pool(), Some(&args))?;

        let handle = PoolHandle::new(request.handle(), request.capabilities(), pool);

        match self.handles().insert(handle) {
            Ok(()) => {
                HANDLES_CONNECTED.with(Event::observe_once);
                Ok(())
            }
            // A resend of the same request got there first.
            Err(Error::AlreadyExists { existing, .. }) => accept_resend(request, existing),
            Err(error) => Err(error),
        }
    }

    /// Drops the handles listed in `request`.
    ///
    /// Handles that are not connected are skipped, as they were most likely disconnected by an
    /// earlier attempt of the same request.
    pub fn handle_disconnect(&self, request: &DisconnectRequest) -> DisconnectReply {
        debug!(
            pool = %request.pool(),
            handle_count = request.handle_count(),
            "handling disconnect request"
        );

        let result = self.disconnect(request);

        if let Err(error) = &result {
            error!(pool = %request.pool(), %error, "disconnect request failed");
        }

        let reply = DisconnectReply::new(ReplyStatus::from_result(&result));

        debug!(
            pool = %request.pool(),
            status = %reply.status(),
            "replying to disconnect request"
        );

        reply
    }

    fn disconnect(&self, request: &DisconnectRequest) -> Result<()> {
        let declared = request.handle_count();

        if declared == 0 {
            return Ok(());
        }

        let Some(ids) = request.handles() else {
            return Err(Error::InvalidInput(format!(
                "disconnect request declares {declared} handles but carries none"
            )));
        };

        if u64::try_from(ids.len()).ok() != Some(declared) {
            return Err(Error::InvalidInput(format!(
                "disconnect request declares {declared} handles but carries {}",
                ids.len()
            )));
        }

        for &id in ids {
            let Some(handle) = self.handles().find(id) else {
                debug!(pool = %request.pool(), handle = %id, "handle is not connected");
                continue;
            };

            // Another disconnect of the same handle may have unlinked it since we found it.
            if self.handles().remove_if_linked(&handle) {
                HANDLES_DISCONNECTED.with(Event::observe_once);
            }

            HandleTable::release(handle);
        }

        Ok(())
    }

    /// Moves the cached pool in `request` and every shard's view of it to a new map version.
    ///
    /// A pool that is not cached on this target is reported as a failure.
    ///
    /// # Panics
    ///
    /// Panics if a shard does not have the cached pool open, as the pool is open on every shard for
    /// as long as it is cached.
    pub fn handle_update_map(&self, request: &UpdateMapRequest) -> UpdateMapReply {
        debug!(
            pool = %request.pool(),
            map_version = request.map_version(),
            "handling map update request"
        );

        let result = self.update_map(request);

        if let Err(error) = &result {
            error!(pool = %request.pool(), %error, "map update request failed");
        }

        let reply = UpdateMapReply::new(ReplyStatus::from_result(&result));

        debug!(
            pool = %request.pool(),
            status = %reply.status(),
            "replying to map update request"
        );

        reply
    }

    fn update_map(&self, request: &UpdateMapRequest) -> Result<()> {
        let pool = self.lookup_or_create_pool(request.pool(), None)?;

        let id = pool.id();
        let map_version = request.map_version();

        // Held until the pool-wide version is overwritten. Shard tasks never take this lock.
        let mut current = pool.lock_map_version();

        if let Err(error) = self.run_on_all_shards(move |context| {
            context
                .registry()
                .update_map_version(id, map_version)
                .map(|_| ())
        }) {
            panic!("failed to propagate map version {map_version} of pool {id} to every shard: {error}");
        }

        let previous = mem::replace(&mut *current, map_version);
        drop(current);

        if map_version < previous {
            warn!(pool = %id, previous, map_version, "pool map version moved backwards");
        } else {
            debug!(pool = %id, previous, map_version, "updated pool map version");
        }

        MAP_UPDATES.with(Event::observe_once);
        Ok(())
    }
}

fn accept_resend(request: &ConnectRequest, existing: Capabilities) -> Result<()> {
    if existing == request.capabilities() {
        debug!(
            handle = %request.handle(),
            "handle is already connected with the same capabilities"
        );
        Ok(())
    } else {
        Err(Error::AlreadyExists {
            handle: request.handle(),
            existing,
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::fake::FakeCollaborators;
    use crate::{HandleId, PoolId};

    const POOL: PoolId = PoolId::new(0x1234);

    fn target(fakes: &FakeCollaborators) -> PoolTarget {
        fakes
            .install(PoolTarget::builder())
            .shard_count(nz!(2))
            .pin_shards(false)
            .build()
            .unwrap()
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn connect_then_disconnect_closes_pool() {
        let fakes = FakeCollaborators::new();
        let target = target(&fakes);

        let reply = target.handle_connect(&ConnectRequest::new(
            POOL,
            HandleId::new(1),
            Capabilities::READ_WRITE,
            3,
        ));
        assert!(reply.status().is_success());
        assert_eq!(target.handles().len(), 1);
        assert_eq!(target.lookup_pool(POOL).unwrap().map_version(), 3);
        assert_eq!(fakes.storage.open_count_for(POOL), 2);

        let reply =
            target.handle_disconnect(&DisconnectRequest::new(POOL, vec![HandleId::new(1)]));
        assert!(reply.status().is_success());
        assert!(target.handles().is_empty());
        assert!(target.lookup_pool(POOL).is_none());
        assert_eq!(fakes.storage.open_count(), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn connect_reports_pool_creation_failure() {
        let fakes = FakeCollaborators::new();
        let target = target(&fakes);
        fakes.storage.fail_next_opens(1);

        let reply = target.handle_connect(&ConnectRequest::new(
            POOL,
            HandleId::new(1),
            Capabilities::READ_ONLY,
            1,
        ));

        assert_eq!(reply.status(), ReplyStatus::FAILURE);
        assert!(target.handles().is_empty());
        assert!(target.pools().is_empty());
        assert_eq!(fakes.storage.open_count(), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn disconnect_validates_declared_count() {
        let fakes = FakeCollaborators::new();
        let target = target(&fakes);

        let missing = target.handle_disconnect(&DisconnectRequest::from_wire(POOL, None, 2));
        assert_eq!(missing.status(), ReplyStatus::FAILURE);

        let short = target.handle_disconnect(&DisconnectRequest::from_wire(
            POOL,
            Some(vec![HandleId::new(1)]),
            2,
        ));
        assert_eq!(short.status(), ReplyStatus::FAILURE);

        let empty = target.handle_disconnect(&DisconnectRequest::from_wire(POOL, None, 0));
        assert!(empty.status().is_success());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn update_map_of_uncached_pool_fails() {
        let fakes = FakeCollaborators::new();
        let target = target(&fakes);

        let reply = target.handle_update_map(&UpdateMapRequest::new(POOL, 5));

        assert_eq!(reply.status(), ReplyStatus::FAILURE);
        assert!(target.pools().is_empty());
    }

    #[test]
    fn resend_with_other_capabilities_is_a_conflict() {
        let request = ConnectRequest::new(POOL, HandleId::new(8), Capabilities::READ_ONLY, 1);

        assert!(accept_resend(&request, Capabilities::READ_ONLY).is_ok());
        assert_eq!(
            accept_resend(&request, Capabilities::EXCLUSIVE),
            Err(Error::AlreadyExists {
                handle: HandleId::new(8),
                existing: Capabilities::EXCLUSIVE,
            })
        );
    }
}
