use std::fmt::Debug;

use crate::{MapVersion, Result};

/// In-memory form of a pool map, describing where pool data lives across the cluster.
///
/// The structure of the map is owned by the placement layer; this crate only keeps the map alive
/// for as long as the pool that owns it and hands it to the group service.
pub trait PlacementMap: Debug + Send + Sync {
    /// The version the map was built from.
    fn version(&self) -> MapVersion;
}

/// Builds [`PlacementMap`] instances from their serialized form.
#[cfg_attr(test, mockall::automock)]
pub trait PlacementMapCodec: Send + Sync {
    /// Decodes a serialized pool map of the given version.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer does not hold a valid map.
    fn decode(&self, buffer: &[u8], version: MapVersion) -> Result<Box<dyn PlacementMap>>;
}
