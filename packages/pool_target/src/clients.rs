//! Services owned by the rest of the target process that this crate consults.
//!
//! The embedding process supplies one implementation of each trait when it builds a
//! [`PoolTarget`][crate::PoolTarget]. In-memory implementations for tests live in
//! [`fake`][crate::fake].

mod group;
mod placement_map;
mod storage;
mod target_files;

pub use group::*;
pub use placement_map::*;
pub use storage::*;
pub use target_files::*;
