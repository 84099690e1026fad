use std::fmt;

use crate::{PlacementMap, PoolId, Result};

/// Membership group formed for a pool by the group service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Group {
    name: String,
}

impl Group {
    /// Creates a group descriptor with the name assigned by the group service.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The name the group service assigned to the group.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The cluster membership service that forms and dissolves pool groups.
pub trait GroupService: Send + Sync {
    /// Forms the group of `pool` from the members listed in `map`.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be formed.
    fn create_group(&self, pool: PoolId, map: &dyn PlacementMap) -> Result<Group>;

    /// Dissolves a group previously returned by [`create_group()`][Self::create_group].
    ///
    /// # Errors
    ///
    /// Returns an error if the group service could not dissolve the group. Callers log the
    /// failure and carry on; the group is considered gone either way.
    fn destroy_group(&self, pool: PoolId, group: &Group) -> Result<()>;
}
