use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Version number of a pool map.
///
/// Versions are assigned by the control plane; this crate only stores and propagates them.
pub type MapVersion = u32;

/// Zero-based index of an execution shard on this target.
pub type ShardId = usize;

/// Writes a 128-bit identifier in the canonical hyphenated UUID layout.
#[expect(
    clippy::cast_possible_truncation,
    reason = "each group is masked to its width before the cast"
)]
fn fmt_uuid(value: u128, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
        f,
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (value >> 96) as u32,
        ((value >> 80) & 0xFFFF) as u16,
        ((value >> 64) & 0xFFFF) as u16,
        ((value >> 48) & 0xFFFF) as u16,
        value & 0xFFFF_FFFF_FFFF
    )
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(u128);

        impl $name {
            /// Creates the identifier from its 128-bit value.
            #[must_use]
            pub const fn new(value: u128) -> Self {
                Self(value)
            }

            /// Returns the 128-bit value of the identifier.
            #[must_use]
            pub const fn get(self) -> u128 {
                self.0
            }
        }

        impl From<u128> for $name {
            fn from(value: u128) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt_uuid(self.0, f)
            }
        }
    };
}

uuid_id! {
    /// Cluster-wide identifier of a pool.
    PoolId
}

uuid_id! {
    /// Identifier of a pool handle, chosen by the client that connects.
    HandleId
}

/// Capability flags requested by a client when it connects to a pool.
///
/// The flags are compared as a whole: a connect request that reuses a handle identifier is only
/// accepted if it asks for exactly the same flags as the handle that already exists.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Capabilities(u64);

impl Capabilities {
    /// No capabilities.
    pub const NONE: Self = Self(0);

    /// Read-only access.
    pub const READ_ONLY: Self = Self(1 << 0);

    /// Read-write access.
    pub const READ_WRITE: Self = Self(1 << 1);

    /// Exclusive access.
    pub const EXCLUSIVE: Self = Self(1 << 2);

    /// Creates a set of capabilities from raw wire bits. Unknown bits are preserved.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw wire bits.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether every flag in `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolId: Send, Sync, Copy);
    assert_impl_all!(HandleId: Send, Sync, Copy);

    #[test]
    fn display_uses_uuid_layout() {
        let id = PoolId::new(0x0123_4567_89ab_cdef_0011_2233_4455_6677);

        assert_eq!(id.to_string(), "01234567-89ab-cdef-0011-223344556677");
    }

    #[test]
    fn display_pads_small_values() {
        assert_eq!(
            HandleId::new(1).to_string(),
            "00000000-0000-0000-0000-000000000001"
        );
    }

    #[test]
    fn capabilities_combine_and_contain() {
        let mut capabilities = Capabilities::READ_ONLY;
        capabilities |= Capabilities::EXCLUSIVE;

        assert!(capabilities.contains(Capabilities::READ_ONLY));
        assert!(capabilities.contains(Capabilities::EXCLUSIVE));
        assert!(!capabilities.contains(Capabilities::READ_WRITE));
        assert_eq!(capabilities, Capabilities::from_bits(0b101));
        assert_eq!(
            Capabilities::READ_ONLY | Capabilities::READ_WRITE,
            Capabilities::from_bits(0b11)
        );
    }

    #[test]
    fn capabilities_keep_unknown_bits() {
        let capabilities = Capabilities::from_bits(0x8000_0000_0000_0001);

        assert_eq!(capabilities.bits(), 0x8000_0000_0000_0001);
        assert_eq!(capabilities.to_string(), "0x8000000000000001");
    }
}
