//! Status bitset carried by module records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Install/activity state of a module
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusFlags(u32);

impl StatusFlags {
    pub const DISABLED: Self = Self(0x01);
    pub const UPDATING: Self = Self(0x02);
    pub const ACTIVE: Self = Self(0x04);
    pub const UNINSTALLING: Self = Self(0x08);
    /// Present only in the pending-update root
    pub const UPDATE_PENDING_ONLY: Self = Self(0x10);
    pub const MAYBE_ACTIVE: Self = Self(0x20);
    pub const HAS_ACTIVE_MOUNT: Self = Self(0x40);

    /// Never set on a valid record
    pub const FENCE: Self = Self(0x1000_0000);
    pub const SOURCED_FROM_REMOTE_CACHE: Self = Self(0x2000_0000);
    pub const INTERNAL_UNPROCESSED_MARKER: Self = Self(0x4000_0000);
    pub const METADATA_INVALID: Self = Self(0x8000_0000);

    /// Either flavour of "active"
    pub const ACTIVE_ANY: Self = Self(Self::ACTIVE.0 | Self::MAYBE_ACTIVE.0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// True if any bit of `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    /// Keep only the bits also set in `mask`
    pub fn retain(&mut self, mask: Self) {
        self.0 &= mask.0;
    }

    pub const fn is_active(self) -> bool {
        self.intersects(Self::ACTIVE_ANY)
    }

    pub const fn is_invalid(self) -> bool {
        self.intersects(Self::METADATA_INVALID)
    }
}

impl BitOr for StatusFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StatusFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(StatusFlags, &str); 11] = [
            (StatusFlags::DISABLED, "DISABLED"),
            (StatusFlags::UPDATING, "UPDATING"),
            (StatusFlags::ACTIVE, "ACTIVE"),
            (StatusFlags::UNINSTALLING, "UNINSTALLING"),
            (StatusFlags::UPDATE_PENDING_ONLY, "UPDATE_PENDING_ONLY"),
            (StatusFlags::MAYBE_ACTIVE, "MAYBE_ACTIVE"),
            (StatusFlags::HAS_ACTIVE_MOUNT, "HAS_ACTIVE_MOUNT"),
            (StatusFlags::FENCE, "FENCE"),
            (StatusFlags::SOURCED_FROM_REMOTE_CACHE, "SOURCED_FROM_REMOTE_CACHE"),
            (StatusFlags::INTERNAL_UNPROCESSED_MARKER, "INTERNAL_UNPROCESSED_MARKER"),
            (StatusFlags::METADATA_INVALID, "METADATA_INVALID"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "StatusFlags({:#x}: {})", self.0, names.join(" | "))
    }
}
