//! GATT services and the handle ranges they span.

use std::fmt;

use crate::Uuid;

/// An inclusive range of attribute handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleRange {
    /// First handle in the range
    pub start: u16,
    /// Last handle in the range
    pub end: u16,
}

impl HandleRange {
    /// Creates the range `start..=end`.
    pub const fn new(start: u16, end: u16) -> Self {
        HandleRange { start, end }
    }

    /// Returns `true` if `handle` lies inside the range.
    #[inline]
    pub fn contains(&self, handle: u16) -> bool {
        (self.start..=self.end).contains(&handle)
    }
}

impl fmt::Display for HandleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}..=0x{:04x}", self.start, self.end)
    }
}

/// A Bluetooth GATT service found on the connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Service {
    /// The [`Uuid`] identifying the type of this GATT service
    pub uuid: Uuid,
    /// The attribute handles belonging to this service
    pub range: HandleRange,
    /// Whether this is a primary service of the device
    pub is_primary: bool,
}

impl Service {
    /// Creates a primary service.
    pub fn primary(uuid: Uuid, range: HandleRange) -> Self {
        Service {
            uuid,
            range,
            is_primary: true,
        }
    }
}
