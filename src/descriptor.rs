//! GATT descriptors.

use crate::btuuid::descriptors;
use crate::Uuid;

/// A Bluetooth GATT descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// The [`Uuid`] identifying the type of this GATT descriptor
    pub uuid: Uuid,
    /// The attribute handle of this descriptor
    pub handle: u16,
}

impl Descriptor {
    /// Creates a descriptor.
    pub fn new(uuid: Uuid, handle: u16) -> Self {
        Descriptor { uuid, handle }
    }

    /// Returns `true` for the client characteristic configuration descriptor.
    #[inline]
    pub fn is_client_configuration(&self) -> bool {
        self.uuid == descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION
    }
}
