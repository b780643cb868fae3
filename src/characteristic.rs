//! GATT characteristics and the descriptor values that subscribe to them.

use crate::{CharacteristicProperties, Uuid};

/// Value written to the client characteristic configuration descriptor to enable notifications.
pub const ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
/// Value written to the client characteristic configuration descriptor to enable indications.
pub const ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];

/// A Bluetooth GATT characteristic as reported by the local attribute cache
///
/// The parent service is not stored; it is the service whose handle range contains [`handle`][Self::handle].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Characteristic {
    /// The [`Uuid`] identifying the type of this GATT characteristic
    pub uuid: Uuid,
    /// The handle of the characteristic value
    pub handle: u16,
    /// The properties of this GATT characteristic
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    /// Creates a characteristic from its declaration fields.
    pub fn new(uuid: Uuid, handle: u16, properties: CharacteristicProperties) -> Self {
        Characteristic {
            uuid,
            handle,
            properties,
        }
    }

    /// The client configuration value that subscribes to this characteristic, if it supports subscriptions.
    ///
    /// Indications are preferred over notifications when both are supported.
    pub fn subscription_value(&self) -> Option<[u8; 2]> {
        if self.properties.indicate {
            Some(ENABLE_INDICATION)
        } else if self.properties.notify {
            Some(ENABLE_NOTIFICATION)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::characteristics;

    #[test]
    fn indicate_preferred_over_notify() {
        let both = Characteristic::new(
            characteristics::BLOOD_PRESSURE_MEASUREMENT,
            0x0012,
            CharacteristicProperties::from_bits(0x30),
        );
        assert_eq!(both.subscription_value(), Some(ENABLE_INDICATION));

        let notify = Characteristic::new(characteristics::BATTERY_LEVEL, 0x0020, CharacteristicProperties::from_bits(0x12));
        assert_eq!(notify.subscription_value(), Some(ENABLE_NOTIFICATION));

        let read_only = Characteristic::new(characteristics::SYSTEM_ID, 0x0030, CharacteristicProperties::from_bits(0x02));
        assert_eq!(read_only.subscription_value(), None);
    }
}
