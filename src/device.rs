//! Devices seen while scanning.

use std::fmt;

use crate::{Address, AddressType, AdvertisementData};

/// A Bluetooth LE device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    /// The device address
    pub address: Address,
    /// The kind of address the device advertised with
    pub address_type: AddressType,
    /// The advertised local name, if any
    pub name: Option<String>,
    /// Set when the device was matched by its manufacturer company identifier
    pub is_target: bool,
}

impl fmt::Display for Device {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.address),
            None => fmt::Display::fmt(&self.address, f),
        }
    }
}

impl Device {
    /// Creates a device with no name that has not been matched yet.
    pub fn new(address: Address, address_type: AddressType) -> Self {
        Device {
            address,
            address_type,
            name: None,
            is_target: false,
        }
    }
}

/// Represents a device discovered during a scan operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingDevice {
    /// The source of the advertisement
    pub device: Device,
    /// The advertisment data
    pub adv_data: AdvertisementData,
    /// The signal strength in dBm of the received advertisement packet
    pub rssi: Option<i16>,
}

impl AdvertisingDevice {
    /// Builds an advertising report from the raw advertising and scan-response payloads.
    pub fn from_raw(
        address: Address,
        address_type: AddressType,
        rssi: Option<i16>,
        adv_data: &[u8],
        scan_rsp: &[u8],
        is_connectable: bool,
    ) -> Self {
        let adv_data = AdvertisementData::parse(adv_data, scan_rsp, is_connectable);
        let mut device = Device::new(address, address_type);
        device.name = adv_data.local_name.clone();
        AdvertisingDevice { device, adv_data, rssi }
    }
}
