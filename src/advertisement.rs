//! Parsing of raw advertising and scan-response payloads into [`AdvertisementData`].

use std::collections::HashMap;

use tracing::trace;

use crate::{AdvertisementData, BluetoothUuidExt, ManufacturerData, Uuid};

/// AD type codes from the Bluetooth Assigned Numbers document.
pub mod ad_types {
    #![allow(missing_docs)]

    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_SERVICE_UUIDS_16: u8 = 0x02;
    pub const COMPLETE_SERVICE_UUIDS_16: u8 = 0x03;
    pub const INCOMPLETE_SERVICE_UUIDS_32: u8 = 0x04;
    pub const COMPLETE_SERVICE_UUIDS_32: u8 = 0x05;
    pub const INCOMPLETE_SERVICE_UUIDS_128: u8 = 0x06;
    pub const COMPLETE_SERVICE_UUIDS_128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const SERVICE_DATA_16: u8 = 0x16;
    pub const SERVICE_DATA_32: u8 = 0x20;
    pub const SERVICE_DATA_128: u8 = 0x21;
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;
}

/// Iterator over the `(ad_type, data)` structures of an advertising payload.
///
/// Iteration stops at the first zero-length structure or at a structure whose length runs past the end of the
/// payload; whatever was parsed up to that point is kept.
#[derive(Debug, Clone)]
pub struct AdStructures<'a> {
    data: &'a [u8],
}

impl<'a> AdStructures<'a> {
    /// Iterates the AD structures in `data`.
    pub fn new(data: &'a [u8]) -> Self {
        AdStructures { data }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.data.split_first()?;
        let len = usize::from(len);
        if len == 0 || len > rest.len() {
            if len != 0 {
                trace!(len, remaining = rest.len(), "truncated AD structure");
            }
            self.data = &[];
            return None;
        }

        let (structure, tail) = rest.split_at(len);
        self.data = tail;
        Some((structure[0], &structure[1..]))
    }
}

impl ManufacturerData {
    /// Decodes manufacturer specific data. Payloads shorter than the 2-byte company identifier yield `None`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data {
            [lo, hi, rest @ ..] => Some(ManufacturerData {
                company_id: u16::from_le_bytes([*lo, *hi]),
                data: rest.to_vec(),
            }),
            _ => None,
        }
    }
}

impl AdvertisementData {
    /// Parses an advertising payload followed by an optional scan response.
    ///
    /// A complete local name takes precedence over a shortened one, and the first manufacturer data structure wins.
    pub fn parse(adv_data: &[u8], scan_rsp: &[u8], is_connectable: bool) -> Self {
        let mut res = AdvertisementData {
            is_connectable,
            ..Default::default()
        };
        let mut shortened_name = None;
        let mut service_data = HashMap::new();

        for (ad_type, data) in AdStructures::new(adv_data).chain(AdStructures::new(scan_rsp)) {
            match ad_type {
                ad_types::FLAGS => res.flags = data.first().copied(),
                ad_types::INCOMPLETE_SERVICE_UUIDS_16 | ad_types::COMPLETE_SERVICE_UUIDS_16 => {
                    push_uuids(&mut res.services, data, 2)
                }
                ad_types::INCOMPLETE_SERVICE_UUIDS_32 | ad_types::COMPLETE_SERVICE_UUIDS_32 => {
                    push_uuids(&mut res.services, data, 4)
                }
                ad_types::INCOMPLETE_SERVICE_UUIDS_128 | ad_types::COMPLETE_SERVICE_UUIDS_128 => {
                    push_uuids(&mut res.services, data, 16)
                }
                ad_types::SHORTENED_LOCAL_NAME => {
                    shortened_name.get_or_insert_with(|| String::from_utf8_lossy(data).into_owned());
                }
                ad_types::COMPLETE_LOCAL_NAME => {
                    res.local_name.get_or_insert_with(|| String::from_utf8_lossy(data).into_owned());
                }
                ad_types::TX_POWER_LEVEL => res.tx_power_level = data.first().map(|&x| i16::from(x as i8)),
                ad_types::SERVICE_DATA_16 => insert_service_data(&mut service_data, data, 2),
                ad_types::SERVICE_DATA_32 => insert_service_data(&mut service_data, data, 4),
                ad_types::SERVICE_DATA_128 => insert_service_data(&mut service_data, data, 16),
                ad_types::MANUFACTURER_SPECIFIC_DATA => {
                    if res.manufacturer_data.is_none() {
                        res.manufacturer_data = ManufacturerData::parse(data);
                    }
                }
                _ => (),
            }
        }

        if res.local_name.is_none() {
            res.local_name = shortened_name;
        }
        res.service_data = service_data;
        res
    }
}

fn push_uuids(services: &mut Vec<Uuid>, data: &[u8], width: usize) {
    services.extend(data.chunks_exact(width).filter_map(Uuid::from_le_bluetooth_bytes));
}

fn insert_service_data(service_data: &mut HashMap<Uuid, Vec<u8>>, data: &[u8], width: usize) {
    if data.len() >= width {
        let (uuid, value) = data.split_at(width);
        if let Some(uuid) = Uuid::from_le_bluetooth_bytes(uuid) {
            service_data.insert(uuid, value.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::services;

    #[test]
    fn parses_name_manufacturer_and_services() {
        let adv = [
            0x02, 0x01, 0x06, // flags
            0x05, 0x03, 0x0a, 0x18, 0x10, 0x18, // 16-bit services
            0x09, 0xff, 0x0d, 0x02, 1, 2, 3, 4, 5, 6, // manufacturer data
            0x02, 0x0a, 0xfc, // tx power -4
        ];
        let rsp = [0x06, 0x09, b'B', b'L', b'E', b's', b'm'];

        let data = AdvertisementData::parse(&adv, &rsp, true);
        assert_eq!(data.flags, Some(0x06));
        assert_eq!(data.services, vec![services::DEVICE_INFORMATION, services::BLOOD_PRESSURE]);
        assert_eq!(
            data.manufacturer_data,
            Some(ManufacturerData {
                company_id: 0x020D,
                data: vec![1, 2, 3, 4, 5, 6]
            })
        );
        assert_eq!(data.tx_power_level, Some(-4));
        assert_eq!(data.local_name.as_deref(), Some("BLEsm"));
        assert!(data.is_connectable);
    }

    #[test]
    fn complete_name_wins_over_shortened() {
        let adv = [0x03, 0x08, b'A', b'B', 0x04, 0x09, b'A', b'B', b'C'];
        let data = AdvertisementData::parse(&adv, &[], false);
        assert_eq!(data.local_name.as_deref(), Some("ABC"));
    }

    #[test]
    fn malformed_structures_stop_parsing() {
        let adv = [0x03, 0x09, b'O', b'K', 0x00, 0x03, 0x09, b'N', b'O'];
        let data = AdvertisementData::parse(&adv, &[], false);
        assert_eq!(data.local_name.as_deref(), Some("OK"));

        let overrun = [0x02, 0x01, 0x06, 0x09, 0xff, 0x0d];
        let data = AdvertisementData::parse(&overrun, &[], false);
        assert_eq!(data.flags, Some(0x06));
        assert_eq!(data.manufacturer_data, None);
    }

    #[test]
    fn short_manufacturer_data_is_ignored() {
        assert_eq!(ManufacturerData::parse(&[0x0d]), None);
        assert_eq!(ManufacturerData::parse(&[]), None);
        let adv = [0x02, 0xff, 0x0d];
        assert_eq!(AdvertisementData::parse(&adv, &[], true).manufacturer_data, None);
    }

    #[test]
    fn service_data() {
        let adv = [0x05, 0x16, 0x0f, 0x18, 0x64, 0x00];
        let data = AdvertisementData::parse(&adv, &[], true);
        assert_eq!(data.service_data.get(&services::BATTERY), Some(&vec![0x64, 0x00]));
    }
}
