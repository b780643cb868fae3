//! Advertisement matching.

use tracing::trace;

use crate::config::FilterConfig;
use crate::{Address, AdvertisingDevice, Device};

/// What to do about one advertising report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Not a device of interest
    Ignore,
    /// A device to keep on the controller allow list: a known address without an identifying payload, or a match
    /// that is not currently accepting connections
    AllowListAdd(Device),
    /// A target device; stop scanning and connect
    ConnectNow(Device),
}

/// Decides which advertisers are worth connecting to.
///
/// A device matches by company identifier in its manufacturer data or by advertised name prefix; a company match
/// wins when both are present and marks the device as a target. A match advertising as non-connectable is put on the
/// allow list instead, so the controller can pick it up once it accepts connections. Known addresses that match
/// neither are only kept on the allow list.
#[derive(Debug, Clone)]
pub struct AdvertisementFilter {
    config: FilterConfig,
}

impl AdvertisementFilter {
    /// Creates a filter from its configuration.
    pub fn new(config: FilterConfig) -> Self {
        AdvertisementFilter { config }
    }

    /// The addresses that belong on the controller allow list.
    pub fn allow_list(&self) -> &[Address] {
        &self.config.allow_list
    }

    /// Evaluates one advertising report. Has no side effects.
    pub fn evaluate(&self, report: &AdvertisingDevice) -> FilterDecision {
        let mut device = report.device.clone();
        if device.name.is_none() {
            device.name = report.adv_data.local_name.clone();
        }

        let matched = if self.company_match(report) {
            device.is_target = true;
            true
        } else {
            self.name_match(device.name.as_deref())
        };

        if matched {
            if report.adv_data.is_connectable {
                return FilterDecision::ConnectNow(device);
            }
            trace!(address = %device.address, "match is not connectable");
            return FilterDecision::AllowListAdd(device);
        }

        if self.config.allow_list.contains(&device.address) {
            return FilterDecision::AllowListAdd(device);
        }

        trace!(address = %device.address, "advertisement ignored");
        FilterDecision::Ignore
    }

    fn company_match(&self, report: &AdvertisingDevice) -> bool {
        report.adv_data.manufacturer_data.as_ref().is_some_and(|data| {
            self.config.company_ids.contains(&data.company_id) && data.data.len() >= self.config.min_manufacturer_payload
        })
    }

    fn name_match(&self, name: Option<&str>) -> bool {
        match (&self.config.name_prefix, name) {
            (Some(prefix), Some(name)) => !prefix.is_empty() && name.starts_with(prefix.as_str()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressType, AdvertisementData, ManufacturerData};

    const KNOWN: Address = Address::new([0x00, 0x5f, 0xbf, 0x9f, 0x9c, 0x11]);
    const OTHER: Address = Address::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

    fn report(address: Address, name: Option<&str>, manufacturer: Option<(u16, &[u8])>) -> AdvertisingDevice {
        let mut device = Device::new(address, AddressType::Public);
        device.name = name.map(str::to_owned);
        AdvertisingDevice {
            device,
            adv_data: AdvertisementData {
                local_name: name.map(str::to_owned),
                manufacturer_data: manufacturer.map(|(company_id, data)| ManufacturerData {
                    company_id,
                    data: data.to_vec(),
                }),
                is_connectable: true,
                ..Default::default()
            },
            rssi: Some(-70),
        }
    }

    fn filter() -> AdvertisementFilter {
        AdvertisementFilter::new(FilterConfig::default())
    }

    #[test]
    fn company_id_marks_target() {
        match filter().evaluate(&report(OTHER, None, Some((0x020D, &[1, 2, 3, 4, 5, 6])))) {
            FilterDecision::ConnectNow(device) => assert!(device.is_target),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn name_prefix_connects_without_target_tag() {
        match filter().evaluate(&report(OTHER, Some("BLEsmart_0000015404"), None)) {
            FilterDecision::ConnectNow(device) => assert!(!device.is_target),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn company_match_takes_precedence_over_name() {
        let company_only = filter().evaluate(&report(OTHER, None, Some((0x020D, &[0xaa, 0xbb]))));
        let both = filter().evaluate(&report(OTHER, Some("BLEsmart_00000154"), Some((0x020D, &[0xaa, 0xbb]))));
        let name_only = filter().evaluate(&report(OTHER, Some("BLEsmart_00000154"), Some((0x004C, &[0xaa, 0xbb]))));

        let tag = |decision: &FilterDecision| match decision {
            FilterDecision::ConnectNow(device) => Some(device.is_target),
            _ => None,
        };
        assert_eq!(tag(&company_only), Some(true));
        assert_eq!(tag(&both), Some(true));
        assert_eq!(tag(&name_only), Some(false));
    }

    #[test]
    fn known_address_without_payload_is_allow_listed() {
        assert!(matches!(
            filter().evaluate(&report(KNOWN, Some("cuff"), None)),
            FilterDecision::AllowListAdd(device) if device.address == KNOWN
        ));
    }

    #[test]
    fn non_connectable_match_is_allow_listed() {
        let mut beacon = report(OTHER, None, Some((0x020D, &[1, 2, 3, 4, 5, 6])));
        beacon.adv_data.is_connectable = false;
        assert!(matches!(
            filter().evaluate(&beacon),
            FilterDecision::AllowListAdd(device) if device.address == OTHER && device.is_target
        ));

        let mut named = report(OTHER, Some("BLEsmart_0000015404"), None);
        named.adv_data.is_connectable = false;
        assert!(matches!(filter().evaluate(&named), FilterDecision::AllowListAdd(_)));
    }

    #[test]
    fn unrelated_advertisers_are_ignored() {
        assert_eq!(filter().evaluate(&report(OTHER, Some("headphones"), None)), FilterDecision::Ignore);
        assert_eq!(
            filter().evaluate(&report(OTHER, None, Some((0x0006, &[1, 2])))),
            FilterDecision::Ignore
        );
    }

    #[test]
    fn payload_length_threshold() {
        let config = FilterConfig {
            min_manufacturer_payload: 6,
            ..Default::default()
        };
        let filter = AdvertisementFilter::new(config);
        assert_eq!(filter.evaluate(&report(OTHER, None, Some((0x020D, &[1, 2])))), FilterDecision::Ignore);
        assert!(matches!(
            filter.evaluate(&report(OTHER, None, Some((0x020D, &[1, 2, 3, 4, 5, 6])))),
            FilterDecision::ConnectNow(_)
        ));
    }
}
