#![warn(missing_docs)]

//! Gattrelay is a Bluetooth Low Energy (BLE) central that finds one target peripheral, walks its GATT database,
//! reads a batch of identification and telemetry attributes and relays the aggregated record to a cloud gateway.
//!
//! The crate is split along the same lines as the data flow:
//!
//! - [`filter`] decides which advertisements are worth connecting to.
//! - [`store`] owns the dynamically sized discovery batches (services, characteristics, descriptors) and the
//!   aggregation sets that collect read results.
//! - [`orchestrator`] is a pure state machine: it consumes [`Event`]s and produces [`Action`]s. It never talks to
//!   the radio directly, which keeps it testable without hardware.
//! - [`central`] is the asynchronous runner that executes actions on an [`Adapter`], feeds request failures back
//!   into the machine, runs the per-phase watchdog and hands finished records to a [`RecordSink`].
//! - [`relay`] formats records into relay requests and talks to the gateway over the framed [`link`].
//!
//! # Usage
//!
//! ```rust,no_run
//!# use gattrelay::{Central, Config, Event, RelayClient};
//!# async fn run<A, B, S>(adapter: A, bus: B, events: S) -> gattrelay::Result<()>
//!# where
//!#     A: gattrelay::Adapter + Send,
//!#     B: gattrelay::link::Bus,
//!#     S: futures_core::Stream<Item = Event> + Unpin,
//!# {
//!let config = Config::default();
//!let mut relay = RelayClient::new(bus, config.relay.clone());
//!relay.configure().await?;
//!
//!let mut central = Central::new(adapter, relay, config)?;
//!central.start().await?;
//!let outcome = central.run(events).await;
//!println!("cycle finished: {outcome:?}");
//!# Ok(())
//!# }
//! ```
//!
//! # Concurrency
//!
//! Everything runs on one task. The orchestrator updates its own state and the attribute store before it returns
//! any action, so a radio stack that delivers a completion re-entrantly while a request is being issued always sees
//! consistent state. Completions that refer to a connection that is no longer current are discarded.

pub mod adapter;
pub mod advertisement;
pub mod btuuid;
pub mod central;
pub mod characteristic;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod event;
pub mod filter;
pub mod link;
pub mod orchestrator;
pub mod record;
pub mod relay;
pub mod service;
pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub use adapter::{Adapter, ConnectionId, GattDatabase, Request};
pub use btuuid::BluetoothUuidExt;
pub use central::{Central, Outcome, RecordSink};
pub use characteristic::Characteristic;
pub use config::Config;
pub use descriptor::Descriptor;
pub use device::{AdvertisingDevice, Device};
pub use error::Error;
pub use event::Event;
pub use filter::{AdvertisementFilter, FilterDecision};
pub use orchestrator::{Action, Orchestrator, State};
pub use record::Record;
pub use relay::RelayClient;
pub use service::Service;
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A 48-bit Bluetooth device address, stored most significant octet first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates an address from its six octets, most significant first.
    pub const fn new(octets: [u8; 6]) -> Self {
        Address(octets)
    }

    /// The address octets, most significant first.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::with_message(error::ErrorKind::InvalidParameter, format!("invalid address '{s}'"));

        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Address(octets))
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The kind of a Bluetooth device address, as reported in advertising reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum AddressType {
    /// Public device address
    #[default]
    Public,
    /// Random device address
    Random,
    /// Resolvable private address resolved to a public identity
    RpaPublic,
    /// Resolvable private address resolved to a random identity
    RpaRandom,
}

/// Data included in a Bluetooth advertisement or scan reponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The (possibly shortened) local name of the device (CSS §A.1.2)
    pub local_name: Option<String>,
    /// Manufacturer specific data (CSS §A.1.4)
    pub manufacturer_data: Option<ManufacturerData>,
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub services: Vec<Uuid>,
    /// Service associated data (CSS §A.1.11)
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Transmitted power level (CSS §A.1.5)
    pub tx_power_level: Option<i16>,
    /// Advertising flags (CSS §A.1.3)
    pub flags: Option<u8>,
    /// Set to true for connectable advertising packets
    pub is_connectable: bool,
}

/// Manufacturer specific data included in Bluetooth advertisements. See the Bluetooth Core Specification Supplement
/// §A.1.4 for details.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManufacturerData {
    /// Company identifier (defined [here](https://www.bluetooth.com/specifications/assigned-numbers/company-identifiers/))
    pub company_id: u16,
    /// Manufacturer specific data
    pub data: Vec<u8>,
}

/// GATT characteristic properties as defined in the Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from the properties octet of a characteristic declaration.
    pub fn from_bits(bits: u8) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
            extended_properties: (bits & (1 << 7)) != 0,
        }
    }

    /// Raw transmutation to the properties octet of a characteristic declaration.
    pub fn to_bits(self) -> u8 {
        u8::from(self.broadcast)
            | (u8::from(self.read) << 1)
            | (u8::from(self.write_without_response) << 2)
            | (u8::from(self.write) << 3)
            | (u8::from(self.notify) << 4)
            | (u8::from(self.indicate) << 5)
            | (u8::from(self.authenticated_signed_writes) << 6)
            | (u8::from(self.extended_properties) << 7)
    }

    /// Returns `true` if the characteristic can push values by notification or indication.
    pub fn can_subscribe(self) -> bool {
        self.notify || self.indicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_and_parse() {
        let address: Address = "00:5f:bf:9F:9C:11".parse().unwrap();
        assert_eq!(address, Address::new([0x00, 0x5f, 0xbf, 0x9f, 0x9c, 0x11]));
        assert_eq!(address.to_string(), "00:5F:BF:9F:9C:11");

        assert!("00:5F:BF:9F:9C".parse::<Address>().is_err());
        assert!("00:5F:BF:9F:9C:11:22".parse::<Address>().is_err());
        assert!("00:5F:BF:9F:9C:1".parse::<Address>().is_err());
        assert!("00:5F:BF:9F:9C:GG".parse::<Address>().is_err());
    }

    #[test]
    fn address_serde_as_string() {
        let address = Address::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"DE:AD:BE:EF:00:01\"");
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), address);
    }

    #[test]
    fn properties_bits() {
        let props = CharacteristicProperties::from_bits(0x32);
        assert!(props.read && props.notify && props.indicate);
        assert!(!props.write);
        assert!(props.can_subscribe());
        assert_eq!(props.to_bits(), 0x32);
        assert!(!CharacteristicProperties::from_bits(0x02).can_subscribe());
    }
}
