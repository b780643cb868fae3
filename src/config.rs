//! Runtime configuration.
//!
//! Every section has defaults matching the reference deployment (an Omron blood-pressure cuff relayed through a
//! cellular gateway), so `Config::default()` is usable as-is and a JSON file only needs to name what differs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::btuuid::{characteristics, services};
use crate::error::{Error, ErrorKind};
use crate::{Address, Result, Uuid};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which advertisers to connect to
    pub filter: FilterConfig,
    /// How to scan and walk the GATT database
    pub discovery: DiscoveryConfig,
    /// Per-phase time budgets
    pub watchdog: WatchdogConfig,
    /// Relay gateway settings
    pub relay: RelayConfig,
}

/// Advertisement matching rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Addresses added to the controller allow list before scanning
    pub allow_list: Vec<Address>,
    /// Advertised names starting with this prefix are connected to
    pub name_prefix: Option<String>,
    /// Manufacturer company identifiers that mark a device as a target
    pub company_ids: Vec<u16>,
    /// Minimum manufacturer payload length (after the company identifier) for a company match
    pub min_manufacturer_payload: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            allow_list: vec![Address::new([0x00, 0x5f, 0xbf, 0x9f, 0x9c, 0x11])],
            name_prefix: Some("BLEsmart_00000154".to_owned()),
            company_ids: vec![0x020D],
            min_manufacturer_payload: 0,
        }
    }
}

/// Scan and GATT discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Length of one timed scan, in seconds
    pub scan_duration_secs: u64,
    /// Target services, in the order they are processed
    pub service_priority: Vec<Uuid>,
    /// Attributes whose values are raw bytes rather than text
    pub binary_attributes: Vec<Uuid>,
    /// Abort the connection when a characteristic count or listing cannot be obtained
    pub abort_on_count_failure: bool,
    /// Keep the connection open after all records are produced
    pub linger: bool,
    /// Transfer unit assumed until MTU exchange completes
    pub default_mtu: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            scan_duration_secs: 30,
            service_priority: vec![services::DEVICE_INFORMATION],
            binary_attributes: vec![
                characteristics::SYSTEM_ID,
                characteristics::IEEE_11073_20601_REGULATORY_CERTIFICATION_DATA_LIST,
            ],
            abort_on_count_failure: true,
            linger: false,
            default_mtu: 23,
        }
    }
}

impl DiscoveryConfig {
    /// Length of one timed scan.
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// Position of `uuid` in the processing order, or `None` if it is not a target service.
    pub fn priority_of(&self, uuid: &Uuid) -> Option<usize> {
        self.service_priority.iter().position(|x| x == uuid)
    }

    /// Returns `true` if values of `uuid` should be rendered as hex.
    pub fn is_binary(&self, uuid: &Uuid) -> bool {
        self.binary_attributes.contains(uuid)
    }
}

/// Time budgets for the phases of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Budget from connect request to connection, in seconds
    pub connect_secs: u64,
    /// Budget for MTU exchange and service discovery, in seconds
    pub discovery_secs: u64,
    /// Budget for reads and aggregation, in seconds
    pub aggregation_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            connect_secs: 10,
            discovery_secs: 15,
            aggregation_secs: 15,
        }
    }
}

/// How per-record publishing reacts to relay failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// One attempt; failures are reported and the record is dropped
    #[default]
    BestEffort,
    /// Retry with backoff within the configured budget
    Bounded,
}

/// Relay gateway settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Product identifier sent with the hub configuration; omitted when the gateway is already provisioned
    pub product: Option<String>,
    /// Serial number sent with the hub configuration
    pub serial_number: String,
    /// Hub sync mode
    pub mode: String,
    /// Notefile records are appended to
    pub file: String,
    /// Ask the hub to sync each record immediately
    pub durable: bool,
    /// Maximum rendered length of one attribute value, in characters
    pub max_value_len: usize,
    /// Retry budget for the startup configuration, in seconds
    pub configure_timeout_secs: u64,
    /// Retry budget for bounded publishing, in seconds
    pub publish_timeout_secs: u64,
    /// Publishing policy for records
    pub publish_mode: PublishMode,
    /// Response polls allowed per transaction
    pub poll_budget: u32,
    /// Delay between response polls, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            product: None,
            serial_number: "omron-relay".to_owned(),
            mode: "continuous".to_owned(),
            file: "omron.qo".to_owned(),
            durable: true,
            max_value_len: 31,
            configure_timeout_secs: 30,
            publish_timeout_secs: 10,
            publish_mode: PublishMode::BestEffort,
            poll_budget: 200,
            poll_interval_ms: 50,
        }
    }
}

impl RelayConfig {
    /// Delay between response polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Parses a configuration from JSON and validates it. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|err| Error::new(ErrorKind::Configuration, Some(Box::new(err)), "invalid configuration".into()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            Error::new(
                ErrorKind::Configuration,
                Some(Box::new(err)),
                format!("failed to read {}", path.display()),
            )
        })?;
        Self::from_json(&contents)
    }

    /// Checks the values that would make a cycle impossible.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| -> Result<()> { Err(Error::with_message(ErrorKind::Configuration, message)) };

        if self.relay.file.is_empty() {
            return invalid("relay file must not be empty");
        }
        if self.relay.max_value_len == 0 {
            return invalid("relay max_value_len must be positive");
        }
        if self.relay.poll_budget == 0 {
            return invalid("relay poll_budget must be positive");
        }
        if self.discovery.service_priority.is_empty() {
            return invalid("service_priority must name at least one service");
        }
        if self.discovery.scan_duration_secs == 0 {
            return invalid("scan duration must be positive");
        }
        let budgets = [
            self.watchdog.connect_secs,
            self.watchdog.discovery_secs,
            self.watchdog.aggregation_secs,
        ];
        if budgets.contains(&0) {
            return invalid("watchdog budgets must be positive");
        }
        Ok(())
    }
}
