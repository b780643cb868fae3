//! Client for the cloud relay gateway.

use std::time::Duration;

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::btuuid::BluetoothUuidExt;
use crate::config::{PublishMode, RelayConfig};
use crate::error::{Error, ErrorKind};
use crate::link::{Bus, BusSettings, Link};
use crate::record::Record;
use crate::Result;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Body key holding the device address.
pub const ADDRESS_KEY: &str = "Bluetooth Device Address";

/// Body key holding the service tag.
pub const SERVICE_KEY: &str = "GATT Service";

/// A `note.add` request carrying one [`Record`].
///
/// Serializes as `{"req":"note.add","file":..,"sync":..,"body":{..}}`, keeping the body in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Notefile the record is appended to
    pub target: String,
    /// Whether the hub should sync immediately
    pub durable: bool,
    /// Flat key/value body
    pub body: Vec<(String, String)>,
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Body<'a>(&'a [(String, String)]);

        impl Serialize for Body<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (key, value) in self.0 {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }

        let mut state = serializer.serialize_struct("Envelope", 4)?;
        state.serialize_field("req", "note.add")?;
        state.serialize_field("file", &self.target)?;
        state.serialize_field("sync", &self.durable)?;
        state.serialize_field("body", &Body(&self.body))?;
        state.end()
    }
}

#[derive(Debug, Serialize)]
struct HubSet<'a> {
    req: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    product: Option<&'a str>,
    mode: &'a str,
    sn: &'a str,
}

/// Submits requests and records to the relay gateway over a [`Link`].
#[derive(Debug)]
pub struct RelayClient<B> {
    link: Link<B>,
    config: RelayConfig,
}

impl<B: Bus> RelayClient<B> {
    /// Creates a client talking over `bus` with the default bus settings.
    pub fn new(bus: B, config: RelayConfig) -> Self {
        let link = Link::new(bus, BusSettings::default()).with_polling(config.poll_budget, config.poll_interval());
        RelayClient { link, config }
    }

    /// The underlying link.
    pub fn link(&self) -> &Link<B> {
        &self.link
    }

    /// The client configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Sends one request and returns the decoded response. A single attempt.
    pub async fn request<T: Serialize + Sync>(&mut self, request: &T) -> Result<Json> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        let raw = self.link.transaction(&line).await?;
        let response: Json = serde_json::from_slice(&raw)?;
        if let Some(err) = response.get("err") {
            let message = err.as_str().map_or_else(|| err.to_string(), str::to_owned);
            return Err(Error::with_message(ErrorKind::Relay, message));
        }
        debug!(%response, "relay response");
        Ok(response)
    }

    /// Sends one request, retrying with exponential backoff until it succeeds or `budget` would be exceeded.
    ///
    /// The error of the last attempt is returned when the budget runs out.
    pub async fn request_with_retry<T: Serialize + Sync>(&mut self, request: &T, budget: Duration) -> Result<Json> {
        let deadline = Instant::now() + budget;
        let mut delay = INITIAL_BACKOFF;
        loop {
            match self.request(request).await {
                Ok(response) => return Ok(response),
                Err(err) if Instant::now() + delay > deadline => return Err(err),
                Err(err) => {
                    warn!(%err, ?delay, "relay request failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Configures the hub. Must succeed before any record is published.
    pub async fn configure(&mut self) -> Result<()> {
        let product = self.config.product.clone();
        let mode = self.config.mode.clone();
        let sn = self.config.serial_number.clone();
        let request = HubSet {
            req: "hub.set",
            product: product.as_deref(),
            mode: &mode,
            sn: &sn,
        };
        let budget = Duration::from_secs(self.config.configure_timeout_secs);
        self.request_with_retry(&request, budget)
            .await
            .map_err(|err| err.escalate(ErrorKind::Configuration, "hub configuration failed"))?;
        info!(mode = %mode, sn = %sn, "relay configured");
        Ok(())
    }

    /// Builds the `note.add` envelope for `record`.
    pub fn envelope(&self, record: &Record) -> Envelope {
        let mut body = Vec::with_capacity(record.entries.len() + 2);
        body.push((ADDRESS_KEY.to_owned(), record.address.to_string()));
        body.push((SERVICE_KEY.to_owned(), record.service.to_tag()));
        body.extend(
            record
                .entries
                .iter()
                .map(|entry| (entry.uuid.to_tag(), entry.value.render(self.config.max_value_len))),
        );
        Envelope {
            target: self.config.file.clone(),
            durable: self.config.durable,
            body,
        }
    }

    /// Publishes a ready record according to the configured [`PublishMode`].
    pub async fn publish(&mut self, record: &Record) -> Result<()> {
        if !record.is_ready() {
            return Err(Error::with_message(ErrorKind::InvalidParameter, "record is not ready"));
        }

        let envelope = self.envelope(record);
        match self.config.publish_mode {
            PublishMode::BestEffort => self.request(&envelope).await?,
            PublishMode::Bounded => {
                let budget = Duration::from_secs(self.config.publish_timeout_secs);
                self.request_with_retry(&envelope, budget).await?
            }
        };

        info!(
            address = %record.address,
            service = %record.service.to_tag(),
            entries = record.entries.len(),
            unavailable = record.unavailable(),
            "record published"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl<B: Bus> crate::central::RecordSink for RelayClient<B> {
    async fn submit(&mut self, record: Record) -> Result<()> {
        self.publish(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::{characteristics, services};
    use crate::link::fake::ScriptedBus;
    use crate::record::{Entry, Value};
    use crate::Address;

    fn config() -> RelayConfig {
        RelayConfig {
            poll_interval_ms: 0,
            ..Default::default()
        }
    }

    fn record() -> Record {
        let mut record = Record::new(Address::new([0x00, 0x5f, 0xbf, 0x9f, 0x9c, 0x11]), services::DEVICE_INFORMATION);
        record.entries = vec![
            Entry {
                uuid: characteristics::MODEL_NUMBER_STRING,
                handle: 0x12,
                value: Value::Text("HEM-7600T".into()),
            },
            Entry {
                uuid: characteristics::SYSTEM_ID,
                handle: 0x14,
                value: Value::Binary(vec![0x11, 0x9c, 0x9f, 0x00, 0x00, 0xbf, 0x5f, 0x00]),
            },
            Entry {
                uuid: characteristics::SERIAL_NUMBER_STRING,
                handle: 0x16,
                value: Value::Unavailable,
            },
        ];
        record.seal();
        record
    }

    #[test]
    fn envelope_is_bit_exact() {
        let client = RelayClient::new(ScriptedBus::default(), config());
        let json = serde_json::to_string(&client.envelope(&record())).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"req":"note.add","file":"omron.qo","sync":true,"body":{"#,
                r#""Bluetooth Device Address":"00:5F:BF:9F:9C:11","GATT Service":"0x180A","#,
                r#""0x2A24":"HEM-7600T","0x2A23":"0x119C9F0000BF5F00","0x2A25":"<unavailable>"}}"#
            )
        );
    }

    #[tokio::test]
    async fn configure_sends_hub_set() {
        let mut client = RelayClient::new(ScriptedBus::replying(["{}\n"]), config());
        client.configure().await.unwrap();
        let sent = String::from_utf8(client.link().bus().requests[0].clone()).unwrap();
        assert_eq!(sent, "{\"req\":\"hub.set\",\"mode\":\"continuous\",\"sn\":\"omron-relay\"}\n");

        let config = RelayConfig {
            product: Some("com.example:bp".into()),
            ..config()
        };
        let mut client = RelayClient::new(ScriptedBus::replying(["{}\n"]), config);
        client.configure().await.unwrap();
        let sent = String::from_utf8(client.link().bus().requests[0].clone()).unwrap();
        assert!(sent.starts_with(r#"{"req":"hub.set","product":"com.example:bp","#));
    }

    #[tokio::test(start_paused = true)]
    async fn configure_failure_is_fatal() {
        let config = RelayConfig {
            configure_timeout_secs: 1,
            ..config()
        };
        let mut client = RelayClient::new(ScriptedBus::replying(["{\"err\":\"no network\"}\n"; 10]), config);
        let err = client.configure().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(client.link().bus().requests.len(), 4);
    }

    #[tokio::test]
    async fn unready_record_is_rejected() {
        let mut client = RelayClient::new(ScriptedBus::replying(["{}\n"]), config());
        let unready = Record::new(Address::default(), services::BATTERY);
        let err = client.publish(&unready).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert!(client.link().bus().requests.is_empty());
    }

    #[tokio::test]
    async fn best_effort_publish_tries_once() {
        let mut client = RelayClient::new(ScriptedBus::replying(["{\"err\":\"busy\"}\n", "{}\n"]), config());
        let err = client.publish(&record()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Relay);
        assert_eq!(err.message(), "busy");
        assert_eq!(client.link().bus().requests.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_publish_retries() {
        let config = RelayConfig {
            publish_mode: PublishMode::Bounded,
            ..config()
        };
        let mut client = RelayClient::new(ScriptedBus::replying(["{\"err\":\"busy\"}\n", "{\"total\":1}\n"]), config);
        client.publish(&record()).await.unwrap();
        assert_eq!(client.link().bus().requests.len(), 2);
    }
}
