use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::stream;
use futures_lite::StreamExt;
use gattrelay::adapter::{AttributeKind, ScanParams};
use gattrelay::btuuid::{characteristics, descriptors, services};
use gattrelay::error::{AttError, AttErrorCode, ErrorKind};
use gattrelay::link::{Bus, BusSettings};
use gattrelay::record::Value;
use gattrelay::service::HandleRange;
use gattrelay::*;

const PEER: Address = Address::new([0x00, 0x5f, 0xbf, 0x9f, 0x9c, 0x11]);
const OTHER: Address = Address::new([0x28, 0xff, 0x3c, 0x80, 0x11, 0x42]);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Connect(Address),
    Disconnect(ConnectionId),
    Read(u16),
    WriteDescriptor(u16, Vec<u8>),
    Other(&'static str),
}

/// A radio that records every request and answers cache queries from a scripted GATT database.
#[derive(Debug, Default)]
struct FakeAdapter {
    characteristics: Vec<Characteristic>,
    descriptors: HashMap<u16, Vec<Descriptor>>,
    refuse_reads: HashSet<u16>,
    calls: Vec<Call>,
}

impl FakeAdapter {
    fn connects(&self) -> usize {
        self.calls.iter().filter(|call| matches!(call, Call::Connect(_))).count()
    }

    fn reads(&self) -> Vec<u16> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Read(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }
}

impl GattDatabase for FakeAdapter {
    fn attribute_count(&self, _conn: ConnectionId, kind: AttributeKind) -> Result<u16> {
        let count = match kind {
            AttributeKind::Characteristic(range) => {
                self.characteristics.iter().filter(|c| range.contains(c.handle)).count()
            }
            AttributeKind::Descriptor(handle) => self.descriptors.get(&handle).map_or(0, Vec::len),
        };
        Ok(count as u16)
    }

    fn characteristics(&self, _conn: ConnectionId, range: HandleRange) -> Result<Vec<Characteristic>> {
        Ok(self
            .characteristics
            .iter()
            .filter(|c| range.contains(c.handle))
            .copied()
            .collect())
    }

    fn descriptors(&self, _conn: ConnectionId, characteristic: u16) -> Result<Vec<Descriptor>> {
        Ok(self.descriptors.get(&characteristic).cloned().unwrap_or_default())
    }
}

impl Adapter for FakeAdapter {
    fn set_scan_params(&mut self, _params: ScanParams) -> Result<()> {
        self.calls.push(Call::Other("set_scan_params"));
        Ok(())
    }

    fn start_scan(&mut self, _duration: Duration) -> Result<()> {
        self.calls.push(Call::Other("start_scan"));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.calls.push(Call::Other("stop_scan"));
        Ok(())
    }

    fn allow_list_add(&mut self, _address: Address) -> Result<()> {
        self.calls.push(Call::Other("allow_list_add"));
        Ok(())
    }

    fn connect(&mut self, address: Address, _address_type: AddressType) -> Result<()> {
        self.calls.push(Call::Connect(address));
        Ok(())
    }

    fn disconnect(&mut self, conn: ConnectionId) -> Result<()> {
        self.calls.push(Call::Disconnect(conn));
        Ok(())
    }

    fn negotiate_unit(&mut self, _conn: ConnectionId) -> Result<()> {
        self.calls.push(Call::Other("negotiate_unit"));
        Ok(())
    }

    fn discover_services(&mut self, _conn: ConnectionId, _filter: Option<Uuid>) -> Result<()> {
        self.calls.push(Call::Other("discover_services"));
        Ok(())
    }

    fn read(&mut self, _conn: ConnectionId, handle: u16) -> Result<()> {
        self.calls.push(Call::Read(handle));
        if self.refuse_reads.contains(&handle) {
            return Err(ErrorKind::Other.into());
        }
        Ok(())
    }

    fn read_descriptor(&mut self, _conn: ConnectionId, _handle: u16) -> Result<()> {
        self.calls.push(Call::Other("read_descriptor"));
        Ok(())
    }

    fn write_descriptor(&mut self, _conn: ConnectionId, handle: u16, value: &[u8]) -> Result<()> {
        self.calls.push(Call::WriteDescriptor(handle, value.to_vec()));
        Ok(())
    }

    fn register_for_notify(&mut self, _address: Address, _handle: u16) -> Result<()> {
        self.calls.push(Call::Other("register_for_notify"));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CollectingSink {
    records: Vec<Record>,
}

#[async_trait]
impl RecordSink for CollectingSink {
    async fn submit(&mut self, record: Record) -> Result<()> {
        self.records.push(record);
        Ok(())
    }
}

/// A gateway that accepts every request.
#[derive(Debug, Default)]
struct Gateway {
    inbound: Vec<u8>,
    outbox: VecDeque<u8>,
    pending_read: Option<usize>,
    lines: Vec<String>,
}

#[async_trait]
impl Bus for Gateway {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match bytes {
            [0, n] => self.pending_read = Some(usize::from(*n)),
            [_, payload @ ..] => {
                self.inbound.extend_from_slice(payload);
                if self.inbound.ends_with(b"\n") {
                    let line = String::from_utf8_lossy(&std::mem::take(&mut self.inbound)).into_owned();
                    self.lines.push(line);
                    self.outbox.extend(b"{}\n");
                }
            }
            [] => return Err(ErrorKind::InvalidParameter.into()),
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.pending_read.take().unwrap_or(0).min(self.outbox.len());
        buf[1] = n as u8;
        for (dst, byte) in buf[2..].iter_mut().zip(self.outbox.drain(..n)) {
            *dst = byte;
        }
        buf[0] = self.outbox.len().min(255) as u8;
        Ok(())
    }

    async fn reset(&mut self, _settings: &BusSettings) -> Result<()> {
        self.inbound.clear();
        self.outbox.clear();
        Ok(())
    }
}

fn read_only() -> CharacteristicProperties {
    CharacteristicProperties::from_bits(0x02)
}

/// The eight Device Information characteristics, value handles 0x12 to 0x20.
fn device_information() -> Vec<Characteristic> {
    [
        characteristics::SYSTEM_ID,
        characteristics::MODEL_NUMBER_STRING,
        characteristics::SERIAL_NUMBER_STRING,
        characteristics::FIRMWARE_REVISION_STRING,
        characteristics::HARDWARE_REVISION_STRING,
        characteristics::SOFTWARE_REVISION_STRING,
        characteristics::MANUFACTURER_NAME_STRING,
        characteristics::IEEE_11073_20601_REGULATORY_CERTIFICATION_DATA_LIST,
    ]
    .into_iter()
    .zip((0x12u16..).step_by(2))
    .map(|(uuid, handle)| Characteristic::new(uuid, handle, read_only()))
    .collect()
}

fn config() -> Config {
    let mut config = Config::default();
    config.discovery.service_priority = vec![services::DEVICE_INFORMATION];
    config.relay.poll_interval_ms = 0;
    config
}

fn advertisement(address: Address, payload_len: usize) -> Event {
    let mut adv = vec![0x02, 0x01, 0x06, (payload_len + 3) as u8, 0xff, 0x0d, 0x02];
    adv.extend(std::iter::repeat(0x5a).take(payload_len));
    Event::Advertisement(AdvertisingDevice::from_raw(
        address,
        AddressType::Public,
        Some(-61),
        &adv,
        &[],
        true,
    ))
}

fn ok_read(conn: ConnectionId, handle: u16, value: &[u8]) -> Event {
    Event::CharacteristicRead {
        conn,
        handle,
        status: Ok(()),
        value: value.to_vec(),
    }
}

/// Events that take a fresh cycle up to the reads being issued on connection `conn`.
fn discovery_events(address: Address, conn: ConnectionId) -> Vec<Event> {
    vec![
        Event::ScanParamsSet { status: Ok(()) },
        advertisement(address, 6),
        Event::Connected { conn, address },
        Event::MtuNegotiated {
            conn,
            status: Ok(()),
            mtu: 247,
        },
        Event::ServiceFound {
            conn,
            service: Service::primary(services::DEVICE_INFORMATION, HandleRange::new(0x0010, 0x002f)),
        },
        Event::SearchComplete { conn, status: Ok(()) },
    ]
}

/// Read completions for the device information batch: six succeed, 0x14 fails, 0x16 is refused by the radio.
fn read_events(conn: ConnectionId) -> Vec<Event> {
    vec![
        ok_read(conn, 0x0012, &[0x11, 0x9c, 0x9f, 0x00, 0x00, 0xbf, 0x5f, 0x00]),
        Event::CharacteristicRead {
            conn,
            handle: 0x0014,
            status: Err(AttError::Known(AttErrorCode::ReadNotPermitted)),
            value: Vec::new(),
        },
        ok_read(conn, 0x0018, b"1.02"),
        ok_read(conn, 0x001a, b"A"),
        ok_read(conn, 0x001c, b"  3.1.7\0\0\0"),
        ok_read(conn, 0x001e, b"OMRON HEALTHCARE"),
        ok_read(conn, 0x0020, &[0xfe, 0x00, 0x65, 0x78]),
    ]
}

fn refusing_adapter() -> FakeAdapter {
    FakeAdapter {
        characteristics: device_information(),
        refuse_reads: HashSet::from([0x0016]),
        ..Default::default()
    }
}

#[tokio::test]
async fn company_match_yields_one_record_with_failed_reads() {
    let mut central = Central::new(refusing_adapter(), CollectingSink::default(), config()).unwrap();
    central.start().await.unwrap();

    let mut events = discovery_events(PEER, 1).into_iter();
    for event in events.by_ref().take(3) {
        central.dispatch(event).await;
    }
    let connection = central.orchestrator().connection().unwrap();
    assert!(connection.device().is_target);
    assert_eq!(central.adapter().connects(), 1);

    for event in events {
        central.dispatch(event).await;
    }
    assert_eq!(central.adapter().reads(), (0x12u16..=0x20).step_by(2).collect::<Vec<_>>());
    assert_eq!(central.orchestrator().state(), State::ReadingAttributes);

    for event in read_events(1) {
        assert!(central.sink().records.is_empty());
        central.dispatch(event).await;
    }

    let records = &central.sink().records;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(record.is_ready());
    assert_eq!(record.address, PEER);
    assert_eq!(record.service, services::DEVICE_INFORMATION);
    assert_eq!(record.entries.len(), 8);
    assert_eq!(record.unavailable(), 2);
    assert_eq!(record.entries[0].value, Value::Binary(vec![0x11, 0x9c, 0x9f, 0x00, 0x00, 0xbf, 0x5f, 0x00]));
    assert_eq!(record.entries[1].value, Value::Unavailable);
    assert_eq!(record.entries[2].value, Value::Unavailable);
    assert_eq!(record.entries[5].value, Value::Text("3.1.7".into()));

    assert_eq!(central.published(), 1);
    assert_eq!(central.adapter().calls.last(), Some(&Call::Disconnect(1)));
    assert_eq!(central.orchestrator().state(), State::Publishing);

    central.dispatch(Event::Disconnected { conn: 1, reason: 0x16 }).await;
    assert_eq!(central.orchestrator().state(), State::Disconnected);
    assert_eq!(central.orchestrator().store().live_allocations(1), 0);
}

#[tokio::test]
async fn disconnect_mid_discovery_releases_everything() {
    let mut adapter = FakeAdapter {
        characteristics: device_information(),
        ..Default::default()
    };
    adapter.characteristics.push(Characteristic::new(
        characteristics::BLOOD_PRESSURE_MEASUREMENT,
        0x0024,
        CharacteristicProperties::from_bits(0x22),
    ));
    adapter.descriptors.insert(
        0x0024,
        vec![Descriptor::new(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION, 0x0025)],
    );

    let mut central = Central::new(adapter, CollectingSink::default(), config()).unwrap();
    central.start().await.unwrap();
    for event in discovery_events(PEER, 1) {
        central.dispatch(event).await;
    }
    assert!(central
        .adapter()
        .calls
        .contains(&Call::WriteDescriptor(0x0025, vec![0x02, 0x00])));
    assert!(central.orchestrator().store().live_allocations(1) > 0);
    central.dispatch(ok_read(1, 0x0012, &[1, 2, 3])).await;

    central.dispatch(Event::Disconnected { conn: 1, reason: 0x08 }).await;
    assert_eq!(central.orchestrator().state(), State::Disconnected);
    assert_eq!(central.orchestrator().store().live_allocations(1), 0);
    assert!(!central.orchestrator().is_connecting());
    assert!(central.orchestrator().connection().is_none());

    // Late completions for the old connection change nothing.
    central.dispatch(ok_read(1, 0x0014, b"late")).await;
    central
        .dispatch(Event::DescriptorWritten {
            conn: 1,
            handle: 0x0025,
            status: Ok(()),
        })
        .await;
    assert!(central.sink().records.is_empty());
    assert_eq!(central.orchestrator().state(), State::Disconnected);

    central.restart().await.unwrap();
    central.dispatch(Event::ScanParamsSet { status: Ok(()) }).await;
    central.dispatch(advertisement(OTHER, 6)).await;
    assert_eq!(central.adapter().connects(), 2);
    assert_eq!(central.adapter().calls.last(), Some(&Call::Connect(OTHER)));
    assert!(central.orchestrator().is_connecting());
}

#[tokio::test]
async fn duplicate_matches_connect_once() {
    let mut central = Central::new(refusing_adapter(), CollectingSink::default(), config()).unwrap();
    central.start().await.unwrap();
    central.dispatch(Event::ScanParamsSet { status: Ok(()) }).await;
    central.dispatch(advertisement(PEER, 6)).await;
    central.dispatch(advertisement(PEER, 6)).await;
    central.dispatch(advertisement(OTHER, 6)).await;
    assert_eq!(central.adapter().connects(), 1);

    let err = central.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyConnecting);
}

#[tokio::test]
async fn run_publishes_through_the_relay() {
    let config = config();
    let mut relay = RelayClient::new(Gateway::default(), config.relay.clone());
    relay.configure().await.unwrap();

    let mut central = Central::new(refusing_adapter(), relay, config).unwrap();
    central.start().await.unwrap();

    let mut events = discovery_events(PEER, 7);
    events.extend(read_events(7));
    events.push(Event::Disconnected { conn: 7, reason: 0x16 });
    let outcome = central.run(stream::iter(events)).await;
    assert_eq!(outcome, Outcome::Disconnected { published: 1, failed: 0 });

    let lines = &central.sink().link().bus().lines;
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with(r#"{"req":"hub.set""#));
    assert!(lines[1].starts_with(concat!(
        r#"{"req":"note.add","file":"omron.qo","sync":true,"body":{"#,
        r#""Bluetooth Device Address":"00:5F:BF:9F:9C:11","GATT Service":"0x180A","#,
        r#""0x2A23":"0x119C9F0000BF5F00","0x2A24":"<unavailable>","0x2A25":"<unavailable>","#,
    )));
    assert!(lines[1].ends_with("}}\n"));
}

#[tokio::test(start_paused = true)]
async fn watchdog_aborts_a_stalled_connect() {
    let mut central = Central::new(refusing_adapter(), CollectingSink::default(), config()).unwrap();
    central.start().await.unwrap();

    let events = stream::iter(vec![Event::ScanParamsSet { status: Ok(()) }, advertisement(PEER, 6)]);
    let outcome = central.run(events.chain(stream::pending::<Event>())).await;
    assert_eq!(outcome, Outcome::Aborted(ErrorKind::Timeout));
    assert!(!central.orchestrator().is_connecting());
}

#[tokio::test(start_paused = true)]
async fn watchdog_aborts_stalled_reads() {
    let mut central = Central::new(refusing_adapter(), CollectingSink::default(), config()).unwrap();
    central.start().await.unwrap();

    let events = stream::iter(discovery_events(PEER, 3));
    let started = tokio::time::Instant::now();
    let outcome = central.run(events.chain(stream::pending::<Event>())).await;
    assert_eq!(outcome, Outcome::Aborted(ErrorKind::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert_eq!(central.adapter().calls.last(), Some(&Call::Disconnect(3)));
    assert_eq!(central.orchestrator().store().live_allocations(3), 0);
    assert!(central.sink().records.is_empty());
}

#[tokio::test]
async fn scan_without_match_ends_the_run() {
    let mut central = Central::new(refusing_adapter(), CollectingSink::default(), config()).unwrap();
    central.start().await.unwrap();
    let events = stream::iter(vec![
        Event::ScanParamsSet { status: Ok(()) },
        Event::Advertisement(AdvertisingDevice {
            device: Device::new(OTHER, AddressType::Random),
            adv_data: AdvertisementData::default(),
            rssi: Some(-90),
        }),
        Event::ScanComplete,
    ]);
    assert_eq!(central.run(events).await, Outcome::ScanEnded);
}
