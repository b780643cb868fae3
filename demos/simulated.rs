use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use futures_lite::stream;
use gattrelay::adapter::{AttributeKind, ScanParams};
use gattrelay::btuuid::{characteristics, descriptors, services};
use gattrelay::error::{AttError, AttErrorCode};
use gattrelay::link::{Bus, BusSettings};
use gattrelay::service::HandleRange;
use gattrelay::{
    Adapter, Address, AddressType, AdvertisingDevice, Central, Characteristic, CharacteristicProperties, Config,
    ConnectionId, Descriptor, Event, GattDatabase, RelayClient, Result, Service, Uuid,
};
use tracing::info;
use tracing::metadata::LevelFilter;

const CUFF: Address = Address::new([0x00, 0x5f, 0xbf, 0x9f, 0x9c, 0x11]);
const CONN: ConnectionId = 0x40;

type Events = Arc<Mutex<VecDeque<Event>>>;

/// A blood-pressure cuff behind a radio that completes every request immediately.
struct SimulatedRadio {
    events: Events,
    services: Vec<Service>,
    characteristics: Vec<Characteristic>,
    descriptors: HashMap<u16, Vec<Descriptor>>,
    values: HashMap<u16, Vec<u8>>,
}

impl SimulatedRadio {
    fn new(events: Events) -> Self {
        let props = CharacteristicProperties::from_bits;
        SimulatedRadio {
            events,
            services: vec![
                Service::primary(services::DEVICE_INFORMATION, HandleRange::new(0x0040, 0x005f)),
                Service::primary(services::BLOOD_PRESSURE, HandleRange::new(0x0030, 0x003f)),
                Service::primary(services::BATTERY, HandleRange::new(0x0020, 0x002f)),
                Service::primary(services::CURRENT_TIME, HandleRange::new(0x0010, 0x001f)),
                Service::primary(services::GENERIC_ACCESS, HandleRange::new(0x0001, 0x000f)),
            ],
            characteristics: vec![
                Characteristic::new(characteristics::DEVICE_NAME, 0x0003, props(0x02)),
                Characteristic::new(characteristics::CURRENT_TIME, 0x0012, props(0x12)),
                Characteristic::new(characteristics::BATTERY_LEVEL, 0x0022, props(0x12)),
                Characteristic::new(characteristics::BLOOD_PRESSURE_MEASUREMENT, 0x0032, props(0x20)),
                Characteristic::new(characteristics::BLOOD_PRESSURE_FEATURE, 0x0035, props(0x02)),
                Characteristic::new(characteristics::MANUFACTURER_NAME_STRING, 0x0042, props(0x02)),
                Characteristic::new(characteristics::MODEL_NUMBER_STRING, 0x0044, props(0x02)),
                Characteristic::new(characteristics::SERIAL_NUMBER_STRING, 0x0046, props(0x02)),
                Characteristic::new(characteristics::HARDWARE_REVISION_STRING, 0x0048, props(0x02)),
                Characteristic::new(characteristics::FIRMWARE_REVISION_STRING, 0x004a, props(0x02)),
                Characteristic::new(characteristics::SOFTWARE_REVISION_STRING, 0x004c, props(0x02)),
                Characteristic::new(characteristics::SYSTEM_ID, 0x004e, props(0x02)),
                Characteristic::new(
                    characteristics::IEEE_11073_20601_REGULATORY_CERTIFICATION_DATA_LIST,
                    0x0050,
                    props(0x02),
                ),
            ],
            descriptors: [0x0012u16, 0x0022, 0x0032]
                .into_iter()
                .map(|handle| {
                    let cccd = Descriptor::new(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION, handle + 1);
                    (handle, vec![cccd])
                })
                .collect(),
            values: HashMap::from([
                (0x0003, b"BLEsmart_0000015400".to_vec()),
                (0x0012, vec![0xea, 0x07, 0x0a, 0x11, 0x09, 0x1e, 0x00, 0x05, 0x00, 0x00]),
                (0x0022, vec![87]),
                (0x0035, vec![0x27, 0x00]),
                (0x0042, b"OMRON HEALTHCARE\0".to_vec()),
                (0x0044, b"HEM-7600T\0".to_vec()),
                (0x0046, b"20170900012  ".to_vec()),
                (0x0048, b"1\0".to_vec()),
                (0x004a, b"1.00".to_vec()),
                (0x0050, vec![0xfe, 0x00, 0x65, 0x78, 0x70, 0x65, 0x72, 0x69, 0x6d, 0x65, 0x6e, 0x74, 0x61, 0x6c]),
                (0x004e, vec![0x11, 0x9c, 0x9f, 0xfe, 0xff, 0xbf, 0x5f, 0x00]),
            ]),
        }
    }

    fn push(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push_back(event);
        }
    }
}

impl GattDatabase for SimulatedRadio {
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

impl Adapter for SimulatedRadio {
    fn set_scan_params(&mut self, _params: ScanParams) -> Result<()> {
        self.push(Event::ScanParamsSet { status: Ok(()) });
        Ok(())
    }

    fn start_scan(&mut self, _duration: Duration) -> Result<()> {
        let headphones = [0x02, 0x01, 0x06, 0x0b, 0x09, b'h', b'e', b'a', b'd', b'p', b'h', b'o', b'n', b'e', b's'];
        let other = Address::new([0x28, 0xff, 0x3c, 0x80, 0x11, 0x42]);
        self.push(Event::Advertisement(AdvertisingDevice::from_raw(
            other,
            AddressType::Random,
            Some(-80),
            &headphones,
            &[],
            true,
        )));

        let cuff = [0x02, 0x01, 0x06, 0x09, 0xff, 0x0d, 0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01];
        let name = [0x14, 0x09, b'B', b'L', b'E', b's', b'm', b'a', b'r', b't', b'_', b'0', b'0', b'0', b'0', b'0', b'1', b'5', b'4', b'0', b'0'];
        self.push(Event::Advertisement(AdvertisingDevice::from_raw(
            CUFF,
            AddressType::Public,
            Some(-52),
            &cuff,
            &name,
            true,
        )));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        Ok(())
    }

    fn allow_list_add(&mut self, _address: Address) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self, address: Address, _address_type: AddressType) -> Result<()> {
        self.push(Event::Connected { conn: CONN, address });
        Ok(())
    }

    fn disconnect(&mut self, conn: ConnectionId) -> Result<()> {
        self.push(Event::Disconnected { conn, reason: 0x16 });
        Ok(())
    }

    fn negotiate_unit(&mut self, conn: ConnectionId) -> Result<()> {
        self.push(Event::MtuNegotiated {
            conn,
            status: Ok(()),
            mtu: 185,
        });
        Ok(())
    }

    fn discover_services(&mut self, conn: ConnectionId, filter: Option<Uuid>) -> Result<()> {
        for service in &self.services {
            if filter.map_or(true, |uuid| uuid == service.uuid) {
                self.push(Event::ServiceFound { conn, service: *service });
            }
        }
        self.push(Event::SearchComplete { conn, status: Ok(()) });
        Ok(())
    }

    fn read(&mut self, conn: ConnectionId, handle: u16) -> Result<()> {
        let event = match self.values.get(&handle) {
            Some(value) => Event::CharacteristicRead {
                conn,
                handle,
                status: Ok(()),
                value: value.clone(),
            },
            None => Event::CharacteristicRead {
                conn,
                handle,
                status: Err(AttError::Known(AttErrorCode::ReadNotPermitted)),
                value: Vec::new(),
            },
        };
        self.push(event);
        Ok(())
    }

    fn read_descriptor(&mut self, conn: ConnectionId, handle: u16) -> Result<()> {
        self.push(Event::DescriptorRead {
            conn,
            handle,
            status: Ok(()),
            value: vec![0x02, 0x00],
        });
        Ok(())
    }

    fn write_descriptor(&mut self, conn: ConnectionId, handle: u16, _value: &[u8]) -> Result<()> {
        self.push(Event::DescriptorWritten {
            conn,
            handle,
            status: Ok(()),
        });
        Ok(())
    }

    fn register_for_notify(&mut self, _address: Address, handle: u16) -> Result<()> {
        self.push(Event::NotifyRegistered {
            conn: CONN,
            handle,
            status: Ok(()),
        });
        Ok(())
    }
}

/// A gateway that logs every request and accepts it.
#[derive(Default)]
struct SimulatedGateway {
    inbound: Vec<u8>,
    outbox: VecDeque<u8>,
    pending_read: usize,
}

#[async_trait::async_trait]
impl Bus for SimulatedGateway {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match bytes {
            [0, n] => self.pending_read = usize::from(*n),
            [_, payload @ ..] => {
                self.inbound.extend_from_slice(payload);
                if self.inbound.ends_with(b"\n") {
                    let line = std::mem::take(&mut self.inbound);
                    info!(request = %String::from_utf8_lossy(&line).trim_end(), "gateway received");
                    self.outbox.extend(b"{}\n");
                }
            }
            [] => {}
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = std::mem::take(&mut self.pending_read).min(self.outbox.len());
        buf[1] = n as u8;
        for (dst, byte) in buf[2..].iter_mut().zip(self.outbox.drain(..n)) {
            *dst = byte;
        }
        buf[0] = self.outbox.len().min(255) as u8;
        Ok(())
    }

    async fn reset(&mut self, settings: &BusSettings) -> Result<()> {
        info!(clock_hz = settings.clock_hz, "gateway reset");
        self.inbound.clear();
        self.outbox.clear();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let mut relay = RelayClient::new(SimulatedGateway::default(), config.relay.clone());
    relay.configure().await?;

    let events = Events::default();
    let radio = SimulatedRadio::new(events.clone());
    let mut central = Central::new(radio, relay, config)?;
    central.start().await?;

    let events = stream::poll_fn(move |_| Poll::Ready(events.lock().ok().and_then(|mut queue| queue.pop_front())));
    let outcome = central.run(events).await;
    info!(?outcome, "simulation finished");

    Ok(())
}
