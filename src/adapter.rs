//! The radio capability consumed by the orchestrator.
//!
//! Every [`Adapter`] method only *issues* a request: it fails synchronously if the radio stack refuses the request
//! and otherwise returns immediately. The outcome arrives later as an [`Event`][crate::Event].

use std::fmt;
use std::time::Duration;

use smallvec::SmallVec;

use crate::service::HandleRange;
use crate::{Address, AddressType, Characteristic, Descriptor, Result, Uuid};

/// Opaque connection handle assigned by the radio stack.
pub type ConnectionId = u16;

/// Which attributes an [`attribute_count`][GattDatabase::attribute_count] query counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// Characteristics declared inside a service's handle range
    Characteristic(HandleRange),
    /// Descriptors belonging to the characteristic with the given value handle
    Descriptor(u16),
}

/// Scan parameters applied before a scan is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanParams {
    /// Request scan responses from advertisers
    pub active: bool,
    /// Scan interval in units of 0.625 ms
    pub interval: u16,
    /// Scan window in units of 0.625 ms
    pub window: u16,
    /// Only report advertisers present in the controller's allow list
    pub allow_list_only: bool,
}

impl Default for ScanParams {
    fn default() -> Self {
        ScanParams {
            active: true,
            interval: 0x50,
            window: 0x30,
            allow_list_only: false,
        }
    }
}

/// Synchronous queries against the radio stack's local GATT cache.
///
/// These are only meaningful after service discovery for the connection has completed.
pub trait GattDatabase {
    /// Counts the attributes of `kind` known for `conn`.
    fn attribute_count(&self, conn: ConnectionId, kind: AttributeKind) -> Result<u16>;

    /// Lists the characteristics declared in `range`.
    fn characteristics(&self, conn: ConnectionId, range: HandleRange) -> Result<Vec<Characteristic>>;

    /// Lists the descriptors of the characteristic whose value handle is `characteristic`.
    fn descriptors(&self, conn: ConnectionId, characteristic: u16) -> Result<Vec<Descriptor>>;
}

/// A Bluetooth LE radio operating in the central role.
pub trait Adapter: GattDatabase {
    /// Applies scan parameters. Completion: [`Event::ScanParamsSet`][crate::Event::ScanParamsSet].
    fn set_scan_params(&mut self, params: ScanParams) -> Result<()>;

    /// Starts a scan that ends on its own after `duration`.
    fn start_scan(&mut self, duration: Duration) -> Result<()>;

    /// Stops a running scan.
    fn stop_scan(&mut self) -> Result<()>;

    /// Adds `address` to the controller's allow list.
    fn allow_list_add(&mut self, address: Address) -> Result<()>;

    /// Opens a connection. Completion: [`Event::Connected`][crate::Event::Connected] or
    /// [`Event::ConnectFailed`][crate::Event::ConnectFailed].
    fn connect(&mut self, address: Address, address_type: AddressType) -> Result<()>;

    /// Closes a connection. Completion: [`Event::Disconnected`][crate::Event::Disconnected].
    fn disconnect(&mut self, conn: ConnectionId) -> Result<()>;

    /// Starts ATT MTU exchange.
    fn negotiate_unit(&mut self, conn: ConnectionId) -> Result<()>;

    /// Starts primary service discovery, optionally restricted to one service UUID.
    fn discover_services(&mut self, conn: ConnectionId, filter: Option<Uuid>) -> Result<()>;

    /// Reads a characteristic value.
    fn read(&mut self, conn: ConnectionId, handle: u16) -> Result<()>;

    /// Reads a descriptor value.
    fn read_descriptor(&mut self, conn: ConnectionId, handle: u16) -> Result<()>;

    /// Writes a descriptor value with response.
    fn write_descriptor(&mut self, conn: ConnectionId, handle: u16, value: &[u8]) -> Result<()>;

    /// Registers locally for notifications and indications of a characteristic.
    fn register_for_notify(&mut self, address: Address, handle: u16) -> Result<()>;
}

/// A request the orchestrator wants issued on the [`Adapter`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SetScanParams(ScanParams),
    StartScan(Duration),
    StopScan,
    AllowListAdd(Address),
    Connect {
        address: Address,
        address_type: AddressType,
    },
    Disconnect(ConnectionId),
    NegotiateUnit(ConnectionId),
    DiscoverServices {
        conn: ConnectionId,
        filter: Option<Uuid>,
    },
    Read {
        conn: ConnectionId,
        handle: u16,
    },
    ReadDescriptor {
        conn: ConnectionId,
        handle: u16,
    },
    WriteDescriptor {
        conn: ConnectionId,
        handle: u16,
        value: SmallVec<[u8; 2]>,
    },
    RegisterForNotify {
        conn: ConnectionId,
        address: Address,
        handle: u16,
    },
}

impl Request {
    /// Issues the request on `adapter`.
    pub fn execute<A: Adapter + ?Sized>(&self, adapter: &mut A) -> Result<()> {
        match self {
            Request::SetScanParams(params) => adapter.set_scan_params(*params),
            Request::StartScan(duration) => adapter.start_scan(*duration),
            Request::StopScan => adapter.stop_scan(),
            Request::AllowListAdd(address) => adapter.allow_list_add(*address),
            Request::Connect { address, address_type } => adapter.connect(*address, *address_type),
            Request::Disconnect(conn) => adapter.disconnect(*conn),
            Request::NegotiateUnit(conn) => adapter.negotiate_unit(*conn),
            Request::DiscoverServices { conn, filter } => adapter.discover_services(*conn, *filter),
            Request::Read { conn, handle } => adapter.read(*conn, *handle),
            Request::ReadDescriptor { conn, handle } => adapter.read_descriptor(*conn, *handle),
            Request::WriteDescriptor { conn, handle, value } => adapter.write_descriptor(*conn, *handle, value),
            Request::RegisterForNotify { address, handle, .. } => adapter.register_for_notify(*address, *handle),
        }
    }

    /// The connection the request belongs to, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Request::Disconnect(conn) | Request::NegotiateUnit(conn) => Some(*conn),
            Request::DiscoverServices { conn, .. }
            | Request::Read { conn, .. }
            | Request::ReadDescriptor { conn, .. }
            | Request::WriteDescriptor { conn, .. }
            | Request::RegisterForNotify { conn, .. } => Some(*conn),
            Request::SetScanParams(_)
            | Request::StartScan(_)
            | Request::StopScan
            | Request::AllowListAdd(_)
            | Request::Connect { .. } => None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::SetScanParams(_) => f.write_str("set scan params"),
            Request::StartScan(duration) => write!(f, "start scan ({}s)", duration.as_secs()),
            Request::StopScan => f.write_str("stop scan"),
            Request::AllowListAdd(address) => write!(f, "allow list add {address}"),
            Request::Connect { address, .. } => write!(f, "connect {address}"),
            Request::Disconnect(conn) => write!(f, "disconnect conn {conn}"),
            Request::NegotiateUnit(conn) => write!(f, "mtu request conn {conn}"),
            Request::DiscoverServices { conn, .. } => write!(f, "search services conn {conn}"),
            Request::Read { conn, handle } => write!(f, "read char 0x{handle:04x} conn {conn}"),
            Request::ReadDescriptor { conn, handle } => write!(f, "read descr 0x{handle:04x} conn {conn}"),
            Request::WriteDescriptor { conn, handle, .. } => write!(f, "write descr 0x{handle:04x} conn {conn}"),
            Request::RegisterForNotify { conn, handle, .. } => write!(f, "register notify 0x{handle:04x} conn {conn}"),
        }
    }
}
