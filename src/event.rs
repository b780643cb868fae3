//! Events delivered to the orchestrator.
//!
//! Most events are completions reported by the radio stack. [`Event::RequestFailed`] and
//! [`Event::WatchdogExpired`] are produced by the [`Central`][crate::Central] runner itself.

use crate::adapter::{ConnectionId, Request};
use crate::error::{AttError, ErrorKind};
use crate::orchestrator::Phase;
use crate::{Address, AdvertisingDevice, Service};

/// Completion status of an ATT operation.
pub type Status = core::result::Result<(), AttError>;

/// An event driving the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Scan parameters were applied
    ScanParamsSet {
        /// Outcome reported by the controller
        status: Status,
    },
    /// An advertising report was received
    Advertisement(AdvertisingDevice),
    /// The timed scan ended
    ScanComplete,
    /// A connection was opened
    Connected {
        /// Connection handle assigned by the radio stack
        conn: ConnectionId,
        /// Address of the peer
        address: Address,
    },
    /// A connection attempt failed before a connection existed
    ConnectFailed {
        /// Address of the peer
        address: Address,
    },
    /// ATT MTU exchange finished
    MtuNegotiated {
        /// Connection handle
        conn: ConnectionId,
        /// Outcome of the exchange
        status: Status,
        /// Agreed MTU
        mtu: u16,
    },
    /// A primary service matched the running service search
    ServiceFound {
        /// Connection handle
        conn: ConnectionId,
        /// The service
        service: Service,
    },
    /// The service search finished; no further `ServiceFound` events follow
    SearchComplete {
        /// Connection handle
        conn: ConnectionId,
        /// Outcome of the search
        status: Status,
    },
    /// A characteristic read finished
    CharacteristicRead {
        /// Connection handle
        conn: ConnectionId,
        /// Characteristic value handle
        handle: u16,
        /// Outcome of the read
        status: Status,
        /// Value read, empty on failure
        value: Vec<u8>,
    },
    /// A descriptor read finished
    DescriptorRead {
        /// Connection handle
        conn: ConnectionId,
        /// Descriptor handle
        handle: u16,
        /// Outcome of the read
        status: Status,
        /// Value read, empty on failure
        value: Vec<u8>,
    },
    /// A descriptor write finished
    DescriptorWritten {
        /// Connection handle
        conn: ConnectionId,
        /// Descriptor handle
        handle: u16,
        /// Outcome of the write
        status: Status,
    },
    /// Local registration for notifications finished
    NotifyRegistered {
        /// Connection handle
        conn: ConnectionId,
        /// Characteristic value handle
        handle: u16,
        /// Outcome of the registration
        status: Status,
    },
    /// A notification or indication arrived
    Notification {
        /// Connection handle
        conn: ConnectionId,
        /// Characteristic value handle
        handle: u16,
        /// Notified value
        value: Vec<u8>,
        /// `true` for notifications, `false` for indications
        is_notify: bool,
    },
    /// A connection closed
    Disconnected {
        /// Connection handle
        conn: ConnectionId,
        /// HCI disconnect reason
        reason: u8,
    },
    /// A request was rejected synchronously by the adapter
    RequestFailed {
        /// The rejected request
        request: Request,
        /// Why it was rejected
        error: ErrorKind,
    },
    /// A phase ran past its watchdog budget
    WatchdogExpired {
        /// The phase that timed out
        phase: Phase,
    },
}

impl Event {
    /// The connection this event refers to, if it refers to one.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Event::Connected { conn, .. }
            | Event::MtuNegotiated { conn, .. }
            | Event::ServiceFound { conn, .. }
            | Event::SearchComplete { conn, .. }
            | Event::CharacteristicRead { conn, .. }
            | Event::DescriptorRead { conn, .. }
            | Event::DescriptorWritten { conn, .. }
            | Event::NotifyRegistered { conn, .. }
            | Event::Notification { conn, .. }
            | Event::Disconnected { conn, .. } => Some(*conn),
            Event::RequestFailed { request, .. } => request.connection(),
            Event::ScanParamsSet { .. }
            | Event::Advertisement(_)
            | Event::ScanComplete
            | Event::ConnectFailed { .. }
            | Event::WatchdogExpired { .. } => None,
        }
    }
}
