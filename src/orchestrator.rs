//! The discovery state machine.
//!
//! [`Orchestrator::handle_event`] is the only way state changes. It updates the connection, the attribute store and
//! its own state first and only then returns the [`Action`]s to perform, so requests are always issued against
//! state that already reflects them.

use std::collections::HashSet;

use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{AttributeKind, ConnectionId, GattDatabase, Request, ScanParams};
use crate::config::{Config, DiscoveryConfig};
use crate::error::{AttError, ErrorKind};
use crate::event::Status;
use crate::store::{AggregationId, Allocation, AttributeStore, AttributeValue, ServiceListHandle, SlotUpdate};
use crate::{
    Address, AdvertisementFilter, AdvertisingDevice, Characteristic, Device, Event, FilterDecision, Record, Result,
    Service,
};

/// The orchestrator's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Nothing running; call [`Orchestrator::start`]
    Idle,
    /// Waiting for scan parameters to be applied
    Scanning,
    /// Scan running, evaluating advertisements
    WaitingForMatch,
    /// Connection requested
    Connecting,
    /// MTU exchange in progress
    NegotiatingUnit,
    /// Primary service search in progress
    DiscoveringServices,
    /// Walking the characteristics of the found services
    EnumeratingChars,
    /// Walking the descriptors of one characteristic
    EnumeratingDescriptors,
    /// Waiting for characteristic reads to finish
    ReadingAttributes,
    /// Building a record from a completed aggregation set
    Aggregating,
    /// Records handed out; waiting for the connection to close
    Publishing,
    /// The connection closed (terminal)
    Disconnected,
    /// The cycle was abandoned (terminal)
    Aborted(ErrorKind),
}

impl State {
    /// Returns `true` for states that end a cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Disconnected | State::Aborted(_))
    }

    /// The watchdog phase this state belongs to, if it is guarded by one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            State::Connecting => Some(Phase::Connect),
            State::NegotiatingUnit | State::DiscoveringServices | State::EnumeratingChars | State::EnumeratingDescriptors => {
                Some(Phase::Discovery)
            }
            State::ReadingAttributes | State::Aggregating | State::Publishing => Some(Phase::Aggregation),
            State::Idle | State::Scanning | State::WaitingForMatch | State::Disconnected | State::Aborted(_) => None,
        }
    }
}

/// Watchdog-guarded phases of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// From connect request to connection
    Connect,
    /// MTU exchange and service discovery
    Discovery,
    /// Reads, aggregation and publishing
    Aggregation,
}

/// Something the caller must do after an event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Issue a request on the adapter
    Request(Request),
    /// Hand a finished record to the relay
    Emit(Record),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Pending {
    Notify(u16),
    WriteDescriptor(u16),
    ReadDescriptor(u16),
}

/// The single live connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    device: Device,
    mtu: u16,
    services: Option<ServiceListHandle>,
    aggregations: Vec<AggregationId>,
    pending: HashSet<Pending>,
}

impl Connection {
    /// Connection handle assigned by the radio stack.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connected device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The negotiated transfer unit, or the default until MTU exchange succeeds.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Number of descriptor and notification operations still outstanding.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Drives one device from advertisement to published records.
#[derive(Debug)]
pub struct Orchestrator {
    config: DiscoveryConfig,
    filter: AdvertisementFilter,
    store: AttributeStore,
    state: State,
    connecting: bool,
    target: Option<Device>,
    connection: Option<Connection>,
    allow_listed: HashSet<Address>,
}

impl Orchestrator {
    /// Creates an idle orchestrator.
    pub fn new(config: &Config) -> Self {
        Orchestrator {
            config: config.discovery.clone(),
            filter: AdvertisementFilter::new(config.filter.clone()),
            store: AttributeStore::new(),
            state: State::Idle,
            connecting: false,
            target: None,
            connection: None,
            allow_listed: HashSet::new(),
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// `true` from the moment a connect is requested until the connection is gone.
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// The attribute store.
    pub fn store(&self) -> &AttributeStore {
        &self.store
    }

    /// Starts a cycle from `Idle` or from a terminal state.
    pub fn start(&mut self) -> Vec<Action> {
        if !matches!(self.state, State::Idle) && !self.state.is_terminal() {
            warn!(state = ?self.state, "cycle already running");
            return Vec::new();
        }
        info!("starting discovery cycle");
        self.state = State::Scanning;
        self.allow_listed.clear();
        vec![Action::Request(Request::SetScanParams(ScanParams::default()))]
    }

    /// Handles one event and returns the actions to perform, in order.
    pub fn handle_event(&mut self, event: Event, db: &dyn GattDatabase) -> Vec<Action> {
        debug!(state = ?self.state, ?event, "event");

        if let Some(conn) = event.connection() {
            if !matches!(event, Event::Connected { .. }) && !self.is_current(conn) {
                debug!(conn, "discarding event for a connection that is no longer current");
                return Vec::new();
            }
        }

        match event {
            Event::ScanParamsSet { status } => self.on_scan_params_set(status),
            Event::Advertisement(report) => self.on_advertisement(&report),
            Event::ScanComplete => self.on_scan_complete(),
            Event::Connected { conn, address } => self.on_connected(conn, address),
            Event::ConnectFailed { address } => self.on_connect_failed(address),
            Event::MtuNegotiated { conn, status, mtu } => self.on_mtu_negotiated(conn, status, mtu),
            Event::ServiceFound { conn, service } => self.on_service_found(conn, service),
            Event::SearchComplete { conn, status } => self.on_search_complete(conn, status, db),
            Event::CharacteristicRead {
                conn,
                handle,
                status,
                value,
            } => self.on_read(conn, handle, status.map(|()| value)),
            Event::DescriptorWritten { conn, handle, status } => self.on_descriptor_written(conn, handle, status),
            Event::DescriptorRead {
                handle, status, value, ..
            } => self.on_descriptor_read(handle, status, &value),
            Event::NotifyRegistered { handle, status, .. } => self.on_notify_registered(handle, status),
            Event::Notification {
                handle,
                value,
                is_notify,
                ..
            } => {
                debug!(
                    handle,
                    value = %hex::encode_upper(&value),
                    kind = if is_notify { "notification" } else { "indication" },
                    "value pushed by peer"
                );
                Vec::new()
            }
            Event::Disconnected { conn, reason } => self.on_disconnected(conn, reason),
            Event::RequestFailed { request, error } => self.on_request_failed(request, error),
            Event::WatchdogExpired { phase } => self.on_watchdog(phase),
        }
    }

    fn is_current(&self, conn: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == conn)
    }

    fn on_scan_params_set(&mut self, status: Status) -> Vec<Action> {
        if self.state != State::Scanning {
            debug!(state = ?self.state, "unexpected scan parameter completion");
            return Vec::new();
        }
        if let Err(err) = status {
            error!(%err, "failed to set scan parameters");
            return self.abort(ErrorKind::Protocol(err));
        }

        let mut actions = Vec::new();
        for &address in self.filter.allow_list() {
            self.allow_listed.insert(address);
            actions.push(Action::Request(Request::AllowListAdd(address)));
        }
        actions.push(Action::Request(Request::StartScan(self.config.scan_duration())));
        self.state = State::WaitingForMatch;
        info!(duration = self.config.scan_duration_secs, "scan started");
        actions
    }

    fn on_advertisement(&mut self, report: &AdvertisingDevice) -> Vec<Action> {
        if self.state != State::WaitingForMatch {
            trace!(state = ?self.state, "advertisement outside of scan window");
            return Vec::new();
        }

        match self.filter.evaluate(report) {
            FilterDecision::Ignore => Vec::new(),
            FilterDecision::AllowListAdd(device) => {
                if self.allow_listed.insert(device.address) {
                    vec![Action::Request(Request::AllowListAdd(device.address))]
                } else {
                    trace!(address = %device.address, "already on allow list");
                    Vec::new()
                }
            }
            FilterDecision::ConnectNow(device) => {
                if self.connecting || self.connection.is_some() {
                    debug!(address = %device.address, "connection already in progress, ignoring match");
                    return Vec::new();
                }
                info!(%device, target = device.is_target, rssi = ?report.rssi, "found device, connecting");
                self.connecting = true;
                let request = Request::Connect {
                    address: device.address,
                    address_type: device.address_type,
                };
                self.target = Some(device);
                self.state = State::Connecting;
                vec![Action::Request(Request::StopScan), Action::Request(request)]
            }
        }
    }

    fn on_scan_complete(&mut self) -> Vec<Action> {
        if self.state == State::WaitingForMatch {
            info!("scan finished without a match");
            self.state = State::Idle;
        }
        Vec::new()
    }

    fn on_connected(&mut self, conn: ConnectionId, address: Address) -> Vec<Action> {
        if self.is_current(conn) {
            debug!(conn, "duplicate connect event");
            return Vec::new();
        }

        let expected = self.state == State::Connecting && self.connection.is_none();
        match self.target.take() {
            Some(device) if expected && device.address == address => {
                info!(conn, %device, "connected");
                self.connection = Some(Connection {
                    id: conn,
                    device,
                    mtu: self.config.default_mtu,
                    services: None,
                    aggregations: Vec::new(),
                    pending: HashSet::new(),
                });
                self.state = State::NegotiatingUnit;
                vec![Action::Request(Request::NegotiateUnit(conn))]
            }
            target => {
                self.target = target;
                warn!(conn, %address, state = ?self.state, "unexpected connection, closing it");
                vec![Action::Request(Request::Disconnect(conn))]
            }
        }
    }

    fn on_connect_failed(&mut self, address: Address) -> Vec<Action> {
        let ours = self.target.as_ref().is_some_and(|device| device.address == address);
        if self.state != State::Connecting || !ours {
            debug!(%address, "ignoring connect failure for a device we are not connecting to");
            return Vec::new();
        }
        warn!(%address, "connection attempt failed");
        self.reset_connection();
        self.state = State::Disconnected;
        Vec::new()
    }

    fn on_mtu_negotiated(&mut self, conn: ConnectionId, status: Status, mtu: u16) -> Vec<Action> {
        if self.state != State::NegotiatingUnit {
            debug!(state = ?self.state, "unexpected MTU completion");
            return Vec::new();
        }
        match status {
            Ok(()) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.mtu = mtu;
                }
                info!(conn, mtu, "MTU negotiated");
            }
            Err(err) => warn!(conn, %err, "MTU exchange failed, continuing with default"),
        }
        self.begin_service_search(conn)
    }

    fn begin_service_search(&mut self, conn: ConnectionId) -> Vec<Action> {
        let targets = self.config.service_priority.len();
        let Some(connection) = self.connection.as_mut() else {
            return Vec::new();
        };
        if let Allocation::Allocated(handle) = self.store.allocate_services(conn, targets) {
            connection.services = Some(handle);
        }

        let filter = match self.config.service_priority.as_slice() {
            [only] => Some(*only),
            _ => None,
        };
        self.state = State::DiscoveringServices;
        vec![Action::Request(Request::DiscoverServices { conn, filter })]
    }

    fn on_service_found(&mut self, conn: ConnectionId, service: Service) -> Vec<Action> {
        if self.state != State::DiscoveringServices {
            debug!(state = ?self.state, "unexpected service result");
            return Vec::new();
        }
        if self.config.priority_of(&service.uuid).is_none() {
            debug!(conn, uuid = %service.uuid, "ignoring non-target service");
            return Vec::new();
        }
        let Some(handle) = self.connection.as_ref().and_then(|c| c.services) else {
            return Vec::new();
        };

        let duplicate = self
            .store
            .items(handle)
            .map(|services| services.iter().any(|s| s.uuid == service.uuid))
            .unwrap_or(false);
        if duplicate {
            debug!(conn, uuid = %service.uuid, "service already stored");
            return Vec::new();
        }

        match self.store.push(handle, service) {
            Ok(()) => info!(conn, uuid = %service.uuid, range = %service.range, "found target service"),
            Err(err) => warn!(conn, uuid = %service.uuid, %err, "could not store service"),
        }
        Vec::new()
    }

    fn on_search_complete(&mut self, conn: ConnectionId, status: Status, db: &dyn GattDatabase) -> Vec<Action> {
        if self.state != State::DiscoveringServices {
            debug!(state = ?self.state, "unexpected search completion");
            return Vec::new();
        }
        if let Err(err) = status {
            error!(conn, %err, "service search failed");
            return self.abort(ErrorKind::Protocol(err));
        }

        let handle = self.connection.as_mut().and_then(|c| c.services.take());
        let mut services = match handle {
            Some(handle) => self.store.release(handle).unwrap_or_default(),
            None => Vec::new(),
        };
        if services.is_empty() {
            warn!(conn, "no target services found");
            return self.abort(ErrorKind::NotFound);
        }
        services.sort_by_key(|service| self.config.priority_of(&service.uuid));

        self.state = State::EnumeratingChars;
        let mut actions = Vec::new();
        for service in &services {
            if let Err(err) = self.enumerate_service(conn, service, db, &mut actions) {
                error!(conn, uuid = %service.uuid, %err, "characteristic discovery failed");
                return self.abort(err.kind());
            }
        }

        if self.connection.as_ref().is_some_and(|c| c.aggregations.is_empty()) {
            warn!(conn, "no readable characteristics in target services");
            return self.abort(ErrorKind::NotFound);
        }
        self.state = State::ReadingAttributes;
        actions
    }

    /// Issues reads and subscriptions for one service. Errors are only returned when the connection should be
    /// abandoned.
    fn enumerate_service(
        &mut self,
        conn: ConnectionId,
        service: &Service,
        db: &dyn GattDatabase,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        let abort_on_failure = self.config.abort_on_count_failure;

        let count = match db.attribute_count(conn, AttributeKind::Characteristic(service.range)) {
            Ok(count) => count,
            Err(err) if abort_on_failure => return Err(err),
            Err(err) => {
                warn!(conn, uuid = %service.uuid, %err, "characteristic count failed, skipping service");
                return Ok(());
            }
        };
        let handle = match self.store.allocate_characteristics(conn, service, usize::from(count)) {
            Allocation::Allocated(handle) => handle,
            Allocation::Empty => {
                warn!(conn, uuid = %service.uuid, "service has no characteristics");
                return Ok(());
            }
        };
        let listed = match db.characteristics(conn, service.range) {
            Ok(listed) => listed,
            Err(err) => {
                self.store.release(handle)?;
                if abort_on_failure {
                    return Err(err);
                }
                warn!(conn, uuid = %service.uuid, %err, "characteristic listing failed, skipping service");
                return Ok(());
            }
        };
        self.store.fill(handle, listed)?;
        let characteristics = self.store.items(handle)?.to_vec();
        debug!(conn, uuid = %service.uuid, count = characteristics.len(), "characteristics listed");

        let Some(address) = self.connection.as_ref().map(|c| c.device.address) else {
            return Err(ErrorKind::NotConnected.into());
        };
        let mut slots = Vec::new();
        for characteristic in &characteristics {
            let props = characteristic.properties;
            if props.can_subscribe() {
                self.subscribe(conn, address, characteristic, db, actions);
            }
            if props.read {
                slots.push(AttributeValue::pending(
                    characteristic.uuid,
                    characteristic.handle,
                    self.config.is_binary(&characteristic.uuid),
                ));
                actions.push(Action::Request(Request::Read {
                    conn,
                    handle: characteristic.handle,
                }));
            }
            if !props.read && !props.can_subscribe() {
                warn!(conn, uuid = %characteristic.uuid, "characteristic is neither readable nor notifiable");
            }
        }
        self.store.release(handle)?;

        if let Allocation::Allocated(id) = self.store.create_aggregation(conn, service.uuid, slots) {
            if let Some(connection) = self.connection.as_mut() {
                connection.aggregations.push(id);
            }
        }
        Ok(())
    }

    /// Registers for notifications and writes the client configuration descriptor.
    fn subscribe(
        &mut self,
        conn: ConnectionId,
        address: Address,
        characteristic: &Characteristic,
        db: &dyn GattDatabase,
        actions: &mut Vec<Action>,
    ) {
        self.state = State::EnumeratingDescriptors;
        let cccd = self.client_configuration(conn, characteristic, db);
        self.state = State::EnumeratingChars;

        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        connection.pending.insert(Pending::Notify(characteristic.handle));
        actions.push(Action::Request(Request::RegisterForNotify {
            conn,
            address,
            handle: characteristic.handle,
        }));

        match (cccd, characteristic.subscription_value()) {
            (Some(descriptor), Some(value)) => {
                connection.pending.insert(Pending::WriteDescriptor(descriptor));
                actions.push(Action::Request(Request::WriteDescriptor {
                    conn,
                    handle: descriptor,
                    value: SmallVec::from_slice(&value),
                }));
            }
            _ => warn!(conn, uuid = %characteristic.uuid, "no client configuration descriptor"),
        }
    }

    /// Finds the client configuration descriptor of `characteristic`, releasing the descriptor batch afterwards.
    fn client_configuration(
        &mut self,
        conn: ConnectionId,
        characteristic: &Characteristic,
        db: &dyn GattDatabase,
    ) -> Option<u16> {
        let count = match db.attribute_count(conn, AttributeKind::Descriptor(characteristic.handle)) {
            Ok(count) => count,
            Err(err) => {
                warn!(conn, handle = characteristic.handle, %err, "descriptor count failed");
                return None;
            }
        };
        let handle = match self.store.allocate_descriptors(conn, characteristic.handle, usize::from(count)) {
            Allocation::Allocated(handle) => handle,
            Allocation::Empty => return None,
        };

        let found = db
            .descriptors(conn, characteristic.handle)
            .and_then(|listed| self.store.fill(handle, listed))
            .and_then(|_| self.store.items(handle))
            .map(|items| items.iter().find(|d| d.is_client_configuration()).map(|d| d.handle));
        if let Err(err) = self.store.release(handle) {
            error!(%err, "descriptor batch released twice");
        }

        match found {
            Ok(found) => found,
            Err(err) => {
                warn!(conn, handle = characteristic.handle, %err, "descriptor listing failed");
                None
            }
        }
    }

    fn on_read(&mut self, conn: ConnectionId, handle: u16, result: core::result::Result<Vec<u8>, AttError>) -> Vec<Action> {
        if !matches!(self.state, State::ReadingAttributes | State::Publishing) {
            debug!(state = ?self.state, handle, "unexpected read completion");
            return Vec::new();
        }

        let update = match result {
            Ok(value) => {
                debug!(conn, handle, len = value.len(), "characteristic read");
                self.store.append_attribute_value(conn, handle, &value)
            }
            Err(err) => {
                warn!(conn, handle, %err, "characteristic read failed");
                self.store.fail_attribute(conn, handle)
            }
        };
        self.after_slot_update(conn, handle, update)
    }

    fn after_slot_update(&mut self, conn: ConnectionId, handle: u16, update: Result<SlotUpdate>) -> Vec<Action> {
        match update {
            Ok(SlotUpdate::Completed(id)) => self.aggregate(conn, id),
            Ok(SlotUpdate::Pending { loaded, expected }) => {
                debug!(conn, loaded, expected, "waiting for more reads");
                Vec::new()
            }
            Ok(SlotUpdate::Duplicate) => {
                debug!(conn, handle, "duplicate read result");
                Vec::new()
            }
            Err(err) => {
                debug!(conn, handle, %err, "read result without a slot");
                Vec::new()
            }
        }
    }

    fn aggregate(&mut self, conn: ConnectionId, id: AggregationId) -> Vec<Action> {
        self.state = State::Aggregating;
        let Some(connection) = self.connection.as_mut() else {
            return Vec::new();
        };
        connection.aggregations.retain(|&x| x != id);
        let Some(set) = self.store.take_aggregation(id) else {
            error!(conn, "completed aggregation set is missing");
            return Vec::new();
        };

        let record = Record::from_aggregation(connection.device.address, &set);
        info!(
            conn,
            service = %record.service,
            entries = record.entries.len(),
            unavailable = record.unavailable(),
            "record ready"
        );

        let mut actions = vec![Action::Emit(record)];
        if connection.aggregations.is_empty() {
            self.state = State::Publishing;
            if !self.config.linger {
                actions.push(Action::Request(Request::Disconnect(conn)));
            }
        } else {
            self.state = State::ReadingAttributes;
        }
        actions
    }

    fn on_descriptor_written(&mut self, conn: ConnectionId, handle: u16, status: Status) -> Vec<Action> {
        let Some(connection) = self.connection.as_mut() else {
            return Vec::new();
        };
        if !connection.pending.remove(&Pending::WriteDescriptor(handle)) {
            debug!(conn, handle, "unexpected descriptor write completion");
            return Vec::new();
        }
        match status {
            Ok(()) => {
                connection.pending.insert(Pending::ReadDescriptor(handle));
                vec![Action::Request(Request::ReadDescriptor { conn, handle })]
            }
            Err(err) => {
                warn!(conn, handle, %err, "client configuration write failed");
                Vec::new()
            }
        }
    }

    fn on_descriptor_read(&mut self, handle: u16, status: Status, value: &[u8]) -> Vec<Action> {
        if let Some(connection) = self.connection.as_mut() {
            if connection.pending.remove(&Pending::ReadDescriptor(handle)) {
                match status {
                    Ok(()) => debug!(handle, value = %hex::encode_upper(value), "descriptor read"),
                    Err(err) => warn!(handle, %err, "descriptor read failed"),
                }
            }
        }
        Vec::new()
    }

    fn on_notify_registered(&mut self, handle: u16, status: Status) -> Vec<Action> {
        if let Some(connection) = self.connection.as_mut() {
            if connection.pending.remove(&Pending::Notify(handle)) {
                match status {
                    Ok(()) => debug!(handle, "registered for notifications"),
                    Err(err) => warn!(handle, %err, "notification registration failed"),
                }
            }
        }
        Vec::new()
    }

    fn on_disconnected(&mut self, conn: ConnectionId, reason: u8) -> Vec<Action> {
        let released = self.store.release_connection(conn);
        info!(conn, reason, released, state = ?self.state, "disconnected");
        self.connection = None;
        self.reset_connection();
        self.state = State::Disconnected;
        Vec::new()
    }

    fn on_request_failed(&mut self, request: Request, error: ErrorKind) -> Vec<Action> {
        error!(%request, %error, "request failed");
        match request {
            Request::SetScanParams(_) | Request::StartScan(_) => {
                if matches!(self.state, State::Scanning | State::WaitingForMatch) {
                    return self.abort(error);
                }
                Vec::new()
            }
            Request::Connect { address, .. } => self.on_connect_failed(address),
            Request::NegotiateUnit(conn) => {
                if self.state == State::NegotiatingUnit {
                    return self.begin_service_search(conn);
                }
                Vec::new()
            }
            Request::DiscoverServices { .. } => {
                if self.state == State::DiscoveringServices {
                    return self.abort(error);
                }
                Vec::new()
            }
            Request::Read { conn, handle } => {
                let update = self.store.fail_attribute(conn, handle);
                self.after_slot_update(conn, handle, update)
            }
            Request::WriteDescriptor { handle, .. } => self.forget(Pending::WriteDescriptor(handle)),
            Request::ReadDescriptor { handle, .. } => self.forget(Pending::ReadDescriptor(handle)),
            Request::RegisterForNotify { handle, .. } => self.forget(Pending::Notify(handle)),
            Request::StopScan | Request::AllowListAdd(_) | Request::Disconnect(_) => Vec::new(),
        }
    }

    fn forget(&mut self, pending: Pending) -> Vec<Action> {
        if let Some(connection) = self.connection.as_mut() {
            connection.pending.remove(&pending);
        }
        Vec::new()
    }

    fn on_watchdog(&mut self, phase: Phase) -> Vec<Action> {
        if self.state.phase() != Some(phase) {
            debug!(?phase, state = ?self.state, "stale watchdog");
            return Vec::new();
        }
        warn!(?phase, state = ?self.state, "phase timed out");
        self.abort(ErrorKind::Timeout)
    }

    /// Abandons the cycle: releases everything owned by the connection and closes it.
    fn abort(&mut self, reason: ErrorKind) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(connection) = self.connection.take() {
            let released = self.store.release_connection(connection.id);
            debug!(conn = connection.id, released, "released connection allocations");
            actions.push(Action::Request(Request::Disconnect(connection.id)));
        }
        self.reset_connection();
        self.state = State::Aborted(reason);
        error!(%reason, "discovery aborted");
        actions
    }

    fn reset_connection(&mut self) {
        self.connecting = false;
        self.target = None;
    }
}
