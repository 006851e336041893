/// Client (central) GATT session
///
/// Owns the connection state machine for an outbound link and routes all data through
/// the transfer engine. Application calls (`connect`, `send`, characteristic selection)
/// and transport events (`handle_event`) arrive on different contexts; both go through
/// one mutex that is never held across a transport call or an event publication.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::{ConnectionState, ConnectionTracker};
use super::error::{SessionError, TransferFailure};
use super::events::{EventSink, SessionEvent};
use super::gatt::{
    Binding, CharacteristicDescriptor, CharacteristicHandle, CharacteristicSelection, DeviceAddress,
    GattStatus, ReadMode, ServiceCatalog, ServiceDescriptor, WriteMode,
};
use super::transfer::{Fragment, TransferEngine, TransferId, TransferOutcome, TransferProgress};
use crate::config::SessionConfig;
use crate::transport::abstraction::{ClientTransport, ClientTransportEvent};

struct ClientState {
    connection: ConnectionTracker,
    /// Device of the current (or last) link
    address: Option<DeviceAddress>,
    /// A transport link object exists and can be resumed
    link_open: bool,
    catalog: ServiceCatalog,
    selection: CharacteristicSelection,
    mtu: u16,
    transfer: TransferEngine,
}

pub struct ClientSession {
    config: SessionConfig,
    transport: Arc<dyn ClientTransport>,
    events: Arc<dyn EventSink>,
    state: Mutex<ClientState>,
}

impl ClientSession {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn ClientTransport>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let state = ClientState {
            connection: ConnectionTracker::default(),
            address: None,
            link_open: false,
            catalog: ServiceCatalog::default(),
            selection: CharacteristicSelection::default(),
            mtu: config.default_mtu,
            transfer: TransferEngine::new(config.overhead_bytes),
        };

        Ok(Self {
            config,
            transport,
            events,
            state: Mutex::new(state),
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection.state()
    }

    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.state.lock().address.clone()
    }

    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.state.lock().catalog.services().to_vec()
    }

    pub fn selection(&self) -> CharacteristicSelection {
        self.state.lock().selection
    }

    pub fn mtu(&self) -> u16 {
        self.state.lock().mtu
    }

    pub fn is_transfer_in_progress(&self) -> bool {
        self.state.lock().transfer.is_busy()
    }

    // ------------------------------------------------------------------------
    // Application operations
    // ------------------------------------------------------------------------

    /// Start connecting to `address`
    ///
    /// Returns once the request is issued; the result arrives as connection-state
    /// events. An existing link to the same device is resumed instead of recreated,
    /// including one that is still connected, unless a transfer is running on it.
    pub fn connect(&self, address: impl Into<DeviceAddress>) -> Result<(), SessionError> {
        let address = address.into();

        let resume = {
            let mut state = self.state.lock();
            let same_device = state.address.as_ref() == Some(&address);
            match state.connection.state() {
                ConnectionState::Connecting => return Err(SessionError::Busy),
                ConnectionState::Connected if !same_device => {
                    return Err(SessionError::Configuration(format!(
                        "Already connected to {}; disconnect first",
                        state.address.as_ref().map(|a| a.as_str()).unwrap_or("another device")
                    )));
                }
                ConnectionState::Connected if state.transfer.is_busy() => {
                    return Err(SessionError::Busy);
                }
                ConnectionState::Connected | ConnectionState::Disconnected => {}
            }

            let resume = state.link_open && same_device;
            state.address = Some(address.clone());
            state.connection.transition(ConnectionState::Connecting);
            resume
        };
        self.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Connecting));

        let issued = if resume {
            info!("Resuming existing link to {}", address);
            self.transport.reconnect()
        } else {
            info!("Connecting to {}", address);
            self.transport.connect(&address)
        };

        match issued {
            Ok(()) => {
                self.state.lock().link_open = true;
                Ok(())
            }
            Err(e) => {
                warn!("Connect request to {} refused: {}", address, e);
                let changed = self
                    .state
                    .lock()
                    .connection
                    .transition(ConnectionState::Disconnected);
                if let Some(state) = changed {
                    self.emit(SessionEvent::ConnectionStateChanged(state));
                }
                Err(SessionError::TransportRejected(e))
            }
        }
    }

    /// Ask the transport to drop the link
    pub fn disconnect(&self) -> Result<(), SessionError> {
        if !self.state.lock().link_open {
            return Ok(());
        }
        self.transport.disconnect()?;
        Ok(())
    }

    /// Release the link entirely; a later `connect` creates a new one
    pub fn close(&self) {
        self.transport.close();

        let (changed, aborted) = {
            let mut state = self.state.lock();
            state.link_open = false;
            state.address = None;
            state.catalog = ServiceCatalog::default();
            state.selection.release_handles();
            let aborted = state.transfer.abort(TransferFailure::ConnectionLost);
            let changed = state.connection.transition(ConnectionState::Disconnected);
            (changed, aborted)
        };

        if let Some(outcome) = aborted {
            self.emit(outcome.into());
        }
        if let Some(state) = changed {
            self.emit(SessionEvent::ConnectionStateChanged(state));
        }
        info!("Client link closed");
    }

    /// Drop sticky configuration: selected modes and the negotiated MTU
    pub fn reset_configuration(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.transfer.is_busy() {
            return Err(SessionError::Busy);
        }
        state.selection = CharacteristicSelection::default();
        state.mtu = self.config.default_mtu;
        Ok(())
    }

    /// Use `handle` for inbound data and subscribe to it in `mode`
    pub fn select_read_characteristic(
        &self,
        handle: CharacteristicHandle,
        mode: ReadMode,
    ) -> Result<(), SessionError> {
        let previous = {
            let mut state = self.state.lock();
            if !state.connection.is_connected() {
                return Err(SessionError::ConnectionLost);
            }
            let characteristic = Self::lookup(&state.catalog, handle)?;
            if !characteristic.supports_read_mode(mode) {
                return Err(SessionError::Configuration(format!(
                    "Characteristic {} does not support {:?}",
                    handle, mode
                )));
            }

            let previous = state.selection.read;
            state.selection.read = Binding {
                handle: Some(handle),
                mode,
            };
            previous
        };

        if let Err(e) = self.transport.subscribe(handle, mode) {
            warn!("Subscribe on {} refused: {}", handle, e);
            let mut state = self.state.lock();
            if state.selection.read.handle == Some(handle) {
                state.selection.read = previous;
            }
            return Err(SessionError::TransportRejected(e));
        }

        info!("Read characteristic {} selected ({:?})", handle, mode);
        Ok(())
    }

    /// Use `handle` for outbound data, written in `mode`
    pub fn select_write_characteristic(
        &self,
        handle: CharacteristicHandle,
        mode: WriteMode,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let characteristic = Self::lookup(&state.catalog, handle)?;
        if !characteristic.supports_write_mode(mode) {
            return Err(SessionError::Configuration(format!(
                "Characteristic {} does not support {:?}",
                handle, mode
            )));
        }
        if state.transfer.is_busy() {
            return Err(SessionError::Busy);
        }

        state.selection.write = Binding {
            handle: Some(handle),
            mode,
        };
        info!("Write characteristic {} selected ({:?})", handle, mode);
        Ok(())
    }

    /// Request a read of `handle`; the value arrives as `DataAvailable`
    pub fn read(&self, handle: CharacteristicHandle) -> Result<(), SessionError> {
        {
            let state = self.state.lock();
            if !state.connection.is_connected() {
                return Err(SessionError::ConnectionLost);
            }
            let characteristic = Self::lookup(&state.catalog, handle)?;
            if !characteristic.is_readable() {
                return Err(SessionError::Configuration(format!(
                    "Characteristic {} is not readable",
                    handle
                )));
            }
        }

        self.transport.read_characteristic(handle)?;
        Ok(())
    }

    /// Start sending `payload` through the selected write characteristic
    ///
    /// Only one transfer runs at a time; a second call while one is running fails
    /// with `Busy` instead of queueing.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<TransferId, SessionError> {
        let payload = payload.into();

        let (fragment, handle, mode) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.connection.is_connected() {
                return Err(SessionError::ConnectionLost);
            }
            let Some((handle, mode)) = state.selection.active_write() else {
                return Err(SessionError::Configuration(
                    "No write characteristic selected".to_string(),
                ));
            };
            let fragment = state.transfer.begin(payload, state.mtu)?;
            (fragment, handle, mode)
        };

        let transfer = fragment.transfer;
        info!("Transfer {} started via {}", transfer, handle);
        self.emit(SessionEvent::FragmentSent {
            transfer,
            len: fragment.data.len(),
        });

        if let Err(e) = self.transport.write_characteristic(handle, &fragment.data, mode) {
            warn!("First fragment of transfer {} refused: {}", transfer, e);
            let aborted = self
                .state
                .lock()
                .transfer
                .abort(TransferFailure::TransportRejected(e.to_string()));
            if let Some(outcome) = aborted {
                self.finish(outcome);
            }
            return Err(SessionError::TransportRejected(e));
        }
        Ok(transfer)
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    /// Apply one transport event
    pub fn handle_event(&self, event: ClientTransportEvent) {
        debug!("Client event: {}", event);
        match event {
            ClientTransportEvent::ConnectionStateChanged { state, status } => {
                self.on_connection_state(state, status)
            }
            ClientTransportEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services)
            }
            ClientTransportEvent::CharacteristicChanged { value, .. } => self.on_inbound(value),
            ClientTransportEvent::CharacteristicRead { handle, status, value } => {
                if status.is_success() {
                    self.on_inbound(value);
                } else {
                    warn!("Read of {} failed: {}", handle, status);
                }
            }
            ClientTransportEvent::WriteComplete { handle, status } => {
                self.on_write_complete(handle, status)
            }
            ClientTransportEvent::DescriptorWritten { handle, status, .. } => {
                if !status.is_success() {
                    warn!("Subscription on {} failed: {}", handle, status);
                }
            }
            ClientTransportEvent::MtuChanged { mtu, status } => {
                if status.is_success() {
                    info!("MTU changed to {}", mtu);
                    self.state.lock().mtu = mtu;
                } else {
                    warn!("MTU negotiation failed: {}", status);
                }
            }
            ClientTransportEvent::DescriptorRead { .. } | ClientTransportEvent::RssiRead { .. } => {}
        }
    }

    /// Pump events from a platform channel until it closes
    pub async fn drive(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ClientTransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Client transport event channel closed");
    }

    fn on_connection_state(&self, state: ConnectionState, status: GattStatus) {
        let state = if status.is_success() {
            state
        } else {
            warn!("Connection state change failed: {}", status);
            ConnectionState::Disconnected
        };

        match state {
            ConnectionState::Connected => {
                let changed = self.state.lock().connection.transition(ConnectionState::Connected);
                if let Some(state) = changed {
                    self.emit(SessionEvent::ConnectionStateChanged(state));
                    info!("Connected; starting service discovery");
                    if let Err(e) = self.transport.discover_services() {
                        warn!("Service discovery refused: {}", e);
                    }
                }
            }
            ConnectionState::Connecting => {
                let changed = self.state.lock().connection.transition(ConnectionState::Connecting);
                if let Some(state) = changed {
                    self.emit(SessionEvent::ConnectionStateChanged(state));
                }
            }
            ConnectionState::Disconnected => self.on_link_lost(),
        }
    }

    fn on_link_lost(&self) {
        let (changed, aborted) = {
            let mut state = self.state.lock();
            state.catalog = ServiceCatalog::default();
            state.selection.release_handles();
            let aborted = state.transfer.abort(TransferFailure::ConnectionLost);
            let changed = state.connection.transition(ConnectionState::Disconnected);
            (changed, aborted)
        };

        if let Some(outcome) = aborted {
            warn!("Transfer aborted by disconnect");
            self.emit(outcome.into());
        }
        if let Some(state) = changed {
            info!("Disconnected");
            self.emit(SessionEvent::ConnectionStateChanged(state));
        }
    }

    fn on_services_discovered(&self, status: GattStatus, services: Vec<ServiceDescriptor>) {
        if !status.is_success() {
            warn!("Service discovery failed: {}", status);
            return;
        }

        let snapshot = {
            let mut state = self.state.lock();
            if !state.connection.is_connected() {
                debug!("Ignoring discovery result for a link that is gone");
                return;
            }
            state.catalog = ServiceCatalog::from_discovery(services);
            state.catalog.services().to_vec()
        };

        info!("Discovered {} services", snapshot.len());
        self.emit(SessionEvent::ServiceListChanged(snapshot));
    }

    fn on_inbound(&self, value: Vec<u8>) {
        debug!("Inbound {} bytes: {}", value.len(), hex::encode(&value));
        self.emit(SessionEvent::DataAvailable(value.clone()));

        if !self.config.echo_inbound || value.is_empty() {
            return;
        }
        let can_echo = {
            let state = self.state.lock();
            state.selection.active_write().is_some() && !state.transfer.is_busy()
        };
        if can_echo {
            if let Err(e) = self.send(value) {
                debug!("Echo skipped: {}", e);
            }
        }
    }

    fn on_write_complete(&self, handle: CharacteristicHandle, status: GattStatus) {
        let progress = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.selection.write.handle != Some(handle) {
                debug!("Write completion on {} is not ours", handle);
                return;
            }
            let connected = state.connection.is_connected();
            state.transfer.acknowledge(status, state.mtu, connected)
        };

        match progress {
            TransferProgress::Next(fragment) => self.issue_fragment(fragment),
            TransferProgress::Finished(outcome) => self.finish(outcome),
            TransferProgress::Idle => debug!("Write completion with nothing pending"),
        }
    }

    fn issue_fragment(&self, fragment: Fragment) {
        let target = self.state.lock().selection.active_write();
        let result = match target {
            Some((handle, mode)) => {
                self.emit(SessionEvent::FragmentSent {
                    transfer: fragment.transfer,
                    len: fragment.data.len(),
                });
                self.transport
                    .write_characteristic(handle, &fragment.data, mode)
                    .map_err(|e| TransferFailure::TransportRejected(e.to_string()))
            }
            None => Err(TransferFailure::ConnectionLost),
        };

        if let Err(reason) = result {
            warn!("Fragment {} of transfer {} not sent: {}", fragment.index, fragment.transfer, reason);
            let aborted = self.state.lock().transfer.abort(reason);
            if let Some(outcome) = aborted {
                self.finish(outcome);
            }
        }
    }

    fn finish(&self, outcome: TransferOutcome) {
        match &outcome {
            TransferOutcome::Complete { transfer, bytes_sent } => {
                info!("Transfer {} complete ({} bytes)", transfer, bytes_sent)
            }
            TransferOutcome::Failed { transfer, reason, bytes_sent } => warn!(
                "Transfer {} failed after {} bytes: {}",
                transfer, bytes_sent, reason
            ),
        }
        self.emit(outcome.into());
    }

    fn lookup(
        catalog: &ServiceCatalog,
        handle: CharacteristicHandle,
    ) -> Result<&CharacteristicDescriptor, SessionError> {
        if catalog.is_empty() {
            return Err(SessionError::Configuration(
                "No services discovered".to_string(),
            ));
        }
        catalog.find_characteristic(handle).ok_or_else(|| {
            SessionError::Configuration(format!("Unknown characteristic {}", handle))
        })
    }

    fn emit(&self, event: SessionEvent) {
        self.events.publish(event);
    }
}
