/// Server (peripheral) GATT session
///
/// Publishes one primary service, accepts a single peer at a time, answers its
/// attribute requests and pushes outbound data as notifications or indications of the
/// read characteristic. Like the client session, state lives behind one mutex that is
/// released before any transport call or event publication.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ConnectionState, ConnectionTracker};
use super::error::{SessionError, TransferFailure};
use super::events::{EventSink, SessionEvent};
use super::gatt::{DeviceAddress, GattStatus, ReadMode, RequestId, ServiceDefinition, WriteMode};
use super::transfer::{Fragment, TransferEngine, TransferId, TransferOutcome, TransferProgress};
use crate::config::SessionConfig;
use crate::transport::abstraction::{Advertiser, ServerTransport, ServerTransportEvent};

struct ServerState {
    connection: ConnectionTracker,
    peer: Option<DeviceAddress>,
    open: bool,
    service: Option<ServiceDefinition>,
    /// Whether `service` is currently registered with the transport
    registered: bool,
    read_mode: ReadMode,
    write_mode: WriteMode,
    /// Value served to read requests on the read characteristic
    read_value: Vec<u8>,
    mtu: u16,
    transfer: TransferEngine,
}

impl ServerState {
    fn is_current_peer(&self, peer: &DeviceAddress) -> bool {
        self.peer.as_ref() == Some(peer)
    }

    /// Peer to push notifications to, when the link is up
    fn connected_peer(&self) -> Option<DeviceAddress> {
        if self.connection.is_connected() {
            self.peer.clone()
        } else {
            None
        }
    }
}

pub struct ServerSession {
    config: SessionConfig,
    transport: Arc<dyn ServerTransport>,
    advertiser: Option<Arc<dyn Advertiser>>,
    events: Arc<dyn EventSink>,
    state: Mutex<ServerState>,
}

impl ServerSession {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn ServerTransport>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let state = ServerState {
            connection: ConnectionTracker::default(),
            peer: None,
            open: false,
            service: None,
            registered: false,
            read_mode: ReadMode::None,
            write_mode: WriteMode::None,
            read_value: Vec::new(),
            mtu: config.default_mtu,
            transfer: TransferEngine::new(config.overhead_bytes),
        };

        Ok(Self {
            config,
            transport,
            advertiser: None,
            events,
            state: Mutex::new(state),
        })
    }

    /// Stop this advertiser once a peer connects
    pub fn with_advertiser(mut self, advertiser: Arc<dyn Advertiser>) -> Self {
        self.advertiser = Some(advertiser);
        self
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection.state()
    }

    pub fn peer(&self) -> Option<DeviceAddress> {
        self.state.lock().peer.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn published_service(&self) -> Option<ServiceDefinition> {
        self.state.lock().service.clone()
    }

    pub fn read_value(&self) -> Vec<u8> {
        self.state.lock().read_value.clone()
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

    /// Define the service to publish
    ///
    /// Registered right away when the server is already open, otherwise on `start`.
    /// While open, the new definition only replaces the old one once the transport
    /// accepts it.
    pub fn publish(&self, read_mode: ReadMode, write_mode: WriteMode) -> Result<(), SessionError> {
        let service = ServiceDefinition::for_modes(&self.config.service, read_mode, write_mode)
            .ok_or_else(|| {
                SessionError::Configuration(
                    "At least one of the read and write modes must be set".to_string(),
                )
            })?;

        let open = {
            let mut state = self.state.lock();
            if state.transfer.is_busy() {
                return Err(SessionError::Busy);
            }
            if !state.open {
                state.service = Some(service.clone());
                state.read_mode = read_mode;
                state.write_mode = write_mode;
                state.registered = false;
            }
            state.open
        };
        info!("Publishing service {} ({:?}/{:?})", service.uuid, read_mode, write_mode);

        if !open {
            return Ok(());
        }

        self.transport.clear_services();
        if let Err(e) = self.transport.register_service(&service) {
            warn!("Registration of service {} refused: {}", service.uuid, e);
            self.state.lock().registered = false;
            return Err(SessionError::TransportRejected(e));
        }

        let mut state = self.state.lock();
        state.service = Some(service);
        state.read_mode = read_mode;
        state.write_mode = write_mode;
        state.registered = true;
        Ok(())
    }

    /// Open the server and register the published service
    ///
    /// Calling it again retries whatever did not succeed the first time.
    pub fn start(&self) -> Result<(), SessionError> {
        let (open, pending) = {
            let state = self.state.lock();
            let pending = if state.registered { None } else { state.service.clone() };
            (state.open, pending)
        };
        if open && pending.is_none() {
            return Ok(());
        }

        if !open {
            self.transport.open()?;
            self.state.lock().open = true;
            info!("GATT server open");
        }

        let Some(service) = pending else {
            debug!("Server opened with nothing published yet");
            return Ok(());
        };
        if let Err(e) = self.transport.register_service(&service) {
            warn!("Registration of service {} refused: {}", service.uuid, e);
            return Err(SessionError::TransportRejected(e));
        }

        let mut state = self.state.lock();
        if state.service.as_ref() == Some(&service) {
            state.registered = true;
        }
        Ok(())
    }

    /// Drop the peer and shut the server down
    pub fn stop(&self) {
        let peer = self.state.lock().peer.clone();
        if let Some(peer) = &peer {
            info!("Cancelling connection to {}", peer);
            self.transport.cancel_connection(peer);
        }
        self.transport.clear_services();
        self.transport.close();

        let (changed, aborted) = {
            let mut state = self.state.lock();
            state.open = false;
            state.registered = false;
            state.peer = None;
            let aborted = state.transfer.abort(TransferFailure::ConnectionLost);
            let changed = state.connection.transition(ConnectionState::Disconnected);
            (changed, aborted)
        };

        if let Some(outcome) = aborted {
            self.finish(outcome);
        }
        if let Some(state) = changed {
            self.emit(SessionEvent::ConnectionStateChanged(state));
        }
        info!("GATT server stopped");
    }

    pub fn set_read_value(&self, value: impl Into<Vec<u8>>) {
        self.state.lock().read_value = value.into();
    }

    /// Push `payload` to the peer through the read characteristic
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<TransferId, SessionError> {
        let payload = payload.into();

        let (fragment, peer, confirm) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(peer) = state.connected_peer() else {
                return Err(SessionError::PeerUnavailable);
            };
            if state.read_mode == ReadMode::None {
                return Err(SessionError::Configuration(
                    "No read characteristic published".to_string(),
                ));
            }
            let fragment = state.transfer.begin(payload, state.mtu)?;
            state.read_value = fragment.data.clone();
            (fragment, peer, state.read_mode.requires_confirmation())
        };

        let transfer = fragment.transfer;
        info!("Transfer {} started to {}", transfer, peer);
        self.emit(SessionEvent::FragmentSent {
            transfer,
            len: fragment.data.len(),
        });

        let characteristic = self.config.service.read_characteristic;
        if let Err(e) = self.transport.notify(&peer, characteristic, &fragment.data, confirm) {
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

    pub fn handle_event(&self, event: ServerTransportEvent) {
        debug!("Server event: {}", event);
        match event {
            ServerTransportEvent::PeerConnectionChanged { peer, state, status } => {
                if status.is_success() {
                    self.on_peer_state(peer, state)
                } else {
                    warn!("Connection event for {} failed: {}", peer, status);
                    self.on_peer_state(peer, ConnectionState::Disconnected)
                }
            }
            ServerTransportEvent::ReadRequest {
                peer,
                request,
                characteristic,
                offset,
            } => self.on_read_request(peer, request, characteristic, offset),
            ServerTransportEvent::WriteRequest {
                peer,
                request,
                characteristic,
                value,
                response_needed,
                offset,
            } => self.on_write_request(peer, request, characteristic, value, response_needed, offset),
            ServerTransportEvent::DescriptorWriteRequest {
                peer,
                request,
                descriptor,
                response_needed,
                ..
            } => {
                if !self.serves(&peer) {
                    return;
                }
                debug!("Descriptor {} written by {}", descriptor, peer);
                if response_needed {
                    self.respond(&peer, request, GattStatus::Success, 0, &[]);
                }
            }
            ServerTransportEvent::DescriptorReadRequest {
                peer,
                request,
                offset,
                ..
            } => {
                if self.serves(&peer) {
                    self.respond(&peer, request, GattStatus::Success, offset, &[]);
                }
            }
            ServerTransportEvent::NotificationSent { peer, status } => {
                self.on_notification_sent(peer, status)
            }
            ServerTransportEvent::MtuChanged { peer, mtu } => {
                let mut state = self.state.lock();
                if state.is_current_peer(&peer) {
                    info!("MTU for {} changed to {}", peer, mtu);
                    state.mtu = mtu;
                }
            }
            ServerTransportEvent::ServiceAdded { service, status } => {
                if status.is_success() {
                    info!("Service {} added", service);
                } else {
                    warn!("Adding service {} failed: {}", service, status);
                }
            }
        }
    }

    /// Pump events from a platform channel until it closes
    pub async fn drive(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ServerTransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Server transport event channel closed");
    }

    fn on_peer_state(&self, peer: DeviceAddress, next: ConnectionState) {
        if next == ConnectionState::Disconnected {
            self.on_peer_lost(peer);
            return;
        }

        let changed = {
            let mut state = self.state.lock();
            let occupied = matches!(&state.peer, Some(current) if *current != peer);
            if occupied {
                None
            } else {
                state.peer = Some(peer.clone());
                Some(state.connection.transition(next))
            }
        };

        let Some(changed) = changed else {
            warn!("Rejecting second peer {}", peer);
            self.transport.cancel_connection(&peer);
            return;
        };

        if let Some(state) = changed {
            info!("Peer {} is {}", peer, state);
            self.emit(SessionEvent::ConnectionStateChanged(state));
        }

        if next == ConnectionState::Connected {
            if let Some(advertiser) = &self.advertiser {
                if advertiser.is_advertising() {
                    info!("Peer connected; stopping advertising");
                    advertiser.stop_advertising();
                }
            }
        }
    }

    fn on_peer_lost(&self, peer: DeviceAddress) {
        let (changed, aborted) = {
            let mut state = self.state.lock();
            if !state.is_current_peer(&peer) {
                debug!("Ignoring disconnect of {}", peer);
                return;
            }
            state.peer = None;
            let aborted = state.transfer.abort(TransferFailure::ConnectionLost);
            let changed = state.connection.transition(ConnectionState::Disconnected);
            (changed, aborted)
        };

        if let Some(outcome) = aborted {
            self.finish(outcome);
        }
        if let Some(state) = changed {
            info!("Peer {} disconnected", peer);
            self.emit(SessionEvent::ConnectionStateChanged(state));
        }
    }

    /// Only the accepted peer gets answers; anyone else's requests are dropped unanswered
    fn serves(&self, peer: &DeviceAddress) -> bool {
        let current = self.state.lock().is_current_peer(peer);
        if !current {
            warn!("Ignoring request from {}: not the connected peer", peer);
        }
        current
    }

    fn on_read_request(&self, peer: DeviceAddress, request: RequestId, characteristic: Uuid, offset: u16) {
        if !self.serves(&peer) {
            return;
        }
        if offset != 0 {
            self.respond(&peer, request, GattStatus::InvalidOffset, offset, &[]);
            return;
        }

        let value = {
            let state = self.state.lock();
            let published = state.read_mode != ReadMode::None;
            if published && characteristic == self.config.service.read_characteristic {
                Some(state.read_value.clone())
            } else {
                None
            }
        };

        match value {
            Some(value) => self.respond(&peer, request, GattStatus::Success, 0, &value),
            None => {
                debug!("Read of unknown characteristic {} from {}", characteristic, peer);
                self.respond(&peer, request, GattStatus::InvalidHandle, 0, &[]);
            }
        }
    }

    fn on_write_request(
        &self,
        peer: DeviceAddress,
        request: RequestId,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
        offset: u16,
    ) {
        if !self.serves(&peer) {
            return;
        }
        let ids = &self.config.service;
        let (writable, readable) = {
            let state = self.state.lock();
            (
                state.write_mode != WriteMode::None && characteristic == ids.write_characteristic,
                state.read_mode != ReadMode::None && characteristic == ids.read_characteristic,
            )
        };

        let status = if offset != 0 {
            GattStatus::InvalidOffset
        } else if writable {
            GattStatus::Success
        } else if readable {
            GattStatus::WriteNotPermitted
        } else {
            GattStatus::InvalidHandle
        };

        if status != GattStatus::Success {
            warn!("Write to {} from {} rejected: {}", characteristic, peer, status);
            if response_needed {
                self.respond(&peer, request, status, offset, &[]);
            }
            return;
        }

        debug!("Inbound {} bytes from {}: {}", value.len(), peer, hex::encode(&value));
        self.emit(SessionEvent::DataAvailable(value.clone()));
        if response_needed {
            self.respond(&peer, request, GattStatus::Success, 0, &[]);
        }

        if self.config.echo_inbound && !value.is_empty() && !self.is_transfer_in_progress() {
            if let Err(e) = self.send(value) {
                debug!("Echo skipped: {}", e);
            }
        }
    }

    fn on_notification_sent(&self, peer: DeviceAddress, status: GattStatus) {
        let progress = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.is_current_peer(&peer) {
                debug!("Notification completion for stale peer {}", peer);
                return;
            }
            let connected = state.connection.is_connected();
            let progress = state.transfer.acknowledge(status, state.mtu, connected);
            if let TransferProgress::Next(fragment) = &progress {
                state.read_value = fragment.data.clone();
            }
            progress
        };

        match progress {
            TransferProgress::Next(fragment) => self.issue_fragment(peer, fragment),
            TransferProgress::Finished(outcome) => self.finish(outcome),
            TransferProgress::Idle => debug!("Notification completion with nothing pending"),
        }
    }

    fn issue_fragment(&self, peer: DeviceAddress, fragment: Fragment) {
        let confirm = self.state.lock().read_mode.requires_confirmation();
        let characteristic = self.config.service.read_characteristic;

        self.emit(SessionEvent::FragmentSent {
            transfer: fragment.transfer,
            len: fragment.data.len(),
        });
        if let Err(e) = self.transport.notify(&peer, characteristic, &fragment.data, confirm) {
            warn!("Fragment {} of transfer {} refused: {}", fragment.index, fragment.transfer, e);
            let aborted = self
                .state
                .lock()
                .transfer
                .abort(TransferFailure::TransportRejected(e.to_string()));
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

    fn respond(&self, peer: &DeviceAddress, request: RequestId, status: GattStatus, offset: u16, value: &[u8]) {
        if let Err(e) = self.transport.send_response(peer, request, status, offset, value) {
            warn!("Response to {} refused: {}", peer, e);
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.events.publish(event);
    }
}
