// Loopback integration test
//
// Wires a client session and a server session together through an in-memory radio:
// client writes arrive as server write requests, server notifications arrive as client
// characteristic changes, and every accepted request is completed on the caller's
// event channel. Both sessions are pumped by their `drive` tasks.

use gattlink_core::transport::ble::{
    CharacteristicDescriptor, CharacteristicProperties, RequestId, ServiceDefinition,
    ServiceDescriptor,
};
use gattlink_core::{
    CharacteristicHandle, ClientSession, ClientTransport, ClientTransportEvent, ConnectionState,
    DeviceAddress, EventBus, GattStatus, ReadMode, ServerSession, ServerTransport,
    ServerTransportEvent, SessionConfig, SessionEvent, TransportError, WriteMode,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use uuid::Uuid;

const CLIENT_ADDRESS: &str = "00:00:00:00:00:C1";
const SERVER_ADDRESS: &str = "00:00:00:00:00:5E";
const READ_HANDLE: CharacteristicHandle = CharacteristicHandle(0x0021);
const WRITE_HANDLE: CharacteristicHandle = CharacteristicHandle(0x0023);

struct Radio {
    to_client: UnboundedSender<ClientTransportEvent>,
    to_server: UnboundedSender<ServerTransportEvent>,
    published: Mutex<Option<ServiceDefinition>>,
    next_request: AtomicU32,
}

impl Radio {
    fn client_event(&self, event: ClientTransportEvent) -> Result<(), TransportError> {
        self.to_client.send(event).map_err(|_| TransportError::Unavailable)
    }

    fn server_event(&self, event: ServerTransportEvent) -> Result<(), TransportError> {
        self.to_server.send(event).map_err(|_| TransportError::Unavailable)
    }

    fn link_state(&self, state: ConnectionState) -> Result<(), TransportError> {
        self.server_event(ServerTransportEvent::PeerConnectionChanged {
            peer: DeviceAddress::new(CLIENT_ADDRESS),
            state,
            status: GattStatus::Success,
        })?;
        self.client_event(ClientTransportEvent::ConnectionStateChanged {
            state,
            status: GattStatus::Success,
        })
    }

    /// The published service as a client discovers it
    fn discovered(&self) -> Vec<ServiceDescriptor> {
        let Some(service) = self.published.lock().clone() else {
            return Vec::new();
        };
        let mut characteristics = Vec::new();
        if let Some(read) = &service.read_characteristic {
            characteristics.push(CharacteristicDescriptor::new(
                READ_HANDLE,
                read.uuid,
                read.properties | CharacteristicProperties::READ,
            ));
        }
        if let Some(write) = &service.write_characteristic {
            characteristics.push(CharacteristicDescriptor::new(
                WRITE_HANDLE,
                write.uuid,
                write.properties,
            ));
        }
        vec![ServiceDescriptor::primary(service.uuid, characteristics)]
    }

    fn uuid_of(&self, handle: CharacteristicHandle) -> Uuid {
        let published = self.published.lock();
        let service = published.as_ref();
        let characteristic = if handle == READ_HANDLE {
            service.and_then(|s| s.read_characteristic.as_ref())
        } else {
            service.and_then(|s| s.write_characteristic.as_ref())
        };
        characteristic.map(|c| c.uuid).unwrap_or_else(Uuid::nil)
    }
}

struct ClientSide(Arc<Radio>);

impl ClientTransport for ClientSide {
    fn connect(&self, _address: &DeviceAddress) -> Result<(), TransportError> {
        self.0.link_state(ConnectionState::Connected)
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        self.0.link_state(ConnectionState::Connected)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.0.link_state(ConnectionState::Disconnected)
    }

    fn close(&self) {}

    fn discover_services(&self) -> Result<(), TransportError> {
        let services = self.0.discovered();
        self.0.client_event(ClientTransportEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services,
        })
    }

    fn read_characteristic(&self, handle: CharacteristicHandle) -> Result<(), TransportError> {
        self.0.server_event(ServerTransportEvent::ReadRequest {
            peer: DeviceAddress::new(CLIENT_ADDRESS),
            request: RequestId(self.0.next_request.fetch_add(1, Ordering::SeqCst)),
            characteristic: self.0.uuid_of(handle),
            offset: 0,
        })
    }

    fn write_characteristic(
        &self,
        handle: CharacteristicHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.0.server_event(ServerTransportEvent::WriteRequest {
            peer: DeviceAddress::new(CLIENT_ADDRESS),
            request: RequestId(self.0.next_request.fetch_add(1, Ordering::SeqCst)),
            characteristic: self.0.uuid_of(handle),
            value: value.to_vec(),
            response_needed: mode == WriteMode::Write,
            offset: 0,
        })?;
        self.0.client_event(ClientTransportEvent::WriteComplete {
            handle,
            status: GattStatus::Success,
        })
    }

    fn subscribe(&self, handle: CharacteristicHandle, mode: ReadMode) -> Result<(), TransportError> {
        let value = mode.cccd_value().ok_or_else(|| TransportError::Refused("subscribe".into()))?;
        self.0.server_event(ServerTransportEvent::DescriptorWriteRequest {
            peer: DeviceAddress::new(CLIENT_ADDRESS),
            request: RequestId(self.0.next_request.fetch_add(1, Ordering::SeqCst)),
            descriptor: gattlink_core::transport::ble::CCCD_UUID,
            value: value.to_vec(),
            response_needed: true,
        })?;
        self.0.client_event(ClientTransportEvent::DescriptorWritten {
            handle,
            descriptor: gattlink_core::transport::ble::CCCD_UUID,
            status: GattStatus::Success,
        })
    }
}

struct ServerSide(Arc<Radio>);

impl ServerTransport for ServerSide {
    fn open(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) {}

    fn register_service(&self, service: &ServiceDefinition) -> Result<(), TransportError> {
        *self.0.published.lock() = Some(service.clone());
        Ok(())
    }

    fn clear_services(&self) {
        *self.0.published.lock() = None;
    }

    fn cancel_connection(&self, _peer: &DeviceAddress) {}

    fn send_response(
        &self,
        _peer: &DeviceAddress,
        _request: RequestId,
        status: GattStatus,
        _offset: u16,
        value: &[u8],
    ) -> Result<(), TransportError> {
        // Only read responses carry data back to the client
        if !value.is_empty() {
            self.0.client_event(ClientTransportEvent::CharacteristicRead {
                handle: READ_HANDLE,
                status,
                value: value.to_vec(),
            })?;
        }
        Ok(())
    }

    fn notify(
        &self,
        peer: &DeviceAddress,
        _characteristic: Uuid,
        value: &[u8],
        _confirm: bool,
    ) -> Result<(), TransportError> {
        self.0.client_event(ClientTransportEvent::CharacteristicChanged {
            handle: READ_HANDLE,
            value: value.to_vec(),
        })?;
        self.0.server_event(ServerTransportEvent::NotificationSent {
            peer: peer.clone(),
            status: GattStatus::Success,
        })
    }
}

struct Link {
    client: Arc<ClientSession>,
    server: Arc<ServerSession>,
    client_events: UnboundedReceiver<SessionEvent>,
    server_events: UnboundedReceiver<SessionEvent>,
}

fn link(client_config: SessionConfig, server_config: SessionConfig) -> Link {
    let (to_client, client_radio) = mpsc::unbounded_channel();
    let (to_server, server_radio) = mpsc::unbounded_channel();
    let radio = Arc::new(Radio {
        to_client,
        to_server,
        published: Mutex::new(None),
        next_request: AtomicU32::new(1),
    });

    let (client_bus, client_events) = EventBus::channel();
    let (server_bus, server_events) = EventBus::channel();
    let client = Arc::new(
        ClientSession::new(client_config, Arc::new(ClientSide(radio.clone())), Arc::new(client_bus))
            .expect("client session"),
    );
    let server = Arc::new(
        ServerSession::new(server_config, Arc::new(ServerSide(radio)), Arc::new(server_bus))
            .expect("server session"),
    );

    tokio::spawn(client.clone().drive(client_radio));
    tokio::spawn(server.clone().drive(server_radio));

    Link {
        client,
        server,
        client_events,
        server_events,
    }
}

/// Wait for the first event matching `predicate`
async fn wait_for<F>(rx: &mut UnboundedReceiver<SessionEvent>, mut predicate: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Connect, discover and select both characteristics
async fn establish(link: &mut Link, read_mode: ReadMode, write_mode: WriteMode) {
    link.server.publish(read_mode, write_mode).expect("publish");
    link.server.start().expect("start");

    link.client.connect(SERVER_ADDRESS).expect("connect");
    wait_for(&mut link.client_events, |e| matches!(e, SessionEvent::ServiceListChanged(_))).await;
    wait_for(&mut link.server_events, |e| {
        *e == SessionEvent::ConnectionStateChanged(ConnectionState::Connected)
    })
    .await;

    link.client
        .select_read_characteristic(READ_HANDLE, read_mode)
        .expect("select read");
    link.client
        .select_write_characteristic(WRITE_HANDLE, write_mode)
        .expect("select write");
}

#[tokio::test]
async fn test_client_to_server_payload() {
    let mut link = link(SessionConfig::default(), SessionConfig::default());
    establish(&mut link, ReadMode::Notify, WriteMode::Write).await;

    let payload: Vec<u8> = (0..=255u8).cycle().take(130).collect();
    link.client.send(payload.clone()).expect("send");

    let mut received = Vec::new();
    while received.len() < payload.len() {
        if let SessionEvent::DataAvailable(chunk) =
            wait_for(&mut link.server_events, |e| matches!(e, SessionEvent::DataAvailable(_))).await
        {
            assert!(chunk.len() <= 20);
            received.extend(chunk);
        }
    }
    assert_eq!(received, payload);

    let done = wait_for(&mut link.client_events, |e| {
        matches!(e, SessionEvent::TransferComplete { .. })
    })
    .await;
    assert!(matches!(done, SessionEvent::TransferComplete { bytes_sent: 130, .. }));
    println!("✓ 130 bytes crossed the link in 20-byte fragments");
}

#[tokio::test]
async fn test_server_to_client_payload() {
    let mut link = link(SessionConfig::default(), SessionConfig::default());
    establish(&mut link, ReadMode::Indicate, WriteMode::WriteNoResponse).await;

    let payload = b"indications are acknowledged one at a time".to_vec();
    link.server.send(payload.clone()).expect("send");

    let mut received = Vec::new();
    while received.len() < payload.len() {
        if let SessionEvent::DataAvailable(chunk) =
            wait_for(&mut link.client_events, |e| matches!(e, SessionEvent::DataAvailable(_))).await
        {
            received.extend(chunk);
        }
    }
    assert_eq!(received, payload);

    wait_for(&mut link.server_events, |e| {
        matches!(e, SessionEvent::TransferComplete { .. })
    })
    .await;
    assert!(!link.server.is_transfer_in_progress());
}

#[tokio::test]
async fn test_server_echoes_client_data() {
    let mut link = link(
        SessionConfig::default(),
        SessionConfig::default().with_echo(true),
    );
    establish(&mut link, ReadMode::Notify, WriteMode::Write).await;

    link.client.send(b"marco".to_vec()).expect("send");

    let echoed = wait_for(&mut link.client_events, |e| {
        matches!(e, SessionEvent::DataAvailable(_))
    })
    .await;
    assert_eq!(echoed, SessionEvent::DataAvailable(b"marco".to_vec()));
}

#[tokio::test]
async fn test_client_read_returns_served_value() {
    let mut link = link(SessionConfig::default(), SessionConfig::default());
    establish(&mut link, ReadMode::Notify, WriteMode::Write).await;
    link.server.set_read_value(b"battery=87".to_vec());

    link.client.read(READ_HANDLE).expect("read");

    let value = wait_for(&mut link.client_events, |e| {
        matches!(e, SessionEvent::DataAvailable(_))
    })
    .await;
    assert_eq!(value, SessionEvent::DataAvailable(b"battery=87".to_vec()));
}

#[tokio::test]
async fn test_disconnect_reaches_both_sides() {
    let mut link = link(SessionConfig::default(), SessionConfig::default());
    establish(&mut link, ReadMode::Notify, WriteMode::Write).await;

    link.client.disconnect().expect("disconnect");

    wait_for(&mut link.client_events, |e| {
        *e == SessionEvent::ConnectionStateChanged(ConnectionState::Disconnected)
    })
    .await;
    wait_for(&mut link.server_events, |e| {
        *e == SessionEvent::ConnectionStateChanged(ConnectionState::Disconnected)
    })
    .await;
    assert!(link.client.services().is_empty());
    assert_eq!(link.server.peer(), None);
}
