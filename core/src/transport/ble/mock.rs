// Recording transports for session unit tests.
//
// Every call is appended to a log; individual operations can be switched to refuse
// so the synchronous-rejection paths can be exercised. Completions are never
// delivered automatically; tests feed them through `handle_event`.

use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

use super::events::{EventBus, SessionEvent};
use super::gatt::{
    CharacteristicHandle, DeviceAddress, GattStatus, ReadMode, RequestId, ServiceDefinition,
    WriteMode,
};
use crate::transport::abstraction::{ClientTransport, ServerTransport, TransportError};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    Connect(DeviceAddress),
    Reconnect,
    Disconnect,
    Close,
    DiscoverServices,
    Read(CharacteristicHandle),
    Write {
        handle: CharacteristicHandle,
        value: Vec<u8>,
        mode: WriteMode,
    },
    Subscribe {
        handle: CharacteristicHandle,
        mode: ReadMode,
    },
}

#[derive(Default)]
pub struct MockClientTransport {
    calls: Mutex<Vec<ClientCall>>,
    refusing: Mutex<HashSet<&'static str>>,
}

impl MockClientTransport {
    /// Make every later call to `op` fail synchronously
    pub fn refuse(&self, op: &'static str) {
        self.refusing.lock().insert(op);
    }

    pub fn allow(&self, op: &'static str) {
        self.refusing.lock().remove(op);
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ClientCall::Write { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, op: &'static str, call: ClientCall) -> Result<(), TransportError> {
        if self.refusing.lock().contains(op) {
            return Err(TransportError::Refused(op.to_string()));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

impl ClientTransport for MockClientTransport {
    fn connect(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        self.record("connect", ClientCall::Connect(address.clone()))
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        self.record("reconnect", ClientCall::Reconnect)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.record("disconnect", ClientCall::Disconnect)
    }

    fn close(&self) {
        self.calls.lock().push(ClientCall::Close);
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.record("discover", ClientCall::DiscoverServices)
    }

    fn read_characteristic(&self, handle: CharacteristicHandle) -> Result<(), TransportError> {
        self.record("read", ClientCall::Read(handle))
    }

    fn write_characteristic(
        &self,
        handle: CharacteristicHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.record(
            "write",
            ClientCall::Write {
                handle,
                value: value.to_vec(),
                mode,
            },
        )
    }

    fn subscribe(&self, handle: CharacteristicHandle, mode: ReadMode) -> Result<(), TransportError> {
        self.record("subscribe", ClientCall::Subscribe { handle, mode })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerCall {
    Open,
    Close,
    RegisterService(ServiceDefinition),
    ClearServices,
    CancelConnection(DeviceAddress),
    Response {
        peer: DeviceAddress,
        request: RequestId,
        status: GattStatus,
        offset: u16,
        value: Vec<u8>,
    },
    Notify {
        peer: DeviceAddress,
        characteristic: Uuid,
        value: Vec<u8>,
        confirm: bool,
    },
}

#[derive(Default)]
pub struct MockServerTransport {
    calls: Mutex<Vec<ServerCall>>,
    refusing: Mutex<HashSet<&'static str>>,
}

impl MockServerTransport {
    pub fn refuse(&self, op: &'static str) {
        self.refusing.lock().insert(op);
    }

    pub fn allow(&self, op: &'static str) {
        self.refusing.lock().remove(op);
    }

    pub fn calls(&self) -> Vec<ServerCall> {
        self.calls.lock().clone()
    }

    pub fn notifications(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ServerCall::Notify { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<ServerCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, ServerCall::Response { .. }))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, op: &'static str, call: ServerCall) -> Result<(), TransportError> {
        if self.refusing.lock().contains(op) {
            return Err(TransportError::Refused(op.to_string()));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

impl ServerTransport for MockServerTransport {
    fn open(&self) -> Result<(), TransportError> {
        self.record("open", ServerCall::Open)
    }

    fn close(&self) {
        self.calls.lock().push(ServerCall::Close);
    }

    fn register_service(&self, service: &ServiceDefinition) -> Result<(), TransportError> {
        self.record("register", ServerCall::RegisterService(service.clone()))
    }

    fn clear_services(&self) {
        self.calls.lock().push(ServerCall::ClearServices);
    }

    fn cancel_connection(&self, peer: &DeviceAddress) {
        self.calls.lock().push(ServerCall::CancelConnection(peer.clone()));
    }

    fn send_response(
        &self,
        peer: &DeviceAddress,
        request: RequestId,
        status: GattStatus,
        offset: u16,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(
            "response",
            ServerCall::Response {
                peer: peer.clone(),
                request,
                status,
                offset,
                value: value.to_vec(),
            },
        )
    }

    fn notify(
        &self,
        peer: &DeviceAddress,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    ) -> Result<(), TransportError> {
        self.record(
            "notify",
            ServerCall::Notify {
                peer: peer.clone(),
                characteristic,
                value: value.to_vec(),
                confirm,
            },
        )
    }
}

/// Everything published so far
pub fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn event_bus() -> (EventBus, UnboundedReceiver<SessionEvent>) {
    EventBus::channel()
}
