//! Transport abstraction layer for GATT sessions
//!
//! Defines the capabilities a platform must provide (client and server GATT
//! transports, and an advertiser handle) and the closed set of events the platform
//! delivers back. Every radio callback maps to exactly one event variant; sessions
//! match on the variant instead of overriding callback methods.
//!
//! Transport calls only *issue* requests. A call returning `Ok` means the request was
//! accepted by the stack; its outcome arrives later as an event.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::transport::ble::connection::ConnectionState;
use crate::transport::ble::gatt::{
    CharacteristicHandle, DeviceAddress, GattStatus, ReadMode, RequestId, ServiceDefinition,
    ServiceDescriptor, WriteMode,
};

/// Synchronous refusal of a transport request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable")]
    Unavailable,
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Request refused: {0}")]
    Refused(String),
}

/// Central-side GATT capability
pub trait ClientTransport: Send + Sync {
    /// Create a new link to `address`
    fn connect(&self, address: &DeviceAddress) -> Result<(), TransportError>;

    /// Re-establish the existing link to the last connected device
    fn reconnect(&self) -> Result<(), TransportError>;

    /// Drop the link; the outcome arrives as a connection-state event
    fn disconnect(&self) -> Result<(), TransportError>;

    /// Release the link and every resource tied to it
    fn close(&self);

    fn discover_services(&self) -> Result<(), TransportError>;

    fn read_characteristic(&self, handle: CharacteristicHandle) -> Result<(), TransportError>;

    fn write_characteristic(
        &self,
        handle: CharacteristicHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    /// Enable notifications or indications by writing `mode.cccd_value()` to the CCCD
    fn subscribe(&self, handle: CharacteristicHandle, mode: ReadMode) -> Result<(), TransportError>;
}

/// Peripheral-side GATT capability
pub trait ServerTransport: Send + Sync {
    /// Open the GATT server so peers can connect
    fn open(&self) -> Result<(), TransportError>;

    fn close(&self);

    fn register_service(&self, service: &ServiceDefinition) -> Result<(), TransportError>;

    fn clear_services(&self);

    fn cancel_connection(&self, peer: &DeviceAddress);

    fn send_response(
        &self,
        peer: &DeviceAddress,
        request: RequestId,
        status: GattStatus,
        offset: u16,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Push `value` on `characteristic`; `confirm` selects indication over notification
    fn notify(
        &self,
        peer: &DeviceAddress,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    ) -> Result<(), TransportError>;
}

/// Handle on the platform advertiser
///
/// Advertising itself is owned by the platform; a server session only needs to stop it
/// once a peer is connected.
#[cfg_attr(test, mockall::automock)]
pub trait Advertiser: Send + Sync {
    fn is_advertising(&self) -> bool;

    fn stop_advertising(&self);
}

/// Events delivered to a client session
#[derive(Debug, Clone, PartialEq)]
pub enum ClientTransportEvent {
    ConnectionStateChanged {
        state: ConnectionState,
        status: GattStatus,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<ServiceDescriptor>,
    },
    /// Notification or indication from the peer
    CharacteristicChanged {
        handle: CharacteristicHandle,
        value: Vec<u8>,
    },
    CharacteristicRead {
        handle: CharacteristicHandle,
        status: GattStatus,
        value: Vec<u8>,
    },
    WriteComplete {
        handle: CharacteristicHandle,
        status: GattStatus,
    },
    DescriptorWritten {
        handle: CharacteristicHandle,
        descriptor: Uuid,
        status: GattStatus,
    },
    DescriptorRead {
        handle: CharacteristicHandle,
        descriptor: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    RssiRead {
        rssi: i16,
        status: GattStatus,
    },
}

impl fmt::Display for ClientTransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientTransportEvent::ConnectionStateChanged { state, status } => {
                write!(f, "ConnectionStateChanged {{ state: {}, status: {} }}", state, status)
            }
            ClientTransportEvent::ServicesDiscovered { status, services } => write!(
                f,
                "ServicesDiscovered {{ status: {}, services: {} }}",
                status,
                services.len()
            ),
            ClientTransportEvent::CharacteristicChanged { handle, value } => write!(
                f,
                "CharacteristicChanged {{ handle: {}, value_len: {} }}",
                handle,
                value.len()
            ),
            ClientTransportEvent::CharacteristicRead { handle, status, value } => write!(
                f,
                "CharacteristicRead {{ handle: {}, status: {}, value_len: {} }}",
                handle,
                status,
                value.len()
            ),
            ClientTransportEvent::WriteComplete { handle, status } => {
                write!(f, "WriteComplete {{ handle: {}, status: {} }}", handle, status)
            }
            ClientTransportEvent::DescriptorWritten { handle, status, .. } => {
                write!(f, "DescriptorWritten {{ handle: {}, status: {} }}", handle, status)
            }
            ClientTransportEvent::DescriptorRead { handle, status, .. } => {
                write!(f, "DescriptorRead {{ handle: {}, status: {} }}", handle, status)
            }
            ClientTransportEvent::MtuChanged { mtu, status } => {
                write!(f, "MtuChanged {{ mtu: {}, status: {} }}", mtu, status)
            }
            ClientTransportEvent::RssiRead { rssi, status } => {
                write!(f, "RssiRead {{ rssi: {}, status: {} }}", rssi, status)
            }
        }
    }
}

/// Events delivered to a server session
#[derive(Debug, Clone, PartialEq)]
pub enum ServerTransportEvent {
    PeerConnectionChanged {
        peer: DeviceAddress,
        state: ConnectionState,
        status: GattStatus,
    },
    ReadRequest {
        peer: DeviceAddress,
        request: RequestId,
        characteristic: Uuid,
        offset: u16,
    },
    WriteRequest {
        peer: DeviceAddress,
        request: RequestId,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
        offset: u16,
    },
    DescriptorWriteRequest {
        peer: DeviceAddress,
        request: RequestId,
        descriptor: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
    DescriptorReadRequest {
        peer: DeviceAddress,
        request: RequestId,
        descriptor: Uuid,
        offset: u16,
    },
    /// The pending notification/indication left the stack (or was confirmed)
    NotificationSent {
        peer: DeviceAddress,
        status: GattStatus,
    },
    MtuChanged {
        peer: DeviceAddress,
        mtu: u16,
    },
    ServiceAdded {
        service: Uuid,
        status: GattStatus,
    },
}

impl fmt::Display for ServerTransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTransportEvent::PeerConnectionChanged { peer, state, status } => write!(
                f,
                "PeerConnectionChanged {{ peer: {}, state: {}, status: {} }}",
                peer, state, status
            ),
            ServerTransportEvent::ReadRequest { peer, offset, .. } => {
                write!(f, "ReadRequest {{ peer: {}, offset: {} }}", peer, offset)
            }
            ServerTransportEvent::WriteRequest { peer, value, response_needed, .. } => write!(
                f,
                "WriteRequest {{ peer: {}, value_len: {}, response_needed: {} }}",
                peer,
                value.len(),
                response_needed
            ),
            ServerTransportEvent::DescriptorWriteRequest { peer, descriptor, .. } => write!(
                f,
                "DescriptorWriteRequest {{ peer: {}, descriptor: {} }}",
                peer, descriptor
            ),
            ServerTransportEvent::DescriptorReadRequest { peer, descriptor, .. } => write!(
                f,
                "DescriptorReadRequest {{ peer: {}, descriptor: {} }}",
                peer, descriptor
            ),
            ServerTransportEvent::NotificationSent { peer, status } => {
                write!(f, "NotificationSent {{ peer: {}, status: {} }}", peer, status)
            }
            ServerTransportEvent::MtuChanged { peer, mtu } => {
                write!(f, "MtuChanged {{ peer: {}, mtu: {} }}", peer, mtu)
            }
            ServerTransportEvent::ServiceAdded { service, status } => {
                write!(f, "ServiceAdded {{ service: {}, status: {} }}", service, status)
            }
        }
    }
}
