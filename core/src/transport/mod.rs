// Transport module: platform abstraction and BLE GATT sessions

pub mod abstraction;
pub mod ble;

pub use abstraction::{
    Advertiser, ClientTransport, ClientTransportEvent, ServerTransport, ServerTransportEvent,
    TransportError,
};
pub use ble::{ClientSession, ServerSession, SessionError, SessionEvent};
