/// BLE GATT session module
///
/// Protocol-level core of a point-to-point GATT link:
///
/// - **gatt**: attribute vocabulary (handles, properties, modes, catalogs, service definitions)
/// - **connection**: the three-state link state machine
/// - **transfer**: MTU-sized, single-writer fragmentation of outbound payloads
/// - **client** / **server**: the two session roles
/// - **events**: what sessions publish to the application
///
/// Radio work is done by platform code behind the traits in `transport::abstraction`;
/// everything here is testable without hardware.

pub mod client;
pub mod connection;
pub mod error;
pub mod events;
pub mod gatt;
pub mod server;
pub mod transfer;

#[cfg(test)]
pub(crate) mod mock;

pub use client::ClientSession;
pub use connection::{ConnectionState, ConnectionTracker};
pub use error::{SessionError, TransferFailure};
pub use events::{EventBus, EventSink, SessionEvent};
pub use gatt::{
    AttributePermission, Binding, CharacteristicDescriptor, CharacteristicHandle,
    CharacteristicProperties, CharacteristicSelection, DeviceAddress, GattStatus,
    LocalCharacteristic, ReadMode, RequestId, ServiceCatalog, ServiceDefinition,
    ServiceDescriptor, WriteMode, ATT_OVERHEAD_BYTES, CCCD_UUID, DEFAULT_MTU,
    GATT_SERVICE_UUID, READ_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID,
};
pub use server::ServerSession;
pub use transfer::{Fragment, TransferEngine, TransferId, TransferOutcome, TransferProgress};
