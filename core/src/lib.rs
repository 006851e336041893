// gattlink core: point-to-point BLE GATT sessions
//
// One client or server session per link, a single outbound write in flight at a time,
// and every payload cut to the MTU the link currently has.
#![allow(clippy::empty_line_after_doc_comments)]

pub mod config;
pub mod transport;

pub use config::{ConfigError, ServiceIdentifiers, SessionConfig};
pub use transport::abstraction::{
    Advertiser, ClientTransport, ClientTransportEvent, ServerTransport, ServerTransportEvent,
    TransportError,
};
pub use transport::ble::{
    CharacteristicHandle, ClientSession, ConnectionState, DeviceAddress, EventBus, EventSink,
    GattStatus, ReadMode, ServerSession, SessionError, SessionEvent, TransferFailure, TransferId,
    WriteMode,
};

/// Install the default `tracing` subscriber (idempotent)
///
/// Filtering follows `RUST_LOG`, falling back to `info`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
