/// GATT model shared by the client and server sessions
///
/// This module provides the attribute-level vocabulary both roles speak: characteristic
/// handles and properties, the read/write modes a session may select, the discovered
/// service catalog, the active characteristic selection, and the service definition a
/// server publishes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use uuid::{uuid, Uuid};

use crate::config::ServiceIdentifiers;

/// Default primary service identifier
pub const GATT_SERVICE_UUID: Uuid = uuid!("5c3a0001-9f1e-4d2b-8a6c-2e7b41d0c9a5");

/// Default read (notify/indicate) characteristic identifier
pub const READ_CHARACTERISTIC_UUID: Uuid = uuid!("5c3a0002-9f1e-4d2b-8a6c-2e7b41d0c9a5");

/// Default write characteristic identifier
pub const WRITE_CHARACTERISTIC_UUID: Uuid = uuid!("5c3a0003-9f1e-4d2b-8a6c-2e7b41d0c9a5");

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CCCD_UUID: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// ATT MTU before any negotiation (leaves 20 bytes of payload)
pub const DEFAULT_MTU: u16 = 23;

/// Bytes of every ATT packet taken by the opcode and handle
pub const ATT_OVERHEAD_BYTES: usize = 3;

/// Attribute handle of a discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicHandle(pub u16);

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Address of a remote device, as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for DeviceAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Identifier the platform attaches to a server-side request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u32);

/// ATT status codes surfaced by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    RequestNotSupported,
    InvalidOffset,
    /// Any other ATT or stack-specific code
    Other(u8),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        *self == GattStatus::Success
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Other(code) => write!(f, "status 0x{:02X}", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// Characteristic property bits, as declared in the characteristic declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    /// True when every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How inbound data reaches this side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReadMode {
    #[default]
    None,
    /// Unacknowledged push
    Notify,
    /// Push acknowledged by the peer
    Indicate,
}

impl ReadMode {
    /// Property a characteristic must declare to support this mode
    pub fn property(self) -> Option<CharacteristicProperties> {
        match self {
            ReadMode::None => None,
            ReadMode::Notify => Some(CharacteristicProperties::NOTIFY),
            ReadMode::Indicate => Some(CharacteristicProperties::INDICATE),
        }
    }

    /// CCCD value that enables this mode on the peer
    pub fn cccd_value(self) -> Option<[u8; 2]> {
        match self {
            ReadMode::None => None,
            ReadMode::Notify => Some(ENABLE_NOTIFICATION_VALUE),
            ReadMode::Indicate => Some(ENABLE_INDICATION_VALUE),
        }
    }

    pub fn requires_confirmation(self) -> bool {
        self == ReadMode::Indicate
    }
}

/// How outbound data leaves the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WriteMode {
    #[default]
    None,
    Write,
    WriteNoResponse,
}

impl WriteMode {
    pub fn property(self) -> Option<CharacteristicProperties> {
        match self {
            WriteMode::None => None,
            WriteMode::Write => Some(CharacteristicProperties::WRITE),
            WriteMode::WriteNoResponse => Some(CharacteristicProperties::WRITE_NO_RESPONSE),
        }
    }
}

/// A characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    pub handle: CharacteristicHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl CharacteristicDescriptor {
    pub fn new(handle: CharacteristicHandle, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            handle,
            uuid,
            properties,
        }
    }

    pub fn supports_read_mode(&self, mode: ReadMode) -> bool {
        mode.property()
            .map_or(false, |property| self.properties.contains(property))
    }

    pub fn supports_write_mode(&self, mode: WriteMode) -> bool {
        mode.property()
            .map_or(false, |property| self.properties.contains(property))
    }

    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharacteristicProperties::READ)
    }
}

/// A service found during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn primary(uuid: Uuid, characteristics: Vec<CharacteristicDescriptor>) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics,
        }
    }
}

/// Services discovered on the connected peer, in discovery order
///
/// The catalog is only ever replaced as a whole; there is no way to add or remove a
/// single service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: Vec<ServiceDescriptor>,
}

impl ServiceCatalog {
    /// Build a catalog from a discovery result, dropping repeated services
    pub fn from_discovery(services: Vec<ServiceDescriptor>) -> Self {
        let mut unique: Vec<ServiceDescriptor> = Vec::with_capacity(services.len());
        for service in services {
            if !unique.contains(&service) {
                unique.push(service);
            }
        }
        Self { services: unique }
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn find_characteristic(&self, handle: CharacteristicHandle) -> Option<&CharacteristicDescriptor> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| characteristic.handle == handle)
    }
}

/// One side of the characteristic selection
///
/// The handle belongs to the catalog it was picked from and is dropped on disconnect;
/// the mode is sticky configuration and survives reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Binding<M> {
    pub handle: Option<CharacteristicHandle>,
    pub mode: M,
}

/// Read and write characteristics currently in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicSelection {
    pub read: Binding<ReadMode>,
    pub write: Binding<WriteMode>,
}

impl CharacteristicSelection {
    /// Active inbound characteristic, if one is bound with a usable mode
    pub fn active_read(&self) -> Option<(CharacteristicHandle, ReadMode)> {
        match (self.read.handle, self.read.mode) {
            (Some(_), ReadMode::None) => None,
            (Some(handle), mode) => Some((handle, mode)),
            (None, _) => None,
        }
    }

    /// Active outbound characteristic, if one is bound with a usable mode
    pub fn active_write(&self) -> Option<(CharacteristicHandle, WriteMode)> {
        match (self.write.handle, self.write.mode) {
            (Some(_), WriteMode::None) => None,
            (Some(handle), mode) => Some((handle, mode)),
            (None, _) => None,
        }
    }

    /// Forget the bound handles, keeping the chosen modes
    pub fn release_handles(&mut self) {
        self.read.handle = None;
        self.write.handle = None;
    }
}

/// Access permission of a locally published characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributePermission {
    Read,
    Write,
}

/// A characteristic this side publishes as a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permission: AttributePermission,
}

/// The primary service a server registers with its transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub read_characteristic: Option<LocalCharacteristic>,
    pub write_characteristic: Option<LocalCharacteristic>,
}

impl ServiceDefinition {
    /// Build the service for the requested modes
    ///
    /// Returns `None` when both modes are `None`: such a service would carry no
    /// characteristics at all.
    pub fn for_modes(ids: &ServiceIdentifiers, read_mode: ReadMode, write_mode: WriteMode) -> Option<Self> {
        let read_characteristic = read_mode.property().map(|properties| LocalCharacteristic {
            uuid: ids.read_characteristic,
            properties,
            permission: AttributePermission::Read,
        });
        let write_characteristic = write_mode.property().map(|properties| LocalCharacteristic {
            uuid: ids.write_characteristic,
            properties,
            permission: AttributePermission::Write,
        });

        if read_characteristic.is_none() && write_characteristic.is_none() {
            return None;
        }

        Some(Self {
            uuid: ids.service,
            read_characteristic,
            write_characteristic,
        })
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &LocalCharacteristic> {
        self.read_characteristic
            .iter()
            .chain(self.write_characteristic.iter())
    }
}
