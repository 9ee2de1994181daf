//! Radio Stack Seam
//!
//! The platform BLE stack sits behind [`RadioStack`]. Every entry point only
//! *starts* a procedure; its outcome is posted later as a [`NativeEvent`] on
//! the channel created by [`native_channel`].

use crate::domain::error::GattStatus;
use crate::infrastructure::bluetooth::adapter::AdapterState;
use crate::infrastructure::bluetooth::protocol::properties;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one native GATT connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

/// Native GATT client handle.
///
/// Not `Clone`: the session owns it and gives it back through
/// [`RadioStack::close`], which consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct GattHandle {
    id: HandleId,
    address: String,
}

impl GattHandle {
    pub fn new(id: HandleId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// One discovered service with its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    /// Raw property bits, see [`properties`]
    pub properties: u8,
    pub descriptors: Vec<Uuid>,
}

impl CharacteristicInfo {
    pub fn supports_notify(&self) -> bool {
        self.properties & properties::NOTIFY != 0
    }

    pub fn supports_indicate(&self) -> bool {
        self.properties & properties::INDICATE != 0
    }

    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

/// The stack declined to start a procedure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} refused by radio stack ({status}): {reason}")]
pub struct NativeError {
    pub operation: &'static str,
    pub status: GattStatus,
    pub reason: String,
}

impl NativeError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            status: GattStatus::FAILURE,
            reason: reason.into(),
        }
    }

    pub fn with_status(mut self, status: GattStatus) -> Self {
        self.status = status;
        self
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Platform BLE central
pub trait RadioStack: Send + Sync {
    fn adapter_state(&self) -> AdapterState;

    fn start_scan(&self) -> NativeResult<()>;

    fn stop_scan(&self) -> NativeResult<()>;

    /// Open a GATT client towards `address`; completion arrives as
    /// [`NativeEvent::Connected`] or [`NativeEvent::ConnectFailed`]
    fn connect(&self, address: &str) -> NativeResult<GattHandle>;

    fn discover_services(&self, handle: &GattHandle) -> NativeResult<()>;

    /// Attribute table as of the last successful discovery
    fn services(&self, handle: &GattHandle) -> Vec<ServiceInfo>;

    /// Toggle local delivery of value changes; synchronous, no callback
    fn set_notification(
        &self,
        handle: &GattHandle,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> NativeResult<()>;

    fn write_descriptor(
        &self,
        handle: &GattHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> NativeResult<()>;

    fn write_characteristic(
        &self,
        handle: &GattHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> NativeResult<()>;

    fn disconnect(&self, handle: &GattHandle) -> NativeResult<()>;

    /// Release every native resource behind the handle
    fn close(&self, handle: GattHandle);
}

/// Outcomes reported by the radio stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    Connected {
        handle: HandleId,
    },
    ConnectFailed {
        handle: HandleId,
        status: GattStatus,
    },
    Disconnected {
        handle: HandleId,
        status: GattStatus,
    },
    ServicesDiscovered {
        handle: HandleId,
        status: GattStatus,
    },
    CharacteristicWrite {
        handle: HandleId,
        characteristic: Uuid,
        status: GattStatus,
    },
    DescriptorWrite {
        handle: HandleId,
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicChanged {
        handle: HandleId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ScanResult {
        name: Option<String>,
        address: Option<String>,
    },
    ScanFailed {
        code: i32,
    },
}

impl NativeEvent {
    /// Connection the event belongs to; `None` for adapter-level events
    pub fn handle(&self) -> Option<HandleId> {
        match self {
            Self::Connected { handle }
            | Self::ConnectFailed { handle, .. }
            | Self::Disconnected { handle, .. }
            | Self::ServicesDiscovered { handle, .. }
            | Self::CharacteristicWrite { handle, .. }
            | Self::DescriptorWrite { handle, .. }
            | Self::CharacteristicChanged { handle, .. } => Some(*handle),
            Self::ScanResult { .. } | Self::ScanFailed { .. } => None,
        }
    }
}

pub type NativeEventSender = mpsc::UnboundedSender<NativeEvent>;
pub type NativeEventReceiver = mpsc::UnboundedReceiver<NativeEvent>;

/// Single-consumer channel from the radio stack to the session
pub fn native_channel() -> (NativeEventSender, NativeEventReceiver) {
    mpsc::unbounded_channel()
}
