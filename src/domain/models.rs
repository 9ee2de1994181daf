use crate::domain::error::GattStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// Service discovery finished; `target_found` tells whether the configured
    /// service/characteristic pair is present
    Ready { target_found: bool },
    DiscoveryFailed,
    Disconnected,
}

/// Who caused the transition an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    UserInitiated,
    PeripheralInitiated,
}

/// Operations that can have a continuation outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Subscribe,
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::Subscribe => "Subscribe",
            Self::Write => "Write",
        };
        f.write_str(name)
    }
}

/// Events pushed to the external listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionStatusChanged {
        status: ConnectionStatus,
        address: String,
        origin: Origin,
    },
    CharacteristicChanged {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        origin: Origin,
    },
    DeviceFound(Device),
    ScanFailed {
        code: i32,
    },
    /// A native completion arrived while no request of that kind was pending
    OperationCompleted {
        kind: OperationKind,
        status: GattStatus,
        origin: Origin,
    },
}

// ----------------------------------------------------------------------------
// Operation outcomes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Subscribed,
    /// The characteristic has no configuration descriptor; the peripheral may
    /// still push values without it
    SubscribedWithoutDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsubscribed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOk;
