//! Error taxonomy for session operations.

use crate::domain::models::OperationKind;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Native status codes
// ----------------------------------------------------------------------------

/// Status code reported by the radio stack for a GATT procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Catch-all stack error, typically seen on connection timeouts
    pub const ERROR: GattStatus = GattStatus(133);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {} ({:#X})", self.0, self.0)
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Broad category of a [`GattError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Precondition,
    Resolution,
    Capability,
    Transport,
    ConnectionLost,
}

/// Errors reported to the caller of a session operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Bluetooth adapter not available")]
    RadioUnavailable,

    #[error("Bluetooth adapter is disabled")]
    RadioDisabled,

    #[error("No active BLE connection")]
    NotConnected,

    #[error("A peripheral connection already exists")]
    AlreadyConnected,

    #[error("{0} operation already in progress")]
    OperationInProgress(OperationKind),

    #[error("A characteristic write is already in progress")]
    WriteInProgress,

    #[error("Invalid peripheral address: {0}")]
    InvalidAddress(String),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Characteristic {0} does not support notifications or indications")]
    Unsupported(Uuid),

    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("Failed to write descriptor: {0}")]
    DescriptorWriteFailed(GattStatus),

    #[error("Failed to write characteristic: {0}")]
    WriteFailed(GattStatus),

    #[error("Failed to start scan: code {0}")]
    ScanFailed(i32),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GattError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RadioUnavailable
            | Self::RadioDisabled
            | Self::NotConnected
            | Self::AlreadyConnected
            | Self::OperationInProgress(_)
            | Self::WriteInProgress
            | Self::InvalidAddress(_)
            | Self::InvalidUuid(_) => ErrorClass::Precondition,
            Self::ServiceNotFound(_) | Self::CharacteristicNotFound(_) => ErrorClass::Resolution,
            Self::Unsupported(_) => ErrorClass::Capability,
            Self::ConnectionFailed(_)
            | Self::DescriptorWriteFailed(_)
            | Self::WriteFailed(_)
            | Self::ScanFailed(_)
            | Self::Internal(_) => ErrorClass::Transport,
            Self::ConnectionLost => ErrorClass::ConnectionLost,
        }
    }

    /// True when the caller should ask the user to switch the radio on
    pub fn needs_enable_prompt(&self) -> bool {
        matches!(self, Self::RadioDisabled)
    }
}

pub type Result<T> = std::result::Result<T, GattError>;
