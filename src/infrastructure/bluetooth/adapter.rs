//! Adapter Gate
//!
//! Checks radio presence and power state before an operation proceeds.

use crate::domain::error::{GattError, Result};
use crate::infrastructure::bluetooth::native::RadioStack;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// No Bluetooth LE radio on this host
    Absent,
    Disabled,
    Enabled,
}

/// Fail unless the radio is present and switched on
pub fn ensure_ready(stack: &dyn RadioStack) -> Result<()> {
    match stack.adapter_state() {
        AdapterState::Enabled => Ok(()),
        AdapterState::Disabled => {
            warn!("Bluetooth adapter is disabled");
            Err(GattError::RadioDisabled)
        }
        AdapterState::Absent => {
            warn!("Bluetooth LE adapter unavailable");
            Err(GattError::RadioUnavailable)
        }
    }
}
