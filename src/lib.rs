//! BLE GATT session manager.
//!
//! Correlates asynchronous radio-stack callbacks with outstanding client
//! requests for a single peripheral connection, and pushes everything that
//! has no matching request onto an event stream.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{GattError, GattStatus};
pub use domain::models::SessionEvent;
pub use infrastructure::bluetooth::BluetoothService;
