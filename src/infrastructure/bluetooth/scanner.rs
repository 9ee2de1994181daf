//! BLE Scanner Module
//!
//! Handles Bluetooth LE peripheral discovery.

use crate::domain::error::{GattError, Result};
use crate::domain::models::{Device, SessionEvent};
use crate::infrastructure::bluetooth::adapter;
use crate::infrastructure::bluetooth::events::EventEmitter;
use crate::infrastructure::bluetooth::native::RadioStack;
use tracing::{debug, error, info, trace, warn};

/// BLE Scanner for discovering peripherals
#[derive(Debug, Default)]
pub struct BleScanner {
    scanning: bool,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new() -> Self {
        Self::default()
    }

    /// Start continuous discovery. Starting twice is a no-op.
    pub fn start(&mut self, stack: &dyn RadioStack) -> Result<()> {
        adapter::ensure_ready(stack)?;

        if self.scanning {
            debug!("Scan already running");
            return Ok(());
        }

        info!("Starting BLE scan...");
        stack.start_scan().map_err(|e| {
            error!("Failed to start BLE scan: {}", e);
            GattError::ScanFailed(e.status.0)
        })?;
        self.scanning = true;
        Ok(())
    }

    /// Stop scanning. Safe to call at any time.
    pub fn stop(&mut self, stack: &dyn RadioStack) {
        if self.scanning {
            info!("Stopping BLE scan...");
            if let Err(e) = stack.stop_scan() {
                warn!("Radio stack refused to stop scanning: {}", e);
            }
            self.scanning = false;
        }
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// One advertisement received; no de-duplication
    pub fn on_advertisement(
        &self,
        name: Option<String>,
        address: Option<String>,
        emitter: &EventEmitter,
    ) {
        if !self.scanning {
            trace!("Advertisement after scan stop ignored");
            return;
        }
        let Some(address) = address.filter(|a| !a.is_empty()) else {
            trace!("Advertisement without address ignored");
            return;
        };

        debug!(
            "BLE Device Found: {} - {}",
            name.as_deref().unwrap_or("Unknown"),
            address
        );
        emitter.device_found(Device { name, address });
    }

    pub fn on_scan_failed(&mut self, code: i32, emitter: &EventEmitter) {
        if !self.scanning {
            debug!("Scan failure ({}) reported while idle", code);
            return;
        }
        error!("BLE scan failed with code: {}", code);
        self.scanning = false;
        emitter.emit(SessionEvent::ScanFailed { code });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::adapter::AdapterState;
    use crate::infrastructure::bluetooth::fake::{FakeRadio, NativeCall};
    use tokio::sync::mpsc;

    #[test]
    fn test_start_is_idempotent() {
        let radio = FakeRadio::new();
        let mut scanner = BleScanner::new();
        scanner.start(&radio).unwrap();
        scanner.start(&radio).unwrap();
        assert_eq!(radio.calls(), vec![NativeCall::StartScan]);

        scanner.stop(&radio);
        scanner.stop(&radio);
        assert_eq!(radio.calls(), vec![NativeCall::StartScan, NativeCall::StopScan]);
    }

    #[test]
    fn test_disabled_radio_blocks_scan() {
        let radio = FakeRadio::new();
        radio.set_adapter_state(AdapterState::Disabled);
        let mut scanner = BleScanner::new();
        assert_eq!(scanner.start(&radio), Err(GattError::RadioDisabled));
        assert!(!scanner.is_scanning());
        assert!(radio.calls().is_empty());
    }

    #[test]
    fn test_advertisements_without_address_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new(tx);
        let radio = FakeRadio::new();
        let mut scanner = BleScanner::new();

        scanner.on_advertisement(None, Some("AA:BB:CC:DD:EE:FF".into()), &emitter);
        assert!(rx.try_recv().is_err());

        scanner.start(&radio).unwrap();
        scanner.on_advertisement(Some("Tag".into()), Some(String::new()), &emitter);
        scanner.on_advertisement(Some("Tag".into()), None, &emitter);
        assert!(rx.try_recv().is_err());

        scanner.on_advertisement(Some("Tag".into()), Some("AA:BB:CC:DD:EE:FF".into()), &emitter);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::DeviceFound(d)) if d.name.as_deref() == Some("Tag")));
    }

    #[test]
    fn test_scan_failure_stops_scanning() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new(tx);
        let radio = FakeRadio::new();
        let mut scanner = BleScanner::new();
        scanner.start(&radio).unwrap();

        scanner.on_scan_failed(2, &emitter);
        assert!(!scanner.is_scanning());
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::ScanFailed { code: 2 })));

        scanner.on_scan_failed(2, &emitter);
        assert!(rx.try_recv().is_err());
    }
}
