//! Event Emitter
//!
//! Pushes session events to the external listener.

use crate::domain::models::{ConnectionStatus, Device, Origin, SessionEvent};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct EventEmitter {
    event_sender: mpsc::UnboundedSender<SessionEvent>,
}

impl EventEmitter {
    pub fn new(event_sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { event_sender }
    }

    pub fn emit(&self, event: SessionEvent) {
        trace!("Emitting {:?}", event);
        if self.event_sender.send(event).is_err() {
            debug!("Event listener dropped, event discarded");
        }
    }

    pub fn connection_status(&self, status: ConnectionStatus, address: &str, origin: Origin) {
        self.emit(SessionEvent::ConnectionStatusChanged {
            status,
            address: address.to_string(),
            origin,
        });
    }

    pub fn device_found(&self, device: Device) {
        self.emit(SessionEvent::DeviceFound(device));
    }
}
