//! Subscription Manager
//!
//! Enables notify/indicate delivery for a characteristic and writes its
//! Client Characteristic Configuration Descriptor.

use crate::domain::error::{GattError, GattStatus, Result};
use crate::domain::models::{OperationKind, Origin, SessionEvent, Subscription, Unsubscribed};
use crate::infrastructure::bluetooth::connection::{Completion, ConnectionSession};
use crate::infrastructure::bluetooth::events::EventEmitter;
use crate::infrastructure::bluetooth::native::RadioStack;
use crate::infrastructure::bluetooth::protocol::{
    CCCD_UUID, ENABLE_BOTH_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::resolver::CharacteristicRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// CCCD value selection when subscribing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DescriptorPolicy {
    /// Indications when available, otherwise notifications
    #[default]
    PreferIndicate,
    /// Notifications when available, otherwise indications
    PreferNotify,
    /// Both flags when both are supported
    Both,
}

impl DescriptorPolicy {
    pub fn cccd_value(&self, reference: &CharacteristicRef) -> [u8; 2] {
        match (
            self,
            reference.supports_notify,
            reference.supports_indicate,
        ) {
            (DescriptorPolicy::Both, true, true) => ENABLE_BOTH_VALUE,
            (DescriptorPolicy::PreferNotify, true, _) => ENABLE_NOTIFICATION_VALUE,
            (_, _, true) => ENABLE_INDICATION_VALUE,
            _ => ENABLE_NOTIFICATION_VALUE,
        }
    }
}

/// Start a subscription. All checks run before the first native call.
pub fn subscribe(
    session: &mut ConnectionSession,
    stack: &dyn RadioStack,
    policy: DescriptorPolicy,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Completion<Subscription>> {
    let handle = session.ready_handle()?;
    let reference = session.attributes.resolve(service, characteristic)?;
    debug!(
        "Characteristic {} supports notify: {}, indicate: {}",
        characteristic, reference.supports_notify, reference.supports_indicate
    );

    if !reference.can_subscribe() {
        return Err(GattError::Unsupported(characteristic));
    }
    if session.pending.subscribe.is_occupied() {
        return Err(GattError::OperationInProgress(OperationKind::Subscribe));
    }

    if let Err(e) = stack.set_notification(handle, service, characteristic, true) {
        warn!("Enabling local notifications failed: {}", e);
    }

    if !reference.has_cccd {
        warn!(
            "CCCD descriptor not found on {}, proceeding without descriptor write",
            characteristic
        );
        return Ok(Completion::ready(Ok(Subscription::SubscribedWithoutDescriptor)));
    }

    let value = policy.cccd_value(&reference);
    if let Err(e) = stack.write_descriptor(handle, service, characteristic, CCCD_UUID, &value) {
        error!("Failed to start descriptor write: {}", e);
        let _ = stack.set_notification(handle, service, characteristic, false);
        return Err(GattError::DescriptorWriteFailed(e.status));
    }
    debug!("Started writing descriptor {:02X?}", value);

    session.pending.subscribe.occupy(OperationKind::Subscribe)
}

/// Stop local delivery. Completes synchronously and leaves the Subscribe
/// slot alone.
pub fn unsubscribe(
    session: &ConnectionSession,
    stack: &dyn RadioStack,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Unsubscribed> {
    let handle = session.ready_handle()?;
    session.attributes.resolve(service, characteristic)?;

    if let Err(e) = stack.set_notification(handle, service, characteristic, false) {
        warn!("Disabling local notifications failed: {}", e);
    }
    info!("Unsubscribed from {}", characteristic);
    Ok(Unsubscribed)
}

pub fn on_descriptor_write(
    session: &mut ConnectionSession,
    emitter: &EventEmitter,
    characteristic: Uuid,
    status: GattStatus,
) {
    match session.pending.subscribe.take() {
        Some(continuation) if status.is_success() => {
            info!("Subscribed to notifications on {}", characteristic);
            continuation.resolve(Subscription::Subscribed);
        }
        Some(continuation) => {
            error!("Failed to write descriptor for {}: {}", characteristic, status);
            continuation.reject(GattError::DescriptorWriteFailed(status));
        }
        None => {
            debug!("Descriptor write with no pending subscribe: {}", status);
            emitter.emit(SessionEvent::OperationCompleted {
                kind: OperationKind::Subscribe,
                status,
                origin: Origin::PeripheralInitiated,
            });
        }
    }
}
