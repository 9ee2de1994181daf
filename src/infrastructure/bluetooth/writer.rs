//! Write Coordinator
//!
//! At most one characteristic write is in flight; a second one is refused
//! rather than queued.

use crate::domain::error::{GattError, GattStatus, Result};
use crate::domain::models::{OperationKind, Origin, SessionEvent, WriteOk};
use crate::infrastructure::bluetooth::connection::{Completion, ConnectionSession};
use crate::infrastructure::bluetooth::events::EventEmitter;
use crate::infrastructure::bluetooth::native::RadioStack;
use tracing::{debug, error};
use uuid::Uuid;

pub fn write(
    session: &mut ConnectionSession,
    stack: &dyn RadioStack,
    service: Uuid,
    characteristic: Uuid,
    payload: &[u8],
) -> Result<Completion<WriteOk>> {
    let handle = session.ready_handle()?;
    session.attributes.resolve(service, characteristic)?;

    if session.pending.write.is_occupied() {
        return Err(GattError::WriteInProgress);
    }

    stack
        .write_characteristic(handle, service, characteristic, payload)
        .map_err(|e| {
            error!("Failed to start write to {}: {}", characteristic, e);
            GattError::WriteFailed(e.status)
        })?;
    debug!("Writing {} bytes to {}", payload.len(), characteristic);

    session.pending.write.occupy(OperationKind::Write)
}

pub fn on_characteristic_write(
    session: &mut ConnectionSession,
    emitter: &EventEmitter,
    characteristic: Uuid,
    status: GattStatus,
) {
    match session.pending.write.take() {
        Some(continuation) if status.is_success() => {
            debug!("Write to {} acknowledged", characteristic);
            continuation.resolve(WriteOk);
        }
        Some(continuation) => {
            error!("Write to {} failed: {}", characteristic, status);
            continuation.reject(GattError::WriteFailed(status));
        }
        None => {
            debug!("Write completion with no pending write: {}", status);
            emitter.emit(SessionEvent::OperationCompleted {
                kind: OperationKind::Write,
                status,
                origin: Origin::PeripheralInitiated,
            });
        }
    }
}
