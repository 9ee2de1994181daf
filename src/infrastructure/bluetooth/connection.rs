//! BLE Connection Module
//!
//! Owns the native GATT handle, the session state machine and the
//! single-flight continuation slots.

use crate::domain::error::{GattError, GattStatus, Result};
use crate::domain::models::{
    ConnectionStatus, Connected, Disconnected, OperationKind, Origin, Subscription, WriteOk,
};
use crate::infrastructure::bluetooth::events::EventEmitter;
use crate::infrastructure::bluetooth::native::{GattHandle, HandleId, RadioStack};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::resolver::{AttributeTable, CharacteristicRef};
use crate::infrastructure::bluetooth::subscription::DescriptorPolicy;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service resolved right after discovery
    pub target_service: Uuid,
    /// Characteristic resolved right after discovery
    pub target_characteristic: Uuid,
    /// Which CCCD value to write when a characteristic supports both modes
    pub descriptor_policy: DescriptorPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_service: protocol::DEFAULT_SERVICE,
            target_characteristic: protocol::DEFAULT_CHARACTERISTIC,
            descriptor_policy: DescriptorPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Discovering,
    Ready,
    Disconnecting,
    Disconnected,
}

// ----------------------------------------------------------------------------
// Continuations
// ----------------------------------------------------------------------------

/// Sending half of a pending request; consumed by exactly one outcome
pub struct Continuation<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Continuation<T> {
    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn reject(self, err: GattError) {
        self.complete(Err(err));
    }

    fn complete(self, outcome: Result<T>) {
        if self.tx.send(outcome).is_err() {
            debug!("Caller dropped its completion before the outcome arrived");
        }
    }
}

/// Caller's handle on an asynchronous outcome.
///
/// Resolves to `ConnectionLost` if the session goes away without answering.
#[must_use = "a completion reports the outcome of the operation"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn pair() -> (Continuation<T>, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        (Continuation { tx }, Completion { rx })
    }

    /// A completion that is already resolved
    pub fn ready(outcome: Result<T>) -> Self {
        let (continuation, completion) = Self::pair();
        continuation.complete(outcome);
        completion
    }

    /// Non-blocking peek. Returns `None` while the outcome is pending; an
    /// outcome can only be taken once.
    pub fn try_outcome(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(GattError::ConnectionLost)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(GattError::ConnectionLost)))
    }
}

/// One pending request per operation kind
pub enum Slot<T> {
    Empty,
    Occupied(Continuation<T>),
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::Empty
    }
}

impl<T> Slot<T> {
    pub fn is_occupied(&self) -> bool {
        matches!(self, Slot::Occupied(_))
    }

    /// Register a new continuation. Occupying a busy slot is an error, never
    /// an overwrite.
    pub fn occupy(&mut self, kind: OperationKind) -> Result<Completion<T>> {
        if self.is_occupied() {
            return Err(match kind {
                OperationKind::Write => GattError::WriteInProgress,
                other => GattError::OperationInProgress(other),
            });
        }
        let (continuation, completion) = Completion::pair();
        *self = Slot::Occupied(continuation);
        Ok(completion)
    }

    pub fn take(&mut self) -> Option<Continuation<T>> {
        match std::mem::take(self) {
            Slot::Occupied(continuation) => Some(continuation),
            Slot::Empty => None,
        }
    }

    fn reject(&mut self, err: GattError) -> bool {
        match self.take() {
            Some(continuation) => {
                continuation.reject(err);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
pub struct PendingSlots {
    pub connect: Slot<Connected>,
    pub disconnect: Slot<Disconnected>,
    pub subscribe: Slot<Subscription>,
    pub write: Slot<WriteOk>,
}

impl PendingSlots {
    pub fn is_occupied(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Connect => self.connect.is_occupied(),
            OperationKind::Disconnect => self.disconnect.is_occupied(),
            OperationKind::Subscribe => self.subscribe.is_occupied(),
            OperationKind::Write => self.write.is_occupied(),
        }
    }

    /// Reject every occupied slot; returns how many were rejected
    pub fn reject_all(&mut self, err: GattError) -> usize {
        [
            self.connect.reject(err.clone()),
            self.disconnect.reject(err.clone()),
            self.subscribe.reject(err.clone()),
            self.write.reject(err),
        ]
        .into_iter()
        .filter(|rejected| *rejected)
        .count()
    }
}

// ----------------------------------------------------------------------------
// Connection Session
// ----------------------------------------------------------------------------

/// The single live connection and its state machine
pub struct ConnectionSession {
    pub(crate) state: SessionState,
    pub(crate) handle_id: HandleId,
    pub(crate) handle: Option<GattHandle>,
    pub(crate) address: String,
    pub(crate) origin: Origin,
    pub(crate) attributes: AttributeTable,
    pub(crate) target: Option<CharacteristicRef>,
    pub(crate) pending: PendingSlots,
}

impl ConnectionSession {
    /// Start connecting to a validated address. The Connect slot is occupied
    /// only once the stack has accepted the request.
    pub fn open(stack: &dyn RadioStack, address: &str) -> Result<(Self, Completion<Connected>)> {
        info!("Connecting to BLE device: {}", address);

        let handle = stack.connect(address).map_err(|e| {
            error!("Failed to start connection to {}: {}", address, e);
            GattError::ConnectionFailed(e.to_string())
        })?;

        let mut session = Self {
            state: SessionState::Connecting,
            handle_id: handle.id(),
            handle: Some(handle),
            address: address.to_string(),
            origin: Origin::UserInitiated,
            attributes: AttributeTable::default(),
            target: None,
            pending: PendingSlots::default(),
        };
        let completion = session.pending.connect.occupy(OperationKind::Connect)?;
        Ok((session, completion))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {}: {:?} -> {:?}", self.address, self.state, next);
        self.state = next;
    }

    /// Handle for characteristic operations; only a Ready session has one
    pub(crate) fn ready_handle(&self) -> Result<&GattHandle> {
        match (self.state, self.handle.as_ref()) {
            (SessionState::Ready, Some(handle)) => Ok(handle),
            _ => Err(GattError::NotConnected),
        }
    }

    /// Begin a user-requested disconnect
    pub fn close(
        &mut self,
        stack: &dyn RadioStack,
        emitter: &EventEmitter,
    ) -> Result<Completion<Disconnected>> {
        let completion = self.pending.disconnect.occupy(OperationKind::Disconnect)?;
        info!("Disconnecting from {}", self.address);

        let refused = match self.handle.as_ref() {
            Some(handle) => stack.disconnect(handle).err(),
            None => None,
        };
        self.transition(SessionState::Disconnecting);

        if let Some(e) = refused {
            // The link will never report back; tear down locally.
            warn!("Native disconnect refused ({}), closing locally", e);
            self.on_link_down(stack, emitter, GattStatus::SUCCESS);
        }
        Ok(completion)
    }

    /// Re-run discovery on a Ready session
    pub fn refresh(&mut self, stack: &dyn RadioStack, emitter: &EventEmitter) -> Result<()> {
        self.ready_handle()?;
        self.start_discovery(stack, emitter);
        Ok(())
    }

    pub fn on_connected(&mut self, stack: &dyn RadioStack, emitter: &EventEmitter) {
        match self.state {
            SessionState::Connecting => {
                info!("Connected to {}", self.address);
                match self.pending.connect.take() {
                    Some(continuation) => continuation.resolve(Connected {
                        address: self.address.clone(),
                    }),
                    None => {
                        self.origin = Origin::PeripheralInitiated;
                        emitter.connection_status(
                            ConnectionStatus::Connected,
                            &self.address,
                            Origin::PeripheralInitiated,
                        );
                    }
                }
                self.start_discovery(stack, emitter);
            }
            _ if self.pending.connect.is_occupied() => {
                // Left for on_link_down to reject
                debug!(
                    "Connected callback for {} while {:?} with a connect pending",
                    self.address, self.state
                );
            }
            _ => {
                debug!(
                    "Connected callback for {} while {:?}, forwarding as event",
                    self.address, self.state
                );
                emitter.connection_status(
                    ConnectionStatus::Connected,
                    &self.address,
                    Origin::PeripheralInitiated,
                );
            }
        }
    }

    fn start_discovery(&mut self, stack: &dyn RadioStack, emitter: &EventEmitter) {
        self.transition(SessionState::Discovering);
        let started = match self.handle.as_ref() {
            Some(handle) => stack.discover_services(handle),
            None => return,
        };
        if let Err(e) = started {
            error!("Could not start service discovery: {}", e);
            self.on_services_discovered(stack, emitter, None, e.status);
        }
    }

    pub fn on_services_discovered(
        &mut self,
        stack: &dyn RadioStack,
        emitter: &EventEmitter,
        config: Option<&SessionConfig>,
        status: GattStatus,
    ) {
        if self.state != SessionState::Discovering {
            debug!("Ignoring discovery result while {:?}", self.state);
            return;
        }

        if status.is_success() {
            let services = match self.handle.as_ref() {
                Some(handle) => stack.services(handle),
                None => Vec::new(),
            };
            info!("Services discovered: {} services", services.len());
            self.attributes = AttributeTable::discovered(services);
            self.target = config.and_then(|c| {
                self.attributes
                    .resolve(c.target_service, c.target_characteristic)
                    .ok()
            });
            if self.target.is_some() {
                info!("Target characteristic found, ready for GATT operations");
            } else {
                warn!("Target characteristic not present on {}", self.address);
            }
            self.transition(SessionState::Ready);
            emitter.connection_status(
                ConnectionStatus::Ready {
                    target_found: self.target.is_some(),
                },
                &self.address,
                self.origin,
            );
        } else {
            error!("Service discovery failed: {}", status);
            self.attributes = AttributeTable::default();
            self.target = None;
            self.transition(SessionState::Ready);
            emitter.connection_status(ConnectionStatus::DiscoveryFailed, &self.address, self.origin);
        }
    }

    /// Link went down, requested or not. Always terminal.
    pub fn on_link_down(&mut self, stack: &dyn RadioStack, emitter: &EventEmitter, status: GattStatus) {
        info!("Disconnected from {} ({})", self.address, status);

        match self.state {
            SessionState::Connecting => match self.pending.connect.take() {
                Some(continuation) => continuation.reject(GattError::ConnectionFailed(format!(
                    "{} disconnected during connect ({})",
                    self.address, status
                ))),
                None => self.emit_unsolicited_disconnect(emitter),
            },
            SessionState::Disconnecting => match self.pending.disconnect.take() {
                Some(continuation) => continuation.resolve(Disconnected),
                None => self.emit_unsolicited_disconnect(emitter),
            },
            _ => self.emit_unsolicited_disconnect(emitter),
        }

        let lost = self.pending.reject_all(GattError::ConnectionLost);
        if lost > 0 {
            warn!("Rejected {} pending operation(s) with ConnectionLost", lost);
        }

        if let Some(handle) = self.handle.take() {
            stack.close(handle);
        }
        self.attributes = AttributeTable::default();
        self.target = None;
        self.transition(SessionState::Disconnected);
    }

    fn emit_unsolicited_disconnect(&self, emitter: &EventEmitter) {
        emitter.connection_status(
            ConnectionStatus::Disconnected,
            &self.address,
            Origin::PeripheralInitiated,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_refuses_second_occupant() {
        let mut slot: Slot<WriteOk> = Slot::default();
        let mut first = slot.occupy(OperationKind::Write).unwrap();
        assert!(matches!(
            slot.occupy(OperationKind::Write),
            Err(GattError::WriteInProgress)
        ));

        slot.take().unwrap().resolve(WriteOk);
        assert_eq!(first.try_outcome(), Some(Ok(WriteOk)));
        assert!(!slot.is_occupied());
    }

    #[test]
    fn test_busy_slot_reports_operation_kind() {
        let mut slot: Slot<Subscription> = Slot::default();
        let _pending = slot.occupy(OperationKind::Subscribe).unwrap();
        assert!(matches!(
            slot.occupy(OperationKind::Subscribe),
            Err(GattError::OperationInProgress(OperationKind::Subscribe))
        ));
    }

    #[test]
    fn test_reject_all_counts_occupied_slots() {
        let mut pending = PendingSlots::default();
        let mut sub = pending.subscribe.occupy(OperationKind::Subscribe).unwrap();
        let mut write = pending.write.occupy(OperationKind::Write).unwrap();

        assert_eq!(pending.reject_all(GattError::ConnectionLost), 2);
        assert_eq!(sub.try_outcome(), Some(Err(GattError::ConnectionLost)));
        assert_eq!(write.try_outcome(), Some(Err(GattError::ConnectionLost)));
        assert!(!pending.is_occupied(OperationKind::Subscribe));
        assert!(!pending.is_occupied(OperationKind::Write));
    }

    #[test]
    fn test_dropped_continuation_reads_as_connection_lost() {
        let mut slot: Slot<Connected> = Slot::default();
        let mut completion = slot.occupy(OperationKind::Connect).unwrap();
        assert_eq!(completion.try_outcome(), None);
        drop(slot);
        assert_eq!(completion.try_outcome(), Some(Err(GattError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_ready_completion_awaits_immediately() {
        let completion = Completion::ready(Ok(WriteOk));
        assert_eq!(completion.await, Ok(WriteOk));
    }
}
