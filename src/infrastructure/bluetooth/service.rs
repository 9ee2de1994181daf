//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, the connection session and
//! characteristic operations. All session state lives behind one mutex;
//! commands take it on the caller's thread, native outcomes take it on the
//! dispatcher.

use crate::domain::error::{GattError, Result};
use crate::domain::models::{
    Connected, Disconnected, OperationKind, Origin, SessionEvent, Subscription, Unsubscribed,
    WriteOk,
};
use crate::domain::settings::SessionSettings;
use crate::infrastructure::bluetooth::{
    adapter,
    connection::{Completion, ConnectionSession, SessionConfig, SessionState},
    events::EventEmitter,
    native::{NativeEvent, NativeEventReceiver, RadioStack},
    protocol,
    scanner::BleScanner,
    subscription, writer,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    session: Option<ConnectionSession>,
    scanner: BleScanner,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    stack: Arc<dyn RadioStack>,
    config: SessionConfig,
    emitter: EventEmitter,
    inner: Mutex<Inner>,
}

impl BluetoothService {
    /// Create a new Bluetooth service
    pub fn new(
        stack: Arc<dyn RadioStack>,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
        config: SessionConfig,
    ) -> Self {
        Self {
            stack,
            config,
            emitter: EventEmitter::new(event_sender),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a service configured from persisted settings
    pub fn from_settings(
        stack: Arc<dyn RadioStack>,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
        settings: &SessionSettings,
    ) -> anyhow::Result<Self> {
        let config = settings.session_config()?;
        Ok(Self::new(stack, event_sender, config))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| GattError::Internal("session lock poisoned".to_string()))
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Start scanning for devices
    pub fn scan_start(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.scanner.start(self.stack.as_ref())
    }

    /// Stop scanning
    pub fn scan_stop(&self) {
        match self.lock() {
            Ok(mut inner) => inner.scanner.stop(self.stack.as_ref()),
            Err(e) => error!("Cannot stop scan: {}", e),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().map(|i| i.scanner.is_scanning()).unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect to a device by address
    pub fn connect(&self, address: &str) -> Result<Completion<Connected>> {
        let address = protocol::parse_address(address)?;
        let mut inner = self.lock()?;

        if inner.session.is_some() {
            return Err(GattError::AlreadyConnected);
        }
        adapter::ensure_ready(self.stack.as_ref())?;

        let (session, completion) = ConnectionSession::open(self.stack.as_ref(), &address)?;
        inner.session = Some(session);
        Ok(completion)
    }

    /// Connect to the last used (or first known) device from settings
    pub fn connect_known(&self, settings: &SessionSettings) -> Result<Completion<Connected>> {
        let address = settings
            .preferred_address()
            .ok_or_else(|| GattError::InvalidAddress("no known device".to_string()))?;
        info!("Connecting to known device {}", address);
        self.connect(address)
    }

    /// Disconnect from the current device
    pub fn disconnect(&self) -> Result<Completion<Disconnected>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let session = inner.session.as_mut().ok_or(GattError::NotConnected)?;

        let completion = session.close(self.stack.as_ref(), &self.emitter)?;
        if session.state() == SessionState::Disconnected {
            inner.session = None;
        }
        Ok(completion)
    }

    /// Re-run service discovery, e.g. after a failed discovery
    pub fn refresh_services(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let session = inner.session.as_mut().ok_or(GattError::NotConnected)?;
        session.refresh(self.stack.as_ref(), &self.emitter)
    }

    pub fn state(&self) -> SessionState {
        self.lock()
            .ok()
            .and_then(|i| i.session.as_ref().map(ConnectionSession::state))
            .unwrap_or(SessionState::Idle)
    }

    pub fn connected_address(&self) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|i| i.session.as_ref().map(|s| s.address().to_string()))
    }

    /// Whether a request of this kind is awaiting its native completion
    pub fn has_pending(&self, kind: OperationKind) -> bool {
        self.lock()
            .ok()
            .and_then(|i| i.session.as_ref().map(|s| s.pending.is_occupied(kind)))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Characteristic operations
    // ------------------------------------------------------------------------

    pub fn subscribe(&self, service: &str, characteristic: &str) -> Result<Completion<Subscription>> {
        let (service, characteristic) = parse_pair(service, characteristic)?;
        self.subscribe_uuid(service, characteristic)
    }

    /// Subscribe to the configured target characteristic
    pub fn subscribe_target(&self) -> Result<Completion<Subscription>> {
        self.subscribe_uuid(self.config.target_service, self.config.target_characteristic)
    }

    fn subscribe_uuid(&self, service: Uuid, characteristic: Uuid) -> Result<Completion<Subscription>> {
        let mut inner = self.lock()?;
        let session = inner.session.as_mut().ok_or(GattError::NotConnected)?;
        subscription::subscribe(
            session,
            self.stack.as_ref(),
            self.config.descriptor_policy,
            service,
            characteristic,
        )
    }

    pub fn unsubscribe(&self, service: &str, characteristic: &str) -> Result<Unsubscribed> {
        let (service, characteristic) = parse_pair(service, characteristic)?;
        let inner = self.lock()?;
        let session = inner.session.as_ref().ok_or(GattError::NotConnected)?;
        subscription::unsubscribe(session, self.stack.as_ref(), service, characteristic)
    }

    pub fn write(
        &self,
        service: &str,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<Completion<WriteOk>> {
        let (service, characteristic) = parse_pair(service, characteristic)?;
        let mut inner = self.lock()?;
        let session = inner.session.as_mut().ok_or(GattError::NotConnected)?;
        writer::write(session, self.stack.as_ref(), service, characteristic, payload)
    }

    // ------------------------------------------------------------------------
    // Native callback path
    // ------------------------------------------------------------------------

    /// Apply one outcome reported by the radio stack
    pub fn handle_native_event(&self, event: NativeEvent) {
        let mut guard = match self.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("Dropping {:?}: {}", event, e);
                return;
            }
        };
        let inner = &mut *guard;
        let stack = self.stack.as_ref();
        let emitter = &self.emitter;

        let event = match event {
            NativeEvent::ScanResult { name, address } => {
                inner.scanner.on_advertisement(name, address, emitter);
                return;
            }
            NativeEvent::ScanFailed { code } => {
                inner.scanner.on_scan_failed(code, emitter);
                return;
            }
            gatt => gatt,
        };

        let Some(session) = inner.session.as_mut() else {
            debug!("No session, dropping {:?}", event);
            return;
        };
        if event.handle() != Some(session.handle_id()) {
            debug!("Stale callback from {:?}, dropping", event.handle());
            return;
        }

        match event {
            NativeEvent::Connected { .. } => session.on_connected(stack, emitter),
            NativeEvent::ConnectFailed { status, .. } | NativeEvent::Disconnected { status, .. } => {
                session.on_link_down(stack, emitter, status)
            }
            NativeEvent::ServicesDiscovered { status, .. } => {
                session.on_services_discovered(stack, emitter, Some(&self.config), status)
            }
            NativeEvent::DescriptorWrite {
                characteristic,
                status,
                ..
            } => subscription::on_descriptor_write(session, emitter, characteristic, status),
            NativeEvent::CharacteristicWrite {
                characteristic,
                status,
                ..
            } => writer::on_characteristic_write(session, emitter, characteristic, status),
            NativeEvent::CharacteristicChanged {
                service,
                characteristic,
                value,
                ..
            } => {
                if value.is_empty() {
                    trace!("Empty notification from {} ignored", characteristic);
                } else {
                    debug!("Received notification: {} bytes", value.len());
                    emitter.emit(SessionEvent::CharacteristicChanged {
                        service,
                        characteristic,
                        value,
                        origin: Origin::PeripheralInitiated,
                    });
                }
            }
            NativeEvent::ScanResult { .. } | NativeEvent::ScanFailed { .. } => {}
        }

        if session.state() == SessionState::Disconnected {
            inner.session = None;
        }
    }

    /// Drain the native channel until every sender is gone
    pub async fn run_dispatcher(self: Arc<Self>, mut events: NativeEventReceiver) {
        debug!("Native event dispatcher started");
        while let Some(event) = events.recv().await {
            self.handle_native_event(event);
        }
        debug!("Native event dispatcher stopped");
    }

    pub fn spawn_dispatcher(self: &Arc<Self>, events: NativeEventReceiver) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_dispatcher(events))
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        let stack = Arc::clone(&self.stack);
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.scanner.stop(stack.as_ref());
        if let Some(mut session) = inner.session.take() {
            session.pending.reject_all(GattError::ConnectionLost);
            if let Some(handle) = session.handle.take() {
                if let Err(e) = stack.disconnect(&handle) {
                    warn!("Radio stack refused to disconnect on shutdown: {}", e);
                }
                stack.close(handle);
            }
        }
    }
}

fn parse_pair(service: &str, characteristic: &str) -> Result<(Uuid, Uuid)> {
    Ok((
        protocol::parse_uuid(service)?,
        protocol::parse_uuid(characteristic)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::GattStatus;
    use crate::domain::models::{ConnectionStatus, Device};
    use crate::infrastructure::bluetooth::adapter::AdapterState;
    use crate::infrastructure::bluetooth::fake::{FakeRadio, NativeCall};
    use crate::infrastructure::bluetooth::native::{
        native_channel, CharacteristicInfo, HandleId, ServiceInfo,
    };
    use crate::infrastructure::bluetooth::protocol::{
        properties, CCCD_UUID, DEFAULT_CHARACTERISTIC, DEFAULT_CHARACTERISTIC_UUID,
        DEFAULT_SERVICE, DEFAULT_SERVICE_UUID, ENABLE_INDICATION_VALUE,
    };

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
    const SVC: &str = DEFAULT_SERVICE_UUID;
    const CHR: &str = DEFAULT_CHARACTERISTIC_UUID;

    struct Harness {
        radio: Arc<FakeRadio>,
        service: BluetoothService,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    impl Harness {
        fn new(props: u8, with_cccd: bool) -> Self {
            let radio = Arc::new(FakeRadio::with_services(target_table(props, with_cccd)));
            let (tx, events) = mpsc::unbounded_channel();
            let stack: Arc<dyn RadioStack> = radio.clone();
            let service = BluetoothService::new(stack, tx, SessionConfig::default());
            Self {
                radio,
                service,
                events,
            }
        }

        fn notify(&self, event: NativeEvent) {
            self.service.handle_native_event(event);
        }

        fn drain(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Connect and discover; returns the handle of the session
        fn ready(&mut self) -> HandleId {
            let mut connected = self.service.connect(ADDRESS).unwrap();
            let handle = HandleId(1);
            self.notify(NativeEvent::Connected { handle });
            self.notify(NativeEvent::ServicesDiscovered {
                handle,
                status: GattStatus::SUCCESS,
            });
            assert_eq!(
                connected.try_outcome(),
                Some(Ok(Connected {
                    address: ADDRESS.to_string()
                }))
            );
            assert_eq!(self.service.state(), SessionState::Ready);
            self.drain();
            self.radio.clear_calls();
            handle
        }
    }

    fn target_table(props: u8, with_cccd: bool) -> Vec<ServiceInfo> {
        vec![ServiceInfo {
            uuid: DEFAULT_SERVICE,
            characteristics: vec![CharacteristicInfo {
                uuid: DEFAULT_CHARACTERISTIC,
                properties: props,
                descriptors: if with_cccd { vec![CCCD_UUID] } else { vec![] },
            }],
        }]
    }

    fn notifiable() -> Harness {
        Harness::new(
            properties::NOTIFY | properties::INDICATE | properties::WRITE,
            true,
        )
    }

    #[tokio::test]
    async fn test_connect_discover_subscribe() {
        let mut h = notifiable();
        let connected = h.service.connect(ADDRESS).unwrap();
        assert_eq!(h.service.state(), SessionState::Connecting);

        let handle = HandleId(1);
        h.notify(NativeEvent::Connected { handle });
        assert_eq!(
            connected.await,
            Ok(Connected {
                address: ADDRESS.to_string()
            })
        );
        assert_eq!(h.service.state(), SessionState::Discovering);

        h.notify(NativeEvent::ServicesDiscovered {
            handle,
            status: GattStatus::SUCCESS,
        });
        assert_eq!(
            h.drain(),
            vec![SessionEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Ready { target_found: true },
                address: ADDRESS.to_string(),
                origin: Origin::UserInitiated,
            }]
        );

        let subscribed = h.service.subscribe(SVC, CHR).unwrap();
        assert!(h.radio.calls().contains(&NativeCall::WriteDescriptor {
            characteristic: DEFAULT_CHARACTERISTIC,
            descriptor: CCCD_UUID,
            value: ENABLE_INDICATION_VALUE.to_vec(),
        }));

        h.notify(NativeEvent::DescriptorWrite {
            handle,
            characteristic: DEFAULT_CHARACTERISTIC,
            descriptor: CCCD_UUID,
            status: GattStatus::SUCCESS,
        });
        assert_eq!(subscribed.await, Ok(Subscription::Subscribed));
        assert!(!h.service.has_pending(OperationKind::Subscribe));
    }

    #[test]
    fn test_scan_emits_devices_in_order_until_stopped() {
        let mut h = notifiable();
        h.service.scan_start().unwrap();
        assert!(h.service.is_scanning());

        for address in ["11:22:33:44:55:66", "77:88:99:AA:BB:CC"] {
            h.notify(NativeEvent::ScanResult {
                name: None,
                address: Some(address.to_string()),
            });
        }
        h.notify(NativeEvent::ScanResult {
            name: Some("nameless".to_string()),
            address: None,
        });
        assert_eq!(
            h.drain(),
            vec![
                SessionEvent::DeviceFound(Device {
                    name: None,
                    address: "11:22:33:44:55:66".to_string(),
                }),
                SessionEvent::DeviceFound(Device {
                    name: None,
                    address: "77:88:99:AA:BB:CC".to_string(),
                }),
            ]
        );

        h.service.scan_stop();
        h.service.scan_stop();
        h.notify(NativeEvent::ScanResult {
            name: Some("late".to_string()),
            address: Some("11:22:33:44:55:66".to_string()),
        });
        assert!(h.drain().is_empty());
        assert_eq!(
            h.radio.calls(),
            vec![NativeCall::StartScan, NativeCall::StopScan]
        );
    }

    #[test]
    fn test_unsubscribe_without_session_touches_nothing() {
        let h = notifiable();
        assert_eq!(
            h.service.unsubscribe(SVC, CHR),
            Err(GattError::NotConnected)
        );
        assert!(h.radio.calls().is_empty());
    }

    #[test]
    fn test_connect_while_connecting_keeps_first_continuation() {
        let h = notifiable();
        let mut first = h.service.connect(ADDRESS).unwrap();

        assert!(matches!(
            h.service.connect(ADDRESS),
            Err(GattError::AlreadyConnected)
        ));
        assert!(matches!(
            h.service.connect("11:22:33:44:55:66"),
            Err(GattError::AlreadyConnected)
        ));
        assert_eq!(first.try_outcome(), None);

        h.notify(NativeEvent::Connected {
            handle: HandleId(1),
        });
        assert!(matches!(first.try_outcome(), Some(Ok(_))));
        assert_eq!(
            h.radio.calls(),
            vec![
                NativeCall::Connect(ADDRESS.to_string()),
                NativeCall::DiscoverServices(HandleId(1)),
            ]
        );
    }

    #[test]
    fn test_unsolicited_disconnect_rejects_pending_operations() {
        let mut h = notifiable();
        let handle = h.ready();

        let mut subscribed = h.service.subscribe(SVC, CHR).unwrap();
        let mut written = h.service.write(SVC, CHR, b"ping").unwrap();

        h.notify(NativeEvent::Disconnected {
            handle,
            status: GattStatus::ERROR,
        });

        assert_eq!(subscribed.try_outcome(), Some(Err(GattError::ConnectionLost)));
        assert_eq!(written.try_outcome(), Some(Err(GattError::ConnectionLost)));
        assert_eq!(
            h.drain(),
            vec![SessionEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Disconnected,
                address: ADDRESS.to_string(),
                origin: Origin::PeripheralInitiated,
            }]
        );
        let closes = h
            .radio
            .calls()
            .into_iter()
            .filter(|c| matches!(c, NativeCall::Close(_)))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(h.service.state(), SessionState::Idle);
        assert_eq!(h.service.connected_address(), None);
    }

    #[test]
    fn test_subscribe_unsupported_issues_no_native_call() {
        let mut h = Harness::new(properties::READ | properties::WRITE, true);
        h.ready();
        assert_eq!(
            h.service.subscribe(SVC, CHR).err(),
            Some(GattError::Unsupported(DEFAULT_CHARACTERISTIC))
        );
        assert!(h.radio.calls().is_empty());
    }

    #[test]
    fn test_second_write_is_refused_while_first_in_flight() {
        let mut h = notifiable();
        let handle = h.ready();

        let mut first = h.service.write(SVC, CHR, b"one").unwrap();
        assert!(matches!(
            h.service.write(SVC, CHR, b"two"),
            Err(GattError::WriteInProgress)
        ));
        assert_eq!(first.try_outcome(), None);

        h.notify(NativeEvent::CharacteristicWrite {
            handle,
            characteristic: DEFAULT_CHARACTERISTIC,
            status: GattStatus::SUCCESS,
        });
        assert_eq!(first.try_outcome(), Some(Ok(WriteOk)));

        let mut third = h.service.write(SVC, CHR, b"three").unwrap();
        h.notify(NativeEvent::CharacteristicWrite {
            handle,
            characteristic: DEFAULT_CHARACTERISTIC,
            status: GattStatus::FAILURE,
        });
        assert_eq!(
            third.try_outcome(),
            Some(Err(GattError::WriteFailed(GattStatus::FAILURE)))
        );
        assert_eq!(
            h.radio
                .calls()
                .iter()
                .filter(|c| matches!(c, NativeCall::WriteCharacteristic { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_connect_failure_releases_handle_and_allows_retry() {
        let h = notifiable();
        let mut pending = h.service.connect(ADDRESS).unwrap();
        h.notify(NativeEvent::ConnectFailed {
            handle: HandleId(1),
            status: GattStatus::ERROR,
        });

        assert!(matches!(
            pending.try_outcome(),
            Some(Err(GattError::ConnectionFailed(_)))
        ));
        assert_eq!(h.service.state(), SessionState::Idle);
        assert!(h.radio.calls().contains(&NativeCall::Close(HandleId(1))));

        let _retry = h.service.connect(ADDRESS).unwrap();
        assert_eq!(h.service.state(), SessionState::Connecting);
        assert!(h.service.has_pending(OperationKind::Connect));
    }

    #[test]
    fn test_user_disconnect_resolves_and_fails_leftovers() {
        let mut h = notifiable();
        let handle = h.ready();
        let mut written = h.service.write(SVC, CHR, b"bye").unwrap();

        let mut disconnected = h.service.disconnect().unwrap();
        assert_eq!(h.service.state(), SessionState::Disconnecting);
        assert!(matches!(
            h.service.disconnect(),
            Err(GattError::OperationInProgress(OperationKind::Disconnect))
        ));
        assert!(matches!(
            h.service.write(SVC, CHR, b"late"),
            Err(GattError::NotConnected)
        ));

        h.notify(NativeEvent::Disconnected {
            handle,
            status: GattStatus::SUCCESS,
        });
        assert_eq!(disconnected.try_outcome(), Some(Ok(Disconnected)));
        assert_eq!(written.try_outcome(), Some(Err(GattError::ConnectionLost)));
        assert!(h.drain().is_empty());
        assert_eq!(
            h.radio.calls(),
            vec![
                NativeCall::WriteCharacteristic {
                    characteristic: DEFAULT_CHARACTERISTIC,
                    value: b"bye".to_vec(),
                },
                NativeCall::Disconnect(handle),
                NativeCall::Close(handle),
            ]
        );
    }

    #[test]
    fn test_disconnect_without_session() {
        let h = notifiable();
        assert!(matches!(
            h.service.disconnect(),
            Err(GattError::NotConnected)
        ));
    }

    #[test]
    fn test_refused_native_disconnect_tears_down_locally() {
        let mut h = notifiable();
        h.ready();
        h.radio.refuse("disconnect");

        let mut disconnected = h.service.disconnect().unwrap();
        assert_eq!(disconnected.try_outcome(), Some(Ok(Disconnected)));
        assert_eq!(h.service.state(), SessionState::Idle);
        assert_eq!(h.radio.calls(), vec![NativeCall::Close(HandleId(1))]);
    }

    #[test]
    fn test_failed_discovery_degrades_until_refresh() {
        let mut h = notifiable();
        let _connected = h.service.connect(ADDRESS).unwrap();
        let handle = HandleId(1);
        h.notify(NativeEvent::Connected { handle });
        h.notify(NativeEvent::ServicesDiscovered {
            handle,
            status: GattStatus::FAILURE,
        });

        assert_eq!(h.service.state(), SessionState::Ready);
        assert_eq!(
            h.drain(),
            vec![SessionEvent::ConnectionStatusChanged {
                status: ConnectionStatus::DiscoveryFailed,
                address: ADDRESS.to_string(),
                origin: Origin::UserInitiated,
            }]
        );
        assert_eq!(
            h.service.subscribe(SVC, CHR).err(),
            Some(GattError::CharacteristicNotFound(DEFAULT_CHARACTERISTIC))
        );

        h.service.refresh_services().unwrap();
        assert_eq!(h.service.state(), SessionState::Discovering);
        h.notify(NativeEvent::ServicesDiscovered {
            handle,
            status: GattStatus::SUCCESS,
        });
        assert!(h.service.subscribe(SVC, CHR).is_ok());
    }

    #[test]
    fn test_missing_cccd_subscribes_without_descriptor_write() {
        let mut h = Harness::new(properties::NOTIFY, false);
        h.ready();

        let mut subscribed = h.service.subscribe(SVC, CHR).unwrap();
        assert_eq!(
            subscribed.try_outcome(),
            Some(Ok(Subscription::SubscribedWithoutDescriptor))
        );
        assert_eq!(
            h.radio.calls(),
            vec![NativeCall::SetNotification {
                characteristic: DEFAULT_CHARACTERISTIC,
                enable: true,
            }]
        );
        assert!(!h.service.has_pending(OperationKind::Subscribe));
    }

    #[test]
    fn test_descriptor_write_failure_and_busy_subscribe() {
        let mut h = notifiable();
        let handle = h.ready();

        let mut subscribed = h.service.subscribe(SVC, CHR).unwrap();
        assert!(matches!(
            h.service.subscribe(SVC, CHR),
            Err(GattError::OperationInProgress(OperationKind::Subscribe))
        ));

        h.notify(NativeEvent::DescriptorWrite {
            handle,
            characteristic: DEFAULT_CHARACTERISTIC,
            descriptor: CCCD_UUID,
            status: GattStatus::ERROR,
        });
        assert_eq!(
            subscribed.try_outcome(),
            Some(Err(GattError::DescriptorWriteFailed(GattStatus::ERROR)))
        );
    }

    #[test]
    fn test_resolution_errors() {
        let mut h = notifiable();
        h.ready();
        let unknown = "0000180f-0000-1000-8000-00805f9b34fb";

        assert!(matches!(
            h.service.write(unknown, CHR, b"x"),
            Err(GattError::ServiceNotFound(_))
        ));
        assert!(matches!(
            h.service.unsubscribe(SVC, unknown),
            Err(GattError::CharacteristicNotFound(_))
        ));
        assert!(matches!(
            h.service.subscribe("not-a-uuid", CHR),
            Err(GattError::InvalidUuid(_))
        ));
        assert!(h.service.unsubscribe(&SVC.to_uppercase(), CHR).is_ok());
    }

    #[test]
    fn test_operations_before_ready_report_not_connected() {
        let h = notifiable();
        let _connected = h.service.connect(ADDRESS).unwrap();
        assert!(matches!(
            h.service.write(SVC, CHR, b"x"),
            Err(GattError::NotConnected)
        ));
        assert!(matches!(
            h.service.subscribe(SVC, CHR),
            Err(GattError::NotConnected)
        ));
    }

    #[test]
    fn test_notifications_and_stale_callbacks() {
        let mut h = notifiable();
        let handle = h.ready();

        h.notify(NativeEvent::CharacteristicChanged {
            handle,
            service: DEFAULT_SERVICE,
            characteristic: DEFAULT_CHARACTERISTIC,
            value: b"42".to_vec(),
        });
        h.notify(NativeEvent::CharacteristicChanged {
            handle,
            service: DEFAULT_SERVICE,
            characteristic: DEFAULT_CHARACTERISTIC,
            value: Vec::new(),
        });
        h.notify(NativeEvent::CharacteristicChanged {
            handle: HandleId(99),
            service: DEFAULT_SERVICE,
            characteristic: DEFAULT_CHARACTERISTIC,
            value: b"stale".to_vec(),
        });
        h.notify(NativeEvent::Disconnected {
            handle: HandleId(99),
            status: GattStatus::SUCCESS,
        });

        assert_eq!(
            h.drain(),
            vec![SessionEvent::CharacteristicChanged {
                service: DEFAULT_SERVICE,
                characteristic: DEFAULT_CHARACTERISTIC,
                value: b"42".to_vec(),
                origin: Origin::PeripheralInitiated,
            }]
        );
        assert_eq!(h.service.state(), SessionState::Ready);
    }

    #[test]
    fn test_unmatched_completions_become_events() {
        let mut h = notifiable();
        let handle = h.ready();

        h.notify(NativeEvent::CharacteristicWrite {
            handle,
            characteristic: DEFAULT_CHARACTERISTIC,
            status: GattStatus::SUCCESS,
        });
        h.notify(NativeEvent::Connected { handle });

        assert_eq!(
            h.drain(),
            vec![
                SessionEvent::OperationCompleted {
                    kind: OperationKind::Write,
                    status: GattStatus::SUCCESS,
                    origin: Origin::PeripheralInitiated,
                },
                SessionEvent::ConnectionStatusChanged {
                    status: ConnectionStatus::Connected,
                    address: ADDRESS.to_string(),
                    origin: Origin::PeripheralInitiated,
                },
            ]
        );
    }

    #[test]
    fn test_adapter_gate_blocks_before_native_calls() {
        let h = notifiable();
        h.radio.set_adapter_state(AdapterState::Disabled);
        let err = h.service.scan_start().unwrap_err();
        assert!(err.needs_enable_prompt());

        h.radio.set_adapter_state(AdapterState::Absent);
        assert!(matches!(
            h.service.connect(ADDRESS),
            Err(GattError::RadioUnavailable)
        ));
        assert!(matches!(
            h.service.connect("not an address"),
            Err(GattError::InvalidAddress(_))
        ));
        assert!(h.radio.calls().is_empty());
        assert!(!h.service.is_scanning());
    }

    #[test]
    fn test_scan_failure_event() {
        let mut h = notifiable();
        h.service.scan_start().unwrap();
        h.notify(NativeEvent::ScanFailed { code: 2 });
        assert_eq!(h.drain(), vec![SessionEvent::ScanFailed { code: 2 }]);
        assert!(!h.service.is_scanning());
    }

    #[test]
    fn test_connect_known_uses_settings() {
        let h = notifiable();
        let mut settings = SessionSettings::default();
        assert!(matches!(
            h.service.connect_known(&settings),
            Err(GattError::InvalidAddress(_))
        ));

        settings.known_addresses.push("aa:bb:cc:dd:ee:ff".to_string());
        let _pending = h.service.connect_known(&settings).unwrap();
        assert_eq!(h.service.connected_address().as_deref(), Some(ADDRESS));
    }

    #[test]
    fn test_drop_releases_live_handle() {
        let h = notifiable();
        let mut pending = h.service.connect(ADDRESS).unwrap();
        let radio = Arc::clone(&h.radio);
        drop(h);

        assert_eq!(pending.try_outcome(), Some(Err(GattError::ConnectionLost)));
        assert!(radio.calls().contains(&NativeCall::Close(HandleId(1))));
    }

    #[test]
    fn test_drop_closes_handle_when_disconnect_refused() {
        let mut h = notifiable();
        h.ready();
        h.radio.refuse("disconnect");
        let radio = Arc::clone(&h.radio);
        drop(h);

        assert_eq!(radio.calls(), vec![NativeCall::Close(HandleId(1))]);
    }

    #[test]
    fn test_disconnect_while_connecting() {
        let mut h = notifiable();
        let mut connected = h.service.connect(ADDRESS).unwrap();
        let mut disconnected = h.service.disconnect().unwrap();
        assert_eq!(h.service.state(), SessionState::Disconnecting);
        assert!(h.radio.calls().contains(&NativeCall::Disconnect(HandleId(1))));

        // Link finishes opening before the teardown is reported
        let handle = HandleId(1);
        h.notify(NativeEvent::Connected { handle });
        assert_eq!(connected.try_outcome(), None);
        assert!(h.drain().is_empty());

        h.notify(NativeEvent::Disconnected {
            handle,
            status: GattStatus::SUCCESS,
        });
        assert_eq!(connected.try_outcome(), Some(Err(GattError::ConnectionLost)));
        assert_eq!(disconnected.try_outcome(), Some(Ok(Disconnected)));
        assert!(h.drain().is_empty());

        let closes = h
            .radio
            .calls()
            .into_iter()
            .filter(|call| matches!(call, NativeCall::Close(_)))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(h.service.state(), SessionState::Idle);
        assert!(h.service.connected_address().is_none());
    }

    #[test]
    fn test_unsolicited_connected_without_pending_connect_is_an_event() {
        let mut h = notifiable();
        let handle = h.ready();

        h.notify(NativeEvent::Connected { handle });
        assert_eq!(
            h.drain(),
            vec![SessionEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Connected,
                address: ADDRESS.to_string(),
                origin: Origin::PeripheralInitiated,
            }]
        );
    }

    #[tokio::test]
    async fn test_dispatcher_drains_native_channel() {
        let radio = Arc::new(FakeRadio::with_services(target_table(
            properties::NOTIFY | properties::WRITE,
            true,
        )));
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let stack: Arc<dyn RadioStack> = radio.clone();
        let service = Arc::new(BluetoothService::new(
            stack,
            event_tx,
            SessionConfig::default(),
        ));
        let (native_tx, native_rx) = native_channel();
        let dispatcher = service.spawn_dispatcher(native_rx);

        let connected = service.connect(ADDRESS).unwrap();
        let handle = HandleId(1);
        native_tx.send(NativeEvent::Connected { handle }).unwrap();
        native_tx
            .send(NativeEvent::ServicesDiscovered {
                handle,
                status: GattStatus::SUCCESS,
            })
            .unwrap();
        assert!(connected.await.is_ok());
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Ready { target_found: true },
                address: ADDRESS.to_string(),
                origin: Origin::UserInitiated,
            })
        );

        drop(native_tx);
        dispatcher.await.unwrap();
    }
}
