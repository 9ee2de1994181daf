//! Windows Radio Stack
//!
//! [`RadioStack`] on top of the WinRT Bluetooth LE APIs. Every procedure is
//! started on the tokio runtime and reports back through the native channel.

use crate::domain::error::GattStatus;
use crate::infrastructure::bluetooth::adapter::AdapterState;
use crate::infrastructure::bluetooth::native::{
    CharacteristicInfo, GattHandle, HandleId, NativeError, NativeEvent, NativeEventSender,
    NativeResult, RadioStack, ServiceInfo,
};
use crate::infrastructure::bluetooth::protocol::{self, CCCD_UUID};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothAdapter, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Devices::Radios::RadioState;
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

type CharacteristicKey = (Uuid, Uuid);

#[derive(Default)]
struct Link {
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    table: Vec<ServiceInfo>,
    characteristics: HashMap<CharacteristicKey, GattCharacteristic>,
    value_tokens: HashMap<CharacteristicKey, i64>,
}

#[derive(Default)]
struct WinState {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    links: HashMap<HandleId, Link>,
    next_id: u64,
}

pub struct WinRtRadio {
    events: NativeEventSender,
    runtime: Handle,
    adapter: AdapterState,
    state: Arc<Mutex<WinState>>,
}

fn lock(state: &Mutex<WinState>) -> MutexGuard<'_, WinState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn refused(operation: &'static str) -> impl Fn(windows::core::Error) -> NativeError {
    move |e| NativeError::new(operation, e.to_string())
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn status_from(status: GattCommunicationStatus) -> GattStatus {
    if status == GattCommunicationStatus::Success {
        GattStatus::SUCCESS
    } else if status == GattCommunicationStatus::Unreachable {
        GattStatus::ERROR
    } else if status == GattCommunicationStatus::AccessDenied {
        // Insufficient authentication
        GattStatus(0x05)
    } else {
        GattStatus::FAILURE
    }
}

fn error_status(e: windows::core::Error) -> GattStatus {
    warn!("WinRT call failed: {}", e);
    GattStatus::ERROR
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

impl WinRtRadio {
    /// Must be called from within a tokio runtime
    pub async fn new(events: NativeEventSender) -> Self {
        let adapter = Self::query_adapter().await;
        info!("Bluetooth adapter state: {:?}", adapter);
        Self {
            events,
            runtime: Handle::current(),
            adapter,
            state: Arc::new(Mutex::new(WinState::default())),
        }
    }

    async fn query_adapter() -> AdapterState {
        let adapter = match BluetoothAdapter::GetDefaultAsync() {
            Ok(op) => match op.await {
                Ok(adapter) => adapter,
                Err(_) => return AdapterState::Absent,
            },
            Err(_) => return AdapterState::Absent,
        };
        if !adapter.IsLowEnergySupported().unwrap_or(false) {
            return AdapterState::Absent;
        }
        let radio = match adapter.GetRadioAsync() {
            Ok(op) => op.await,
            Err(e) => Err(e),
        };
        match radio.and_then(|r| r.State()) {
            Ok(state) if state == RadioState::On => AdapterState::Enabled,
            Ok(_) => AdapterState::Disabled,
            Err(_) => AdapterState::Absent,
        }
    }

    async fn open_link(
        raw_address: u64,
        id: HandleId,
        state: Arc<Mutex<WinState>>,
        sender: NativeEventSender,
    ) -> windows::core::Result<()> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(raw_address)?.await?;

        let status_sender = sender.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = status_sender.send(NativeEvent::Disconnected {
                            handle: id,
                            status: GattStatus::ERROR,
                        });
                    }
                }
                Ok(())
            });
        device.ConnectionStatusChanged(&status_handler)?;

        // A GattSession with MaintainConnection is what actually opens the link
        let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
        session.SetMaintainConnection(true)?;

        let mut guard = lock(&state);
        match guard.links.get_mut(&id) {
            Some(link) => {
                link.device = Some(device);
                link.session = Some(session);
            }
            None => {
                debug!("Link {:?} closed while opening", id);
                let _ = session.Close();
                let _ = device.Close();
            }
        }
        Ok(())
    }

    async fn read_table(
        device: BluetoothLEDevice,
    ) -> Result<(Vec<ServiceInfo>, HashMap<CharacteristicKey, GattCharacteristic>), GattStatus> {
        let result = device
            .GetGattServicesAsync()
            .map_err(error_status)?
            .await
            .map_err(error_status)?;
        let status = status_from(result.Status().map_err(error_status)?);
        if !status.is_success() {
            return Err(status);
        }

        let mut table = Vec::new();
        let mut handles = HashMap::new();
        let services = result.Services().map_err(error_status)?;
        for i in 0..services.Size().map_err(error_status)? {
            let service = services.GetAt(i).map_err(error_status)?;
            let service_uuid = to_uuid(service.Uuid().map_err(error_status)?);

            let chars_result = service
                .GetCharacteristicsAsync()
                .map_err(error_status)?
                .await
                .map_err(error_status)?;
            let characteristics = chars_result.Characteristics().map_err(error_status)?;

            let mut infos = Vec::new();
            for j in 0..characteristics.Size().map_err(error_status)? {
                let c = characteristics.GetAt(j).map_err(error_status)?;
                let char_uuid = to_uuid(c.Uuid().map_err(error_status)?);
                let properties = c.CharacteristicProperties().map_err(error_status)?;

                let mut descriptors = Vec::new();
                if let Ok(op) = c.GetDescriptorsAsync() {
                    if let Ok(found) = op.await.and_then(|r| r.Descriptors()) {
                        for k in 0..found.Size().unwrap_or(0) {
                            if let Ok(d) = found.GetAt(k) {
                                if let Ok(uuid) = d.Uuid() {
                                    descriptors.push(to_uuid(uuid));
                                }
                            }
                        }
                    }
                }

                infos.push(CharacteristicInfo {
                    uuid: char_uuid,
                    properties: (properties.0 & 0xFF) as u8,
                    descriptors,
                });
                handles.insert((service_uuid, char_uuid), c);
            }

            table.push(ServiceInfo {
                uuid: service_uuid,
                characteristics: infos,
            });
        }
        Ok((table, handles))
    }

    fn characteristic(
        &self,
        operation: &'static str,
        handle: &GattHandle,
        key: CharacteristicKey,
    ) -> NativeResult<GattCharacteristic> {
        lock(&self.state)
            .links
            .get(&handle.id())
            .and_then(|link| link.characteristics.get(&key).cloned())
            .ok_or_else(|| NativeError::new(operation, "characteristic not discovered"))
    }
}

impl RadioStack for WinRtRadio {
    fn adapter_state(&self) -> AdapterState {
        self.adapter
    }

    fn start_scan(&self) -> NativeResult<()> {
        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(refused("start_scan"))?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(refused("start_scan"))?;

        let sender = self.events.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let address = protocol::format_address(args.BluetoothAddress()?);
                    let _ = sender.send(NativeEvent::ScanResult {
                        name: (!name.is_empty()).then_some(name),
                        address: Some(address),
                    });
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(refused("start_scan"))?;
        watcher.Start().map_err(refused("start_scan"))?;
        lock(&self.state).watcher = Some(watcher);
        Ok(())
    }

    fn stop_scan(&self) -> NativeResult<()> {
        if let Some(watcher) = lock(&self.state).watcher.take() {
            watcher.Stop().map_err(refused("stop_scan"))?;
        }
        Ok(())
    }

    fn connect(&self, address: &str) -> NativeResult<GattHandle> {
        let raw = protocol::address_to_u64(address)
            .map_err(|e| NativeError::new("connect", e.to_string()))?;

        let id = {
            let mut guard = lock(&self.state);
            guard.next_id += 1;
            let id = HandleId(guard.next_id);
            guard.links.insert(id, Link::default());
            id
        };

        let state = Arc::clone(&self.state);
        let sender = self.events.clone();
        self.runtime.spawn(async move {
            let event = match Self::open_link(raw, id, state, sender.clone()).await {
                Ok(()) => NativeEvent::Connected { handle: id },
                Err(e) => {
                    warn!("Failed to open link {:?}: {}", id, e);
                    NativeEvent::ConnectFailed {
                        handle: id,
                        status: GattStatus::ERROR,
                    }
                }
            };
            let _ = sender.send(event);
        });

        Ok(GattHandle::new(id, address))
    }

    fn discover_services(&self, handle: &GattHandle) -> NativeResult<()> {
        let device = lock(&self.state)
            .links
            .get(&handle.id())
            .and_then(|link| link.device.clone())
            .ok_or_else(|| NativeError::new("discover_services", "link not open"))?;

        let id = handle.id();
        let state = Arc::clone(&self.state);
        let sender = self.events.clone();
        self.runtime.spawn(async move {
            let status = match Self::read_table(device).await {
                Ok((table, characteristics)) => {
                    if let Some(link) = lock(&state).links.get_mut(&id) {
                        link.table = table;
                        link.characteristics = characteristics;
                    }
                    GattStatus::SUCCESS
                }
                Err(status) => status,
            };
            let _ = sender.send(NativeEvent::ServicesDiscovered { handle: id, status });
        });
        Ok(())
    }

    fn services(&self, handle: &GattHandle) -> Vec<ServiceInfo> {
        lock(&self.state)
            .links
            .get(&handle.id())
            .map(|link| link.table.clone())
            .unwrap_or_default()
    }

    fn set_notification(
        &self,
        handle: &GattHandle,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> NativeResult<()> {
        let key = (service, characteristic);
        let chr = self.characteristic("set_notification", handle, key)?;
        let mut guard = lock(&self.state);
        let link = guard
            .links
            .get_mut(&handle.id())
            .ok_or_else(|| NativeError::new("set_notification", "link not open"))?;

        if !enable {
            if let Some(token) = link.value_tokens.remove(&key) {
                chr.RemoveValueChanged(token)
                    .map_err(refused("set_notification"))?;
            }
            return Ok(());
        }
        if link.value_tokens.contains_key(&key) {
            return Ok(());
        }

        let id = handle.id();
        let sender = self.events.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = sender.send(NativeEvent::CharacteristicChanged {
                        handle: id,
                        service,
                        characteristic,
                        value,
                    });
                }
                Ok(())
            },
        );
        let token = chr
            .ValueChanged(&handler)
            .map_err(refused("set_notification"))?;
        link.value_tokens.insert(key, token);
        Ok(())
    }

    fn write_descriptor(
        &self,
        handle: &GattHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> NativeResult<()> {
        if descriptor != CCCD_UUID || value.len() != 2 {
            return Err(NativeError::new(
                "write_descriptor",
                "only the configuration descriptor can be written",
            ));
        }
        let chr = self.characteristic("write_descriptor", handle, (service, characteristic))?;
        let flags = GattClientCharacteristicConfigurationDescriptorValue(i32::from(
            u16::from_le_bytes([value[0], value[1]]),
        ));

        let id = handle.id();
        let sender = self.events.clone();
        self.runtime.spawn(async move {
            let status = match chr.WriteClientCharacteristicConfigurationDescriptorAsync(flags) {
                Ok(op) => op.await.map(status_from).unwrap_or_else(error_status),
                Err(e) => error_status(e),
            };
            let _ = sender.send(NativeEvent::DescriptorWrite {
                handle: id,
                characteristic,
                descriptor,
                status,
            });
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        handle: &GattHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> NativeResult<()> {
        let chr = self.characteristic("write_characteristic", handle, (service, characteristic))?;
        let payload = value.to_vec();

        let id = handle.id();
        let sender = self.events.clone();
        self.runtime.spawn(async move {
            let write = || -> windows::core::Result<_> {
                let writer = DataWriter::new()?;
                writer.WriteBytes(&payload)?;
                let buffer = writer.DetachBuffer()?;
                chr.WriteValueAsync(&buffer)
            };
            let status = match write() {
                Ok(op) => op.await.map(status_from).unwrap_or_else(error_status),
                Err(e) => error_status(e),
            };
            let _ = sender.send(NativeEvent::CharacteristicWrite {
                handle: id,
                characteristic,
                status,
            });
        });
        Ok(())
    }

    fn disconnect(&self, handle: &GattHandle) -> NativeResult<()> {
        let mut guard = lock(&self.state);
        let link = guard
            .links
            .get_mut(&handle.id())
            .ok_or_else(|| NativeError::new("disconnect", "link not open"))?;

        for ((service, characteristic), token) in link.value_tokens.drain() {
            if let Some(chr) = link.characteristics.get(&(service, characteristic)) {
                let _ = chr.RemoveValueChanged(token);
            }
        }
        if let Some(session) = link.session.take() {
            let _ = session.Close();
        }
        if let Some(device) = link.device.take() {
            let _ = device.Close();
        }

        // WinRT does not report a locally closed link
        let _ = self.events.send(NativeEvent::Disconnected {
            handle: handle.id(),
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn close(&self, handle: GattHandle) {
        if let Some(link) = lock(&self.state).links.remove(&handle.id()) {
            if let Some(session) = link.session {
                let _ = session.Close();
            }
            if let Some(device) = link.device {
                let _ = device.Close();
            }
        }
        debug!("Released link {:?} to {}", handle.id(), handle.address());
    }
}
