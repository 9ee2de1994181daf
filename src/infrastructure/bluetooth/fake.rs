//! In-memory radio stack.
//!
//! Records every native call and never posts outcomes on its own: the
//! driver feeds [`NativeEvent`](super::native::NativeEvent)s to the session
//! explicitly, which makes every interleaving reproducible.

use crate::infrastructure::bluetooth::adapter::AdapterState;
use crate::infrastructure::bluetooth::native::{
    GattHandle, HandleId, NativeError, NativeResult, RadioStack, ServiceInfo,
};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
    StartScan,
    StopScan,
    Connect(String),
    DiscoverServices(HandleId),
    SetNotification {
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    WriteCharacteristic {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Disconnect(HandleId),
    Close(HandleId),
}

struct FakeState {
    adapter: AdapterState,
    services: Vec<ServiceInfo>,
    calls: Vec<NativeCall>,
    refusing: HashSet<&'static str>,
    next_handle: u64,
}

pub struct FakeRadio {
    state: Mutex<FakeState>,
}

impl Default for FakeRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRadio {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                adapter: AdapterState::Enabled,
                services: Vec::new(),
                calls: Vec::new(),
                refusing: HashSet::new(),
                next_handle: 1,
            }),
        }
    }

    pub fn with_services(services: Vec<ServiceInfo>) -> Self {
        let radio = Self::new();
        radio.set_services(services);
        radio
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_adapter_state(&self, adapter: AdapterState) {
        self.lock().adapter = adapter;
    }

    pub fn set_services(&self, services: Vec<ServiceInfo>) {
        self.lock().services = services;
    }

    /// Make the named operation (e.g. `"write_characteristic"`) refuse to start
    pub fn refuse(&self, operation: &'static str) {
        self.lock().refusing.insert(operation);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn record(&self, operation: &'static str, call: NativeCall) -> NativeResult<()> {
        let mut state = self.lock();
        if state.refusing.contains(operation) {
            return Err(NativeError::new(operation, "refused by fake radio"));
        }
        state.calls.push(call);
        Ok(())
    }
}

impl RadioStack for FakeRadio {
    fn adapter_state(&self) -> AdapterState {
        self.lock().adapter
    }

    fn start_scan(&self) -> NativeResult<()> {
        self.record("start_scan", NativeCall::StartScan)
    }

    fn stop_scan(&self) -> NativeResult<()> {
        self.record("stop_scan", NativeCall::StopScan)
    }

    fn connect(&self, address: &str) -> NativeResult<GattHandle> {
        self.record("connect", NativeCall::Connect(address.to_string()))?;
        let mut state = self.lock();
        let id = HandleId(state.next_handle);
        state.next_handle += 1;
        Ok(GattHandle::new(id, address))
    }

    fn discover_services(&self, handle: &GattHandle) -> NativeResult<()> {
        self.record("discover_services", NativeCall::DiscoverServices(handle.id()))
    }

    fn services(&self, _handle: &GattHandle) -> Vec<ServiceInfo> {
        self.lock().services.clone()
    }

    fn set_notification(
        &self,
        _handle: &GattHandle,
        _service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> NativeResult<()> {
        self.record(
            "set_notification",
            NativeCall::SetNotification {
                characteristic,
                enable,
            },
        )
    }

    fn write_descriptor(
        &self,
        _handle: &GattHandle,
        _service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> NativeResult<()> {
        self.record(
            "write_descriptor",
            NativeCall::WriteDescriptor {
                characteristic,
                descriptor,
                value: value.to_vec(),
            },
        )
    }

    fn write_characteristic(
        &self,
        _handle: &GattHandle,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> NativeResult<()> {
        self.record(
            "write_characteristic",
            NativeCall::WriteCharacteristic {
                characteristic,
                value: value.to_vec(),
            },
        )
    }

    fn disconnect(&self, handle: &GattHandle) -> NativeResult<()> {
        self.record("disconnect", NativeCall::Disconnect(handle.id()))
    }

    fn close(&self, handle: GattHandle) {
        self.lock().calls.push(NativeCall::Close(handle.id()));
    }
}
