use gatt_session::domain::models::{ConnectionStatus, SessionEvent};
use gatt_session::domain::settings::SettingsService;
use gatt_session::infrastructure::bluetooth::native::{native_channel, NativeEventSender, RadioStack};
use gatt_session::infrastructure::logging;
use gatt_session::BluetoothService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[cfg(windows)]
async fn platform_stack(events: NativeEventSender) -> anyhow::Result<Arc<dyn RadioStack>> {
    use gatt_session::infrastructure::bluetooth::winrt::WinRtRadio;
    Ok(Arc::new(WinRtRadio::new(events).await))
}

#[cfg(not(windows))]
async fn platform_stack(_events: NativeEventSender) -> anyhow::Result<Arc<dyn RadioStack>> {
    anyhow::bail!("No BLE radio backend is available on this platform")
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::DeviceFound(device) => info!(
            "Found {} [{}]",
            device.name.as_deref().unwrap_or("Unknown"),
            device.address
        ),
        SessionEvent::CharacteristicChanged {
            characteristic,
            value,
            ..
        } => info!("{} -> {:02X?}", characteristic, value),
        SessionEvent::ScanFailed { code } => warn!("Scan failed with code {}", code),
        other => info!("{:?}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting GATT session console");

    let (native_tx, native_rx) = native_channel();
    let stack = match platform_stack(native_tx).await {
        Ok(stack) => stack,
        Err(e) => {
            error!("{:#}", e);
            return Ok(());
        }
    };
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let service = Arc::new(BluetoothService::from_settings(
        stack,
        event_tx,
        &settings.get().session,
    )?);
    let dispatcher = service.spawn_dispatcher(native_rx);

    match service.scan_start() {
        Ok(()) => {
            let window = tokio::time::sleep(Duration::from_secs(
                settings.get().session.scan_duration_secs,
            ));
            tokio::pin!(window);
            loop {
                tokio::select! {
                    _ = &mut window => break,
                    Some(event) = events.recv() => log_event(&event),
                }
            }
            service.scan_stop();
        }
        Err(e) if e.needs_enable_prompt() => {
            error!("Bluetooth is turned off, please enable it and retry");
            dispatcher.abort();
            return Ok(());
        }
        Err(e) => warn!("Scanning unavailable: {}", e),
    }

    if settings.get().session.preferred_address().is_none() {
        info!("No known device in settings, nothing to connect to");
        dispatcher.abort();
        return Ok(());
    }

    let connecting = service.connect_known(&settings.get().session)?;
    let connected = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while connecting");
            dispatcher.abort();
            return Ok(());
        }
        outcome = connecting => outcome?,
    };
    info!("Connected to {}", connected.address);
    settings.remember_address(&connected.address)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
                match event {
                    SessionEvent::ConnectionStatusChanged {
                        status: ConnectionStatus::Ready { target_found: true },
                        ..
                    } => match service.subscribe_target() {
                        Ok(completion) => tokio::select! {
                            _ = tokio::signal::ctrl_c() => break,
                            outcome = completion => match outcome {
                                Ok(outcome) => info!("Subscription: {:?}", outcome),
                                Err(e) => error!("Subscription failed: {}", e),
                            },
                        },
                        Err(e) => error!("Cannot subscribe: {}", e),
                    },
                    SessionEvent::ConnectionStatusChanged {
                        status: ConnectionStatus::Disconnected,
                        ..
                    } => break,
                    _ => {}
                }
            }
        }
    }

    if service.connected_address().is_some() {
        match service.disconnect() {
            Ok(completion) => {
                if let Err(e) = completion.await {
                    warn!("Disconnect did not complete cleanly: {}", e);
                }
            }
            Err(e) => warn!("Disconnect refused: {}", e),
        }
    }

    dispatcher.abort();
    info!("GATT session console stopped");
    Ok(())
}
