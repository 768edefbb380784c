//! Teensy 2 pad driver
//!
//! Scans for pads, connects to every new one and hands each connected
//! [`Device`] to the consumer together with its event stream. A pad whose
//! handshake fails, or that later disconnects, is picked up again by a
//! later scan.

pub mod device;
pub mod hid;
pub mod link;
pub mod write_queue;

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DriverSettings;
use crate::protocol::ReportError;
use crate::signal::LinearizationTable;

pub use device::{
    ConfigurationUpdate, Device, DeviceConfiguration, DeviceEvent, DeviceId, DeviceProperties,
    InputSample,
};
pub use hid::{HidApiPort, HidConnection, HidDeviceInfo, HidPort, WriteKind};
pub use link::DeviceLink;
pub use write_queue::PendingWrites;

pub const TEENSY2_VENDOR_ID: u16 = 0x03eb;
pub const TEENSY2_PRODUCT_ID: u16 = 0x204f;

const CLOSED_PATH_CAPACITY: usize = 32;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device is closed")]
    QueueClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Report(#[from] ReportError),
}

pub enum DriverEvent {
    NewDevice {
        device: Device,
        events: mpsc::Receiver<DeviceEvent>,
    },
}

/// Runs the connect pipeline for one enumerated path: grace delay,
/// handshake, then start.
pub async fn connect_device(
    port: Arc<dyn HidPort>,
    path: String,
    id: DeviceId,
    settings: &DriverSettings,
    table: Arc<LinearizationTable>,
    closed_paths: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<(Device, mpsc::Receiver<DeviceEvent>), DriverError> {
    let link = DeviceLink::discover(path, port, settings.clone(), cancel)
        .wait_for_interface()
        .await;
    let (link, pad, name) = link.handshake().await?;
    let configuration = DeviceConfiguration::from_reports(&pad, name, &table);
    link.start(id, configuration, table, closed_paths)
}

/// Handle to the scanning task.
pub struct DeviceDriver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DeviceDriver {
    pub fn spawn(
        port: Arc<dyn HidPort>,
        settings: DriverSettings,
        table: Arc<LinearizationTable>,
        events: mpsc::Sender<DriverEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (closed_tx, closed_rx) = mpsc::channel(CLOSED_PATH_CAPACITY);
        let scanner = Scanner {
            port,
            settings,
            table,
            events,
            known_paths: HashSet::new(),
            connections: 0,
            closed_tx,
            closed_rx,
            cancel: cancel.clone(),
        };
        info!(
            "Starting device driver for {:04x}:{:04x}",
            scanner.settings.vendor_id, scanner.settings.product_id
        );
        let task = tokio::spawn(scanner.run());
        Self { cancel, task }
    }

    /// Stops scanning and closes every device this driver connected.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Driver task ended abnormally: {}", e);
        }
        info!("Device driver stopped");
    }
}

struct Scanner {
    port: Arc<dyn HidPort>,
    settings: DriverSettings,
    table: Arc<LinearizationTable>,
    events: mpsc::Sender<DriverEvent>,
    /// Paths that are connecting or connected.
    known_paths: HashSet<String>,
    connections: u64,
    closed_tx: mpsc::Sender<String>,
    closed_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl Scanner {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.scan().await,
                Some(path) = self.closed_rx.recv() => {
                    debug!("Path {} is free again", path);
                    self.known_paths.remove(&path);
                }
            }
        }
    }

    async fn scan(&mut self) {
        let port = self.port.clone();
        let devices = match tokio::task::spawn_blocking(move || port.list_devices()).await {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                warn!("Device scan failed: {}", e);
                return;
            }
            Err(e) => {
                error!("Device scan task failed: {}", e);
                return;
            }
        };

        for info in devices {
            if !self.settings.matches(info.vendor_id, info.product_id) {
                continue;
            }
            if info.path.is_empty() {
                warn!("Ignoring pad without a device path");
                continue;
            }
            if !self.known_paths.insert(info.path.clone()) {
                continue;
            }

            self.connections += 1;
            let id = format!("teensy2:{}#{}", info.path, self.connections);
            info!("Found pad at {}, connecting as {}", info.path, id);
            self.spawn_connect(info.path, id);
        }
    }

    fn spawn_connect(&self, path: String, id: DeviceId) {
        let port = self.port.clone();
        let settings = self.settings.clone();
        let table = self.table.clone();
        let events = self.events.clone();
        let closed_tx = self.closed_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let connect = connect_device(
                port,
                path.clone(),
                id,
                &settings,
                table,
                closed_tx.clone(),
                cancel.child_token(),
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connect => result,
            };

            match result {
                Ok((device, device_events)) => {
                    let event = DriverEvent::NewDevice {
                        device,
                        events: device_events,
                    };
                    if let Err(mpsc::error::SendError(DriverEvent::NewDevice { device, .. })) =
                        events.send(event).await
                    {
                        warn!("No consumer for {}, closing it", device.id());
                        device.close();
                    }
                }
                Err(e) => {
                    warn!("Could not connect to pad at {}: {}", path, e);
                    let _res = closed_tx.send(path).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::hid::mock::{MockHidPort, MockPad};
    use super::*;
    use crate::protocol::{PadConfigurationReport, ReportCodec};
    use std::time::Duration;
    use tokio::time::timeout;

    fn settings() -> DriverSettings {
        DriverSettings {
            button_count: 4,
            sensor_count: 2,
            connect_grace_ms: 0,
            scan_interval_ms: 20,
            write_gap_ms: 1,
            read_timeout_ms: 2,
            handshake_attempts: 2,
            handshake_retry_ms: 1,
            event_rate_interval_ms: 100,
            ..DriverSettings::default()
        }
    }

    fn pad(path: &str) -> MockPad {
        let configuration = PadConfigurationReport {
            sensor_thresholds: vec![300, 600],
            release_threshold: 0.75,
            sensor_to_button_mapping: vec![0, 1],
        };
        MockPad::new(path, ReportCodec::new(2), &configuration, "stage left").unwrap()
    }

    async fn next_device(events: &mut mpsc::Receiver<DriverEvent>) -> (Device, mpsc::Receiver<DeviceEvent>) {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(DriverEvent::NewDevice { device, events })) => (device, events),
            _ => panic!("expected a new device"),
        }
    }

    async fn connect_pad(
        pad: &MockPad,
        settings: DriverSettings,
    ) -> (Device, mpsc::Receiver<DeviceEvent>, mpsc::Receiver<String>) {
        let port = MockHidPort::new();
        port.add(pad.clone());
        let (closed_tx, closed_rx) = mpsc::channel(4);
        let (device, events) = connect_device(
            Arc::new(port),
            pad.path().to_string(),
            "pad".to_string(),
            &settings,
            Arc::new(LinearizationTable::default()),
            closed_tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (device, events, closed_rx)
    }

    async fn wait_for(events: &mut mpsc::Receiver<DeviceEvent>, wanted: impl Fn(&DeviceEvent) -> bool) -> DeviceEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Some(event) if wanted(&event) => return event,
                    Some(_) => continue,
                    None => panic!("device event stream ended"),
                }
            }
        })
        .await
        .expect("timed out waiting for device event")
    }

    #[tokio::test]
    async fn connects_and_reads_configuration() {
        let port = Arc::new(MockHidPort::new());
        let pad = pad("/dev/hidraw3");
        port.add(pad.clone());
        let (tx, mut rx) = mpsc::channel(8);

        let driver = DeviceDriver::spawn(
            port,
            settings(),
            Arc::new(LinearizationTable::default()),
            tx,
        );
        let (device, _events) = next_device(&mut rx).await;

        assert_eq!(device.id(), "teensy2:/dev/hidraw3#1");
        assert_eq!(device.configuration().name, "stage left");
        assert_eq!(device.properties().sensor_count, 2);
        assert_eq!(device.configuration().sensor_to_button_mapping, vec![0, 1]);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn decodes_input_and_measures_event_rate() {
        let port = Arc::new(MockHidPort::new());
        let pad = pad("/dev/hidraw4");
        port.add(pad.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let driver = DeviceDriver::spawn(port, settings(), Arc::new(LinearizationTable::default()), tx);
        let (_device, mut events) = next_device(&mut rx).await;

        pad.queue_sensor_values(0b10, &[0, 1023]);
        let input = wait_for(&mut events, |e| matches!(e, DeviceEvent::Input(_))).await;
        match input {
            DeviceEvent::Input(sample) => {
                assert_eq!(sample.buttons, vec![false, true, false, false]);
                assert!((sample.sensors[1] - 1.0).abs() < 1e-9);
            }
            _ => unreachable!(),
        }

        // malformed reports are dropped but still count towards the event rate
        for _ in 0..3 {
            pad.queue_interrupt(vec![0x01, 0x00]);
        }
        // the valid report is counted in a window reported after its input
        let mut total = 0;
        while total < 4 {
            if let DeviceEvent::EventRate(rate) =
                wait_for(&mut events, |e| matches!(e, DeviceEvent::EventRate(_))).await
            {
                total += rate;
            }
        }
        assert_eq!(total, 4);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn unplug_emits_single_disconnect_and_releases_handle() {
        let port = Arc::new(MockHidPort::new());
        let pad = pad("/dev/hidraw5");
        port.add(pad.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let driver = DeviceDriver::spawn(port, settings(), Arc::new(LinearizationTable::default()), tx);
        let (device, mut events) = next_device(&mut rx).await;

        pad.unplug();
        wait_for(&mut events, |e| *e == DeviceEvent::Disconnected).await;
        assert!(timeout(Duration::from_secs(1), events.recv()).await.unwrap().is_none());
        assert_eq!(pad.open_handles(), 0);
        assert!(device.save_configuration().await.is_err());

        // replugging connects again under a fresh id
        pad.plug_in();
        let (device, _events) = next_device(&mut rx).await;
        assert_eq!(device.id(), "teensy2:/dev/hidraw5#2");

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn failed_handshake_releases_handle_and_retries_later() {
        let port = Arc::new(MockHidPort::new());
        let pad = pad("/dev/hidraw6");
        pad.set_silent(true);
        port.add(pad.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let driver = DeviceDriver::spawn(port, settings(), Arc::new(LinearizationTable::default()), tx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        pad.set_silent(false);
        let (device, _events) = next_device(&mut rx).await;
        assert_eq!(device.configuration().name, "stage left");
        // every failed attempt released its handle
        assert_eq!(pad.open_handles(), 1);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn close_emits_single_disconnect() {
        let mock = MockHidPort::new();
        let pad = pad("/dev/hidraw8");
        mock.add(pad.clone());
        let port: Arc<dyn HidPort> = Arc::new(mock);
        let (closed_tx, mut closed_rx) = mpsc::channel(4);

        let (device, mut events) = connect_device(
            port,
            pad.path().to_string(),
            "pad".to_string(),
            &settings(),
            Arc::new(LinearizationTable::default()),
            closed_tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(pad.open_handles(), 1);

        device.close();
        device.close();
        wait_for(&mut events, |e| *e == DeviceEvent::Disconnected).await;
        assert!(timeout(Duration::from_secs(1), events.recv()).await.unwrap().is_none());
        assert_eq!(closed_rx.recv().await.as_deref(), Some("/dev/hidraw8"));
        assert_eq!(pad.open_handles(), 0);
    }

    #[tokio::test]
    async fn configuration_update_reaches_pad_in_order() {
        let mock = MockHidPort::new();
        let pad = pad("/dev/hidraw9");
        mock.add(pad.clone());
        let table = Arc::new(LinearizationTable::default());
        let (closed_tx, _closed_rx) = mpsc::channel(4);
        let (mut device, _events) = connect_device(
            Arc::new(mock),
            pad.path().to_string(),
            "pad".to_string(),
            &settings(),
            table.clone(),
            closed_tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let pending = device
            .update_configuration(ConfigurationUpdate {
                name: Some("stage right".to_string()),
                sensor_thresholds: Some(vec![0.7, 0.2]),
                ..ConfigurationUpdate::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        pending.acknowledged().await.unwrap();

        let writes = pad.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].data[0], 0x02);
        assert_eq!(writes[1].data[0], 0x05);
        assert!(writes.iter().all(|w| w.kind == WriteKind::Feature));

        let stored = pad.configuration().unwrap();
        assert_eq!(stored.sensor_thresholds[0], table.unit_to_raw(0.7));
        assert_eq!(pad.name().as_deref(), Some("stage right"));
        assert_eq!(device.configuration().sensor_thresholds, vec![0.7, 0.2]);

        device.reset_to_bootloader().await.unwrap().acknowledged().await.unwrap();
        let reset = pad.writes().pop().unwrap();
        assert_eq!(reset.kind, WriteKind::Output);
        assert_eq!(reset.data, vec![0x03, 0x00]);
    }

    #[tokio::test]
    async fn dropped_device_releases_handle() {
        let pad = pad("/dev/hidraw10");
        let (device, mut events, mut closed_rx) = connect_pad(&pad, settings()).await;
        assert_eq!(pad.open_handles(), 1);

        drop(device);

        wait_for(&mut events, |e| *e == DeviceEvent::Disconnected).await;
        assert_eq!(closed_rx.recv().await.as_deref(), Some("/dev/hidraw10"));
        assert_eq!(pad.open_handles(), 0);
    }

    #[tokio::test]
    async fn close_discards_queued_configuration_writes() {
        let pad = pad("/dev/hidraw11");
        let slow = DriverSettings {
            write_gap_ms: 200,
            ..settings()
        };
        let (mut device, mut events, _closed_rx) = connect_pad(&pad, slow).await;

        let mut pending = Vec::new();
        for threshold in [0.1, 0.2, 0.3] {
            let update = ConfigurationUpdate::thresholds(vec![threshold, threshold]);
            pending.push(device.update_configuration(update).await.unwrap());
        }
        for _ in 0..100 {
            if !pad.writes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        device.close();
        wait_for(&mut events, |e| *e == DeviceEvent::Disconnected).await;

        assert_eq!(pad.writes().len(), 1);
        for writes in pending {
            assert!(matches!(
                writes.acknowledged().await,
                Err(DriverError::QueueClosed)
            ));
        }
    }

    #[tokio::test]
    async fn idle_reader_does_not_starve_writes() {
        let pad = pad("/dev/hidraw12");
        let idle = DriverSettings {
            read_timeout_ms: 20,
            ..settings()
        };
        let (device, _events, _closed_rx) = connect_pad(&pad, idle).await;

        let started = tokio::time::Instant::now();
        for _ in 0..10 {
            device
                .save_configuration()
                .await
                .unwrap()
                .acknowledged()
                .await
                .unwrap();
        }

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pad.writes().len(), 10);
    }
}
