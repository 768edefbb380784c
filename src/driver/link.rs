//! Connection lifecycle of a single pad
//!
//! # State Machine
//!
//! ```text
//! Discovered ──(grace delay)──► Connecting ──(handshake)──► Connected ──► Closed
//!                                    │
//!                                    └── handshake failed: handle released
//! ```
//!
//! Once connected, three tasks serve the device:
//! - a blocking reader that forwards raw interrupt reports
//! - the write queue
//! - an actor that decodes reports, measures the event rate and owns teardown

use statum::{machine, state};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::{Device, DeviceConfiguration, DeviceEvent, DeviceId, InputSample};
use super::hid::{HidPort, SharedConnection};
use super::write_queue::spawn_write_queue;
use super::DriverError;
use crate::config::DriverSettings;
use crate::protocol::{NameReport, PadConfigurationReport, ReportCodec, ReportError, ReportId};
use crate::signal::LinearizationTable;

const READ_CHANNEL_CAPACITY: usize = 256;
const DEVICE_EVENT_CAPACITY: usize = 256;

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Discovered,
    Connecting,
    Connected,
    Closed,
}

#[machine]
pub struct DeviceLink<S: LinkState> {
    path: String,
    port: Arc<dyn HidPort>,
    settings: DriverSettings,
    codec: ReportCodec,
    connection: Option<SharedConnection>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: LinkState> DeviceLink<S> {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl DeviceLink<Discovered> {
    pub fn discover(
        path: String,
        port: Arc<dyn HidPort>,
        settings: DriverSettings,
        cancel: CancellationToken,
    ) -> Self {
        let codec = ReportCodec::new(settings.sensor_count);
        Self::new(path, port, settings, codec, None, cancel, Vec::new())
    }

    /// Waits out the grace delay before the interface is opened.
    pub async fn wait_for_interface(self) -> DeviceLink<Connecting> {
        let grace = self.settings.connect_grace();
        debug!("Waiting {:?} before opening {}", grace, self.path);
        tokio::time::sleep(grace).await;
        self.transition()
    }
}

impl DeviceLink<Connecting> {
    /// Opens the device and reads its configuration and name. Any failure
    /// releases the handle again.
    pub async fn handshake(
        mut self,
    ) -> Result<(DeviceLink<Connected>, PadConfigurationReport, NameReport), DriverError> {
        let port = self.port.clone();
        let path = self.path.clone();
        let connection = tokio::task::spawn_blocking(move || port.open(&path))
            .await
            .map_err(|e| DriverError::HandshakeFailed(format!("Open task failed: {}", e)))?
            .map_err(|e| DriverError::HandshakeFailed(e.to_string()))?;
        let connection = SharedConnection::new(connection);

        let codec = self.codec;
        let pad = self
            .read_feature(&connection, ReportId::PadConfiguration, codec.pad_configuration_len(), |data| {
                codec.decode_pad_configuration(data)
            })
            .await?;
        let name = self
            .read_feature(&connection, ReportId::Name, codec.name_len(), |data| {
                codec.decode_name(data)
            })
            .await?;

        info!("Handshake with {} complete, pad is named \"{}\"", self.path, name.name);
        self.connection = Some(connection);
        Ok((self.transition(), pad, name))
    }

    async fn read_feature<T>(
        &self,
        connection: &SharedConnection,
        id: ReportId,
        len: usize,
        decode: impl Fn(&[u8]) -> Result<T, ReportError>,
    ) -> Result<T, DriverError> {
        let attempts = self.settings.handshake_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let handle = connection.clone();
            let read = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; len];
                buf[0] = id.as_byte();
                handle.get_feature_report(&mut buf).map(|n| {
                    buf.truncate(n);
                    buf
                })
            })
            .await
            .map_err(|e| DriverError::HandshakeFailed(format!("Read task failed: {}", e)))?;

            match read.map_err(|e| e.to_string()).and_then(|data| {
                decode(&data).map_err(|e| e.to_string())
            }) {
                Ok(report) => return Ok(report),
                Err(e) => {
                    debug!(
                        "Reading {:?} from {} failed (attempt {}/{}): {}",
                        id, self.path, attempt, attempts, e
                    );
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.handshake_retry()).await;
            }
        }

        Err(DriverError::HandshakeFailed(format!(
            "No valid {:?} report from {} after {} attempts: {}",
            id, self.path, attempts, last_error
        )))
    }
}

impl DeviceLink<Connected> {
    /// Spawns the reader, the write queue and the actor and hands out the
    /// device handle. `closed_paths` learns the path once the link is closed.
    pub fn start(
        mut self,
        id: DeviceId,
        configuration: DeviceConfiguration,
        table: Arc<LinearizationTable>,
        closed_paths: mpsc::Sender<String>,
    ) -> Result<(Device, mpsc::Receiver<DeviceEvent>), DriverError> {
        let connection = self
            .connection
            .clone()
            .ok_or_else(|| DriverError::Transport("Link has no open handle".to_string()))?;

        let (writes, write_task) = spawn_write_queue(
            connection.clone(),
            self.settings.write_gap(),
            self.cancel.clone(),
        );

        let (reads_tx, reads_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let report_len = self.codec.sensor_values_len();
        let timeout_ms = self.settings.read_timeout_ms;
        let reader_cancel = self.cancel.clone();
        let reader_task = tokio::task::spawn_blocking(move || {
            read_loop(connection, reads_tx, reader_cancel, report_len, timeout_ms)
        });
        self.tasks.push(write_task);
        self.tasks.push(reader_task);

        let properties = self.settings.properties();
        let device = Device::new(
            id.clone(),
            properties,
            configuration,
            table.clone(),
            writes,
            self.cancel.clone(),
        );

        let (events_tx, events_rx) = mpsc::channel(DEVICE_EVENT_CAPACITY);
        let actor = DeviceActor {
            id,
            codec: self.codec,
            table,
            reads: reads_rx,
            events: events_tx,
            closed_paths,
        };
        tokio::spawn(actor.run(self));

        Ok((device, events_rx))
    }

    /// Stops all tasks and releases the handle.
    pub async fn close(mut self) -> DeviceLink<Closed> {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Device task for {} ended abnormally: {}", self.path, e);
            }
        }
        self.connection = None;
        debug!("Released handle for {}", self.path);
        self.transition()
    }
}

/// Blocking interrupt read loop. Ends on cancellation, on a transport error
/// (forwarded first) or when the actor stops listening.
///
/// The handle is locked for the length of each read, so a queued write can
/// wait up to `timeout_ms` on an idle pad.
fn read_loop(
    connection: SharedConnection,
    reads: mpsc::Sender<Result<Vec<u8>, DriverError>>,
    cancel: CancellationToken,
    report_len: usize,
    timeout_ms: i32,
) {
    let mut buf = vec![0u8; report_len + 1];
    while !cancel.is_cancelled() {
        match connection.read_timeout(&mut buf, timeout_ms) {
            Ok(0) => {
                if reads.is_closed() {
                    break;
                }
                // let a waiting writer take the handle
                std::thread::yield_now();
            }
            Ok(n) => {
                if reads.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _res = reads.blocking_send(Err(e));
                break;
            }
        }
    }
}

struct DeviceActor {
    id: DeviceId,
    codec: ReportCodec,
    table: Arc<LinearizationTable>,
    reads: mpsc::Receiver<Result<Vec<u8>, DriverError>>,
    events: mpsc::Sender<DeviceEvent>,
    closed_paths: mpsc::Sender<String>,
}

impl DeviceActor {
    async fn run(mut self, link: DeviceLink<Connected>) {
        let window = link.settings.event_rate_interval();
        let properties = link.settings.properties();
        let mut rate_ticker = interval_at(Instant::now() + window, window);
        rate_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reports_in_window: u32 = 0;

        info!("Device {} is live", self.id);

        loop {
            tokio::select! {
                _ = link.cancel.cancelled() => {
                    debug!("Device {} was asked to close", self.id);
                    break;
                }
                read = self.reads.recv() => match read {
                    Some(Ok(data)) => {
                        reports_in_window = reports_in_window.saturating_add(1);
                        match self.codec.decode_sensor_values(&data) {
                            Ok(report) => {
                                let sample = InputSample::from_report(&report, &properties, &self.table);
                                if self.events.send(DeviceEvent::Input(sample)).await.is_err() {
                                    debug!("Nobody listens to {} anymore", self.id);
                                    break;
                                }
                            }
                            Err(e) => debug!("Dropping report from {}: {}", self.id, e),
                        }
                    }
                    Some(Err(e)) => {
                        error!("Lost connection to {}: {}", self.id, e);
                        break;
                    }
                    None => break,
                },
                _ = rate_ticker.tick() => {
                    let _res = self.events.send(DeviceEvent::EventRate(reports_in_window)).await;
                    reports_in_window = 0;
                }
            }
        }

        // the reader may be blocked on a full channel
        drop(self.reads);
        let closed = link.close().await;

        info!("Disconnected from {}", self.id);
        let _res = self.events.send(DeviceEvent::Disconnected).await;
        let _res = self.closed_paths.send(closed.path().to_string()).await;
    }
}
