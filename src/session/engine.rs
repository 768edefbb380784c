//! Session engine
//!
//! A single task owns the device registry, the per-device subscriptions,
//! throttles and calibration sessions. Everything reaches it as an
//! [`EngineMessage`] or a [`DriverEvent`], so no state is shared.
//!
//! # Flow
//!
//! ```text
//! DeviceDriver ──NewDevice──► engine ◄──EngineMessage── SessionHandle (peers)
//!                               │  ▲
//!           forwarder per device│  └── DeviceEvent (input, event rate, disconnect)
//!                               ▼
//!                           Transport ──► peers
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::calibration::CalibrationSession;
use super::messages::{ClientCommand, DeviceDescription, ServerMessage};
use super::throttle::InputThrottle;
use super::transport::{PeerId, Transport};
use super::SessionError;
use crate::config::SessionSettings;
use crate::driver::{
    ConfigurationUpdate, Device, DeviceEvent, DeviceId, DriverEvent, InputSample, PendingWrites,
};

const INBOX_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum EngineMessage {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Command {
        peer: PeerId,
        command: ClientCommand,
    },
    Device {
        device_id: DeviceId,
        event: DeviceEvent,
    },
    DescribeDevices {
        reply: oneshot::Sender<Vec<DeviceDescription>>,
    },
    Shutdown,
}

/// Cloneable front door to a running [`SessionEngine`].
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::Sender<EngineMessage>,
}

impl SessionHandle {
    async fn send(&self, message: EngineMessage) -> Result<(), SessionError> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| SessionError::EngineStopped)
    }

    pub async fn peer_connected(&self, peer: PeerId) -> Result<(), SessionError> {
        self.send(EngineMessage::PeerConnected(peer)).await
    }

    pub async fn peer_disconnected(&self, peer: PeerId) -> Result<(), SessionError> {
        self.send(EngineMessage::PeerDisconnected(peer)).await
    }

    pub async fn command(&self, peer: PeerId, command: ClientCommand) -> Result<(), SessionError> {
        self.send(EngineMessage::Command { peer, command }).await
    }

    /// Same snapshot a `devicesUpdated` broadcast would carry.
    pub async fn describe_devices(&self) -> Result<Vec<DeviceDescription>, SessionError> {
        let (reply, answer) = oneshot::channel();
        self.send(EngineMessage::DescribeDevices { reply }).await?;
        answer.await.map_err(|_| SessionError::EngineStopped)
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(EngineMessage::Shutdown).await
    }
}

struct RegisteredDevice {
    device: Device,
    subscribers: BTreeSet<PeerId>,
    throttle: InputThrottle,
    calibration: Option<CalibrationSession>,
}

pub struct SessionEngine {
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    devices: BTreeMap<DeviceId, RegisteredDevice>,
    inbox: mpsc::Receiver<EngineMessage>,
    inbox_tx: mpsc::Sender<EngineMessage>,
}

impl SessionEngine {
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> (Self, SessionHandle) {
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let handle = SessionHandle {
            inbox: inbox_tx.clone(),
        };
        let engine = Self {
            transport,
            settings,
            devices: BTreeMap::new(),
            inbox,
            inbox_tx,
        };
        (engine, handle)
    }

    /// Runs until [`SessionHandle::shutdown`]. Closes every registered device
    /// on the way out.
    pub async fn run(mut self, mut driver_events: mpsc::Receiver<DriverEvent>) {
        info!(
            "Session engine started, forwarding at most {} input events per second",
            self.settings.input_event_rate_hz
        );
        let mut driver_open = true;

        loop {
            tokio::select! {
                event = driver_events.recv(), if driver_open => match event {
                    Some(event) => self.handle_driver_event(event),
                    None => {
                        debug!("Driver event channel closed");
                        driver_open = false;
                    }
                },
                message = self.inbox.recv() => match message {
                    Some(EngineMessage::Shutdown) | None => break,
                    Some(message) => self.handle_message(message).await,
                },
            }
        }

        for (id, entry) in &self.devices {
            debug!("Closing {} on shutdown", id);
            entry.device.close();
        }
        info!("Session engine stopped");
    }

    pub fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::NewDevice { device, events } => self.register_device(device, events),
        }
    }

    pub async fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::PeerConnected(peer) => {
                info!("{} connected", peer);
                self.transport.send_to(
                    peer,
                    ServerMessage::DevicesUpdated {
                        devices: self.describe_devices(),
                    },
                );
            }
            EngineMessage::PeerDisconnected(peer) => {
                info!("{} disconnected", peer);
                for entry in self.devices.values_mut() {
                    entry.subscribers.remove(&peer);
                }
            }
            EngineMessage::Command { peer, command } => {
                let device_id = command.device_id().to_string();
                let name = command.name();
                if let Err(e) = self.handle_command(peer, command).await {
                    warn!("Rejected {} from {} for {}: {}", name, peer, device_id, e);
                    self.transport.send_to(
                        peer,
                        ServerMessage::CommandRejected {
                            device_id,
                            error: e.to_string(),
                        },
                    );
                }
            }
            EngineMessage::Device { device_id, event } => {
                self.handle_device_event(device_id, event).await
            }
            EngineMessage::DescribeDevices { reply } => {
                let _res = reply.send(self.describe_devices());
            }
            EngineMessage::Shutdown => {
                debug!("Shutdown is handled by the run loop");
            }
        }
    }

    pub fn describe_devices(&self) -> Vec<DeviceDescription> {
        self.devices
            .iter()
            .map(|(id, entry)| DeviceDescription {
                id: id.clone(),
                configuration: entry.device.configuration().clone(),
                properties: *entry.device.properties(),
                calibration: entry.calibration.as_ref().map(CalibrationSession::status),
            })
            .collect()
    }

    fn register_device(&mut self, device: Device, mut events: mpsc::Receiver<DeviceEvent>) {
        let device_id = device.id().to_string();
        info!(
            "Registering device \"{}\" ({}) connected at {}",
            device.configuration().name,
            device_id,
            device.connected_at().format("%H:%M:%S")
        );

        let inbox = self.inbox_tx.clone();
        let forward_id = device_id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let message = EngineMessage::Device {
                    device_id: forward_id.clone(),
                    event,
                };
                if inbox.send(message).await.is_err() {
                    break;
                }
            }
        });

        self.devices.insert(
            device_id,
            RegisteredDevice {
                device,
                subscribers: BTreeSet::new(),
                throttle: InputThrottle::new(self.settings.min_input_interval()),
                calibration: None,
            },
        );
        self.broadcast_devices_updated();
    }

    async fn handle_device_event(&mut self, device_id: DeviceId, event: DeviceEvent) {
        match event {
            DeviceEvent::Input(sample) => self.handle_input(&device_id, sample).await,
            DeviceEvent::EventRate(event_rate) => {
                let Some(entry) = self.devices.get(&device_id) else {
                    return;
                };
                let subscribers: Vec<PeerId> = entry.subscribers.iter().copied().collect();
                if !subscribers.is_empty() {
                    self.transport.send_to_many(
                        &subscribers,
                        ServerMessage::EventRate {
                            device_id,
                            event_rate,
                        },
                    );
                }
            }
            DeviceEvent::Disconnected => {
                let Some(entry) = self.devices.remove(&device_id) else {
                    return;
                };
                entry.device.close();
                let connected_for = chrono::Local::now() - entry.device.connected_at();
                info!(
                    "Device {} disconnected after {}s",
                    device_id,
                    connected_for.num_seconds()
                );
                self.broadcast_devices_updated();
            }
        }
    }

    async fn handle_input(&mut self, device_id: &str, sample: InputSample) {
        let Some(entry) = self.devices.get_mut(device_id) else {
            debug!("Input for unknown device {}", device_id);
            return;
        };

        // calibration sees every sample, the throttle only applies to peers
        let committed = entry
            .calibration
            .as_mut()
            .and_then(|session| session.record(&sample.sensors));
        if let Some(thresholds) = committed {
            match entry
                .device
                .update_configuration(ConfigurationUpdate::thresholds(thresholds))
                .await
            {
                Ok(pending) => {
                    debug!("Committed calibration batch for {}", device_id);
                    self.watch_writes(None, device_id, pending);
                    self.broadcast_devices_updated();
                }
                Err(e) => warn!("Could not apply calibration batch to {}: {}", device_id, e),
            }
        }

        let Some(entry) = self.devices.get_mut(device_id) else {
            return;
        };
        if entry.subscribers.is_empty() || !entry.throttle.should_forward(Instant::now()) {
            return;
        }
        let subscribers: Vec<PeerId> = entry.subscribers.iter().copied().collect();
        self.transport.send_to_many(
            &subscribers,
            ServerMessage::InputEvent {
                device_id: device_id.to_string(),
                input_data: sample,
            },
        );
    }

    async fn handle_command(&mut self, peer: PeerId, command: ClientCommand) -> Result<(), SessionError> {
        let batch_size = self.settings.calibration_batch_size;
        let device_id = command.device_id().to_string();
        let entry = self
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| SessionError::UnknownDevice(device_id.clone()))?;

        let (pending, changed) = match command {
            ClientCommand::SubscribeToDevice { .. } => {
                if entry.subscribers.insert(peer) {
                    info!("{} subscribed to {}", peer, device_id);
                }
                (None, false)
            }
            ClientCommand::UnsubscribeFromDevice { .. } => {
                if entry.subscribers.remove(&peer) {
                    info!("{} unsubscribed from {}", peer, device_id);
                }
                (None, false)
            }
            ClientCommand::UpdateConfiguration { configuration, .. } => {
                let pending = entry.device.update_configuration(configuration).await?;
                info!("{} updated the configuration of {}", peer, device_id);
                (Some(pending), true)
            }
            ClientCommand::SaveConfiguration { .. } => {
                (Some(entry.device.save_configuration().await?), false)
            }
            ClientCommand::UpdateSensorThreshold {
                sensor_index,
                new_threshold,
                ..
            } => {
                let mut thresholds = entry.device.configuration().sensor_thresholds.clone();
                let slot = thresholds.get_mut(sensor_index).ok_or_else(|| {
                    SessionError::InvalidCommand(format!(
                        "sensor index {} is out of range",
                        sensor_index
                    ))
                })?;
                *slot = new_threshold;
                let pending = entry
                    .device
                    .update_configuration(ConfigurationUpdate::thresholds(thresholds))
                    .await?;
                debug!(
                    "{} set threshold {} of {} to {}",
                    peer, sensor_index, device_id, new_threshold
                );
                (Some(pending), true)
            }
            ClientCommand::StartOrUpdateCalibration {
                calibration_buffer, ..
            } => {
                if !calibration_buffer.is_finite() {
                    return Err(SessionError::InvalidCommand(format!(
                        "calibration buffer {} is not a number",
                        calibration_buffer
                    )));
                }
                match entry.calibration.as_mut() {
                    Some(session) => {
                        debug!(
                            "{} changed the calibration buffer of {} with {} samples in the current batch",
                            peer,
                            device_id,
                            session.sample_count()
                        );
                        session.set_calibration_buffer(calibration_buffer);
                    }
                    None => {
                        info!("{} started calibrating {}", peer, device_id);
                        entry.calibration = Some(CalibrationSession::start(
                            entry.device.configuration().sensor_thresholds.clone(),
                            calibration_buffer,
                            batch_size,
                        ));
                    }
                }
                (None, true)
            }
            ClientCommand::CancelCalibration { .. } => {
                let session = entry.calibration.take().ok_or_else(no_calibration)?;
                let pending = entry
                    .device
                    .update_configuration(ConfigurationUpdate::thresholds(
                        session.into_thresholds_before_calibration(),
                    ))
                    .await?;
                info!("{} cancelled calibrating {}", peer, device_id);
                (Some(pending), true)
            }
            ClientCommand::SaveCalibration { .. } => {
                if entry.calibration.is_none() {
                    return Err(no_calibration());
                }
                let pending = entry.device.save_configuration().await?;
                entry.calibration = None;
                info!("{} saved the calibration of {}", peer, device_id);
                (Some(pending), true)
            }
            ClientCommand::ResetDevice { .. } => {
                (Some(entry.device.reset_to_bootloader().await?), false)
            }
        };

        if let Some(pending) = pending {
            self.watch_writes(Some(peer), &device_id, pending);
        }
        if changed {
            self.broadcast_devices_updated();
        }
        Ok(())
    }

    /// Reports a failed write to the peer that caused it. Writes the engine
    /// issues on its own are only logged.
    fn watch_writes(&self, requester: Option<PeerId>, device_id: &str, pending: PendingWrites) {
        let transport = self.transport.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let Err(e) = pending.acknowledged().await else {
                return;
            };
            match requester {
                Some(peer) => {
                    warn!("Write to {} requested by {} failed: {}", device_id, peer, e);
                    transport.send_to(
                        peer,
                        ServerMessage::CommandRejected {
                            device_id,
                            error: e.to_string(),
                        },
                    );
                }
                None => error!("Write to {} failed: {}", device_id, e),
            }
        });
    }

    fn broadcast_devices_updated(&self) {
        self.transport.broadcast(ServerMessage::DevicesUpdated {
            devices: self.describe_devices(),
        });
    }
}

fn no_calibration() -> SessionError {
    SessionError::InvalidCommand("no calibration in progress".to_string())
}
