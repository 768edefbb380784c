//! Wire messages between peers and the session engine
//!
//! Both directions are adjacently tagged JSON objects:
//!
//! ```json
//! {"command": "updateSensorThreshold", "data": {"deviceId": "...", "sensorIndex": 3, "newThreshold": 0.4}}
//! {"event": "eventRate", "data": {"deviceId": "...", "eventRate": 998}}
//! ```

use serde::{Deserialize, Serialize};

use crate::driver::{
    ConfigurationUpdate, DeviceConfiguration, DeviceId, DeviceProperties, InputSample,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    SubscribeToDevice {
        device_id: DeviceId,
    },
    UnsubscribeFromDevice {
        device_id: DeviceId,
    },
    UpdateConfiguration {
        device_id: DeviceId,
        configuration: ConfigurationUpdate,
    },
    SaveConfiguration {
        device_id: DeviceId,
    },
    UpdateSensorThreshold {
        device_id: DeviceId,
        sensor_index: usize,
        new_threshold: f64,
    },
    StartOrUpdateCalibration {
        device_id: DeviceId,
        calibration_buffer: f64,
    },
    CancelCalibration {
        device_id: DeviceId,
    },
    SaveCalibration {
        device_id: DeviceId,
    },
    ResetDevice {
        device_id: DeviceId,
    },
}

impl ClientCommand {
    pub fn device_id(&self) -> &str {
        match self {
            ClientCommand::SubscribeToDevice { device_id }
            | ClientCommand::UnsubscribeFromDevice { device_id }
            | ClientCommand::UpdateConfiguration { device_id, .. }
            | ClientCommand::SaveConfiguration { device_id }
            | ClientCommand::UpdateSensorThreshold { device_id, .. }
            | ClientCommand::StartOrUpdateCalibration { device_id, .. }
            | ClientCommand::CancelCalibration { device_id }
            | ClientCommand::SaveCalibration { device_id }
            | ClientCommand::ResetDevice { device_id } => device_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::SubscribeToDevice { .. } => "subscribeToDevice",
            ClientCommand::UnsubscribeFromDevice { .. } => "unsubscribeFromDevice",
            ClientCommand::UpdateConfiguration { .. } => "updateConfiguration",
            ClientCommand::SaveConfiguration { .. } => "saveConfiguration",
            ClientCommand::UpdateSensorThreshold { .. } => "updateSensorThreshold",
            ClientCommand::StartOrUpdateCalibration { .. } => "startOrUpdateCalibration",
            ClientCommand::CancelCalibration { .. } => "cancelCalibration",
            ClientCommand::SaveCalibration { .. } => "saveCalibration",
            ClientCommand::ResetDevice { .. } => "resetDevice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationStatus {
    pub calibration_buffer: f64,
}

/// Snapshot of one connected device as broadcast to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescription {
    pub id: DeviceId,
    pub configuration: DeviceConfiguration,
    pub properties: DeviceProperties,
    pub calibration: Option<CalibrationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    DevicesUpdated {
        devices: Vec<DeviceDescription>,
    },
    InputEvent {
        device_id: DeviceId,
        input_data: InputSample,
    },
    EventRate {
        device_id: DeviceId,
        event_rate: u32,
    },
    /// Sent only to the peer whose command failed.
    CommandRejected {
        device_id: DeviceId,
        error: String,
    },
}

impl ServerMessage {
    /// Input events may be dropped under backpressure, nothing else should be.
    pub fn is_lossy(&self) -> bool {
        matches!(self, ServerMessage::InputEvent { .. })
    }
}
