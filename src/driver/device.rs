//! Connected pad handle and its host-side data model
//!
//! Thresholds cross the host boundary as unit values in `[0, 1]` and go to the
//! firmware as raw ADC values through the shared [`LinearizationTable`].

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::hid::WriteKind;
use super::write_queue::{PendingWrites, WriteQueueHandle};
use super::DriverError;
use crate::protocol::{
    NameReport, PadConfigurationReport, ReportCodec, SensorValuesReport, MAX_NAME_SIZE,
};
use crate::signal::{decode_buttons, LinearizationTable};

pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    pub button_count: usize,
    pub sensor_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfiguration {
    pub name: String,
    /// Per sensor, in `[0, 1]`.
    pub sensor_thresholds: Vec<f64>,
    /// Fraction of the press threshold below which a button releases.
    pub release_threshold: f64,
    /// Button index per sensor, `-1` for unmapped.
    pub sensor_to_button_mapping: Vec<i8>,
}

impl DeviceConfiguration {
    pub fn from_reports(
        pad: &PadConfigurationReport,
        name: NameReport,
        table: &LinearizationTable,
    ) -> Self {
        Self {
            name: name.name,
            sensor_thresholds: pad
                .sensor_thresholds
                .iter()
                .map(|raw| table.raw_to_unit(*raw))
                .collect(),
            release_threshold: f64::from(pad.release_threshold),
            sensor_to_button_mapping: pad.sensor_to_button_mapping.clone(),
        }
    }

    pub fn to_pad_report(&self, table: &LinearizationTable) -> PadConfigurationReport {
        PadConfigurationReport {
            sensor_thresholds: self
                .sensor_thresholds
                .iter()
                .map(|unit| table.unit_to_raw(*unit))
                .collect(),
            release_threshold: self.release_threshold as f32,
            sensor_to_button_mapping: self.sensor_to_button_mapping.clone(),
        }
    }

    pub fn validate(&self, properties: &DeviceProperties) -> Result<(), DriverError> {
        let invalid = |msg: String| Err(DriverError::InvalidConfiguration(msg));

        if self.name.len() > MAX_NAME_SIZE {
            return invalid(format!(
                "name is {} bytes long, at most {} are allowed",
                self.name.len(),
                MAX_NAME_SIZE
            ));
        }
        if self.sensor_thresholds.len() != properties.sensor_count {
            return invalid(format!(
                "expected {} sensor thresholds, got {}",
                properties.sensor_count,
                self.sensor_thresholds.len()
            ));
        }
        if let Some(threshold) = self
            .sensor_thresholds
            .iter()
            .find(|t| !(0.0..=1.0).contains(*t))
        {
            return invalid(format!("sensor threshold {} is outside [0, 1]", threshold));
        }
        if !(0.0..=1.0).contains(&self.release_threshold) {
            return invalid(format!(
                "release threshold {} is outside [0, 1]",
                self.release_threshold
            ));
        }
        if self.sensor_to_button_mapping.len() != properties.sensor_count {
            return invalid(format!(
                "expected {} sensor mappings, got {}",
                properties.sensor_count,
                self.sensor_to_button_mapping.len()
            ));
        }
        if let Some(button) = self
            .sensor_to_button_mapping
            .iter()
            .find(|b| **b < -1 || **b as isize >= properties.button_count as isize)
        {
            return invalid(format!("sensor mapped to unknown button {}", button));
        }
        Ok(())
    }
}

/// A partial configuration change; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_thresholds: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_to_button_mapping: Option<Vec<i8>>,
}

impl ConfigurationUpdate {
    pub fn thresholds(sensor_thresholds: Vec<f64>) -> Self {
        Self {
            sensor_thresholds: Some(sensor_thresholds),
            ..Self::default()
        }
    }

    pub fn merged_over(self, current: &DeviceConfiguration) -> DeviceConfiguration {
        DeviceConfiguration {
            name: self.name.unwrap_or_else(|| current.name.clone()),
            sensor_thresholds: self
                .sensor_thresholds
                .unwrap_or_else(|| current.sensor_thresholds.clone()),
            release_threshold: self.release_threshold.unwrap_or(current.release_threshold),
            sensor_to_button_mapping: self
                .sensor_to_button_mapping
                .unwrap_or_else(|| current.sensor_to_button_mapping.clone()),
        }
    }
}

/// One decoded interrupt report in host units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSample {
    pub buttons: Vec<bool>,
    pub sensors: Vec<f64>,
}

impl InputSample {
    pub fn from_report(
        report: &SensorValuesReport,
        properties: &DeviceProperties,
        table: &LinearizationTable,
    ) -> Self {
        Self {
            buttons: decode_buttons(report.button_bits, properties.button_count),
            sensors: report
                .sensor_values
                .iter()
                .map(|raw| table.raw_to_unit(*raw))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Input(InputSample),
    /// Interrupt reports received during the last measurement window.
    EventRate(u32),
    /// Emitted exactly once, after the handle is released.
    Disconnected,
}

/// Handle to a connected pad. Cloning is not offered: the session engine is
/// the single owner and the only caller of mutating operations.
pub struct Device {
    id: DeviceId,
    properties: DeviceProperties,
    configuration: DeviceConfiguration,
    connected_at: DateTime<Local>,
    codec: ReportCodec,
    table: Arc<LinearizationTable>,
    writes: WriteQueueHandle,
    cancel: CancellationToken,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        properties: DeviceProperties,
        configuration: DeviceConfiguration,
        table: Arc<LinearizationTable>,
        writes: WriteQueueHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            codec: ReportCodec::new(properties.sensor_count),
            properties,
            configuration,
            connected_at: Local::now(),
            table,
            writes,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Last configuration sent to, or read from, the pad.
    pub fn configuration(&self) -> &DeviceConfiguration {
        &self.configuration
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Merges `update` into the current configuration and queues the pad
    /// configuration report followed by the name report. The in-memory
    /// configuration changes as soon as both are queued.
    pub async fn update_configuration(
        &mut self,
        update: ConfigurationUpdate,
    ) -> Result<PendingWrites, DriverError> {
        let merged = update.merged_over(&self.configuration);
        merged.validate(&self.properties)?;
        self.ensure_open()?;

        let pad = self
            .codec
            .encode_pad_configuration(&merged.to_pad_report(&self.table))?;
        let name = self.codec.encode_name(&NameReport {
            name: merged.name.clone(),
        })?;

        let pad_ack = self.writes.enqueue(WriteKind::Feature, pad).await?;
        // the pad report may still reach the firmware while the stored
        // configuration keeps its old values
        let name_ack = match self.writes.enqueue(WriteKind::Feature, name).await {
            Ok(ack) => ack,
            Err(e) => {
                debug!(
                    "Name report for {} not queued after its pad report: {}",
                    self.id, e
                );
                return Err(e);
            }
        };

        debug!("Queued configuration update for {}", self.id);
        self.configuration = merged;
        Ok(PendingWrites::new(vec![pad_ack, name_ack]))
    }

    /// Asks the firmware to persist its current configuration.
    pub async fn save_configuration(&self) -> Result<PendingWrites, DriverError> {
        self.ensure_open()?;
        let ack = self
            .writes
            .enqueue(WriteKind::Feature, self.codec.encode_save_configuration())
            .await?;
        info!("Saving configuration on {}", self.id);
        Ok(PendingWrites::new(vec![ack]))
    }

    /// Reboots the pad into its bootloader. The pad drops off the bus
    /// afterwards and the read loop closes the device.
    pub async fn reset_to_bootloader(&self) -> Result<PendingWrites, DriverError> {
        self.ensure_open()?;
        let ack = self
            .writes
            .enqueue(WriteKind::Output, self.codec.encode_reset())
            .await?;
        info!("Resetting {} into its bootloader", self.id);
        Ok(PendingWrites::new(vec![ack]))
    }

    /// Starts closing the device. The `Disconnected` event follows once the
    /// handle is released. Calling this more than once is harmless.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.is_closed() || self.writes.is_closed() {
            return Err(DriverError::QueueClosed);
        }
        Ok(())
    }
}

/// Dropping the handle closes the device like [`Device::close`].
impl Drop for Device {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("Handle for {} dropped, closing it", self.id);
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> DeviceProperties {
        DeviceProperties {
            button_count: 4,
            sensor_count: 2,
        }
    }

    fn configuration() -> DeviceConfiguration {
        DeviceConfiguration {
            name: "pad".to_string(),
            sensor_thresholds: vec![0.5, 0.25],
            release_threshold: 0.8,
            sensor_to_button_mapping: vec![0, 3],
        }
    }

    #[test]
    fn update_keeps_absent_fields() {
        let merged = ConfigurationUpdate {
            name: Some("right".to_string()),
            ..ConfigurationUpdate::default()
        }
        .merged_over(&configuration());

        assert_eq!(merged.name, "right");
        assert_eq!(merged.sensor_thresholds, vec![0.5, 0.25]);
        assert_eq!(merged.sensor_to_button_mapping, vec![0, 3]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let props = properties();
        assert!(configuration().validate(&props).is_ok());

        let cases = [
            ConfigurationUpdate::thresholds(vec![0.5]),
            ConfigurationUpdate::thresholds(vec![0.5, 1.5]),
            ConfigurationUpdate {
                release_threshold: Some(-0.1),
                ..ConfigurationUpdate::default()
            },
            ConfigurationUpdate {
                sensor_to_button_mapping: Some(vec![0, 4]),
                ..ConfigurationUpdate::default()
            },
            ConfigurationUpdate {
                sensor_to_button_mapping: Some(vec![-2, 0]),
                ..ConfigurationUpdate::default()
            },
            ConfigurationUpdate {
                name: Some("x".repeat(MAX_NAME_SIZE + 1)),
                ..ConfigurationUpdate::default()
            },
        ];
        for update in cases {
            let merged = update.clone().merged_over(&configuration());
            assert!(
                matches!(merged.validate(&props), Err(DriverError::InvalidConfiguration(_))),
                "{:?} should be rejected",
                update
            );
        }
    }

    #[test]
    fn thresholds_survive_report_conversion() {
        let table = LinearizationTable::default();
        let config = configuration();

        let report = config.to_pad_report(&table);
        let back = DeviceConfiguration::from_reports(
            &report,
            NameReport {
                name: config.name.clone(),
            },
            &table,
        );

        for (a, b) in config.sensor_thresholds.iter().zip(&back.sensor_thresholds) {
            assert!((a - b).abs() <= 3.0 / 1023.0);
        }
        assert!((back.release_threshold - 0.8).abs() < 1e-6);
        assert_eq!(back.sensor_to_button_mapping, vec![0, 3]);
    }

    #[test]
    fn input_sample_uses_linearized_values() {
        let table = LinearizationTable::default();
        let report = SensorValuesReport {
            button_bits: 0b0101,
            sensor_values: vec![0, 1023],
        };

        let sample = InputSample::from_report(&report, &properties(), &table);

        assert_eq!(sample.buttons, vec![true, false, true, false]);
        assert_eq!(sample.sensors[0], 0.0);
        assert!((sample.sensors[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn configuration_serializes_in_camel_case() {
        let json = serde_json::to_value(configuration()).unwrap();
        assert_eq!(json["sensorThresholds"][1], 0.25);
        assert_eq!(json["sensorToButtonMapping"][1], 3);
        assert_eq!(json["releaseThreshold"], 0.8);
    }
}
