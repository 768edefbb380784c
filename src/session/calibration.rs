//! Threshold calibration
//!
//! While a calibration session runs, every input sample of the device is
//! folded into a running per-sensor average. Once more than `batch_size`
//! samples were averaged, the batch is committed: each threshold becomes
//! `average + calibration_buffer`, clamped to `[0, 1]`, and a new batch starts.

use super::messages::CalibrationStatus;

pub const DEFAULT_CALIBRATION_BATCH_SIZE: u32 = 250;

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSession {
    calibration_buffer: f64,
    batch_size: u32,
    running_average: Option<Vec<f64>>,
    sample_count: u32,
    thresholds_before_calibration: Vec<f64>,
}

impl CalibrationSession {
    pub fn start(thresholds_before_calibration: Vec<f64>, calibration_buffer: f64, batch_size: u32) -> Self {
        Self {
            calibration_buffer,
            batch_size,
            running_average: None,
            sample_count: 0,
            thresholds_before_calibration,
        }
    }

    /// Takes effect from the next committed batch on.
    pub fn set_calibration_buffer(&mut self, calibration_buffer: f64) {
        self.calibration_buffer = calibration_buffer;
    }

    pub fn into_thresholds_before_calibration(self) -> Vec<f64> {
        self.thresholds_before_calibration
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn status(&self) -> CalibrationStatus {
        CalibrationStatus {
            calibration_buffer: self.calibration_buffer,
        }
    }

    /// Folds one sample into the running average. Returns the new thresholds
    /// when this sample completes a batch.
    pub fn record(&mut self, sensors: &[f64]) -> Option<Vec<f64>> {
        let average = self
            .running_average
            .get_or_insert_with(|| vec![0.0; sensors.len()]);
        if average.len() != sensors.len() {
            *average = vec![0.0; sensors.len()];
            self.sample_count = 0;
        }

        let n = f64::from(self.sample_count);
        for (avg, sample) in average.iter_mut().zip(sensors) {
            *avg += (sample - *avg) / (n + 1.0);
        }
        self.sample_count += 1;

        if self.sample_count <= self.batch_size {
            return None;
        }

        let average = self.running_average.take()?;
        self.sample_count = 0;
        Some(
            average
                .into_iter()
                .map(|avg| (avg + self.calibration_buffer).clamp(0.0, 1.0))
                .collect(),
        )
    }
}
