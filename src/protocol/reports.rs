use super::{ReportError, ReportReader, ReportWriter};

/// Longest name the firmware stores, in bytes.
pub const MAX_NAME_SIZE: usize = 50;

/// Report id + length byte + name bytes.
pub const NAME_REPORT_LEN: usize = 1 + 1 + MAX_NAME_SIZE;

/// Report id + one padding byte, used by Reset and SaveConfiguration.
pub const CONTROL_REPORT_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportId {
    SensorValues = 0x01,
    PadConfiguration = 0x02,
    Reset = 0x03,
    SaveConfiguration = 0x04,
    Name = 0x05,
}

impl ReportId {
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ReportId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ReportId::SensorValues),
            0x02 => Ok(ReportId::PadConfiguration),
            0x03 => Ok(ReportId::Reset),
            0x04 => Ok(ReportId::SaveConfiguration),
            0x05 => Ok(ReportId::Name),
            other => Err(other),
        }
    }
}

/// Interrupt report with the current button state and raw ADC readings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorValuesReport {
    pub button_bits: u16,
    pub sensor_values: Vec<u16>,
}

/// Pad configuration as the firmware stores it, thresholds in raw ADC units.
#[derive(Debug, Clone, PartialEq)]
pub struct PadConfigurationReport {
    pub sensor_thresholds: Vec<u16>,
    pub release_threshold: f32,
    pub sensor_to_button_mapping: Vec<i8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameReport {
    pub name: String,
}

/// Encoder/decoder for one pad layout. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportCodec {
    sensor_count: usize,
}

impl ReportCodec {
    pub const fn new(sensor_count: usize) -> Self {
        Self { sensor_count }
    }

    pub const fn sensor_count(&self) -> usize {
        self.sensor_count
    }

    pub const fn sensor_values_len(&self) -> usize {
        1 + 2 + 2 * self.sensor_count
    }

    pub const fn pad_configuration_len(&self) -> usize {
        1 + 2 * self.sensor_count + 4 + self.sensor_count
    }

    pub const fn name_len(&self) -> usize {
        NAME_REPORT_LEN
    }

    pub fn decode_sensor_values(&self, data: &[u8]) -> Result<SensorValuesReport, ReportError> {
        let mut reader = open_report(data, ReportId::SensorValues, self.sensor_values_len())?;

        let button_bits = reader.read_u16_le()?;
        let sensor_values = (0..self.sensor_count)
            .map(|_| reader.read_u16_le())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SensorValuesReport {
            button_bits,
            sensor_values,
        })
    }

    /// Only the firmware sends these; the host side uses it for emulated pads.
    pub fn encode_sensor_values(&self, report: &SensorValuesReport) -> Result<Vec<u8>, ReportError> {
        self.check_len(report.sensor_values.len())?;

        let mut writer = ReportWriter::new(ReportId::SensorValues.as_byte(), self.sensor_values_len());
        writer.write_u16_le(report.button_bits);
        for value in &report.sensor_values {
            writer.write_u16_le(*value);
        }
        Ok(writer.finish())
    }

    pub fn decode_pad_configuration(
        &self,
        data: &[u8],
    ) -> Result<PadConfigurationReport, ReportError> {
        let mut reader =
            open_report(data, ReportId::PadConfiguration, self.pad_configuration_len())?;

        let sensor_thresholds = (0..self.sensor_count)
            .map(|_| reader.read_u16_le())
            .collect::<Result<Vec<_>, _>>()?;
        let release_threshold = reader.read_f32_le()?;
        let sensor_to_button_mapping = (0..self.sensor_count)
            .map(|_| reader.read_i8())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PadConfigurationReport {
            sensor_thresholds,
            release_threshold,
            sensor_to_button_mapping,
        })
    }

    pub fn encode_pad_configuration(
        &self,
        report: &PadConfigurationReport,
    ) -> Result<Vec<u8>, ReportError> {
        self.check_len(report.sensor_thresholds.len())?;
        self.check_len(report.sensor_to_button_mapping.len())?;

        let mut writer = ReportWriter::new(
            ReportId::PadConfiguration.as_byte(),
            self.pad_configuration_len(),
        );
        for threshold in &report.sensor_thresholds {
            writer.write_u16_le(*threshold);
        }
        writer.write_f32_le(report.release_threshold);
        for button in &report.sensor_to_button_mapping {
            writer.write_i8(*button);
        }
        Ok(writer.finish())
    }

    pub fn decode_name(&self, data: &[u8]) -> Result<NameReport, ReportError> {
        let mut reader = open_report(data, ReportId::Name, 2)?;

        let size = reader.read_u8()? as usize;
        if size > MAX_NAME_SIZE {
            return Err(ReportError::NameLength(size));
        }
        let bytes = reader.read_bytes(size)?;
        let name = std::str::from_utf8(bytes).map_err(|_| ReportError::InvalidName)?;

        Ok(NameReport {
            name: name.to_string(),
        })
    }

    pub fn encode_name(&self, report: &NameReport) -> Result<Vec<u8>, ReportError> {
        let bytes = report.name.as_bytes();
        if bytes.len() > MAX_NAME_SIZE {
            return Err(ReportError::NameTooLong(bytes.len()));
        }

        let mut writer = ReportWriter::new(ReportId::Name.as_byte(), NAME_REPORT_LEN);
        writer.write_u8(bytes.len() as u8).write_bytes(bytes);
        Ok(writer.finish())
    }

    pub fn encode_save_configuration(&self) -> Vec<u8> {
        ReportWriter::new(ReportId::SaveConfiguration.as_byte(), CONTROL_REPORT_LEN).finish()
    }

    pub fn encode_reset(&self) -> Vec<u8> {
        ReportWriter::new(ReportId::Reset.as_byte(), CONTROL_REPORT_LEN).finish()
    }

    fn check_len(&self, actual: usize) -> Result<(), ReportError> {
        if actual != self.sensor_count {
            return Err(ReportError::SensorCountMismatch {
                expected: self.sensor_count,
                actual,
            });
        }
        Ok(())
    }
}

/// Validates id and minimum length, returning a reader positioned after the id.
fn open_report(data: &[u8], id: ReportId, len: usize) -> Result<ReportReader<'_>, ReportError> {
    let found = *data.first().ok_or(ReportError::TooShort {
        expected: len,
        actual: 0,
    })?;
    if found != id.as_byte() {
        return Err(ReportError::UnexpectedReportId {
            expected: id.as_byte(),
            found,
        });
    }
    if data.len() < len {
        return Err(ReportError::TooShort {
            expected: len,
            actual: data.len(),
        });
    }

    let mut reader = ReportReader::new(data);
    reader.read_u8()?;
    Ok(reader)
}
