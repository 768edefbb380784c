//! Cursor helpers for fixed-layout reports

use super::ReportError;

/// Little-endian cursor over a received report.
pub struct ReportReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ReportReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], ReportError> {
        let end = self.position + count;
        let bytes = self.data.get(self.position..end).ok_or(ReportError::TooShort {
            expected: end,
            actual: self.data.len(),
        })?;
        self.position = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReportError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, ReportError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, ReportError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_f32_le(&mut self) -> Result<f32, ReportError> {
        let bytes = self.read_bytes(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Builds an outgoing report of a fixed length. Unwritten bytes stay zero.
pub struct ReportWriter {
    buffer: Vec<u8>,
    len: usize,
}

impl ReportWriter {
    /// Starts a report with the given id byte; `len` includes the id.
    pub fn new(report_id: u8, len: usize) -> Self {
        let mut buffer = Vec::with_capacity(len);
        buffer.push(report_id);
        Self { buffer, len }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.buffer.push(value as u8);
        self
    }

    pub fn write_u16_le(&mut self, value: u16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_f32_le(&mut self, value: f32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.buffer.len() < self.len {
            self.buffer.resize(self.len, 0);
        }
        self.buffer
    }
}
