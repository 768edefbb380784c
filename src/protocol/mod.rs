//! Report codec for the Teensy 2 pad firmware
//!
//! Every report starts with a report-id byte followed by a fixed layout whose
//! size depends only on the pad's sensor count:
//!
//! ```text
//! 0x01 SensorValues      id | u16 buttonBits | u16[sensors]                  (device → host, interrupt)
//! 0x02 PadConfiguration  id | u16[sensors] | f32 releaseThreshold | i8[sensors] (feature, both ways)
//! 0x03 Reset             id | 0x00                                           (host → device)
//! 0x04 SaveConfiguration id | 0x00                                           (host → device, feature)
//! 0x05 Name              id | u8 length | name[50]                           (feature, both ways)
//! ```
//!
//! All integers are little-endian. Encoders always emit the full fixed length,
//! zero padded, because hidraw on Linux rejects short feature reports from this
//! firmware. Decoders never try to salvage a partial report.

pub mod reader;
pub mod reports;

pub use reader::{ReportReader, ReportWriter};
pub use reports::{
    NameReport, PadConfigurationReport, ReportCodec, ReportId, SensorValuesReport,
    CONTROL_REPORT_LEN, MAX_NAME_SIZE, NAME_REPORT_LEN,
};

/// Decoding and encoding failures. Every decode failure is a malformed report:
/// it is fatal to that single read and never to the connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReportError {
    #[error("Malformed report: expected report id {expected:#04x}, found {found:#04x}")]
    UnexpectedReportId { expected: u8, found: u8 },

    #[error("Malformed report: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Malformed report: name length {0} exceeds {max} bytes", max = MAX_NAME_SIZE)]
    NameLength(usize),

    #[error("Malformed report: name is not valid UTF-8")]
    InvalidName,

    #[error("Name is {0} bytes long, only {max} fit into a name report", max = MAX_NAME_SIZE)]
    NameTooLong(usize),

    #[error("Expected {expected} values per sensor array, got {actual}")]
    SensorCountMismatch { expected: usize, actual: usize },
}
