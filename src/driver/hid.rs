//! HID transport seam
//!
//! The driver only talks to pads through [`HidPort`] and [`HidConnection`].
//! [`HidApiPort`] is the hidapi backend; [`mock`] simulates Teensy 2 pads
//! for tests.

use hidapi::HidApi;
use std::ffi::CString;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::DriverError;

/// An enumerated HID interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub path: String,
}

/// How a report travels to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Feature,
    Output,
}

/// An open device handle. All calls block.
pub trait HidConnection: Send {
    /// Reads one interrupt report. `Ok(0)` means the timeout elapsed.
    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, DriverError>;

    fn write(&mut self, data: &[u8]) -> Result<usize, DriverError>;

    fn send_feature_report(&mut self, data: &[u8]) -> Result<(), DriverError>;

    /// `buf[0]` selects the report id. Returns the number of bytes read,
    /// report id included.
    fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, DriverError>;
}

pub trait HidPort: Send + Sync {
    fn list_devices(&self) -> Result<Vec<HidDeviceInfo>, DriverError>;

    fn open(&self, path: &str) -> Result<Box<dyn HidConnection>, DriverError>;
}

fn transport(context: &str, error: impl std::fmt::Display) -> DriverError {
    DriverError::Transport(format!("{}: {}", context, error))
}

pub struct HidApiPort {
    api: Mutex<HidApi>,
}

impl HidApiPort {
    pub fn new() -> Result<Self, DriverError> {
        let api = HidApi::new().map_err(|e| transport("Failed to initialize hidapi", e))?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }

    fn api(&self) -> Result<MutexGuard<'_, HidApi>, DriverError> {
        self.api
            .lock()
            .map_err(|_| DriverError::Transport("hidapi context lock poisoned".to_string()))
    }
}

impl HidPort for HidApiPort {
    fn list_devices(&self) -> Result<Vec<HidDeviceInfo>, DriverError> {
        let mut api = self.api()?;
        api.refresh_devices()
            .map_err(|e| transport("Failed to enumerate HID devices", e))?;

        Ok(api
            .device_list()
            .map(|info| HidDeviceInfo {
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                path: info.path().to_string_lossy().into_owned(),
            })
            .collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn HidConnection>, DriverError> {
        let c_path = CString::new(path).map_err(|e| transport("Invalid device path", e))?;
        let device = self
            .api()?
            .open_path(&c_path)
            .map_err(|e| transport(&format!("Failed to open {}", path), e))?;
        debug!("Opened HID device at {}", path);
        Ok(Box::new(HidApiConnection { device }))
    }
}

struct HidApiConnection {
    device: hidapi::HidDevice,
}

impl HidConnection for HidApiConnection {
    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, DriverError> {
        self.device
            .read_timeout(buf, timeout_ms)
            .map_err(|e| transport("Read failed", e))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DriverError> {
        self.device
            .write(data)
            .map_err(|e| transport("Write failed", e))
    }

    fn send_feature_report(&mut self, data: &[u8]) -> Result<(), DriverError> {
        self.device
            .send_feature_report(data)
            .map_err(|e| transport("Sending feature report failed", e))
    }

    fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, DriverError> {
        self.device
            .get_feature_report(buf)
            .map_err(|e| transport("Reading feature report failed", e))
    }
}

/// A handle shared by the reader, the write queue and the handshake.
/// Dropping the last clone releases the OS handle.
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<Mutex<Box<dyn HidConnection>>>,
}

impl SharedConnection {
    pub fn new(connection: Box<dyn HidConnection>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(connection)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn HidConnection>>, DriverError> {
        self.inner
            .lock()
            .map_err(|_| DriverError::Transport("Device handle lock poisoned".to_string()))
    }

    pub fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, DriverError> {
        self.lock()?.read_timeout(buf, timeout_ms)
    }

    pub fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize, DriverError> {
        self.lock()?.get_feature_report(buf)
    }

    pub fn send(&self, kind: WriteKind, data: &[u8]) -> Result<(), DriverError> {
        let mut connection = self.lock()?;
        match kind {
            WriteKind::Feature => connection.send_feature_report(data),
            WriteKind::Output => connection.write(data).map(|_| ()),
        }
    }
}

pub mod mock {
    //! Simulated Teensy 2 pads.
    //!
    //! A [`MockPad`] answers feature report requests from its stored
    //! configuration and name, stores the ones it receives, records every
    //! write and serves queued interrupt reports.

    use super::*;
    use crate::driver::{TEENSY2_PRODUCT_ID, TEENSY2_VENDOR_ID};
    use crate::protocol::{
        NameReport, PadConfigurationReport, ReportCodec, ReportId, SensorValuesReport,
    };
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone)]
    pub struct RecordedWrite {
        pub kind: WriteKind,
        pub data: Vec<u8>,
        pub at: Instant,
    }

    struct PadState {
        configuration: Vec<u8>,
        name: Vec<u8>,
        interrupts: VecDeque<Vec<u8>>,
        writes: Vec<RecordedWrite>,
        connected: bool,
        fail_writes: bool,
        silent: bool,
        open_handles: usize,
    }

    #[derive(Clone)]
    pub struct MockPad {
        info: HidDeviceInfo,
        codec: ReportCodec,
        state: Arc<Mutex<PadState>>,
    }

    impl MockPad {
        pub fn new(
            path: impl Into<String>,
            codec: ReportCodec,
            configuration: &PadConfigurationReport,
            name: &str,
        ) -> Result<Self, DriverError> {
            let state = PadState {
                configuration: codec.encode_pad_configuration(configuration)?,
                name: codec.encode_name(&NameReport {
                    name: name.to_string(),
                })?,
                interrupts: VecDeque::new(),
                writes: Vec::new(),
                connected: true,
                fail_writes: false,
                silent: false,
                open_handles: 0,
            };
            Ok(Self {
                info: HidDeviceInfo {
                    vendor_id: TEENSY2_VENDOR_ID,
                    product_id: TEENSY2_PRODUCT_ID,
                    path: path.into(),
                },
                codec,
                state: Arc::new(Mutex::new(state)),
            })
        }

        fn state(&self) -> MutexGuard<'_, PadState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        pub fn path(&self) -> &str {
            &self.info.path
        }

        pub fn queue_interrupt(&self, data: Vec<u8>) {
            self.state().interrupts.push_back(data);
        }

        pub fn queue_sensor_values(&self, button_bits: u16, sensor_values: &[u16]) {
            let report = SensorValuesReport {
                button_bits,
                sensor_values: sensor_values.to_vec(),
            };
            if let Ok(data) = self.codec.encode_sensor_values(&report) {
                self.queue_interrupt(data);
            }
        }

        pub fn writes(&self) -> Vec<RecordedWrite> {
            self.state().writes.clone()
        }

        /// Pad configuration as currently stored on the simulated device.
        pub fn configuration(&self) -> Option<PadConfigurationReport> {
            self.codec
                .decode_pad_configuration(&self.state().configuration)
                .ok()
        }

        pub fn name(&self) -> Option<String> {
            self.codec
                .decode_name(&self.state().name)
                .ok()
                .map(|report| report.name)
        }

        /// Removes the pad from enumeration and fails all I/O on open handles.
        pub fn unplug(&self) {
            self.state().connected = false;
        }

        pub fn plug_in(&self) {
            self.state().connected = true;
        }

        pub fn fail_writes(&self, fail: bool) {
            self.state().fail_writes = fail;
        }

        /// A silent pad does not answer feature report requests.
        pub fn set_silent(&self, silent: bool) {
            self.state().silent = silent;
        }

        pub fn open_handles(&self) -> usize {
            self.state().open_handles
        }

        fn is_connected(&self) -> bool {
            self.state().connected
        }
    }

    struct MockConnection {
        pad: MockPad,
    }

    impl MockConnection {
        fn check_connected(&self) -> Result<(), DriverError> {
            if self.pad.is_connected() {
                Ok(())
            } else {
                Err(DriverError::Transport("Device unplugged".to_string()))
            }
        }

        fn record(&self, kind: WriteKind, data: &[u8]) -> Result<(), DriverError> {
            self.check_connected()?;
            let mut state = self.pad.state();
            state.writes.push(RecordedWrite {
                kind,
                data: data.to_vec(),
                at: Instant::now(),
            });
            if state.fail_writes {
                return Err(DriverError::Transport("Simulated write failure".to_string()));
            }
            Ok(())
        }
    }

    impl HidConnection for MockConnection {
        fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, DriverError> {
            self.check_connected()?;
            if let Some(report) = self.pad.state().interrupts.pop_front() {
                let len = report.len().min(buf.len());
                buf[..len].copy_from_slice(&report[..len]);
                return Ok(len);
            }
            std::thread::sleep(Duration::from_millis(timeout_ms.max(0) as u64));
            Ok(0)
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, DriverError> {
            self.record(WriteKind::Output, data)?;
            Ok(data.len())
        }

        fn send_feature_report(&mut self, data: &[u8]) -> Result<(), DriverError> {
            self.record(WriteKind::Feature, data)?;
            let mut state = self.pad.state();
            match data.first().copied().map(ReportId::try_from) {
                Some(Ok(ReportId::PadConfiguration)) => state.configuration = data.to_vec(),
                Some(Ok(ReportId::Name)) => state.name = data.to_vec(),
                _ => {}
            }
            Ok(())
        }

        fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, DriverError> {
            self.check_connected()?;
            let state = self.pad.state();
            if state.silent {
                return Err(DriverError::Transport("No response to feature request".to_string()));
            }
            let report = match buf.first().copied().map(ReportId::try_from) {
                Some(Ok(ReportId::PadConfiguration)) => &state.configuration,
                Some(Ok(ReportId::Name)) => &state.name,
                _ => return Err(DriverError::Transport("Unsupported feature report".to_string())),
            };
            let len = report.len().min(buf.len());
            buf[..len].copy_from_slice(&report[..len]);
            Ok(len)
        }
    }

    impl Drop for MockConnection {
        fn drop(&mut self) {
            let mut state = self.pad.state();
            state.open_handles = state.open_handles.saturating_sub(1);
        }
    }

    #[derive(Default)]
    pub struct MockHidPort {
        pads: Mutex<Vec<MockPad>>,
    }

    impl MockHidPort {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add(&self, pad: MockPad) {
            self.pads.lock().unwrap_or_else(|e| e.into_inner()).push(pad);
        }
    }

    impl HidPort for MockHidPort {
        fn list_devices(&self) -> Result<Vec<HidDeviceInfo>, DriverError> {
            let pads = self.pads.lock().unwrap_or_else(|e| e.into_inner());
            Ok(pads
                .iter()
                .filter(|pad| pad.is_connected())
                .map(|pad| pad.info.clone())
                .collect())
        }

        fn open(&self, path: &str) -> Result<Box<dyn HidConnection>, DriverError> {
            let pads = self.pads.lock().unwrap_or_else(|e| e.into_inner());
            let pad = pads
                .iter()
                .find(|pad| pad.path() == path && pad.is_connected())
                .ok_or_else(|| DriverError::Transport(format!("No device at {}", path)))?;
            pad.state().open_handles += 1;
            Ok(Box::new(MockConnection { pad: pad.clone() }))
        }
    }
}
