//! Hub settings
//!
//! Settings are read from `<config dir>/padhub/settings.toml`. Every field has
//! a default, so a missing file or a partial file is fine.
//!
//! ```toml
//! log_level = "debug"
//!
//! [driver]
//! connect_grace_ms = 1000
//!
//! [session]
//! input_event_rate_hz = 20
//! ```

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::driver::device::DeviceProperties;
use crate::driver::{TEENSY2_PRODUCT_ID, TEENSY2_VENDOR_ID};
use crate::session::calibration::DEFAULT_CALIBRATION_BATCH_SIZE;
use crate::signal::DEFAULT_MAX_SENSOR_VALUE;

const CONFIG_DIR: &str = "padhub";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HubSettings {
    /// Fallback for `RUST_LOG`.
    pub log_level: String,
    pub driver: DriverSettings,
    pub session: SessionSettings,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            driver: DriverSettings::default(),
            session: SessionSettings::default(),
        }
    }
}

/// Everything the device driver needs to find and talk to Teensy 2 pads.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DriverSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub button_count: usize,
    pub sensor_count: usize,
    /// Full-scale ADC reading.
    pub max_sensor_value: u16,

    /// Wait between enumeration and opening. The Linux hidraw node is not
    /// usable immediately after the device shows up.
    pub connect_grace_ms: u64,
    /// Interval of the hot-plug rescan.
    pub scan_interval_ms: u64,
    /// Minimum gap between two consecutive writes to one device.
    pub write_gap_ms: u64,
    /// Timeout of a single blocking interrupt read.
    pub read_timeout_ms: i32,
    pub handshake_attempts: u32,
    pub handshake_retry_ms: u64,
    /// Window over which interrupt reports are counted for the event rate.
    pub event_rate_interval_ms: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            vendor_id: TEENSY2_VENDOR_ID,
            product_id: TEENSY2_PRODUCT_ID,
            button_count: 16,
            sensor_count: 12,
            max_sensor_value: DEFAULT_MAX_SENSOR_VALUE,
            connect_grace_ms: 1000,
            scan_interval_ms: 1000,
            write_gap_ms: 5,
            read_timeout_ms: 10,
            handshake_attempts: 5,
            handshake_retry_ms: 20,
            event_rate_interval_ms: 1000,
        }
    }
}

impl DriverSettings {
    pub fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            button_count: self.button_count,
            sensor_count: self.sensor_count,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }

    pub fn write_gap(&self) -> Duration {
        Duration::from_millis(self.write_gap_ms)
    }

    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }

    pub fn event_rate_interval(&self) -> Duration {
        Duration::from_millis(self.event_rate_interval_ms.max(1))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Upper bound of input events per device and second.
    pub input_event_rate_hz: u32,
    /// Samples averaged before a calibration batch is committed.
    pub calibration_batch_size: u32,
    /// Outbound buffer per peer. Messages to a full peer are dropped.
    pub peer_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            input_event_rate_hz: 20,
            calibration_batch_size: DEFAULT_CALIBRATION_BATCH_SIZE,
            peer_buffer: 256,
        }
    }
}

impl SessionSettings {
    pub fn min_input_interval(&self) -> Duration {
        Duration::from_secs(1) / self.input_event_rate_hz.max(1)
    }
}

impl HubSettings {
    /// Default location of the settings file.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(SETTINGS_FILE);
        path
    }

    /// Loads settings from `path`, or from [`HubSettings::default_path`].
    /// A missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);

        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
        {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;
        let settings = Self::from_toml(&content)
            .map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))?;

        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
