use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

use crate::error::BandError;

/// Mi Band protocol generation a discovered device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// First generation Mi Band (no heart-rate sensor, no auth)
    MiBand1,
    /// Mi Band 2
    MiBand2,
    /// Mi Band 3
    MiBand3,
    /// Mi Band 4
    MiBand4,
    /// Mi Band 5
    MiBand5,
    /// Mi Band 6
    MiBand6,
    /// Mi Band 7
    MiBand7,
    /// Mi Band 8 / Xiaomi Smart Band 8
    MiBand8,
    /// Not recognized as a Mi Band family device
    Unknown,
}

impl DeviceType {
    /// All protocol generations this crate knows about, oldest first
    pub const ALL: [Self; 8] = [
        Self::MiBand1,
        Self::MiBand2,
        Self::MiBand3,
        Self::MiBand4,
        Self::MiBand5,
        Self::MiBand6,
        Self::MiBand7,
        Self::MiBand8,
    ];

    /// Newest known model, used as the loose-heuristic fallback
    #[must_use]
    pub const fn newest() -> Self {
        Self::MiBand8
    }

    /// Feature support for this model
    ///
    /// The first generation has no heart-rate sensor and pairs without the
    /// handshake; calorie tracking arrived with gen 2 and sleep with gen 3.
    #[must_use]
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::MiBand1 => Capabilities {
                heart_rate: false,
                steps: true,
                calories: false,
                sleep: false,
                notifications: true,
                find: true,
                battery: true,
                auth: false,
            },
            Self::MiBand2 => Capabilities {
                heart_rate: true,
                steps: true,
                calories: true,
                sleep: false,
                notifications: true,
                find: true,
                battery: true,
                auth: true,
            },
            Self::MiBand3
            | Self::MiBand4
            | Self::MiBand5
            | Self::MiBand6
            | Self::MiBand7
            | Self::MiBand8 => Capabilities {
                heart_rate: true,
                steps: true,
                calories: true,
                sleep: true,
                notifications: true,
                find: true,
                battery: true,
                auth: true,
            },
            Self::Unknown => Capabilities {
                heart_rate: false,
                steps: false,
                calories: false,
                sleep: false,
                notifications: false,
                find: false,
                battery: false,
                auth: false,
            },
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MiBand1 => write!(f, "Mi Band"),
            Self::MiBand2 => write!(f, "Mi Band 2"),
            Self::MiBand3 => write!(f, "Mi Band 3"),
            Self::MiBand4 => write!(f, "Mi Band 4"),
            Self::MiBand5 => write!(f, "Mi Band 5"),
            Self::MiBand6 => write!(f, "Mi Band 6"),
            Self::MiBand7 => write!(f, "Mi Band 7"),
            Self::MiBand8 => write!(f, "Mi Band 8"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Per-model feature support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Device has a heart-rate sensor
    pub heart_rate: bool,
    /// Device counts steps
    pub steps: bool,
    /// Device tracks calories
    pub calories: bool,
    /// Device tracks sleep
    pub sleep: bool,
    /// Device can display pushed notifications
    pub notifications: bool,
    /// Device supports the find-device vibration
    pub find: bool,
    /// Device exposes battery level
    pub battery: bool,
    /// Device requires the authentication handshake
    pub auth: bool,
}

/// One device observed during discovery
///
/// Immutable snapshot of a single advertisement (or probe result); a later
/// scan of the same id produces a new candidate rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCandidate {
    /// Platform identifier for the device
    pub id: String,
    /// Advertised or probed name
    pub name: String,
    /// Device address (same as id on platforms without a separate MAC)
    pub address: String,
    /// Signal strength at scan time
    pub rssi: Option<i16>,
    /// Classified protocol generation
    pub device_type: DeviceType,
    /// Whether a session to this device is currently live
    pub is_connected: bool,
}

/// One decoded telemetry snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Heart rate in beats per minute
    pub heart_rate: Option<u8>,
    /// Step count
    pub steps: Option<u32>,
    /// Calories burned
    pub calories: Option<u16>,
    /// Standing hours
    pub standing_hours: Option<u8>,
    /// When this snapshot was decoded
    pub timestamp: SystemTime,
    /// Address of the originating device
    pub device_address: String,
}

impl HealthMetrics {
    /// Create an empty snapshot for a device
    #[must_use]
    pub fn new(device_address: impl Into<String>) -> Self {
        Self {
            heart_rate: None,
            steps: None,
            calories: None,
            standing_hours: None,
            timestamp: SystemTime::now(),
            device_address: device_address.into(),
        }
    }
}

/// Signal quality reported alongside a heart-rate sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartRateQuality {
    /// Good contact
    Good,
    /// Poor contact
    Poor,
    /// No quality byte present
    Unknown,
}

/// One decoded heart-rate sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateSample {
    /// Heart rate in beats per minute
    pub heart_rate: u8,
    /// Sensor contact quality
    pub quality: HeartRateQuality,
}

/// Steps/calories/distance decoded from a basic activity packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityData {
    /// Step count
    pub steps: Option<u32>,
    /// Calories burned
    pub calories: Option<u16>,
    /// Distance in meters
    pub distance: Option<u32>,
    /// Standing hours
    pub standing_hours: Option<u8>,
}

/// Whether a detailed activity packet is live or replayed history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    /// Sample taken now
    Realtime,
    /// Sample carries its own timestamp
    Historical,
}

/// Fully decoded detailed activity packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailedActivityData {
    /// Step count
    pub steps: u32,
    /// Calories burned
    pub calories: u16,
    /// Distance in meters
    pub distance: u16,
    /// Minutes of activity
    pub active_minutes: u16,
    /// Sample timestamp (packet-supplied for historical data)
    pub timestamp: SystemTime,
    /// Realtime or historical
    pub kind: ActivityKind,
}

/// Firmware/hardware/serial details read from the device-info packet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Firmware version string
    pub firmware_version: Option<String>,
    /// Hardware version string
    pub hardware_version: Option<String>,
    /// Serial number as hex
    pub serial_number: Option<String>,
}

/// Options controlling a pairing attempt
#[derive(Debug, Clone, Default)]
pub struct PairingOptions {
    /// 32-hex-character pre-shared authentication key, when the model needs one
    pub auth_key: Option<String>,
    /// Protocol generation to trust instead of re-classifying
    pub device_type: Option<DeviceType>,
    /// Connection timeout override in milliseconds
    pub timeout_ms: Option<u64>,
}

/// Protocol timeout and supervision configuration
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Transport connect timeout in milliseconds
    pub connection_ms: u64,
    /// Per-step authentication timeout in milliseconds
    pub authentication_ms: u64,
    /// Command response timeout in milliseconds
    pub command_ms: u64,
    /// Scan window in milliseconds
    pub scan_ms: u64,
    /// Heart-rate measurement window in milliseconds
    pub heart_rate_measurement_ms: u64,
    /// Auto-reconnect poll interval in milliseconds
    pub reconnect_interval_ms: u64,
    /// Liveness check interval in milliseconds
    pub liveness_interval_ms: u64,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connection_ms: 15_000,
            authentication_ms: 10_000,
            command_ms: 5_000,
            scan_ms: 10_000,
            heart_rate_measurement_ms: 60_000,
            reconnect_interval_ms: 5_000,
            liveness_interval_ms: 10_000,
            max_reconnect_attempts: 3,
        }
    }
}

/// Receiver for device events
///
/// Every method has a no-op default, so consumers implement only the events
/// they care about. Handlers run on the session's task; keep them short.
pub trait DeviceEvents: Send + Sync {
    /// A session reached READY or dropped to DISCONNECTED
    fn on_connection_state_change(&self, _connected: bool, _device_address: &str) {}

    /// A pairing attempt started or finished
    fn on_pairing_state_change(&self, _pairing: bool, _device_address: &str) {}

    /// A decoded telemetry snapshot arrived
    fn on_health_metrics(&self, _metrics: &HealthMetrics) {}

    /// A heart-rate sample arrived
    fn on_heart_rate(&self, _heart_rate: u8, _device_address: &str) {}

    /// A step count arrived
    fn on_steps(&self, _steps: u32, _device_address: &str) {}

    /// A calorie count arrived
    fn on_calories(&self, _calories: u16, _device_address: &str) {}

    /// A standing-hours count arrived
    fn on_standing_hours(&self, _hours: u8, _device_address: &str) {}

    /// A non-fatal error occurred on a background path
    fn on_error(&self, _error: &BandError, _device_address: Option<&str>) {}
}

/// Event receiver that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl DeviceEvents for NoopEvents {}

/// Event receiver that records everything, for assertions in tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct BandEventRecorder {
    heart_rates: std::sync::Mutex<Vec<u8>>,
    steps: std::sync::Mutex<Vec<u32>>,
    calories: std::sync::Mutex<Vec<u16>>,
    connection_changes: std::sync::Mutex<Vec<(bool, String)>>,
    errors: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl BandEventRecorder {
    pub(crate) fn heart_rates(&self) -> Vec<u8> {
        self.heart_rates.lock().unwrap().clone()
    }

    pub(crate) fn steps(&self) -> Vec<u32> {
        self.steps.lock().unwrap().clone()
    }

    pub(crate) fn calories(&self) -> Vec<u16> {
        self.calories.lock().unwrap().clone()
    }

    pub(crate) fn connection_changes(&self) -> Vec<(bool, String)> {
        self.connection_changes.lock().unwrap().clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl DeviceEvents for BandEventRecorder {
    fn on_connection_state_change(&self, connected: bool, device_address: &str) {
        self.connection_changes
            .lock()
            .unwrap()
            .push((connected, device_address.to_string()));
    }

    fn on_heart_rate(&self, heart_rate: u8, _device_address: &str) {
        self.heart_rates.lock().unwrap().push(heart_rate);
    }

    fn on_steps(&self, steps: u32, _device_address: &str) {
        self.steps.lock().unwrap().push(steps);
    }

    fn on_calories(&self, calories: u16, _device_address: &str) {
        self.calories.lock().unwrap().push(calories);
    }

    fn on_error(&self, error: &BandError, _device_address: Option<&str>) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_display() {
        assert_eq!(DeviceType::MiBand8.to_string(), "Mi Band 8");
        assert_eq!(DeviceType::MiBand1.to_string(), "Mi Band");
        assert_eq!(DeviceType::Unknown.to_string(), "Unknown");
    }

    #[test]
    fn test_newest_model() {
        assert_eq!(DeviceType::newest(), DeviceType::MiBand8);
        assert_eq!(DeviceType::ALL.last(), Some(&DeviceType::MiBand8));
    }

    #[test]
    fn test_capability_table() {
        assert!(!DeviceType::MiBand1.capabilities().heart_rate);
        assert!(!DeviceType::MiBand1.capabilities().auth);
        assert!(DeviceType::MiBand2.capabilities().heart_rate);
        assert!(!DeviceType::MiBand2.capabilities().sleep);
        assert!(DeviceType::MiBand8.capabilities().sleep);
        assert!(!DeviceType::Unknown.capabilities().steps);
    }

    #[test]
    fn test_timeouts_defaults() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connection_ms, 15_000);
        assert_eq!(timeouts.authentication_ms, 10_000);
        assert_eq!(timeouts.reconnect_interval_ms, 5_000);
        assert_eq!(timeouts.liveness_interval_ms, 10_000);
        assert_eq!(timeouts.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_noop_events_accept_everything() {
        let events = NoopEvents;
        events.on_heart_rate(72, "AA:BB:CC:DD:EE:FF");
        events.on_steps(1000, "AA:BB:CC:DD:EE:FF");
        events.on_error(&BandError::DeviceNotFound, None);
    }
}
