use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use hwif::{Roi, Size};
use tucam::{CaptureMode, TriggerEdge};

use crate::{Error, Result};

/// The default value for [DhyanaConfig::internal_trigger_period_ms].
pub const DEFAULT_INTERNAL_TRIGGER_PERIOD_MS: u64 = 999;
/// The default value for [DhyanaConfig::arm_settle_ms].
pub const DEFAULT_ARM_SETTLE_MS: u64 = 100;
/// The default value for [DhyanaConfig::abort_retry_ms].
pub const DEFAULT_ABORT_RETRY_MS: u64 = 50;
/// The default value for [DhyanaConfig::max_consecutive_wait_failures].
pub const DEFAULT_MAX_CONSECUTIVE_WAIT_FAILURES: u32 = 10;

fn default_internal_trigger_period_ms() -> u64 {
    DEFAULT_INTERNAL_TRIGGER_PERIOD_MS
}

fn default_arm_settle_ms() -> u64 {
    DEFAULT_ARM_SETTLE_MS
}

fn default_abort_retry_ms() -> u64 {
    DEFAULT_ABORT_RETRY_MS
}

fn default_max_consecutive_wait_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_WAIT_FAILURES
}

fn default_one() -> u32 {
    1
}

/// Hardware trigger scheme used for the external trigger modes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtTriggerMode {
    #[default]
    Standard,
    Synchronous,
    Global,
}

impl ExtTriggerMode {
    pub fn capture_mode(&self) -> CaptureMode {
        match self {
            ExtTriggerMode::Standard => CaptureMode::TriggerStandard,
            ExtTriggerMode::Synchronous => CaptureMode::TriggerSynchronous,
            ExtTriggerMode::Global => CaptureMode::TriggerGlobal,
        }
    }
}

/// Active edge of the external trigger input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEdgeSetting {
    #[default]
    Rising,
    Falling,
}

impl From<TriggerEdgeSetting> for TriggerEdge {
    fn from(orig: TriggerEdgeSetting) -> Self {
        match orig {
            TriggerEdgeSetting::Rising => TriggerEdge::Rising,
            TriggerEdgeSetting::Falling => TriggerEdge::Falling,
        }
    }
}

/// Sensor gain setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalGain {
    Hdr,
    High,
    Low,
}

impl GlobalGain {
    /// Value of the global gain property.
    pub fn prop_value(&self) -> f64 {
        match self {
            GlobalGain::Hdr => 0.0,
            GlobalGain::High => 1.0,
            GlobalGain::Low => 2.0,
        }
    }

    pub fn from_prop_value(value: f64) -> Option<Self> {
        match value.round() as i64 {
            0 => Some(GlobalGain::Hdr),
            1 => Some(GlobalGain::High),
            2 => Some(GlobalGain::Low),
            _ => None,
        }
    }
}

/// Grid onto which a region of interest is snapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoiConstraint {
    /// Origin and size are multiples of this. Must be a power of two.
    #[serde(default = "default_one")]
    pub alignment: u32,
    /// Smallest width and height.
    #[serde(default = "default_one")]
    pub min_size: u32,
}

impl Default for RoiConstraint {
    fn default() -> Self {
        Self {
            alignment: 1,
            min_size: 1,
        }
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

impl RoiConstraint {
    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::Config(format!(
                "ROI alignment {} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }

    /// Grow `roi` so that it lies on the grid: the origin is rounded down,
    /// the far corner up, and the size is at least `min_size`. A region
    /// that would then extend past `detector` is moved back inside it.
    pub fn apply(&self, roi: &Roi, detector: Size) -> Roi {
        let (x, width) = self.snap(roi.top_left.x, roi.size.width, detector.width);
        let (y, height) = self.snap(roi.top_left.y, roi.size.height, detector.height);
        Roi::new(x, y, width, height)
    }

    fn snap(&self, origin: u32, len: u32, detector: u32) -> (u32, u32) {
        let a = self.alignment.max(1);
        let start = origin / a * a;
        let mut size = align_up(len + (origin - start), a).max(align_up(self.min_size, a));
        if size > detector {
            size = detector / a * a;
            if size < self.min_size || size == 0 {
                // detector narrower than the grid allows
                return (0, detector);
            }
        }
        if start + size > detector {
            ((detector - size) / a * a, size)
        } else {
            (start, size)
        }
    }
}

/// Plugin configuration, usually loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DhyanaConfig {
    /// Index of the camera to open.
    #[serde(default)]
    pub camera_index: u32,
    /// Software trigger period in internal trigger mode.
    #[serde(default = "default_internal_trigger_period_ms")]
    pub internal_trigger_period_ms: u64,
    /// Delay after arming the capture before frames are expected.
    #[serde(default = "default_arm_settle_ms")]
    pub arm_settle_ms: u64,
    /// Interval at which `stop` re-issues the abort of the frame wait.
    #[serde(default = "default_abort_retry_ms")]
    pub abort_retry_ms: u64,
    /// Consecutive failed frame waits after which the acquisition ends in
    /// fault. Zero retries forever.
    #[serde(default = "default_max_consecutive_wait_failures")]
    pub max_consecutive_wait_failures: u32,
    /// Sensor temperature target in degrees C, applied when the camera opens.
    pub temperature_target: Option<f64>,
    pub fan_speed: Option<i32>,
    pub global_gain: Option<GlobalGain>,
    #[serde(default)]
    pub trigger_mode: ExtTriggerMode,
    #[serde(default)]
    pub trigger_edge: TriggerEdgeSetting,
    pub roi_constraint: Option<RoiConstraint>,
}

impl Default for DhyanaConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            internal_trigger_period_ms: DEFAULT_INTERNAL_TRIGGER_PERIOD_MS,
            arm_settle_ms: DEFAULT_ARM_SETTLE_MS,
            abort_retry_ms: DEFAULT_ABORT_RETRY_MS,
            max_consecutive_wait_failures: DEFAULT_MAX_CONSECUTIVE_WAIT_FAILURES,
            temperature_target: None,
            fan_speed: None,
            global_gain: None,
            trigger_mode: ExtTriggerMode::default(),
            trigger_edge: TriggerEdgeSetting::default(),
            roi_constraint: None,
        }
    }
}

impl DhyanaConfig {
    pub fn from_toml_str(buf: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(buf)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read_to_string(path)?;
        debug!("read configuration from \"{}\"", path.display());
        Self::from_toml_str(&buf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.abort_retry_ms == 0 {
            return Err(Error::Config("abort_retry_ms must be positive".into()));
        }
        if self.internal_trigger_period_ms == 0 {
            return Err(Error::Config(
                "internal_trigger_period_ms must be positive".into(),
            ));
        }
        if let Some(c) = &self.roi_constraint {
            c.validate()?;
        }
        Ok(())
    }

    pub fn internal_trigger_period(&self) -> Duration {
        Duration::from_millis(self.internal_trigger_period_ms)
    }

    pub fn arm_settle(&self) -> Duration {
        Duration::from_millis(self.arm_settle_ms)
    }

    pub fn abort_retry(&self) -> Duration {
        Duration::from_millis(self.abort_retry_ms)
    }
}
