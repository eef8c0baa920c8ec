//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `AUTOPOWER_`, nested keys separated
//!    by a double underscore
//!
//! ```text
//! AUTOPOWER_APPLICATION__LOG_LEVEL=debug
//! AUTOPOWER_MEASUREMENT__SAMPLE_COUNT=10
//! AUTOPOWER_RETRY__MAX_ATTEMPTS=5
//! ```
//!
//! A run snapshot is the ordered list of [`ModelProfile`]s returned by
//! [`AppConfig::profiles`]. Every profile is validated when the file is loaded,
//! so the orchestrator never sees an out-of-range bus address or an
//! overlapping criteria band.
//!
//! # Example
//!
//! ```toml
//! [application]
//! pseudo_mode = true
//!
//! [measurement]
//! sample_count = 30
//! sample_interval = "1s"
//!
//! [[models]]
//! model_id = "F966"
//! voltage = 4.2
//! bus_address = 6
//! pass_min = 0.1
//! pass_max = 0.5
//! ```

use crate::error::ConfigError;
use crate::error_recovery::RetryPolicy;
use crate::measurement::FailureCategory;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest primary address on a GPIB bus.
pub const MAX_BUS_ADDRESS: u8 = 30;

/// Address used when a profile does not name one.
pub const DEFAULT_BUS_ADDRESS: u8 = 6;

/// Settled readings above this many amps fail as overcurrent unless a profile
/// sets its own limit.
pub const DEFAULT_OVERCURRENT_LIMIT: f64 = 4.0;

/// Longest accepted value for any measurement or retry duration.
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Bus address
// ============================================================================

/// Primary GPIB address of a power supply (0-30).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct BusAddress(u8);

impl BusAddress {
    /// Validates and wraps a primary address.
    pub fn new(address: u8) -> Result<Self, ConfigError> {
        if address > MAX_BUS_ADDRESS {
            return Err(ConfigError::Validation(format!(
                "bus address {} out of range 0-{}",
                address, MAX_BUS_ADDRESS
            )));
        }
        Ok(Self(address))
    }

    /// Raw primary address.
    pub fn value(self) -> u8 {
        self.0
    }

    /// VISA resource string for the supply.
    pub fn resource_string(self) -> String {
        format!("GPIB0::{}::INSTR", self.0)
    }
}

impl Default for BusAddress {
    fn default() -> Self {
        Self(DEFAULT_BUS_ADDRESS)
    }
}

impl TryFrom<u8> for BusAddress {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BusAddress> for u8 {
    fn from(address: BusAddress) -> Self {
        address.0
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource_string())
    }
}

// ============================================================================
// Criteria
// ============================================================================

/// Current interval with an exclusive lower and an inclusive upper bound.
///
/// A missing bound is unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Interval {
    /// Exclusive lower bound in amps.
    #[serde(default)]
    pub low: Option<f64>,
    /// Inclusive upper bound in amps.
    #[serde(default)]
    pub high: Option<f64>,
}

impl Interval {
    /// Interval `(low, high]`.
    pub fn new(low: Option<f64>, high: Option<f64>) -> Self {
        Self { low, high }
    }

    /// Whether `current` lies in `(low, high]`. NaN is never contained.
    pub fn contains(&self, current: f64) -> bool {
        if current.is_nan() {
            return false;
        }
        if matches!(self.low, Some(low) if current <= low) {
            return false;
        }
        if matches!(self.high, Some(high) if current > high) {
            return false;
        }
        true
    }

    /// Whether two intervals share at least one point.
    ///
    /// Intervals that only touch (`a.high == b.low`) do not overlap because the
    /// lower bound is exclusive.
    pub fn overlaps(&self, other: &Interval) -> bool {
        let low = self
            .low
            .unwrap_or(f64::NEG_INFINITY)
            .max(other.low.unwrap_or(f64::NEG_INFINITY));
        let high = self
            .high
            .unwrap_or(f64::INFINITY)
            .min(other.high.unwrap_or(f64::INFINITY));
        low < high
    }

    fn validate(&self, what: &str) -> Result<(), ConfigError> {
        for bound in [self.low, self.high].into_iter().flatten() {
            if !bound.is_finite() {
                return Err(ConfigError::Validation(format!(
                    "{}: bound {} is not finite",
                    what, bound
                )));
            }
        }
        if let (Some(low), Some(high)) = (self.low, self.high) {
            if low >= high {
                return Err(ConfigError::Validation(format!(
                    "{}: lower bound {} must be below upper bound {}",
                    what, low, high
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.low {
            Some(low) => write!(f, "({}", low)?,
            None => f.write_str("(-inf")?,
        }
        match self.high {
            Some(high) => write!(f, ", {}]", high),
            None => f.write_str(", +inf)"),
        }
    }
}

/// Average current interval that maps directly onto a failure category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailBand {
    /// Category reported when the settled average falls in the band.
    pub category: FailureCategory,
    /// Exclusive lower bound in amps.
    #[serde(default)]
    pub low: Option<f64>,
    /// Inclusive upper bound in amps.
    #[serde(default)]
    pub high: Option<f64>,
}

impl FailBand {
    /// Band as an [`Interval`].
    pub fn interval(&self) -> Interval {
        Interval::new(self.low, self.high)
    }
}

/// Timing side of the pass/fail criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingBounds {
    /// Samples before this offset are start-up inrush and not checked.
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Out-of-band stretches this long or longer are sustained excursions.
    #[serde(with = "humantime_serde")]
    pub max_excursion: Duration,
}

impl Default for TimingBounds {
    fn default() -> Self {
        Self {
            settle_time: Duration::from_secs(2),
            max_excursion: Duration::from_secs(3),
        }
    }
}

/// Pass/fail thresholds of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Exclusive lower bound of the pass band in amps.
    pub pass_min: f64,
    /// Inclusive upper bound of the pass band in amps.
    pub pass_max: f64,
    /// Any settled reading above this fails the run outright.
    #[serde(default = "default_overcurrent_limit")]
    pub overcurrent_limit: f64,
    /// Timing bounds.
    #[serde(default)]
    pub timing: TimingBounds,
    /// Optional direct mappings from average current to failure category.
    #[serde(default)]
    pub fail_bands: Vec<FailBand>,
}

impl Thresholds {
    /// Thresholds with default timing and no fail bands.
    pub fn new(pass_min: f64, pass_max: f64) -> Self {
        Self {
            pass_min,
            pass_max,
            overcurrent_limit: DEFAULT_OVERCURRENT_LIMIT,
            timing: TimingBounds::default(),
            fail_bands: Vec::new(),
        }
    }

    /// The pass band `(pass_min, pass_max]`.
    pub fn pass_band(&self) -> Interval {
        Interval::new(Some(self.pass_min), Some(self.pass_max))
    }

    fn validate(&self, model_id: &str) -> Result<(), ConfigError> {
        let pass = self.pass_band();
        pass.validate(&format!("model '{}' pass band", model_id))?;
        if !self.overcurrent_limit.is_finite() || self.overcurrent_limit <= self.pass_max {
            return Err(ConfigError::Validation(format!(
                "model '{}': overcurrent_limit {} must be a number above pass_max {}",
                model_id, self.overcurrent_limit, self.pass_max
            )));
        }

        let mut bands: Vec<(String, Interval)> = vec![("PASS".to_string(), pass)];
        for band in &self.fail_bands {
            if matches!(
                band.category,
                FailureCategory::Inconclusive | FailureCategory::InstrumentFault
            ) {
                return Err(ConfigError::Validation(format!(
                    "model '{}': category {:?} cannot be used as a fail band",
                    model_id, band.category
                )));
            }
            let interval = band.interval();
            let label = band.category.code().to_string();
            interval.validate(&format!("model '{}' {} band", model_id, label))?;

            if let Some((other, _)) = bands.iter().find(|(_, b)| b.overlaps(&interval)) {
                return Err(ConfigError::Validation(format!(
                    "model '{}': overlap detected between {} and {}",
                    model_id, other, label
                )));
            }
            bands.push((label, interval));
        }
        Ok(())
    }
}

fn default_overcurrent_limit() -> f64 {
    DEFAULT_OVERCURRENT_LIMIT
}

fn check_duration(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value > MAX_CONFIG_DURATION {
        return Err(ConfigError::Validation(format!(
            "{} {:?} exceeds the {:?} limit",
            name, value, MAX_CONFIG_DURATION
        )));
    }
    Ok(())
}

// ============================================================================
// Model profiles
// ============================================================================

/// Everything needed to test one device model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Model name, e.g. `F966`.
    pub model_id: String,
    /// Boot voltage programmed on the supply.
    pub voltage: f64,
    /// GPIB address of the supply the device is wired to.
    #[serde(default)]
    pub bus_address: BusAddress,
    /// Pass/fail criteria.
    #[serde(flatten)]
    pub thresholds: Thresholds,
}

impl ModelProfile {
    /// Builds and validates a profile.
    pub fn new(
        model_id: impl Into<String>,
        voltage: f64,
        bus_address: BusAddress,
        thresholds: Thresholds,
    ) -> Result<Self, ConfigError> {
        let profile = Self {
            model_id: model_id.into(),
            voltage,
            bus_address,
            thresholds,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Checks the profile for semantic errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "model_id must not be empty".to_string(),
            ));
        }
        if !self.voltage.is_finite() || self.voltage <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "model '{}': voltage {} must be a positive number",
                self.model_id, self.voltage
            )));
        }
        self.thresholds.validate(&self.model_id)
    }
}

// ============================================================================
// Application and measurement settings
// ============================================================================

/// When the orchestrator stops to ask the operator about the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCheckPolicy {
    /// Never prompt; missing current is left to the classifier.
    Never,
    /// Prompt when no current appears within `no_current_timeout`.
    #[default]
    OnNoCurrent,
    /// Prompt before every measurement.
    Always,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Use the simulated supply instead of the GPIB bus.
    pub pseudo_mode: bool,
    /// Directory for the run log. Defaults to `~/Documents/AutoPowerTester Log`.
    pub result_dir: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "AutoPowerTester".to_string(),
            log_level: "info".to_string(),
            pseudo_mode: false,
            result_dir: None,
        }
    }
}

impl ApplicationConfig {
    /// Resolved run log directory.
    pub fn result_dir(&self) -> PathBuf {
        self.result_dir.clone().unwrap_or_else(|| {
            dirs::document_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("AutoPowerTester Log")
        })
    }
}

/// Measurement sequencing and instrument timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Readings taken in the observation window.
    pub sample_count: usize,
    /// Spacing between readings; also the tick cadence.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Poll cadence while waiting for the device to draw current.
    #[serde(with = "humantime_serde")]
    pub onset_poll_interval: Duration,
    /// How long to wait for current before applying the device check policy.
    #[serde(with = "humantime_serde")]
    pub no_current_timeout: Duration,
    /// Readings at or below this many amps count as no current.
    pub presence_threshold: f64,
    /// Operator confirmation policy.
    pub device_check: DeviceCheckPolicy,
    /// Timeout for opening a supply.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Timeout for a single command on an open supply.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            sample_count: 30,
            sample_interval: Duration::from_secs(1),
            onset_poll_interval: Duration::from_millis(200),
            no_current_timeout: Duration::from_secs(15),
            presence_threshold: 0.005,
            device_check: DeviceCheckPolicy::OnNoCurrent,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(2),
        }
    }
}

impl MeasurementConfig {
    /// Length of the observation window.
    pub fn observation_window(&self) -> Duration {
        self.sample_interval
            .saturating_mul(u32::try_from(self.sample_count).unwrap_or(u32::MAX))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_count == 0 {
            return Err(ConfigError::Validation(
                "measurement.sample_count must be at least 1".to_string(),
            ));
        }
        if self.onset_poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "measurement.onset_poll_interval must be non-zero".to_string(),
            ));
        }
        if !self.presence_threshold.is_finite() || self.presence_threshold < 0.0 {
            return Err(ConfigError::Validation(format!(
                "measurement.presence_threshold {} must be a non-negative number",
                self.presence_threshold
            )));
        }
        check_duration("measurement.sample_interval", self.sample_interval)?;
        check_duration("measurement.onset_poll_interval", self.onset_poll_interval)?;
        check_duration("measurement.no_current_timeout", self.no_current_timeout)?;
        check_duration("measurement.connect_timeout", self.connect_timeout)?;
        check_duration("measurement.command_timeout", self.command_timeout)?;
        check_duration("measurement observation window", self.observation_window())
    }
}

// ============================================================================
// Top level
// ============================================================================

/// Top-level tester configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Measurement sequencing.
    pub measurement: MeasurementConfig,
    /// Instrument retry policy.
    pub retry: RetryPolicy,
    /// Model profiles in run order.
    pub models: Vec<ModelProfile>,
}

impl AppConfig {
    /// Loads configuration from a TOML file plus `AUTOPOWER_` overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Validation(format!(
                "configuration file {} not found",
                path.display()
            )));
        }
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed("AUTOPOWER_").split("__")),
        )
    }

    /// Loads configuration from TOML text, without environment overrides.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Toml::string(text)))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        tracing::debug!(models = config.models.len(), "configuration loaded");
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        check_duration("retry.initial_backoff", self.retry.initial_backoff)?;
        check_duration("retry.max_backoff", self.retry.max_backoff)?;
        self.measurement.validate()?;

        let mut seen = HashSet::new();
        for profile in &self.models {
            profile.validate()?;
            if !seen.insert(profile.model_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "model '{}' is configured more than once",
                    profile.model_id
                )));
            }
        }
        Ok(())
    }

    /// Ordered run snapshot.
    ///
    /// With an empty `filter` every configured model is returned. Otherwise the
    /// named models are returned in filter order; unknown names are an error.
    pub fn profiles(&self, filter: &[String]) -> Result<Vec<ModelProfile>, ConfigError> {
        if filter.is_empty() {
            return Ok(self.models.clone());
        }
        filter
            .iter()
            .map(|id| {
                self.models
                    .iter()
                    .find(|p| &p.model_id == id)
                    .cloned()
                    .ok_or_else(|| ConfigError::Validation(format!("Unknown model: {}", id)))
            })
            .collect()
    }
}
