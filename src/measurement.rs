//! Measurement data model: samples, verdicts and finished run records.

use crate::config::BusAddress;
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Number of trailing samples averaged into the reported current.
pub const AVERAGE_WINDOW: usize = 5;

/// One current reading taken during the observation window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// Offset from the start of the observation window.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Current in amps.
    pub current: f64,
}

impl MeasurementSample {
    /// Creates a sample.
    pub fn new(elapsed: Duration, current: f64) -> Self {
        Self { elapsed, current }
    }
}

/// Length of a device IMEI.
pub const IMEI_LEN: usize = 15;

/// IMEI of the device under test: 15 digits, the first one `3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Imei(String);

impl Imei {
    /// Validates an operator-entered IMEI. Surrounding whitespace is ignored.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let digits = text.trim();
        let valid = digits.len() == IMEI_LEN
            && digits.bytes().all(|b| b.is_ascii_digit())
            && digits.starts_with('3');
        if !valid {
            return Err(ConfigError::Validation(format!(
                "invalid IMEI '{}': expected {} digits starting with 3",
                digits, IMEI_LEN
            )));
        }
        Ok(Self(digits.to_string()))
    }

    /// The digits.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Imei {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Imei {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Imei> for String {
    fn from(imei: Imei) -> Self {
        imei.0
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named ways a run can fail.
///
/// The legacy bench codes keep their physical meaning: `W74A` is current that
/// left the band or dropped out after settling, `W748` is an overcurrent spike,
/// and "Sub PBA" is a device that never drew current at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Settled current outside the pass band with no more specific signature.
    ThresholdViolation,
    /// Current stayed out of band for longer than the excursion bound, or
    /// dropped out after settling (W74A).
    #[serde(alias = "W74A")]
    SustainedOutOfBand,
    /// Settled current spiked past the absolute overcurrent limit (W748).
    #[serde(alias = "W748")]
    Overcurrent,
    /// No current at all while the device was attached (Sub PBA).
    #[serde(alias = "SubPBA", alias = "Sub PBA")]
    SubAssembly,
    /// No usable data was captured.
    Inconclusive,
    /// The run could not complete because the instrument failed.
    InstrumentFault,
}

impl FailureCategory {
    /// Sub-failures get their own progress notice before `Done`.
    pub fn is_sub_failure(self) -> bool {
        matches!(
            self,
            Self::SustainedOutOfBand | Self::Overcurrent | Self::SubAssembly
        )
    }

    /// Short code used on the operator display and in the run log.
    pub fn code(self) -> &'static str {
        match self {
            Self::ThresholdViolation => "FAIL",
            Self::SustainedOutOfBand => "FAIL(W74A)",
            Self::Overcurrent => "FAIL(W748)",
            Self::SubAssembly => "FAIL(Sub PBA)",
            Self::Inconclusive => "FAIL(NO DATA)",
            Self::InstrumentFault => "FAIL(INSTRUMENT)",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of a single model run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "category", rename_all = "snake_case")]
pub enum Verdict {
    /// Trace met the model criteria.
    Pass,
    /// Trace or instrument failed.
    Fail(FailureCategory),
    /// Operator cancelled the run before it finished.
    Cancelled,
}

impl Verdict {
    /// True only for [`Verdict::Pass`].
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }

    /// The sub-failure category, if any.
    pub fn sub_failure(self) -> Option<FailureCategory> {
        match self {
            Self::Fail(category) if category.is_sub_failure() => Some(category),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Fail(category) => category.fmt(f),
            Self::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

/// Finished record of one model run. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Model under test.
    pub model_id: String,
    /// IMEI of the physical device, when the operator entered one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imei: Option<Imei>,
    /// Supply the model was tested on.
    pub bus_address: BusAddress,
    /// Programmed supply voltage.
    pub voltage: f64,
    /// Classification outcome.
    pub verdict: Verdict,
    /// Captured trace in capture order.
    pub samples: Vec<MeasurementSample>,
    /// When the model run began.
    pub started_at: DateTime<Utc>,
    /// When the model run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Mean current over the last [`AVERAGE_WINDOW`] samples.
    pub fn average_current(&self) -> Option<f64> {
        tail_average(&self.samples, AVERAGE_WINDOW)
    }

    /// One line summary for status displays.
    pub fn summary(&self) -> String {
        let device = match &self.imei {
            Some(imei) => format!("{} [{}]", self.model_id, imei),
            None => self.model_id.clone(),
        };
        match self.average_current() {
            Some(avg) => format!("{} {} ({:.3}A)", device, self.verdict, avg),
            None => format!("{} {}", device, self.verdict),
        }
    }
}

/// Mean of the last `window` samples, or of all samples when fewer exist.
pub(crate) fn tail_average(samples: &[MeasurementSample], window: usize) -> Option<f64> {
    if samples.is_empty() || window == 0 {
        return None;
    }
    let tail = &samples[samples.len().saturating_sub(window)..];
    Some(tail.iter().map(|s| s.current).sum::<f64>() / tail.len() as f64)
}
