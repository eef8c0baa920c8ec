//! Pass/fail classification of captured current traces.
//!
//! [`classify`] is pure and total: every trace maps to exactly one
//! [`Verdict`], and a trace without usable current never passes. Rules are
//! applied in order, the first match wins:
//!
//! 1. no finite reading at all: `Inconclusive`
//! 2. no reading above the presence threshold: `SubAssembly`
//! 3. a settled reading drops to the presence threshold or below: `SustainedOutOfBand`
//! 4. a settled reading above the overcurrent limit: `Overcurrent`
//! 5. an out-of-band stretch lasting `max_excursion` or longer, or covering the
//!    whole settled window: `SustainedOutOfBand`
//! 6. settled average inside the pass band: `Pass`
//! 7. settled average inside a configured fail band: that band's category
//! 8. anything else: `ThresholdViolation`

use crate::config::Thresholds;
use crate::measurement::{tail_average, FailureCategory, MeasurementSample, Verdict, AVERAGE_WINDOW};

/// Classifies a trace against a model's thresholds.
pub fn classify(
    samples: &[MeasurementSample],
    thresholds: &Thresholds,
    presence_threshold: f64,
) -> Verdict {
    if !samples.iter().any(|s| s.current.is_finite()) {
        return Verdict::Fail(FailureCategory::Inconclusive);
    }
    if !samples.iter().any(|s| s.current > presence_threshold) {
        return Verdict::Fail(FailureCategory::SubAssembly);
    }

    let settled = settled_window(samples, thresholds);
    if settled
        .iter()
        .any(|s| s.current.is_finite() && s.current <= presence_threshold)
    {
        return Verdict::Fail(FailureCategory::SustainedOutOfBand);
    }
    if settled
        .iter()
        .any(|s| s.current > thresholds.overcurrent_limit)
    {
        return Verdict::Fail(FailureCategory::Overcurrent);
    }

    if has_sustained_excursion(settled, thresholds) {
        return Verdict::Fail(FailureCategory::SustainedOutOfBand);
    }

    let Some(average) = tail_average(settled, AVERAGE_WINDOW) else {
        return Verdict::Fail(FailureCategory::Inconclusive);
    };
    if thresholds.pass_band().contains(average) {
        return Verdict::Pass;
    }
    thresholds
        .fail_bands
        .iter()
        .find(|band| band.interval().contains(average))
        .map_or(
            Verdict::Fail(FailureCategory::ThresholdViolation),
            |band| Verdict::Fail(band.category),
        )
}

/// Samples captured after the settle time, or the whole trace if none were.
fn settled_window<'a>(
    samples: &'a [MeasurementSample],
    thresholds: &Thresholds,
) -> &'a [MeasurementSample] {
    let settle = thresholds.timing.settle_time;
    match samples.iter().position(|s| s.elapsed >= settle) {
        Some(start) => &samples[start..],
        None => samples,
    }
}

fn has_sustained_excursion(settled: &[MeasurementSample], thresholds: &Thresholds) -> bool {
    let band = thresholds.pass_band();
    let max_excursion = thresholds.timing.max_excursion;

    if !settled.is_empty() && settled.iter().all(|s| !band.contains(s.current)) {
        return true;
    }

    let mut stretch_start = None;
    for sample in settled {
        if band.contains(sample.current) {
            stretch_start = None;
            continue;
        }
        let start = *stretch_start.get_or_insert(sample.elapsed);
        if sample.elapsed.saturating_sub(start) >= max_excursion {
            return true;
        }
    }
    false
}
