//! Sweep parameters, their limits, and the derived plan.

use crate::error::{Field, KeithleyError, Result, ValidationError};
use crate::scpi::cmd;
use serde::{Deserialize, Serialize};

/// Largest source current magnitude (A).
pub const CURRENT_LIMIT: f64 = 0.105;
/// Smallest sweep step (A).
pub const MIN_STEP: f64 = 1e-12;
/// Source delay bounds (s).
pub const DELAY_RANGE: (f64, f64) = (1e-3, 9999.999);
/// Differential delta bounds (A).
pub const DELTA_RANGE: (f64, f64) = (1e-5, CURRENT_LIMIT);
/// Buffer capacity of the 6220 in points.
pub const MAX_POINTS: u32 = 65530;

/// Default source delay (s).
pub const DEFAULT_DELAY: f64 = 0.002;
/// Default differential delta (A).
pub const DEFAULT_DELTA: f64 = 1e-5;

fn default_delay() -> f64 {
    DEFAULT_DELAY
}

fn default_delta() -> f64 {
    DEFAULT_DELTA
}

/// One of the five differential-conductance parameters held by the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepField {
    /// `SOUR:DCON:STAR`
    Start,
    /// `SOUR:DCON:STOP`
    Stop,
    /// `SOUR:DCON:STEP`
    Step,
    /// `SOUR:DCON:DELTA`
    Delta,
    /// `SOUR:DCON:DELay`
    Delay,
}

impl SweepField {
    /// SCPI header the parameter is written to; append `?` to read it back.
    pub fn header(self) -> &'static str {
        match self {
            SweepField::Start => cmd::DCON_START,
            SweepField::Stop => cmd::DCON_STOP,
            SweepField::Step => cmd::DCON_STEP,
            SweepField::Delta => cmd::DCON_DELTA,
            SweepField::Delay => cmd::DCON_DELAY,
        }
    }
}

impl From<SweepField> for Field {
    fn from(field: SweepField) -> Self {
        match field {
            SweepField::Start => Field::Start,
            SweepField::Stop => Field::Stop,
            SweepField::Step => Field::Step,
            SweepField::Delta => Field::Delta,
            SweepField::Delay => Field::Delay,
        }
    }
}

/// Requested differential-conductance sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepParams {
    /// Start current (A).
    pub start: f64,
    /// Stop current (A).
    pub stop: f64,
    /// Step current (A).
    pub step: f64,
    /// Source delay per point (s).
    #[serde(default = "default_delay")]
    pub delay: f64,
    /// Differential delta current (A).
    #[serde(default = "default_delta")]
    pub delta: f64,
}

impl SweepParams {
    /// Sweep with the default delay and delta.
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self {
            start,
            stop,
            step,
            delay: DEFAULT_DELAY,
            delta: DEFAULT_DELTA,
        }
    }

    /// Override the source delay.
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Override the differential delta.
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    /// Check every bound, reporting the first violation.
    ///
    /// Order: start, stop, step, delay, delta, then `stop > start`.
    pub fn validate(&self) -> Result<()> {
        check_range(Field::Start, self.start, -CURRENT_LIMIT, CURRENT_LIMIT)?;
        check_range(Field::Stop, self.stop, -CURRENT_LIMIT, CURRENT_LIMIT)?;
        check_range(Field::Step, self.step, MIN_STEP, CURRENT_LIMIT)?;
        check_range(Field::Delay, self.delay, DELAY_RANGE.0, DELAY_RANGE.1)?;
        check_range(Field::Delta, self.delta, DELTA_RANGE.0, DELTA_RANGE.1)?;
        if self.stop <= self.start {
            return Err(KeithleyError::StopNotAboveStart {
                start: self.start,
                stop: self.stop,
            });
        }
        Ok(())
    }
}

/// Reject `value` unless it lies in `[min, max]`. NaN is always rejected.
pub(crate) fn check_range(field: Field, value: f64, min: f64, max: f64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError {
            field,
            value,
            min,
            max,
        }
        .into())
    }
}

/// Number of buffer points a sweep produces.
///
/// The quotient is rounded to six decimals before taking the ceiling so that
/// `0.01 / 0.001` counts as exactly ten steps.
pub fn total_points(start: f64, stop: f64, step: f64) -> u64 {
    let steps = ((stop - start).abs() / step * 1e6).round() / 1e6;
    steps.ceil() as u64 + 1
}

/// A validated sweep with its derived point count and duration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepPlan {
    params: SweepParams,
    total_points: u32,
    estimated_time: f64,
}

impl SweepPlan {
    /// Validate `params` and derive the plan, without touching the device.
    pub fn new(params: SweepParams) -> Result<Self> {
        params.validate()?;

        let points = total_points(params.start, params.stop, params.step);
        if points > u64::from(MAX_POINTS) {
            return Err(KeithleyError::Capacity {
                points,
                max: MAX_POINTS,
            });
        }
        // Bounded by MAX_POINTS above.
        let total_points = points as u32;

        Ok(Self {
            params,
            total_points,
            estimated_time: f64::from(total_points) * params.delay,
        })
    }

    /// The requested parameters.
    pub fn params(&self) -> &SweepParams {
        &self.params
    }

    /// Buffer points the sweep fills.
    pub fn total_points(&self) -> u32 {
        self.total_points
    }

    /// Expected sweep duration in seconds.
    pub fn estimated_time(&self) -> f64 {
        self.estimated_time
    }

    /// Parameters in the order they are written to the instrument.
    pub fn fields(&self) -> [(SweepField, f64); 5] {
        [
            (SweepField::Start, self.params.start),
            (SweepField::Stop, self.params.stop),
            (SweepField::Step, self.params.step),
            (SweepField::Delta, self.params.delta),
            (SweepField::Delay, self.params.delay),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_follow_write_order() {
        let plan = SweepPlan::new(SweepParams::new(0.0, 0.01, 0.001)).unwrap();

        let headers: Vec<&str> = plan.fields().iter().map(|(f, _)| f.header()).collect();
        assert_eq!(
            headers,
            [
                "SOUR:DCON:STAR",
                "SOUR:DCON:STOP",
                "SOUR:DCON:STEP",
                "SOUR:DCON:DELTA",
                "SOUR:DCON:DELay"
            ]
        );
        assert_eq!(Field::from(SweepField::Delta), Field::Delta);
    }

    #[test]
    fn test_reference_sweep() {
        let plan = SweepPlan::new(SweepParams::new(0.0, 0.01, 0.001)).unwrap();

        assert_eq!(plan.total_points(), 11);
        assert!((plan.estimated_time() - 0.022).abs() < 1e-12);
    }

    #[test]
    fn test_point_count_rounds_quotient() {
        // 0.3 / 0.1 is 2.9999999999999996 in binary floating point.
        assert_eq!(total_points(0.0, 0.3, 0.1), 4);
        assert_eq!(total_points(-0.001, 0.001, 0.0003), 8);
        assert_eq!(total_points(0.0, 0.1, 0.105), 2);
    }

    #[test]
    fn test_point_count_property() {
        let starts = [-0.105, -0.05, -1e-6, 0.0, 0.02];
        let spans = [1e-9, 1e-4, 0.013, 0.05, 0.08];
        let steps = [1e-5, 3.3e-4, 0.001, 0.01, 0.1];
        for &start in &starts {
            for &span in &spans {
                for &step in &steps {
                    let stop = start + span;
                    let points = total_points(start, stop, step);
                    let ratio = (stop - start).abs() / step;
                    let intervals = (points - 1) as f64;
                    assert!(points >= 1);
                    assert!(intervals >= ratio - 1e-6, "{start} {stop} {step}");
                    assert!(intervals < ratio + 1.0 + 1e-6, "{start} {stop} {step}");
                }
            }
        }
    }

    #[test]
    fn test_start_out_of_range_names_start() {
        let err = SweepPlan::new(SweepParams::new(0.2, 0.3, 0.001)).unwrap_err();
        match err {
            KeithleyError::Validation(v) => {
                assert_eq!(v.field, Field::Start);
                assert_eq!(v.field.name(), "start");
                assert_eq!(v.value, 0.2);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_order() {
        // Both step and delta are bad; step is checked first.
        let params = SweepParams::new(0.0, 0.01, 0.0).with_delta(1.0);
        match params.validate().unwrap_err() {
            KeithleyError::Validation(v) => assert_eq!(v.field, Field::Step),
            other => panic!("unexpected {other:?}"),
        }

        // Delay before delta.
        let params = SweepParams::new(0.0, 0.01, 0.001).with_delay(0.0).with_delta(1.0);
        match params.validate().unwrap_err() {
            KeithleyError::Validation(v) => assert_eq!(v.field, Field::Delay),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stop_not_above_start() {
        for (start, stop) in [(0.01, 0.01), (0.01, 0.0), (0.1, -0.1)] {
            let err = SweepParams::new(start, stop, 0.001).validate().unwrap_err();
            assert!(matches!(err, KeithleyError::StopNotAboveStart { .. }));
        }
    }

    #[test]
    fn test_non_finite_rejected() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(SweepParams::new(bad, 0.01, 0.001).validate().is_err());
            assert!(SweepParams::new(0.0, 0.01, 0.001).with_delay(bad).validate().is_err());
        }
    }

    #[test]
    fn test_capacity_limit() {
        let err = SweepPlan::new(SweepParams::new(-0.1, 0.1, 1e-6)).unwrap_err();
        assert!(matches!(
            err,
            KeithleyError::Capacity {
                points: 200_001,
                max: MAX_POINTS
            }
        ));

        // Exactly at capacity is accepted.
        let plan = SweepPlan::new(SweepParams::new(0.0, 0.065529, 1e-6)).unwrap();
        assert_eq!(plan.total_points(), MAX_POINTS);
    }

    #[test]
    fn test_defaults_from_config() {
        let params: SweepParams =
            serde_json::from_str(r#"{"start": 0.0, "stop": 0.01, "step": 0.001}"#).unwrap();
        assert_eq!(params.delay, DEFAULT_DELAY);
        assert_eq!(params.delta, DEFAULT_DELTA);
    }
}
