//! Capital recovery schedules and the year-axis series operations used to
//! amortize investment streams.
//!
//! Series are dense `f64` vectors over a contiguous, ascending year axis with
//! `NaN` marking a missing year.

use crate::models::RunConfig;
use serde::{Deserialize, Serialize};

/// Where the per-year capital recovery factor comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrfSource {
    /// Closed-form annuity over `sys_eval_years` at the run discount rate.
    User,
    /// The model's own CRF series.
    #[default]
    Model,
}

/// When capital payments start relative to the investment year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapitalTiming {
    /// Loan-style payments starting the year after the investment.
    #[default]
    NextYear,
    /// Payments start in the investment year; the CRF is divided by `1+d`
    /// to keep the present value unchanged.
    SameYear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrfSchedule {
    factors: Vec<f64>,
}

impl CrfSchedule {
    /// Constant closed-form factor for every year of the axis.
    pub fn user(config: &RunConfig, periods: u32, years: &[i32]) -> Self {
        let crf = config.capital_recovery_factor(periods);
        Self {
            factors: vec![crf; years.len()],
        }
    }

    /// Model-supplied sparse series placed on the axis. Points off the axis
    /// are ignored; gaps are interpolated linearly, the last known value is
    /// held to the end and the first known value is carried backwards.
    pub fn from_model(points: &[(i32, f64)], years: &[i32]) -> Self {
        let mut factors = vec![f64::NAN; years.len()];
        for (year, crf) in points {
            if let Some(pos) = years.iter().position(|y| y == year) {
                factors[pos] = *crf;
            }
        }
        interpolate_linear(&mut factors);
        backward_fill(&mut factors);
        Self { factors }
    }

    /// Adjust the schedule for the capital timing convention.
    pub fn with_timing(mut self, timing: CapitalTiming, discount_rate: f64) -> Self {
        if timing == CapitalTiming::SameYear {
            for crf in &mut self.factors {
                *crf /= 1.0 + discount_rate;
            }
        }
        self
    }

    pub fn factors(&self) -> &[f64] {
        &self.factors
    }
}

/// Interior gaps become straight lines between neighbours; trailing gaps take
/// the last known value. Leading gaps are left alone.
pub fn interpolate_linear(values: &mut [f64]) {
    let mut last_known: Option<usize> = None;
    for i in 0..values.len() {
        if values[i].is_nan() {
            continue;
        }
        if let Some(prev) = last_known {
            let span = (i - prev) as f64;
            for j in prev + 1..i {
                let t = (j - prev) as f64 / span;
                values[j] = values[prev] + t * (values[i] - values[prev]);
            }
        }
        last_known = Some(i);
    }
    if let Some(last) = last_known {
        let held = values[last];
        for value in &mut values[last + 1..] {
            *value = held;
        }
    }
}

pub fn backward_fill(values: &mut [f64]) {
    if let Some(first) = values.iter().position(|v| !v.is_nan()) {
        let held = values[first];
        for value in &mut values[..first] {
            *value = held;
        }
    }
}

/// Move every value one year later; the first year becomes missing.
pub fn shift_forward(values: &[f64]) -> Vec<f64> {
    let mut shifted = Vec::with_capacity(values.len());
    if !values.is_empty() {
        shifted.push(f64::NAN);
        shifted.extend_from_slice(&values[..values.len() - 1]);
    }
    shifted
}

/// Trailing sum over `window` years. Years without a full window, or whose
/// window holds a missing value, are missing. A zero window yields nothing.
pub fn rolling_sum(values: &[f64], window: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| {
            if window == 0 || i + 1 < window {
                return f64::NAN;
            }
            values[i + 1 - window..=i].iter().sum()
        })
        .collect()
}

/// Carry each value forward over at most `limit` following missing years.
pub fn forward_fill(values: &mut [f64], limit: usize) {
    let mut carried: Option<f64> = None;
    let mut run = 0;
    for value in values.iter_mut() {
        if value.is_nan() {
            if let Some(v) = carried {
                if run < limit {
                    *value = v;
                    run += 1;
                }
            }
        } else {
            carried = Some(*value);
            run = 0;
        }
    }
}
