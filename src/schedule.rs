//! Source-signal-annealing (SSA) schedules.
//!
//! During adaptation the supervised signal from the source community is
//! gradually down-weighted so that the later iterations are dominated by the
//! target-side alignment losses. The schedule maps a step index onto a
//! ratio in `[0, 1]` that scales the source classification and source VAT
//! losses.

use std::f64::consts::FRAC_PI_2;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Annealing schedule for the source-domain loss weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsaSchedule {
    /// Annealing disabled: ratio is always 1.
    Constant,
    /// `1 - t/T`
    Linear,
    /// `cos(t/T * pi/2)`
    Cosine,
    /// `1 - sin(t/T * pi/2)`
    Sine,
}

impl FromStr for SsaSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "cos" => Ok(Self::Cosine),
            "sin" => Ok(Self::Sine),
            other => Err(Error::InvalidConfig(format!(
                "unknown annealing schedule `{other}` (expected linear, cos or sin)"
            ))),
        }
    }
}

impl SsaSchedule {
    /// Ratio at step `t` of a `total`-step run. Monotone non-increasing in
    /// `t` and bounded to `[0, 1]` for `t <= total`.
    pub fn ratio(&self, t: usize, total: usize) -> f64 {
        let frac = t as f64 / total as f64;
        match self {
            Self::Constant => 1.0,
            Self::Linear => 1.0 - frac,
            Self::Cosine => (frac * FRAC_PI_2).cos(),
            Self::Sine => 1.0 - (frac * FRAC_PI_2).sin(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: usize = 5_000;

    #[test]
    fn schedules_stay_in_unit_interval() {
        for schedule in [
            SsaSchedule::Constant,
            SsaSchedule::Linear,
            SsaSchedule::Cosine,
            SsaSchedule::Sine,
        ] {
            for t in (0..=T).step_by(50) {
                let r = schedule.ratio(t, T);
                assert!((0.0..=1.0).contains(&r), "{schedule:?} at {t}: {r}");
            }
        }
    }

    #[test]
    fn schedule_endpoints() {
        assert_eq!(SsaSchedule::Linear.ratio(0, T), 1.0);
        assert_eq!(SsaSchedule::Linear.ratio(T, T), 0.0);
        assert!((SsaSchedule::Cosine.ratio(0, T) - 1.0).abs() < 1e-12);
        assert!((SsaSchedule::Sine.ratio(0, T) - 1.0).abs() < 1e-12);
        assert!(SsaSchedule::Cosine.ratio(T, T).abs() < 1e-12);
        assert!(SsaSchedule::Sine.ratio(T, T).abs() < 1e-12);
    }

    #[test]
    fn unknown_schedule_name_is_config_error() {
        let err = "cosine_warmup".parse::<SsaSchedule>().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn known_names_parse() {
        assert_eq!("linear".parse::<SsaSchedule>().unwrap(), SsaSchedule::Linear);
        assert_eq!("cos".parse::<SsaSchedule>().unwrap(), SsaSchedule::Cosine);
        assert_eq!("sin".parse::<SsaSchedule>().unwrap(), SsaSchedule::Sine);
    }
}
