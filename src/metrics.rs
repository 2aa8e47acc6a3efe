//! Binary classification metrics.

use crate::error::{Error, Result};

/// Confusion counts for the binary bot-detection task, with class 1 (bot)
/// as the positive class.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryConfusion {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl BinaryConfusion {
    pub fn from_predictions(predictions: &[u32], labels: &[u32]) -> Result<Self> {
        if predictions.len() != labels.len() {
            return Err(Error::DimensionMismatch {
                expected: labels.len(),
                got: predictions.len(),
            });
        }
        let mut counts = Self::default();
        for (&p, &l) in predictions.iter().zip(labels.iter()) {
            match (p, l) {
                (1, 1) => counts.true_positive += 1,
                (1, 0) => counts.false_positive += 1,
                (0, 0) => counts.true_negative += 1,
                (0, 1) => counts.false_negative += 1,
                _ => {
                    return Err(Error::Data(format!(
                        "labels must be binary, got prediction {p} / label {l}"
                    )))
                }
            }
        }
        Ok(counts)
    }

    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    pub fn accuracy(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        (self.true_positive + self.true_negative) as f64 / self.total() as f64
    }

    pub fn precision(&self) -> f64 {
        let denom = self.true_positive + self.false_positive;
        if denom == 0 {
            return 0.0;
        }
        self.true_positive as f64 / denom as f64
    }

    pub fn recall(&self) -> f64 {
        let denom = self.true_positive + self.false_negative;
        if denom == 0 {
            return 0.0;
        }
        self.true_positive as f64 / denom as f64
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            return 0.0;
        }
        2.0 * p * r / (p + r)
    }
}

/// Mean and population standard deviation of repeated experiment results.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions() {
        let c = BinaryConfusion::from_predictions(&[0, 1, 1, 0], &[0, 1, 1, 0]).unwrap();
        assert_eq!(c.accuracy(), 1.0);
        assert_eq!(c.f1(), 1.0);
    }

    #[test]
    fn mixed_predictions() {
        // tp=1, fp=1, tn=1, fn=1
        let c = BinaryConfusion::from_predictions(&[1, 1, 0, 0], &[1, 0, 0, 1]).unwrap();
        assert_eq!(c.accuracy(), 0.5);
        assert_eq!(c.precision(), 0.5);
        assert_eq!(c.recall(), 0.5);
        assert_eq!(c.f1(), 0.5);
    }

    #[test]
    fn degenerate_all_negative_predictions() {
        let c = BinaryConfusion::from_predictions(&[0, 0, 0], &[1, 1, 0]).unwrap();
        assert_eq!(c.precision(), 0.0);
        assert_eq!(c.recall(), 0.0);
        assert_eq!(c.f1(), 0.0);
    }

    #[test]
    fn nonbinary_labels_are_rejected() {
        assert!(BinaryConfusion::from_predictions(&[2], &[0]).is_err());
        assert!(BinaryConfusion::from_predictions(&[0, 1], &[0]).is_err());
    }

    #[test]
    fn mean_std_of_constant_sequence() {
        let (m, s) = mean_std(&[0.8, 0.8, 0.8]);
        assert!((m - 0.8).abs() < 1e-12);
        assert!(s.abs() < 1e-12);
    }
}
