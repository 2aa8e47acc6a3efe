//! Adaptation loss terms.
//!
//! The training objective combines four signals: supervised cross-entropy on
//! source labels, a sliced Wasserstein distance aligning the source and
//! target feature distributions (Lee et al., "Sliced Wasserstein
//! Discrepancy", CVPR 2019), a conditional entropy penalty sharpening target
//! predictions, and the virtual adversarial term from [`crate::vat`].

use candle_core::{DType, Tensor, D};

use crate::error::{Error, Result};

/// Probability floor applied before logarithms.
pub const PROB_EPS: f64 = 1e-6;

/// Sliced Wasserstein distance between two feature batches.
///
/// Draws `num_projections` fresh random unit directions, projects both
/// batches onto each, sorts the projections and averages the elementwise
/// `p`-powered differences of the sorted sequences. Batches of unequal size
/// are truncated to the shorter one so the sorted sequences pair up.
pub fn sliced_wasserstein_distance(
    source: &Tensor,
    target: &Tensor,
    num_projections: usize,
    p: f64,
) -> Result<Tensor> {
    let dim = source.dim(1)?;
    if target.dim(1)? != dim {
        return Err(Error::DimensionMismatch {
            expected: dim,
            got: target.dim(1)?,
        });
    }
    let n = source.dim(0)?.min(target.dim(0)?);
    let source = source.narrow(0, 0, n)?;
    let target = target.narrow(0, 0, n)?;

    let theta = Tensor::randn(0f32, 1f32, (num_projections, dim), source.device())?;
    let norms = theta.sqr()?.sum_keepdim(1)?.sqrt()?;
    let theta = theta.broadcast_div(&norms)?;

    // [num_projections, n], sorted along each projection
    let proj_source = sort_rows(&source.matmul(&theta.t()?)?.t()?.contiguous()?)?;
    let proj_target = sort_rows(&target.matmul(&theta.t()?)?.t()?.contiguous()?)?;

    let distance = (proj_target - proj_source)?.powf(p)?;
    Ok(distance.mean_all()?)
}

/// Sort each row ascending, keeping the computation differentiable by
/// routing the values through a gather.
fn sort_rows(x: &Tensor) -> Result<Tensor> {
    let indices = x.arg_sort_last_dim(true)?;
    Ok(x.gather(&indices, D::Minus1)?)
}

/// Mean per-example entropy of a `[batch, classes]` probability tensor.
/// Probabilities below [`PROB_EPS`] are excluded from the sum.
pub fn conditional_entropy(pred: &Tensor) -> Result<Tensor> {
    let mask = pred.ge(PROB_EPS)?.to_dtype(DType::F32)?;
    let log_p = pred.maximum(PROB_EPS)?.log()?;
    let entropy = (pred * log_p)?.mul(&mask)?.sum_all()?.neg()?;
    Ok((entropy / pred.dim(0)? as f64)?)
}

/// Cross-entropy of a `[batch, classes]` probability tensor against u32
/// class labels. Operates on probabilities rather than logits because the
/// classifier's softmax output also feeds probability-space losses.
pub fn cross_entropy_probs(probs: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let picked = probs
        .gather(&labels.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .maximum(PROB_EPS)?;
    Ok(picked.log()?.mean_all()?.neg()?)
}

/// Batch-mean KL divergence `KL(reference || other)` between two probability
/// tensors.
pub fn kl_divergence(reference: &Tensor, other: &Tensor) -> Result<Tensor> {
    let log_ref = reference.maximum(PROB_EPS)?.log()?;
    let log_other = other.maximum(PROB_EPS)?.log()?;
    let per_element = (reference * (log_ref - log_other)?)?;
    Ok((per_element.sum_all()? / reference.dim(0)? as f64)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: Tensor) -> f32 {
        t.to_vec0::<f32>().unwrap()
    }

    #[test]
    fn swd_is_zero_for_identical_batches() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (32, 8), &dev).unwrap();
        let d = scalar(sliced_wasserstein_distance(&x, &x, 64, 1.0).unwrap());
        assert!(d.abs() < 1e-6, "distance between a batch and itself: {d}");
    }

    #[test]
    fn swd_grows_with_separation() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (64, 8), &dev).unwrap();
        let near = Tensor::randn(0f32, 1f32, (64, 8), &dev).unwrap();
        let far = (Tensor::randn(0f32, 1f32, (64, 8), &dev).unwrap() + 10.0).unwrap();
        let d_near = scalar(sliced_wasserstein_distance(&x, &near, 128, 2.0).unwrap());
        let d_far = scalar(sliced_wasserstein_distance(&x, &far, 128, 2.0).unwrap());
        assert!(d_far > d_near, "{d_far} should exceed {d_near}");
    }

    #[test]
    fn swd_truncates_to_shorter_batch() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (20, 4), &dev).unwrap();
        let y = Tensor::randn(0f32, 1f32, (7, 4), &dev).unwrap();
        assert!(sliced_wasserstein_distance(&x, &y, 16, 1.0).is_ok());
    }

    #[test]
    fn entropy_of_uniform_is_ln_two() {
        let dev = Device::Cpu;
        let uniform = Tensor::full(0.5f32, (10, 2), &dev).unwrap();
        let h = scalar(conditional_entropy(&uniform).unwrap());
        assert!((h - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn entropy_of_confident_predictions_is_small() {
        let dev = Device::Cpu;
        let confident =
            Tensor::from_vec(vec![0.999f32, 0.001, 0.001, 0.999], (2, 2), &dev).unwrap();
        let h = scalar(conditional_entropy(&confident).unwrap());
        assert!(h < 0.01, "confident entropy {h}");
    }

    #[test]
    fn entropy_of_one_hot_probabilities_is_zero() {
        let dev = Device::Cpu;
        let one_hot = Tensor::from_vec(vec![1f32, 0., 0., 1.], (2, 2), &dev).unwrap();
        let h = scalar(conditional_entropy(&one_hot).unwrap());
        assert!(h.abs() < 1e-7);
    }

    #[test]
    fn cross_entropy_rewards_correct_confidence() {
        let dev = Device::Cpu;
        let probs = Tensor::from_vec(vec![0.9f32, 0.1, 0.2, 0.8], (2, 2), &dev).unwrap();
        let right = Tensor::from_vec(vec![0u32, 1], (2,), &dev).unwrap();
        let wrong = Tensor::from_vec(vec![1u32, 0], (2,), &dev).unwrap();
        let ce_right = scalar(cross_entropy_probs(&probs, &right).unwrap());
        let ce_wrong = scalar(cross_entropy_probs(&probs, &wrong).unwrap());
        assert!(ce_right < ce_wrong);
    }

    #[test]
    fn kl_of_identical_distributions_is_zero() {
        let dev = Device::Cpu;
        let p = Tensor::from_vec(vec![0.3f32, 0.7, 0.6, 0.4], (2, 2), &dev).unwrap();
        let kl = scalar(kl_divergence(&p, &p).unwrap());
        assert!(kl.abs() < 1e-6);
    }

    #[test]
    fn kl_is_positive_for_distinct_distributions() {
        let dev = Device::Cpu;
        let p = Tensor::from_vec(vec![0.9f32, 0.1], (1, 2), &dev).unwrap();
        let q = Tensor::from_vec(vec![0.2f32, 0.8], (1, 2), &dev).unwrap();
        assert!(scalar(kl_divergence(&p, &q).unwrap()) > 0.0);
    }
}
