//! Virtual adversarial training.
//!
//! Computes the local distributional smoothness term of Miyato et al.
//! ("Virtual Adversarial Training", TPAMI 2019): a power iteration finds the
//! input perturbation of the metadata and text views that most changes the
//! classifier output, then the loss is the KL divergence between the clean
//! and adversarially perturbed predictions. Normalization statistics are
//! frozen while perturbed passes run so adversarial inputs never leak into
//! the running estimates.

use candle_core::{Tensor, Var};

use crate::classifier::{BatchNorm1d, Classifier};
use crate::error::{Error, Result};
use crate::fusion::FeatureGenerator;
use crate::losses::kl_divergence;
use crate::sampler::GraphBatch;

/// Virtual adversarial loss over a sampled batch.
pub struct VatLoss {
    /// Scale of the probe perturbation used during power iteration.
    pub xi: f64,
    /// Radius of the final adversarial perturbation.
    pub eps: f64,
    /// Power iteration count.
    pub power_iterations: usize,
}

impl Default for VatLoss {
    fn default() -> Self {
        Self {
            xi: 10.0,
            eps: 1.0,
            power_iterations: 1,
        }
    }
}

/// Scoped batch-norm tracking freeze; the previous state is restored when
/// the guard drops, on every exit path.
struct FrozenStats<'a> {
    norm: &'a BatchNorm1d,
    previous: bool,
}

impl<'a> FrozenStats<'a> {
    fn new(norm: &'a BatchNorm1d) -> Self {
        let previous = norm.is_tracking();
        norm.set_tracking(false);
        Self { norm, previous }
    }
}

impl Drop for FrozenStats<'_> {
    fn drop(&mut self) {
        self.norm.set_tracking(self.previous);
    }
}

/// Row-wise L2 normalization of a `[batch, features]` perturbation.
fn l2_normalize(d: &Tensor) -> Result<Tensor> {
    let norm = d.sqr()?.sum_keepdim(1)?.sqrt()?;
    Ok(d.broadcast_div(&(norm + 1e-8)?)?)
}

impl VatLoss {
    pub fn forward(
        &self,
        generator: &FeatureGenerator,
        classifier: &Classifier,
        batch: &GraphBatch,
    ) -> Result<Tensor> {
        // Clean reference prediction; detached so the loss only pushes the
        // perturbed branch toward it.
        let reference = {
            let features = generator.forward_t(&batch.meta, &batch.text, batch, true)?;
            let seeds = features.narrow(0, 0, batch.batch_size)?;
            classifier.forward_t(&seeds, true)?.detach()
        };

        let device = batch.meta.device();
        let mut d_meta =
            l2_normalize(&(Tensor::rand(0f32, 1f32, batch.meta.dims(), device)? - 0.5)?)?;
        let mut d_text =
            l2_normalize(&(Tensor::rand(0f32, 1f32, batch.text.dims(), device)? - 0.5)?)?;

        let _frozen = FrozenStats::new(classifier.norm());

        for _ in 0..self.power_iterations {
            let probe_meta = Var::from_tensor(&d_meta)?;
            let probe_text = Var::from_tensor(&d_text)?;
            let meta_hat = (&batch.meta + (probe_meta.as_tensor() * self.xi)?)?;
            let text_hat = (&batch.text + (probe_text.as_tensor() * self.xi)?)?;

            let features = generator.forward_t(&meta_hat, &text_hat, batch, true)?;
            let pred_hat = classifier.forward_t(&features.narrow(0, 0, batch.batch_size)?, true)?;
            let divergence = kl_divergence(&reference, &pred_hat)?;
            let grads = divergence.backward()?;

            let grad_meta = grads
                .get(&probe_meta)
                .ok_or_else(|| Error::Training("no gradient reached the meta probe".into()))?;
            let grad_text = grads
                .get(&probe_text)
                .ok_or_else(|| Error::Training("no gradient reached the text probe".into()))?;
            d_meta = l2_normalize(grad_meta)?;
            d_text = l2_normalize(grad_text)?;
        }

        let meta_hat = (&batch.meta + (d_meta.detach() * self.eps)?)?;
        let text_hat = (&batch.text + (d_text.detach() * self.eps)?)?;
        let features = generator.forward_t(&meta_hat, &text_hat, batch, true)?;
        let pred_hat = classifier.forward_t(&features.narrow(0, 0, batch.batch_size)?, true)?;
        kl_divergence(&reference, &pred_hat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn toy_setup() -> (FeatureGenerator, Classifier, GraphBatch) {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let generator = FeatureGenerator::new(8, 6, 4, 0.0, 2, 2, vb.pp("f")).unwrap();
        let classifier = Classifier::new(8, 0.0, vb.pp("c")).unwrap();

        let n = 6;
        let batch = GraphBatch {
            meta: Tensor::randn(0f32, 1f32, (n, 4), &dev).unwrap(),
            text: Tensor::randn(0f32, 1f32, (n, 6), &dev).unwrap(),
            labels: Tensor::zeros((n,), DType::U32, &dev).unwrap(),
            edges: (0..n as u32 - 1).map(|i| (i, i + 1)).collect(),
            edge_types: (0..n as u32 - 1).map(|i| i % 2).collect(),
            batch_size: 4,
            num_nodes: n,
        };
        (generator, classifier, batch)
    }

    #[test]
    fn loss_is_finite_and_nonnegative() {
        let (generator, classifier, batch) = toy_setup();
        let loss = VatLoss::default()
            .forward(&generator, &classifier, &batch)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(loss.is_finite());
        assert!(loss > -1e-5, "kl-based loss should be nonnegative: {loss}");
    }

    #[test]
    fn tracking_state_is_restored() {
        let (generator, classifier, batch) = toy_setup();
        assert!(classifier.norm().is_tracking());
        VatLoss::default()
            .forward(&generator, &classifier, &batch)
            .unwrap();
        assert!(classifier.norm().is_tracking());
    }

    #[test]
    fn normalized_rows_have_unit_norm() {
        let dev = Device::Cpu;
        let d = Tensor::randn(0f32, 3f32, (5, 7), &dev).unwrap();
        let n = l2_normalize(&d).unwrap();
        for row in n.to_vec2::<f32>().unwrap() {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }
}
