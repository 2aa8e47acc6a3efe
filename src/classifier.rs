//! Probability head over fused node features.

use std::cell::{Cell, RefCell};

use candle_core::{Tensor, D};
use candle_nn::{linear, ops, Dropout, Init, Linear, Module, VarBuilder};

use crate::error::Result;

/// Batch normalization over `[batch, features]` activations.
///
/// The affine scale and shift are ordinary trainable parameters; the running
/// mean and variance are buffers held outside the variable map so the
/// optimizer never touches them. `set_tracking(false)` lets a caller run
/// forward passes without polluting the running statistics.
pub struct BatchNorm1d {
    weight: Tensor,
    bias: Tensor,
    running_mean: RefCell<Tensor>,
    running_var: RefCell<Tensor>,
    tracking: Cell<bool>,
    momentum: f64,
    eps: f64,
}

impl BatchNorm1d {
    pub fn new(features: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(features, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(features, "bias", Init::Const(0.0))?;
        let device = weight.device().clone();
        Ok(Self {
            weight,
            bias,
            running_mean: RefCell::new(Tensor::zeros(features, candle_core::DType::F32, &device)?),
            running_var: RefCell::new(Tensor::ones(features, candle_core::DType::F32, &device)?),
            tracking: Cell::new(true),
            momentum: 0.1,
            eps: 1e-5,
        })
    }

    pub fn set_tracking(&self, on: bool) {
        self.tracking.set(on);
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.get()
    }

    /// Overwrite this instance's running statistics with `source`'s.
    pub fn copy_stats_from(&self, source: &Self) {
        self.running_mean
            .replace(source.running_mean.borrow().clone());
        self.running_var.replace(source.running_var.borrow().clone());
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (mean, var) = if train {
            let n = x.dim(0)? as f64;
            let mean = x.mean(0)?;
            let var = x.broadcast_sub(&mean)?.sqr()?.mean(0)?;
            if self.tracking.get() {
                // running variance keeps the unbiased estimate
                let unbiased = if n > 1.0 {
                    (&var * (n / (n - 1.0)))?
                } else {
                    var.clone()
                };
                let new_mean = ((&*self.running_mean.borrow() * (1.0 - self.momentum))?
                    + (mean.detach() * self.momentum)?)?;
                let new_var = ((&*self.running_var.borrow() * (1.0 - self.momentum))?
                    + (unbiased.detach() * self.momentum)?)?;
                self.running_mean.replace(new_mean);
                self.running_var.replace(new_var);
            }
            (mean, var)
        } else {
            (
                self.running_mean.borrow().clone(),
                self.running_var.borrow().clone(),
            )
        };

        let normalized = x
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normalized
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

/// Two-class probability head: `4*hidden -> hidden -> 2` with batch
/// normalization between the layers and a softmax output.
pub struct Classifier {
    output_linear1: Linear,
    output_linear2: Linear,
    batch_norm: BatchNorm1d,
    dropout: Dropout,
}

impl Classifier {
    pub fn new(hidden_size: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            output_linear1: linear(hidden_size * 4, hidden_size, vb.pp("output_linear1"))?,
            output_linear2: linear(hidden_size, 2, vb.pp("output_linear2"))?,
            batch_norm: BatchNorm1d::new(hidden_size, vb.pp("batch_norm"))?,
            dropout: Dropout::new(dropout as f32),
        })
    }

    pub fn norm(&self) -> &BatchNorm1d {
        &self.batch_norm
    }

    /// Map `[batch, 4*hidden]` features to `[batch, 2]` class probabilities.
    pub fn forward_t(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.output_linear1.forward(features)?.relu()?;
        let h = self.dropout.forward(&h, train)?;
        let h = self.batch_norm.forward_t(&h, train)?;
        let logits = self.output_linear2.forward(&h)?;
        Ok(ops::softmax(&logits, D::Minus1)?)
    }
}
