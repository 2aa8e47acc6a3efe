//! Exponential-moving-average teacher models.
//!
//! Adaptation trains a live model but evaluates a shadow copy whose
//! parameters trail the live ones as an exponential moving average
//! (Tarvainen & Valpola, "Mean teachers are better role models", NeurIPS
//! 2017). The shadow is a structurally identical second instantiation from
//! its own variable map; `update` folds the live parameters into it and
//! hard-copies the normalization buffers.

use std::cell::Cell;

use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::warn;

use crate::classifier::Classifier;
use crate::error::Result;
use crate::fusion::FeatureGenerator;

/// A model whose non-parameter state can be mirrored into a second instance.
pub trait EmaModel {
    /// Copy normalization buffers (running statistics) into `target`.
    fn copy_buffers_to(&self, target: &Self) -> Result<()>;
}

impl EmaModel for FeatureGenerator {
    fn copy_buffers_to(&self, _target: &Self) -> Result<()> {
        Ok(())
    }
}

impl EmaModel for Classifier {
    fn copy_buffers_to(&self, target: &Self) -> Result<()> {
        target.norm().copy_stats_from(self.norm());
        Ok(())
    }
}

/// Live model plus its EMA shadow.
pub struct Ema<M> {
    live: M,
    shadow: M,
    live_vars: VarMap,
    shadow_vars: VarMap,
    decay: f64,
    training: Cell<bool>,
}

impl<M: EmaModel> Ema<M> {
    /// Instantiate the model twice from `build` and initialize the shadow
    /// with the live parameter values.
    pub fn new<F>(decay: f64, dtype: DType, device: &Device, build: F) -> Result<Self>
    where
        F: Fn(VarBuilder) -> Result<M>,
    {
        let live_vars = VarMap::new();
        let live = build(VarBuilder::from_varmap(&live_vars, dtype, device))?;
        let shadow_vars = VarMap::new();
        let shadow = build(VarBuilder::from_varmap(&shadow_vars, dtype, device))?;

        {
            let live_data = live_vars.data().lock().unwrap();
            let shadow_data = shadow_vars.data().lock().unwrap();
            for (name, var) in live_data.iter() {
                shadow_data[name].set(var.as_tensor())?;
            }
        }
        live.copy_buffers_to(&shadow)?;

        Ok(Self {
            live,
            shadow,
            live_vars,
            shadow_vars,
            decay,
            training: Cell::new(true),
        })
    }

    pub fn set_training(&self, on: bool) {
        self.training.set(on);
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// The model the current mode dispatches to: live in training, shadow in
    /// evaluation.
    pub fn active(&self) -> &M {
        if self.training.get() {
            &self.live
        } else {
            &self.shadow
        }
    }

    pub fn live(&self) -> &M {
        &self.live
    }

    /// Parameters the optimizer should own. Shadow variables never receive
    /// gradients.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.live_vars.all_vars()
    }

    /// Fold the live parameters into the shadow:
    /// `shadow = decay * shadow + (1 - decay) * live`, then hard-copy the
    /// buffers. A no-op outside training.
    pub fn update(&self) -> Result<()> {
        if !self.training.get() {
            warn!("ema update called outside training, skipping");
            return Ok(());
        }

        {
            let live_data = self.live_vars.data().lock().unwrap();
            let shadow_data = self.shadow_vars.data().lock().unwrap();

            let mut live_keys: Vec<&String> = live_data.keys().collect();
            let mut shadow_keys: Vec<&String> = shadow_data.keys().collect();
            live_keys.sort();
            shadow_keys.sort();
            assert_eq!(live_keys, shadow_keys, "live/shadow parameter sets diverged");

            for (name, live_var) in live_data.iter() {
                let shadow_var = &shadow_data[name];
                let blended = ((shadow_var.as_tensor() * self.decay)?
                    + (live_var.as_tensor() * (1.0 - self.decay))?)?;
                shadow_var.set(&blended)?;
            }
        }
        self.live.copy_buffers_to(&self.shadow)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use candle_nn::Init;

    struct Scalar {
        value: Tensor,
    }

    impl Scalar {
        fn build(vb: VarBuilder) -> Result<Self> {
            Ok(Self {
                value: vb.get_with_hints(1, "value", Init::Const(0.0))?,
            })
        }

        fn get(&self) -> f32 {
            self.value.to_vec1::<f32>().unwrap()[0]
        }
    }

    impl EmaModel for Scalar {
        fn copy_buffers_to(&self, _target: &Self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn shadow_starts_equal_to_live() {
        let ema = Ema::new(0.9, DType::F32, &Device::Cpu, Scalar::build).unwrap();
        assert_eq!(ema.live.get(), ema.shadow.get());
    }

    #[test]
    fn update_blends_toward_live() {
        let ema = Ema::new(0.9, DType::F32, &Device::Cpu, Scalar::build).unwrap();
        let ones = Tensor::ones(1, DType::F32, &Device::Cpu).unwrap();
        ema.live_vars.data().lock().unwrap()["value"].set(&ones).unwrap();

        ema.update().unwrap();
        // shadow = 0.9*0 + 0.1*1
        assert!((ema.shadow.get() - 0.1).abs() < 1e-6);
        ema.update().unwrap();
        assert!((ema.shadow.get() - 0.19).abs() < 1e-6);
    }

    #[test]
    fn update_is_noop_outside_training() {
        let ema = Ema::new(0.5, DType::F32, &Device::Cpu, Scalar::build).unwrap();
        let ones = Tensor::ones(1, DType::F32, &Device::Cpu).unwrap();
        ema.live_vars.data().lock().unwrap()["value"].set(&ones).unwrap();

        ema.set_training(false);
        ema.update().unwrap();
        assert_eq!(ema.shadow.get(), 0.0);
    }

    #[test]
    #[should_panic(expected = "diverged")]
    fn mismatched_parameter_sets_are_fatal() {
        let ema = Ema::new(0.5, DType::F32, &Device::Cpu, Scalar::build).unwrap();
        let stray = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        ema.live_vars
            .data()
            .lock()
            .unwrap()
            .insert("stray".to_string(), stray);
        let _ = ema.update();
    }

    #[test]
    fn mode_selects_the_model() {
        let ema = Ema::new(0.5, DType::F32, &Device::Cpu, Scalar::build).unwrap();
        let ones = Tensor::ones(1, DType::F32, &Device::Cpu).unwrap();
        ema.live_vars.data().lock().unwrap()["value"].set(&ones).unwrap();

        assert_eq!(ema.active().get(), 1.0);
        ema.set_training(false);
        assert_eq!(ema.active().get(), 0.0);
    }
}
