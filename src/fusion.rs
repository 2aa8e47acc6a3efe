//! Modality encoders and attention fusion.
//!
//! Three per-node views are embedded into a shared hidden space: metadata
//! and text through two-layer MLPs, the graph view through the relational
//! encoder over the (detached) concatenation of the other two. A multi-head
//! self-attention block then mixes the three embeddings as a length-3
//! sequence; its head-averaged attention map is projected into a fourth
//! "interaction" embedding, and the four are concatenated into the final
//! `[batch, 4*hidden]` representation.

use candle_core::{Tensor, D};
use candle_nn::{linear, ops, Dropout, Linear, Module, VarBuilder};

use crate::conv::RgcnEncoder;
use crate::error::Result;
use crate::sampler::GraphBatch;

/// Two-layer perceptron: `linear -> relu -> linear -> relu -> dropout`.
pub struct Mlp2L {
    linear1: Linear,
    linear2: Linear,
    dropout: Dropout,
}

impl Mlp2L {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
        dropout: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            linear1: linear(input_size, hidden_size, vb.pp("linear1"))?,
            linear2: linear(hidden_size, output_size, vb.pp("linear2"))?,
            dropout: Dropout::new(dropout as f32),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.linear1.forward(x)?.relu()?;
        let h = self.linear2.forward(&h)?.relu()?;
        Ok(self.dropout.forward(&h, train)?)
    }
}

/// Multi-head self-attention over a fixed-length modality sequence.
///
/// Returns both the attended sequence and the head-averaged attention map,
/// which downstream code treats as a cross-modality interaction signature.
struct ModalityAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl ModalityAttention {
    fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            q_proj: linear(hidden_size, hidden_size, vb.pp("q_proj"))?,
            k_proj: linear(hidden_size, hidden_size, vb.pp("k_proj"))?,
            v_proj: linear(hidden_size, hidden_size, vb.pp("v_proj"))?,
            out_proj: linear(hidden_size, hidden_size, vb.pp("out_proj"))?,
            num_heads,
            head_dim: hidden_size / num_heads,
        })
    }

    /// `x` is `[batch, seq, hidden]`; returns the attended `[batch, seq,
    /// hidden]` sequence and the `[batch, seq, seq]` head-averaged weights.
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, seq, _) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(self.q_proj.forward(x)?)?;
        let k = split(self.k_proj.forward(x)?)?;
        let v = split(self.v_proj.forward(x)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let weights = ops::softmax(&scores, D::Minus1)?;

        let attended = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.num_heads * self.head_dim))?;
        let attended = self.out_proj.forward(&attended)?;
        let averaged = weights.mean(1)?;
        Ok((attended, averaged))
    }
}

/// Fused per-node feature generator.
pub struct FeatureGenerator {
    graph_encoder: RgcnEncoder,
    text_encoder: Mlp2L,
    meta_encoder: Mlp2L,
    attention: ModalityAttention,
    con_linear: Linear,
    hidden_size: usize,
}

impl FeatureGenerator {
    pub fn new(
        hidden_size: usize,
        text_input_size: usize,
        meta_input_size: usize,
        dropout: f64,
        num_relations: usize,
        att_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            graph_encoder: RgcnEncoder::new(
                hidden_size,
                num_relations,
                dropout,
                vb.pp("graph_encoder"),
            )?,
            text_encoder: Mlp2L::new(
                text_input_size,
                hidden_size,
                hidden_size,
                dropout,
                vb.pp("text_encoder"),
            )?,
            meta_encoder: Mlp2L::new(
                meta_input_size,
                hidden_size,
                hidden_size,
                dropout,
                vb.pp("meta_encoder"),
            )?,
            attention: ModalityAttention::new(hidden_size, att_heads, vb.pp("attention"))?,
            con_linear: linear(3 * 3, hidden_size, vb.pp("con_linear"))?,
            hidden_size,
        })
    }

    pub fn output_size(&self) -> usize {
        self.hidden_size * 4
    }

    /// Encode all nodes of a batch into `[num_nodes, 4*hidden]` features.
    ///
    /// `meta` and `text` are passed separately from `batch` so callers can
    /// substitute perturbed inputs while reusing the batch topology.
    pub fn forward_t(
        &self,
        meta: &Tensor,
        text: &Tensor,
        batch: &GraphBatch,
        train: bool,
    ) -> Result<Tensor> {
        let meta_feature = self.meta_encoder.forward_t(meta, train)?;
        let text_feature = self.text_encoder.forward_t(text, train)?;

        // The graph branch sees the modality embeddings as fixed inputs;
        // gradients reach the MLP encoders only through the attention path.
        let graph_input = Tensor::cat(&[meta_feature.detach(), text_feature.detach()], 1)?;
        let graph_feature = self.graph_encoder.forward_t(&graph_input, batch, train)?;

        let sequence = Tensor::stack(&[&graph_feature, &text_feature, &meta_feature], 1)?;
        let (attended, att_map) = self.attention.forward(&sequence)?;

        let graph_feature = attended.narrow(1, 0, 1)?.squeeze(1)?;
        let text_feature = attended.narrow(1, 1, 1)?.squeeze(1)?;
        let meta_feature = attended.narrow(1, 2, 1)?.squeeze(1)?;

        let interaction = self
            .con_linear
            .forward(&att_map.reshape((att_map.dim(0)?, 9))?)?;

        Ok(Tensor::cat(
            &[graph_feature, text_feature, meta_feature, interaction],
            1,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn toy_batch(n: usize, meta_dim: usize, text_dim: usize) -> GraphBatch {
        let dev = Device::Cpu;
        GraphBatch {
            meta: Tensor::randn(0f32, 1f32, (n, meta_dim), &dev).unwrap(),
            text: Tensor::randn(0f32, 1f32, (n, text_dim), &dev).unwrap(),
            labels: Tensor::zeros((n,), DType::U32, &dev).unwrap(),
            edges: (0..n as u32 - 1).map(|i| (i, i + 1)).collect(),
            edge_types: (0..n as u32 - 1).map(|i| i % 2).collect(),
            batch_size: n,
            num_nodes: n,
        }
    }

    #[test]
    fn fused_feature_is_four_times_hidden() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let gen = FeatureGenerator::new(8, 6, 4, 0.0, 2, 2, vb).unwrap();

        let batch = toy_batch(5, 4, 6);
        let out = gen
            .forward_t(&batch.meta, &batch.text, &batch, false)
            .unwrap();
        assert_eq!(out.dims(), &[5, 32]);
    }

    #[test]
    fn attention_weights_rows_sum_to_one() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = ModalityAttention::new(8, 2, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (4, 3, 8), &dev).unwrap();
        let (out, weights) = attn.forward(&x).unwrap();
        assert_eq!(out.dims(), &[4, 3, 8]);
        assert_eq!(weights.dims(), &[4, 3, 3]);
        let sums = weights.sum(D::Minus1).unwrap().flatten_all().unwrap();
        for s in sums.to_vec1::<f32>().unwrap() {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn mlp_output_is_nonnegative() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mlp = Mlp2L::new(4, 8, 8, 0.0, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (3, 4), &dev).unwrap();
        let out = mlp.forward_t(&x, false).unwrap();
        assert!(out
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|&v| v >= 0.0));
    }
}
