//! Community dataset loading and preparation.
//!
//! Each community `c` persists one `com{c}.safetensors` file with the
//! index-aligned per-node tensors `label`, `text` and `meta`, the `[2, E]`
//! `edge_index` tensor and the `[E]` `edge_type` tensor, plus optional
//! `meta_mean` / `meta_std` normalization statistics used for
//! cross-community meta alignment.

use std::path::Path;

use candle_core::{safetensors, DType, Device, Tensor};
use tracing::info;

use crate::error::{Error, Result};

/// Raw edge-type value that is collapsed onto canonical relation id 1.
const COLLAPSED_RAW_TYPE: i64 = 12;

/// Per-community meta-feature normalization statistics.
#[derive(Debug, Clone)]
pub struct MetaStats {
    pub mean: Tensor,
    pub std: Tensor,
}

/// A node-labeled, edge-typed community graph.
#[derive(Debug)]
pub struct CommunityData {
    pub num_nodes: usize,
    /// Binary node labels, `[N]` u32.
    pub label: Tensor,
    /// Text embeddings, `[N, text_dim]` f32.
    pub text: Tensor,
    /// Metadata features, `[N, meta_dim]` f32.
    pub meta: Tensor,
    /// Directed edges as (source, destination) node indices.
    pub edges: Vec<(u32, u32)>,
    /// Canonical relation id per edge, aligned with `edges`.
    pub edge_types: Vec<u32>,
    /// Normalization statistics, present when the artifact carries them.
    pub meta_stats: Option<MetaStats>,
}

impl CommunityData {
    /// Load a community from `root/com{id}.safetensors` and log its shape
    /// summary.
    pub fn load(root: &Path, id: usize, num_relations: usize, device: &Device) -> Result<Self> {
        let path = root.join(format!("com{id}.safetensors"));
        let tensors = safetensors::load(&path, device)?;
        let get = |name: &str| {
            tensors
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Data(format!("{} is missing tensor `{name}`", path.display())))
        };

        let label = get("label")?.to_dtype(DType::U32)?;
        let text = get("text")?.to_dtype(DType::F32)?;
        let meta = get("meta")?.to_dtype(DType::F32)?;
        let edge_index = get("edge_index")?.to_dtype(DType::I64)?;
        let edge_type = get("edge_type")?.to_dtype(DType::I64)?;
        let meta_stats = match (tensors.get("meta_mean"), tensors.get("meta_std")) {
            (Some(mean), Some(std)) => Some(MetaStats {
                mean: mean.to_dtype(DType::F32)?,
                std: std.to_dtype(DType::F32)?,
            }),
            _ => None,
        };

        info!(
            community = id,
            label = ?label.dims(),
            meta = ?meta.dims(),
            text = ?text.dims(),
            edge_index = ?edge_index.dims(),
            edge_type = ?edge_type.dims(),
            "loaded community"
        );

        let rows = edge_index.to_vec2::<i64>()?;
        if rows.len() != 2 {
            return Err(Error::Data(format!(
                "edge_index must be [2, E], got {:?}",
                edge_index.dims()
            )));
        }
        let raw_types = edge_type.to_vec1::<i64>()?;
        let edges: Vec<(u32, u32)> = rows[0]
            .iter()
            .zip(rows[1].iter())
            .map(|(&s, &d)| (s as u32, d as u32))
            .collect();

        Self::from_parts(label, text, meta, edges, raw_types, num_relations, meta_stats)
    }

    /// Assemble and validate a community graph from already-materialized
    /// parts. Raw edge types are canonicalized before validation.
    pub fn from_parts(
        label: Tensor,
        text: Tensor,
        meta: Tensor,
        edges: Vec<(u32, u32)>,
        raw_edge_types: Vec<i64>,
        num_relations: usize,
        meta_stats: Option<MetaStats>,
    ) -> Result<Self> {
        let num_nodes = label.dim(0)?;
        if text.dim(0)? != num_nodes {
            return Err(Error::DimensionMismatch {
                expected: num_nodes,
                got: text.dim(0)?,
            });
        }
        if meta.dim(0)? != num_nodes {
            return Err(Error::DimensionMismatch {
                expected: num_nodes,
                got: meta.dim(0)?,
            });
        }
        if raw_edge_types.len() != edges.len() {
            return Err(Error::DimensionMismatch {
                expected: edges.len(),
                got: raw_edge_types.len(),
            });
        }
        for &(s, d) in &edges {
            if s as usize >= num_nodes || d as usize >= num_nodes {
                return Err(Error::Data(format!(
                    "edge ({s}, {d}) references a node outside 0..{num_nodes}"
                )));
            }
        }

        let edge_types = canonicalize_edge_types(&raw_edge_types, num_relations)?;

        Ok(Self {
            num_nodes,
            label,
            text,
            meta,
            edges,
            edge_types,
            meta_stats,
        })
    }

    /// Re-express this community's meta features in the `source`
    /// normalization frame:
    ///
    /// `meta' = (meta * own_std + own_mean - source_mean) / source_std`
    ///
    /// Identity when both communities share the same statistics.
    pub fn align_meta(&mut self, source: &MetaStats) -> Result<()> {
        let own = self
            .meta_stats
            .as_ref()
            .ok_or_else(|| Error::Data("meta alignment needs own meta_mean/meta_std".into()))?;
        let denorm = self
            .meta
            .broadcast_mul(&own.std)?
            .broadcast_add(&own.mean)?;
        self.meta = denorm
            .broadcast_sub(&source.mean)?
            .broadcast_div(&source.std)?;
        Ok(())
    }
}

/// Collapse raw edge-type values onto canonical relation ids and verify the
/// result is dense in `0..num_relations`.
pub fn canonicalize_edge_types(raw: &[i64], num_relations: usize) -> Result<Vec<u32>> {
    raw.iter()
        .map(|&t| {
            let id = if t == COLLAPSED_RAW_TYPE { 1 } else { t };
            if id < 0 || id as usize >= num_relations {
                return Err(Error::Data(format!(
                    "edge type {t} maps to relation {id}, outside 0..{num_relations}"
                )));
            }
            Ok(id as u32)
        })
        .collect()
}

/// Disjoint train/eval/test node index sets of one community.
#[derive(Debug, Clone)]
pub struct NodeSplit {
    pub train: Vec<u32>,
    pub eval: Vec<u32>,
    pub test: Vec<u32>,
}

/// Randomly partition `num_nodes` nodes by ratio; the test split takes the
/// remainder after train and eval.
pub fn random_node_split(
    num_nodes: usize,
    train_ratio: f64,
    eval_ratio: f64,
    seed: u64,
) -> Result<NodeSplit> {
    if train_ratio + eval_ratio >= 1.0 {
        return Err(Error::InvalidConfig(format!(
            "split ratios {train_ratio} + {eval_ratio} leave no test nodes"
        )));
    }
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let mut order: Vec<u32> = (0..num_nodes as u32).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let n_train = (num_nodes as f64 * train_ratio).round() as usize;
    let n_eval = (num_nodes as f64 * eval_ratio).round() as usize;
    let n_eval_end = (n_train + n_eval).min(num_nodes);

    Ok(NodeSplit {
        train: order[..n_train].to_vec(),
        eval: order[n_train..n_eval_end].to_vec(),
        test: order[n_eval_end..].to_vec(),
    })
}
