//! Neighbor-sampling mini-batch construction.
//!
//! Batches are induced subgraphs grown around a window of seed nodes: every
//! pass shuffles the seed order, then each batch takes `batch_size` seeds and
//! expands them over a fixed number of hops, keeping at most `fanout`
//! incoming edges per node and hop. The seeds always occupy the leading rows
//! of the batch tensors, so downstream losses can truncate to `batch_size`
//! and treat the remaining rows as message-passing support only.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;

use crate::data::CommunityData;
use crate::error::{Error, Result};

/// One sampled subgraph batch.
#[derive(Debug)]
pub struct GraphBatch {
    /// Metadata features of all batch nodes, `[n, meta_dim]`.
    pub meta: Tensor,
    /// Text features of all batch nodes, `[n, text_dim]`.
    pub text: Tensor,
    /// Labels of all batch nodes, `[n]` u32.
    pub labels: Tensor,
    /// Edges re-indexed into the batch's local node space.
    pub edges: Vec<(u32, u32)>,
    /// Relation id per local edge.
    pub edge_types: Vec<u32>,
    /// Number of leading seed nodes; only these enter losses and metrics.
    pub batch_size: usize,
    /// Total node count including sampled support nodes.
    pub num_nodes: usize,
}

/// Restartable neighbor sampler over a fixed seed set.
pub struct NeighborSampler<'a> {
    data: &'a CommunityData,
    /// Incoming (source, relation) pairs per node.
    incoming: Vec<Vec<(u32, u32)>>,
    order: Vec<u32>,
    batch_size: usize,
    fanout: usize,
    hops: usize,
    rng: StdRng,
}

impl<'a> NeighborSampler<'a> {
    /// Build a sampler whose passes iterate `seeds` in shuffled order.
    pub fn new(
        data: &'a CommunityData,
        seeds: Vec<u32>,
        batch_size: usize,
        fanout: usize,
        hops: usize,
        seed: u64,
    ) -> Result<Self> {
        if seeds.is_empty() {
            return Err(Error::Data("sampler needs at least one seed node".into()));
        }
        let mut incoming = vec![Vec::new(); data.num_nodes];
        for (&(src, dst), &rel) in data.edges.iter().zip(data.edge_types.iter()) {
            incoming[dst as usize].push((src, rel));
        }
        Ok(Self {
            data,
            incoming,
            order: seeds,
            batch_size,
            fanout,
            hops,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Number of batches per pass over the seed set.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Start a new pass: reshuffle the seed order.
    pub fn reshuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
    }

    /// Sample the `i`-th batch of the current pass.
    pub fn batch(&mut self, i: usize) -> Result<GraphBatch> {
        let start = i * self.batch_size;
        if start >= self.order.len() {
            return Err(Error::Data(format!(
                "batch index {i} out of range for {} seeds",
                self.order.len()
            )));
        }
        let end = (start + self.batch_size).min(self.order.len());
        let seeds = &self.order[start..end];

        // Seeds take local ids 0..batch_size; support nodes follow in
        // discovery order.
        let mut local: HashMap<u32, u32> = HashMap::new();
        let mut nodes: Vec<u32> = Vec::with_capacity(seeds.len());
        for &s in seeds {
            local.insert(s, nodes.len() as u32);
            nodes.push(s);
        }

        let mut edges: Vec<(u32, u32)> = Vec::new();
        let mut edge_types: Vec<u32> = Vec::new();
        let mut frontier: Vec<u32> = seeds.to_vec();

        for _ in 0..self.hops {
            let mut next_frontier = Vec::new();
            for &dst in &frontier {
                let candidates = &self.incoming[dst as usize];
                let sampled: Vec<(u32, u32)> = if candidates.len() > self.fanout {
                    candidates
                        .choose_multiple(&mut self.rng, self.fanout)
                        .copied()
                        .collect()
                } else {
                    candidates.clone()
                };
                let dst_local = local[&dst];
                for (src, rel) in sampled {
                    let src_local = *local.entry(src).or_insert_with(|| {
                        nodes.push(src);
                        next_frontier.push(src);
                        (nodes.len() - 1) as u32
                    });
                    edges.push((src_local, dst_local));
                    edge_types.push(rel);
                }
            }
            frontier = next_frontier;
        }

        let device = self.data.text.device();
        let index = Tensor::from_vec(nodes.clone(), (nodes.len(),), device)?;
        Ok(GraphBatch {
            meta: self.data.meta.index_select(&index, 0)?,
            text: self.data.text.index_select(&index, 0)?,
            labels: self.data.label.index_select(&index, 0)?,
            edges,
            edge_types,
            batch_size: seeds.len(),
            num_nodes: nodes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CommunityData;
    use candle_core::{DType, Device, Tensor};

    fn chain_community(n: usize) -> CommunityData {
        let dev = Device::Cpu;
        let label = Tensor::from_vec((0..n as u32).map(|i| i % 2).collect(), (n,), &dev).unwrap();
        let text =
            Tensor::from_vec((0..n * 3).map(|i| i as f32).collect(), (n, 3), &dev).unwrap();
        let meta =
            Tensor::from_vec((0..n * 2).map(|i| i as f32).collect(), (n, 2), &dev).unwrap();
        // a directed chain i -> i+1 with alternating relations
        let edges: Vec<(u32, u32)> = (0..n as u32 - 1).map(|i| (i, i + 1)).collect();
        let raw: Vec<i64> = (0..edges.len() as i64).map(|i| i % 2).collect();
        CommunityData::from_parts(label, text, meta, edges, raw, 2, None).unwrap()
    }

    #[test]
    fn seeds_lead_and_edges_stay_local() {
        let data = chain_community(10);
        let mut sampler =
            NeighborSampler::new(&data, (0..10).collect(), 4, 8, 2, 1).unwrap();
        sampler.reshuffle();
        for i in 0..sampler.num_batches() {
            let batch = sampler.batch(i).unwrap();
            assert!(batch.batch_size <= 4);
            assert_eq!(batch.meta.dim(0).unwrap(), batch.num_nodes);
            assert_eq!(batch.text.dim(0).unwrap(), batch.num_nodes);
            assert_eq!(batch.labels.dim(0).unwrap(), batch.num_nodes);
            assert_eq!(batch.edges.len(), batch.edge_types.len());
            for &(s, d) in &batch.edges {
                assert!((s as usize) < batch.num_nodes);
                assert!((d as usize) < batch.num_nodes);
            }
        }
    }

    #[test]
    fn pass_covers_every_seed_once() {
        let data = chain_community(10);
        let mut sampler =
            NeighborSampler::new(&data, (0..10).collect(), 3, 8, 1, 2).unwrap();
        assert_eq!(sampler.num_batches(), 4);
        sampler.reshuffle();
        let mut seen = 0;
        for i in 0..sampler.num_batches() {
            seen += sampler.batch(i).unwrap().batch_size;
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn fanout_caps_sampled_edges() {
        // star graph: every node points at node 0
        let dev = Device::Cpu;
        let n = 20;
        let label = Tensor::zeros((n,), DType::U32, &dev).unwrap();
        let text = Tensor::zeros((n, 3), DType::F32, &dev).unwrap();
        let meta = Tensor::zeros((n, 2), DType::F32, &dev).unwrap();
        let edges: Vec<(u32, u32)> = (1..n as u32).map(|i| (i, 0)).collect();
        let raw = vec![0i64; edges.len()];
        let data = CommunityData::from_parts(label, text, meta, edges, raw, 2, None).unwrap();

        let mut sampler = NeighborSampler::new(&data, vec![0], 1, 5, 1, 3).unwrap();
        let batch = sampler.batch(0).unwrap();
        assert_eq!(batch.edges.len(), 5);
        assert_eq!(batch.num_nodes, 6);
    }
}
