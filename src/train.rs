//! Adaptation training orchestration.
//!
//! One *pair run* adapts a model from a labeled source community to an
//! unlabeled target community, repeating the experiment several times from
//! fresh initializations and reporting mean and deviation of target-side
//! accuracy and F1. Each experiment trains live models while exponential
//! moving averages shadow them; evaluation always goes through the shadows.

use candle_core::{DType, Device, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::info;

use crate::classifier::Classifier;
use crate::config::Config;
use crate::data::{random_node_split, CommunityData, NodeSplit};
use crate::ema::Ema;
use crate::error::{Error, Result};
use crate::fusion::FeatureGenerator;
use crate::losses::{conditional_entropy, cross_entropy_probs, sliced_wasserstein_distance};
use crate::metrics::{mean_std, BinaryConfusion};
use crate::sampler::{GraphBatch, NeighborSampler};
use crate::vat::VatLoss;

/// Random projections drawn per sliced Wasserstein evaluation.
const SWD_PROJECTIONS: usize = 256;
/// Exponent of the Wasserstein distance.
const SWD_P: f64 = 1.0;
/// Message-passing depth of the neighbor sampler.
const SAMPLER_HOPS: usize = 2;

/// Target-side quality of one experiment at its last evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExperimentResult {
    pub accuracy: f64,
    pub f1: f64,
}

/// Aggregate over the repetitions of one source/target pair.
#[derive(Debug, Clone, Copy)]
pub struct PairSummary {
    pub source: usize,
    pub target: usize,
    pub accuracy_mean: f64,
    pub accuracy_std: f64,
    pub f1_mean: f64,
    pub f1_std: f64,
}

/// Run all repetitions of one source/target community pair.
pub fn run_pair(
    config: &Config,
    device: &Device,
    source_id: usize,
    target_id: usize,
) -> Result<PairSummary> {
    info!(source = source_id, target = target_id, "starting pair");
    let source = CommunityData::load(&config.data_root, source_id, config.num_relations, device)?;
    let mut target = CommunityData::load(&config.data_root, target_id, config.num_relations, device)?;

    if config.meta_align {
        let stats = source.meta_stats.clone().ok_or_else(|| {
            Error::Data(format!(
                "community {source_id} carries no meta statistics for alignment"
            ))
        })?;
        target.align_meta(&stats)?;
        info!("aligned target meta features with the source normalization frame");
    }

    let split = random_node_split(
        target.num_nodes,
        config.train_ratio,
        config.eval_ratio,
        config.seed,
    )?;
    info!(
        train = split.train.len(),
        eval = split.eval.len(),
        test = split.test.len(),
        "target split"
    );

    let mut accuracies = Vec::with_capacity(config.exp_times);
    let mut f1s = Vec::with_capacity(config.exp_times);
    for e in 0..config.exp_times {
        info!(experiment = e, "starting repetition");
        let result = run_experiment(config, device, &source, &target, &split, e)?;
        accuracies.push(result.accuracy);
        f1s.push(result.f1);
    }

    let (accuracy_mean, accuracy_std) = mean_std(&accuracies);
    let (f1_mean, f1_std) = mean_std(&f1s);
    let summary = PairSummary {
        source: source_id,
        target: target_id,
        accuracy_mean,
        accuracy_std,
        f1_mean,
        f1_std,
    };
    info!(
        source = source_id,
        target = target_id,
        accuracy_mean,
        accuracy_std,
        f1_mean,
        f1_std,
        "pair finished"
    );
    Ok(summary)
}

/// One full training run from a fresh initialization.
fn run_experiment(
    config: &Config,
    device: &Device,
    source: &CommunityData,
    target: &CommunityData,
    split: &NodeSplit,
    exp_index: usize,
) -> Result<ExperimentResult> {
    let seed = config.seed.wrapping_add(exp_index as u64);

    let ema_f = Ema::new(config.ema_decay, DType::F32, device, |vb| {
        FeatureGenerator::new(
            config.hidden_size,
            config.text_input_size,
            config.meta_input_size,
            config.dropout,
            config.num_relations,
            config.att_heads,
            vb,
        )
    })?;
    let ema_c = Ema::new(config.ema_decay, DType::F32, device, |vb| {
        Classifier::new(config.hidden_size, config.dropout, vb)
    })?;

    let params = ParamsAdamW {
        lr: config.lr,
        weight_decay: config.weight_decay,
        ..Default::default()
    };
    let mut opt_f = AdamW::new(ema_f.trainable_vars(), params.clone())?;
    let mut opt_c = AdamW::new(ema_c.trainable_vars(), params)?;

    let mut src_sampler = NeighborSampler::new(
        source,
        (0..source.num_nodes as u32).collect(),
        config.batch_size,
        config.fanout,
        SAMPLER_HOPS,
        seed,
    )?;
    let mut tgt_sampler = NeighborSampler::new(
        target,
        split.train.clone(),
        config.batch_size,
        config.fanout,
        SAMPLER_HOPS,
        seed.wrapping_add(1),
    )?;
    let mut test_sampler = NeighborSampler::new(
        target,
        split.test.clone(),
        config.batch_size,
        config.fanout,
        SAMPLER_HOPS,
        seed.wrapping_add(2),
    )?;

    let vat = VatLoss::default();
    let mut result = ExperimentResult::default();

    for t in 0..config.iterations {
        // Both streams cycle independently; a pass restarts with a reshuffle
        // whenever its seed set is exhausted.
        if t % src_sampler.num_batches() == 0 {
            src_sampler.reshuffle();
        }
        if t % tgt_sampler.num_batches() == 0 {
            tgt_sampler.reshuffle();
        }
        let src_batch = src_sampler.batch(t % src_sampler.num_batches())?;
        let tgt_batch = tgt_sampler.batch(t % tgt_sampler.num_batches())?;

        let ratio = config.schedule.ratio(t, config.iterations);
        let loss = train_step(
            config, &ema_f, &ema_c, &mut opt_f, &mut opt_c, &vat, &src_batch, &tgt_batch, ratio,
        )?;

        if t % config.train_report == 0 {
            info!(step = t, loss, ratio, "train");
        }
        if (t + 1) % config.ema_interval == 0 {
            ema_c.update()?;
            ema_f.update()?;
        }
        if (t + 1) % config.test_report == 0 {
            info!(step = t + 1, "evaluating on target test split");
            result = evaluate(&ema_f, &ema_c, &mut test_sampler)?;
        }
    }

    Ok(result)
}

/// One optimization step over a source batch and a target batch.
#[allow(clippy::too_many_arguments)]
fn train_step(
    config: &Config,
    ema_f: &Ema<FeatureGenerator>,
    ema_c: &Ema<Classifier>,
    opt_f: &mut AdamW,
    opt_c: &mut AdamW,
    vat: &VatLoss,
    src_batch: &GraphBatch,
    tgt_batch: &GraphBatch,
    ssa_ratio: f64,
) -> Result<f64> {
    ema_f.set_training(true);
    ema_c.set_training(true);
    let generator = ema_f.active();
    let classifier = ema_c.active();

    let src_features = generator.forward_t(&src_batch.meta, &src_batch.text, src_batch, true)?;
    let tgt_features = generator.forward_t(&tgt_batch.meta, &tgt_batch.text, tgt_batch, true)?;
    let src_seed = src_features.narrow(0, 0, src_batch.batch_size)?;
    let tgt_seed = tgt_features.narrow(0, 0, tgt_batch.batch_size)?;

    let dis_loss = sliced_wasserstein_distance(&src_seed, &tgt_seed, SWD_PROJECTIONS, SWD_P)?;

    let src_pred = classifier.forward_t(&src_seed, true)?;
    let src_labels = src_batch.labels.narrow(0, 0, src_batch.batch_size)?;
    let cls_loss = (cross_entropy_probs(&src_pred, &src_labels)? * ssa_ratio)?;

    let tgt_pred = classifier.forward_t(&tgt_seed, true)?;
    let cet_loss = conditional_entropy(&tgt_pred)?;

    let src_vat = (vat.forward(generator, classifier, src_batch)? * ssa_ratio)?;
    let tgt_vat = vat.forward(generator, classifier, tgt_batch)?;
    let vat_loss = (src_vat + tgt_vat)?;

    let loss = (((cls_loss + (dis_loss * config.lmd_dis)?)?
        + (cet_loss * config.lmd_cet)?)?
        + (vat_loss * config.lmd_vat)?)?;
    let value = loss.to_vec0::<f32>()? as f64;

    let grads = loss.backward()?;
    opt_c.step(&grads)?;
    opt_f.step(&grads)?;
    Ok(value)
}

/// Evaluate the shadow models over one pass of the test sampler.
fn evaluate(
    ema_f: &Ema<FeatureGenerator>,
    ema_c: &Ema<Classifier>,
    sampler: &mut NeighborSampler,
) -> Result<ExperimentResult> {
    ema_f.set_training(false);
    ema_c.set_training(false);
    let generator = ema_f.active();
    let classifier = ema_c.active();

    let mut predictions: Vec<u32> = Vec::new();
    let mut labels: Vec<u32> = Vec::new();
    let mut loss_sum = 0.0;
    let mut count = 0usize;

    sampler.reshuffle();
    for i in 0..sampler.num_batches() {
        let batch = sampler.batch(i)?;
        let features = generator.forward_t(&batch.meta, &batch.text, &batch, false)?;
        let seeds = features.narrow(0, 0, batch.batch_size)?;
        let probs = classifier.forward_t(&seeds, false)?;
        let batch_labels = batch.labels.narrow(0, 0, batch.batch_size)?;

        let loss = cross_entropy_probs(&probs, &batch_labels)?;
        loss_sum += loss.to_vec0::<f32>()? as f64 * batch.batch_size as f64;
        count += batch.batch_size;

        predictions.extend(probs.argmax(D::Minus1)?.to_vec1::<u32>()?);
        labels.extend(batch_labels.to_vec1::<u32>()?);
    }

    ema_f.set_training(true);
    ema_c.set_training(true);

    let confusion = BinaryConfusion::from_predictions(&predictions, &labels)?;
    let result = ExperimentResult {
        accuracy: confusion.accuracy(),
        f1: confusion.f1(),
    };
    info!(
        accuracy = result.accuracy,
        f1 = result.f1,
        avg_loss = loss_sum / count.max(1) as f64,
        "test"
    );
    Ok(result)
}
