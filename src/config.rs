//! Run configuration.
//!
//! All knobs are collected once at startup into an immutable [`Config`] that
//! is passed by reference into every component; nothing reads ambient global
//! state after argument parsing.

use std::path::PathBuf;

use candle_core::Device;
use clap::{ArgAction, Parser};

use crate::error::{Error, Result};
use crate::schedule::SsaSchedule;

/// Command-line surface.
#[derive(Parser, Debug)]
#[command(name = "botadapt")]
#[command(about = "Cross-community bot detection via graph domain adaptation", long_about = None)]
pub struct Args {
    /// Directory holding `com{id}.safetensors` community artifacts
    #[arg(long, default_value = "./data")]
    pub data_root: PathBuf,

    /// Source:target community pairs, e.g. `5:6,6:5`
    #[arg(long, value_delimiter = ',')]
    pub coms: Vec<String>,

    /// Expand to all ordered pairs over the 5..10 and 0..5 id ranges
    #[arg(long, default_value_t = false)]
    pub exp_all: bool,

    /// Repetitions per community pair
    #[arg(long, default_value_t = 5)]
    pub exp_times: usize,

    /// Compute device: `cpu` or `cuda:N`
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Log training loss every N steps
    #[arg(long, default_value_t = 100)]
    pub train_report: usize,

    /// Evaluate on the target test split every N steps
    #[arg(long, default_value_t = 500)]
    pub test_report: usize,

    /// Target-community train split ratio
    #[arg(long, default_value_t = 0.7)]
    pub train_ratio: f64,

    /// Target-community eval split ratio (test = remainder)
    #[arg(long, default_value_t = 0.2)]
    pub eval_ratio: f64,

    /// Learning rate
    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    /// Weight decay (L2 regularization)
    #[arg(long, default_value_t = 1e-3)]
    pub weight_decay: f64,

    /// Dropout probability
    #[arg(long, default_value_t = 0.5)]
    pub dropout: f64,

    /// Hidden width of every encoder
    #[arg(long, default_value_t = 128)]
    pub hidden_size: usize,

    /// Total training iterations per repetition
    #[arg(long, default_value_t = 5_000)]
    pub iterations: usize,

    /// Attention heads in the fusion block
    #[arg(long, default_value_t = 2)]
    pub att_heads: usize,

    /// Seed nodes per mini-batch
    #[arg(long, default_value_t = 512)]
    pub batch_size: usize,

    /// Per-hop neighbor fan-out cap of the sampler
    #[arg(long, default_value_t = 256)]
    pub fanout: usize,

    /// Width of per-node text embeddings
    #[arg(long, default_value_t = 768)]
    pub text_input_size: usize,

    /// Width of per-node metadata features
    #[arg(long, default_value_t = 8)]
    pub meta_input_size: usize,

    /// Number of canonical edge relation types
    #[arg(long, default_value_t = 2)]
    pub num_relations: usize,

    /// Weight of the sliced Wasserstein alignment loss
    #[arg(long, default_value_t = 1.0)]
    pub lmd_dis: f64,

    /// Weight of the conditional entropy loss
    #[arg(long, default_value_t = 0.005)]
    pub lmd_cet: f64,

    /// Weight of the virtual adversarial training loss
    #[arg(long, default_value_t = 0.001)]
    pub lmd_vat: f64,

    /// EMA decay of the teacher shadow
    #[arg(long, default_value_t = 0.999)]
    pub ema_decay: f64,

    /// Update the EMA shadow every N steps
    #[arg(long, default_value_t = 1)]
    pub ema_interval: usize,

    /// Re-express target meta features in the source normalization frame
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub meta_align: bool,

    /// Source-signal annealing toggle
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub ssa: bool,

    /// Annealing schedule: linear, cos or sin
    #[arg(long, default_value = "sin")]
    pub ssa_schedule: String,

    /// Base RNG seed for sampling and splitting
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

/// Immutable run configuration, validated once.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_root: PathBuf,
    pub pairs: Vec<(usize, usize)>,
    pub exp_times: usize,
    pub device: String,
    pub train_report: usize,
    pub test_report: usize,
    pub train_ratio: f64,
    pub eval_ratio: f64,
    pub lr: f64,
    pub weight_decay: f64,
    pub dropout: f64,
    pub hidden_size: usize,
    pub iterations: usize,
    pub att_heads: usize,
    pub batch_size: usize,
    pub fanout: usize,
    pub text_input_size: usize,
    pub meta_input_size: usize,
    pub num_relations: usize,
    pub lmd_dis: f64,
    pub lmd_cet: f64,
    pub lmd_vat: f64,
    pub ema_decay: f64,
    pub ema_interval: usize,
    pub meta_align: bool,
    pub schedule: SsaSchedule,
    pub seed: u64,
}

impl Config {
    /// Validate CLI arguments into a config. Fails fast on an unknown
    /// annealing schedule or malformed community pair.
    pub fn from_args(args: Args) -> Result<Self> {
        let schedule = if args.ssa {
            args.ssa_schedule.parse()?
        } else {
            SsaSchedule::Constant
        };

        let pairs = if args.exp_all {
            all_pairs()
        } else if args.coms.is_empty() {
            vec![(5, 6), (6, 5)]
        } else {
            args.coms
                .iter()
                .map(|s| parse_pair(s))
                .collect::<Result<Vec<_>>>()?
        };

        if args.train_ratio + args.eval_ratio >= 1.0 {
            return Err(Error::InvalidConfig(format!(
                "train_ratio + eval_ratio must leave room for a test split, got {} + {}",
                args.train_ratio, args.eval_ratio
            )));
        }
        if !(0.0..1.0).contains(&args.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                args.dropout
            )));
        }
        if args.hidden_size % args.att_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "hidden_size {} must be divisible by att_heads {}",
                args.hidden_size, args.att_heads
            )));
        }

        Ok(Self {
            data_root: args.data_root,
            pairs,
            exp_times: args.exp_times,
            device: args.device,
            train_report: args.train_report,
            test_report: args.test_report,
            train_ratio: args.train_ratio,
            eval_ratio: args.eval_ratio,
            lr: args.lr,
            weight_decay: args.weight_decay,
            dropout: args.dropout,
            hidden_size: args.hidden_size,
            iterations: args.iterations,
            att_heads: args.att_heads,
            batch_size: args.batch_size,
            fanout: args.fanout,
            text_input_size: args.text_input_size,
            meta_input_size: args.meta_input_size,
            num_relations: args.num_relations,
            lmd_dis: args.lmd_dis,
            lmd_cet: args.lmd_cet,
            lmd_vat: args.lmd_vat,
            ema_decay: args.ema_decay,
            ema_interval: args.ema_interval,
            meta_align: args.meta_align,
            schedule,
            seed: args.seed,
        })
    }

    /// Resolve the configured compute device.
    pub fn device(&self) -> Result<Device> {
        if self.device == "cpu" {
            return Ok(Device::Cpu);
        }
        if let Some(ordinal) = self.device.strip_prefix("cuda:") {
            let ordinal: usize = ordinal.parse().map_err(|_| {
                Error::InvalidConfig(format!("bad cuda ordinal in `{}`", self.device))
            })?;
            return Ok(Device::new_cuda(ordinal)?);
        }
        Err(Error::InvalidConfig(format!(
            "unknown device `{}` (expected cpu or cuda:N)",
            self.device
        )))
    }
}

fn parse_pair(s: &str) -> Result<(usize, usize)> {
    let (src, tgt) = s
        .split_once(':')
        .ok_or_else(|| Error::InvalidConfig(format!("bad community pair `{s}` (want SRC:TGT)")))?;
    let src = src
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("bad community id `{src}`")))?;
    let tgt = tgt
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("bad community id `{tgt}`")))?;
    if src == tgt {
        return Err(Error::InvalidConfig(format!(
            "self-pair {src}:{tgt} has nothing to adapt"
        )));
    }
    Ok((src, tgt))
}

/// All ordered pairs inside the two disjoint community id ranges, no
/// self-pairs, 5..10 block first.
fn all_pairs() -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 5..10 {
        for j in 5..10 {
            if i != j {
                pairs.push((i, j));
            }
        }
    }
    for i in 0..5 {
        for j in 0..5 {
            if i != j {
                pairs.push((i, j));
            }
        }
    }
    pairs
}
