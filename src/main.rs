use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use botadapt::{run_pair, Args, Config};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args(Args::parse()).context("invalid configuration")?;
    let device = config.device().context("device setup failed")?;
    info!(pairs = config.pairs.len(), "starting adaptation runs");

    let mut summaries = Vec::with_capacity(config.pairs.len());
    for &(source, target) in &config.pairs {
        let summary = run_pair(&config, &device, source, target)
            .with_context(|| format!("pair {source} -> {target} failed"))?;
        summaries.push(summary);
    }

    for s in &summaries {
        println!(
            "source {} -> target {}: acc {:.2}% ± {:.2}%, f1 {:.4} ± {:.4}",
            s.source,
            s.target,
            100.0 * s.accuracy_mean,
            100.0 * s.accuracy_std,
            s.f1_mean,
            s.f1_std
        );
    }
    info!("done");
    Ok(())
}
