//! `run` command implementation.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

use contracts::PipelineBlueprint;

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::pipeline::{Outcome, Pipeline, PipelineConfig};

/// Execute the `run` command
pub async fn run_pipeline(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    if !args.config.exists() {
        return Err(CliError::config_not_found(args.config.display().to_string()).into());
    }

    let blueprint = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    info!(
        dispatcher = ?blueprint.dispatcher.kind,
        sources = blueprint.merge.sources,
        batch_size = blueprint.batch.size,
        policy = ?blueprint.batch.policy,
        "Configuration loaded"
    );

    // Dry run - just validate and exit
    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&blueprint);
        return Ok(());
    }

    let pipeline = Pipeline::new(pipeline_config(blueprint, args));

    info!("Starting pipeline...");

    tokio::select! {
        result = pipeline.run() => {
            let stats = result.context("Pipeline execution failed")?;
            info!(
                batches = stats.batches(),
                elements = stats.elements(),
                duration_secs = stats.duration.as_secs_f64(),
                throughput = format!("{:.2}", stats.throughput()),
                "Pipeline finished"
            );
            stats.print_summary();

            if let Outcome::Failed(error) = stats.outcome {
                return Err(CliError::StreamFailed(error).into());
            }
        }
        _ = shutdown_signal() => {
            warn!("Received shutdown signal, stopping pipeline...");
        }
    }

    info!("Backflow finished");
    Ok(())
}

fn pipeline_config(blueprint: PipelineBlueprint, args: &RunArgs) -> PipelineConfig {
    PipelineConfig {
        blueprint,
        max_batches: (args.max_batches != 0).then_some(args.max_batches),
        timeout: (args.timeout != 0).then(|| Duration::from_secs(args.timeout)),
        metrics_port: (args.metrics_port != 0).then_some(args.metrics_port),
    }
}

/// Resolves on Ctrl+C or SIGTERM
///
/// A handler that cannot be installed never resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print configuration summary for dry-run mode
fn print_config_summary(blueprint: &PipelineBlueprint) {
    println!("\n=== Configuration Summary ===\n");
    println!("Dispatcher:");
    println!(
        "  {:?} ({}, queue {})",
        blueprint.dispatcher.kind, blueprint.dispatcher.name, blueprint.dispatcher.queue_capacity
    );
    println!("\nMerge:");
    println!(
        "  {} sources x {} elements{}",
        blueprint.merge.sources,
        blueprint.merge.elements_per_source,
        if blueprint.merge.dynamic { " (dynamic)" } else { "" }
    );
    if let Some(index) = blueprint.merge.fail_source {
        println!("  Source {} fails after its elements", index);
    }
    println!("\nBatch:");
    println!("  {:?} windows of {}", blueprint.batch.policy, blueprint.batch.size);
    if let Some(timespan) = blueprint.batch.timespan() {
        println!("  Timed flush every {:?}", timespan);
    }
    println!();
}
