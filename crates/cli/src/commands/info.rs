//! `info` command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use contracts::PipelineBlueprint;

use crate::cli::InfoArgs;
use crate::error::CliError;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    dispatcher: DispatcherInfo,
    merge: MergeInfo,
    batch: BatchInfo,
    /// `None` when demand is unbounded
    initial_request: Option<u64>,
}

#[derive(Serialize)]
struct DispatcherInfo {
    kind: String,
    name: String,
    queue_capacity: usize,
}

#[derive(Serialize)]
struct MergeInfo {
    sources: usize,
    elements_per_source: u64,
    interval_ms: u64,
    dynamic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fail_source: Option<usize>,
}

#[derive(Serialize)]
struct BatchInfo {
    size: usize,
    policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timespan_ms: Option<u64>,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        return Err(CliError::config_not_found(args.config.display().to_string()).into());
    }

    let blueprint = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.json {
        let info = build_config_info(&blueprint);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint);
    }

    Ok(())
}

fn build_config_info(blueprint: &PipelineBlueprint) -> ConfigInfo {
    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        dispatcher: DispatcherInfo {
            kind: format!("{:?}", blueprint.dispatcher.kind),
            name: blueprint.dispatcher.name.clone(),
            queue_capacity: blueprint.dispatcher.queue_capacity,
        },
        merge: MergeInfo {
            sources: blueprint.merge.sources,
            elements_per_source: blueprint.merge.elements_per_source,
            interval_ms: blueprint.merge.interval_ms,
            dynamic: blueprint.merge.dynamic,
            max_concurrency: blueprint.merge.max_concurrency,
            fail_source: blueprint.merge.fail_source,
        },
        batch: BatchInfo {
            size: blueprint.batch.size,
            policy: format!("{:?}", blueprint.batch.policy),
            timespan_ms: blueprint.batch.timespan_ms,
        },
        initial_request: (blueprint.demand.initial_request != 0)
            .then_some(blueprint.demand.initial_request),
    }
}

fn print_config_info(blueprint: &PipelineBlueprint) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  Backflow Configuration                      ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let dispatcher = &blueprint.dispatcher;
    println!("⚙️  Dispatcher");
    println!("   ├─ Version: {:?}", blueprint.version);
    println!("   ├─ Kind: {:?}", dispatcher.kind);
    println!("   ├─ Name: {}", dispatcher.name);
    println!("   └─ Queue Capacity: {}", dispatcher.queue_capacity);

    let merge = &blueprint.merge;
    println!("\n🔀 Merge ({} sources)", merge.sources);
    println!("   ├─ Elements per Source: {}", merge.elements_per_source);
    match merge.interval_ms {
        0 => println!("   ├─ Pacing: on demand"),
        ms => println!("   ├─ Pacing: every {} ms", ms),
    }
    if let Some(index) = merge.fail_source {
        println!("   ├─ Failing Source: {}", index);
    }
    match (merge.dynamic, merge.max_concurrency) {
        (true, Some(limit)) => println!("   └─ Mode: dynamic, {} at a time", limit),
        (true, None) => println!("   └─ Mode: dynamic"),
        (false, _) => println!("   └─ Mode: fixed"),
    }

    let batch = &blueprint.batch;
    println!("\n📦 Batch");
    println!("   ├─ Policy: {:?}", batch.policy);
    match batch.timespan_ms {
        Some(ms) => {
            println!("   ├─ Size: {}", batch.size);
            println!("   └─ Timespan: {} ms", ms);
        }
        None => println!("   └─ Size: {}", batch.size),
    }

    println!("\n📥 Demand");
    match blueprint.demand.initial_request {
        0 => println!("   └─ Initial Request: unbounded"),
        n => println!("   └─ Initial Request: {}", n),
    }

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_loader::{ConfigFormat, ConfigLoader};

    #[test]
    fn test_info_reflects_blueprint() {
        let blueprint = ConfigLoader::load_from_str(
            r#"
            [batch]
            size = 8
            policy = "last"
            timespan_ms = 250

            [merge]
            sources = 3
            elements_per_source = 10
            dynamic = true
            max_concurrency = 2
            "#,
            ConfigFormat::Toml,
        )
        .unwrap();

        let info = build_config_info(&blueprint);
        assert_eq!(info.batch.policy, "Last");
        assert_eq!(info.batch.timespan_ms, Some(250));
        assert_eq!(info.merge.max_concurrency, Some(2));
        assert!(info.initial_request.is_none());

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["dispatcher"]["kind"], "Worker");
        assert!(json["merge"].get("fail_source").is_none());
    }
}
