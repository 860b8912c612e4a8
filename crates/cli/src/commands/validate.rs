//! `validate` command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use contracts::{DispatcherKindConfig, PipelineBlueprint};

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    dispatcher: String,
    sources: usize,
    total_elements: u64,
    batch_size: usize,
    policy: String,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => {
            let warnings = collect_warnings(&blueprint);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: (!warnings.is_empty()).then_some(warnings),
                summary: Some(ConfigSummary {
                    version: format!("{:?}", blueprint.version),
                    dispatcher: format!("{:?}", blueprint.dispatcher.kind),
                    sources: blueprint.merge.sources,
                    total_elements: blueprint.merge.sources as u64
                        * blueprint.merge.elements_per_source,
                    batch_size: blueprint.batch.size,
                    policy: format!("{:?}", blueprint.batch.policy),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(blueprint: &PipelineBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    if blueprint.batch.timespan_ms.is_some()
        && blueprint.dispatcher.kind != DispatcherKindConfig::Worker
    {
        warnings.push(
            "batch.timespan_ms with an inline dispatcher runs timed flushes on the timer thread"
                .to_string(),
        );
    }

    let total = blueprint.merge.sources as u64 * blueprint.merge.elements_per_source;
    if (blueprint.batch.size as u64) > total {
        warnings.push(format!(
            "batch.size {} exceeds the {} generated elements - only the final flush will emit",
            blueprint.batch.size, total
        ));
    }

    if blueprint.merge.fail_source.is_some() {
        warnings.push("merge.fail_source is set - the run will end with an error".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Dispatcher: {}", summary.dispatcher);
            println!("  Sources: {}", summary.sources);
            println!("  Elements: {}", summary.total_elements);
            println!("  Batch: {} x {}", summary.policy, summary.batch_size);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
