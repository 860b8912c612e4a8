//! Configuration validation
//!
//! Rules:
//! - Field ranges declared on the blueprint (`validator` derive)
//! - `merge.fail_source` names an existing source
//! - `merge.max_concurrency` only applies to a dynamic merge

use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use contracts::{ConfigError, PipelineBlueprint};

/// Validate a blueprint
///
/// Returns the first error encountered.
pub fn validate(blueprint: &PipelineBlueprint) -> Result<(), ConfigError> {
    blueprint.validate().map_err(|errors| first_error("", &errors))?;
    validate_fail_source(blueprint)?;
    validate_concurrency(blueprint)?;
    Ok(())
}

/// Flatten nested `validator` errors into the first offending field path
fn first_error(prefix: &str, errors: &ValidationErrors) -> ConfigError {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by_key(|(field, _)| field.to_string());

    for (field, kind) in fields {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                if let Some(error) = list.first() {
                    let message = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("failed '{}' check", error.code));
                    return ConfigError::config_validation(path, message);
                }
            }
            ValidationErrorsKind::Struct(nested) => return first_error(&path, nested),
            ValidationErrorsKind::List(items) => {
                if let Some((idx, nested)) = items.iter().next() {
                    return first_error(&format!("{path}[{idx}]"), nested);
                }
            }
        }
    }
    ConfigError::config_validation(prefix, "invalid value")
}

fn validate_fail_source(blueprint: &PipelineBlueprint) -> Result<(), ConfigError> {
    let merge = &blueprint.merge;
    match merge.fail_source {
        Some(idx) if idx >= merge.sources => Err(ConfigError::config_validation(
            "merge.fail_source",
            format!("fail_source {idx} out of range for {} sources", merge.sources),
        )),
        _ => Ok(()),
    }
}

fn validate_concurrency(blueprint: &PipelineBlueprint) -> Result<(), ConfigError> {
    let merge = &blueprint.merge;
    if merge.max_concurrency.is_some() && !merge.dynamic {
        return Err(ConfigError::config_validation(
            "merge.max_concurrency",
            "max_concurrency requires dynamic = true",
        ));
    }
    Ok(())
}
