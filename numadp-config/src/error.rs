//! Error types for configuration loading and validation

use std::path::PathBuf;
use thiserror::Error;
use validator::{ValidationErrors, ValidationErrorsKind};

/// Key validator uses for struct-level (schema) failures.
const SCHEMA_KEY: &str = "__all__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("numadp configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// One or more sections failed validation. Each violation is listed as
    /// `section.field: code` on its own line.
    #[error("invalid numadp configuration:\n{}", render_violations(.0))]
    Validation(#[source] ValidationErrors),

    /// Malformed YAML or a `NUMADP_*` variable that does not fit its field.
    #[error("failed to read numadp configuration: {0}")]
    Parsing(#[from] figment::Error),
}

impl ConfigError {
    /// Dotted field paths and codes of every validation failure, sorted.
    /// Empty for errors other than [`ConfigError::Validation`].
    pub fn violations(&self) -> Vec<String> {
        match self {
            ConfigError::Validation(errors) => {
                let mut out = Vec::new();
                collect_violations("", errors, &mut out);
                out.sort();
                out
            }
            _ => Vec::new(),
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    match (prefix.is_empty(), key == SCHEMA_KEY) {
        (_, true) => prefix.to_string(),
        (true, false) => key.to_string(),
        (false, false) => format!("{prefix}.{key}"),
    }
}

fn collect_violations(prefix: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
    for (key, kind) in errors.errors() {
        let path = join_path(prefix, &key.to_string());
        match kind {
            ValidationErrorsKind::Field(errors) => {
                for error in errors {
                    let detail = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| error.code.to_string());
                    out.push(format!("{path}: {detail}"));
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_violations(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_violations(&format!("{path}[{index}]"), nested, out);
                }
            }
        }
    }
}

fn render_violations(errors: &ValidationErrors) -> String {
    let mut out = Vec::new();
    collect_violations("", errors, &mut out);
    out.sort();
    out.iter().map(|line| format!("  - {line}\n")).collect()
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        ConfigError::Validation(errors)
    }
}
