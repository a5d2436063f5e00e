//! Custom validation functions for configuration.

use validator::ValidationError;

use crate::pool::PoolConfig;

const PAGE: usize = 4096;
const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// An explicit per-node size must be at least one page and a page multiple.
pub fn validate_pool_sizing(pool: &PoolConfig) -> Result<(), ValidationError> {
    match pool.per_node_bytes {
        Some(bytes) if bytes < PAGE || bytes % PAGE != 0 => {
            Err(ValidationError::new("per_node_bytes_not_page_multiple"))
        }
        _ => Ok(()),
    }
}

/// Accepts `level` or comma-separated `target=level` directives.
pub fn validate_log_filter(filter: &str) -> Result<(), ValidationError> {
    let valid = !filter.trim().is_empty()
        && filter.split(',').all(|directive| {
            let level = directive.rsplit('=').next().unwrap_or_default().trim();
            let target_ok = directive
                .split_once('=')
                .map(|(target, _)| !target.trim().is_empty())
                .unwrap_or(true);
            target_ok && LEVELS.contains(&level.to_ascii_lowercase().as_str())
        });

    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_filter"))
    }
}
