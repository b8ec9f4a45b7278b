//! Configuration validation

use super::Config;

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_xmit(config, &mut result);
    validate_neighbor(config, &mut result);
    validate_logging(config, &mut result);

    result
}

fn validate_xmit(config: &Config, result: &mut ValidationResult) {
    let xmit = &config.xmit;

    if !xmit.fast_xmit_inbound && !xmit.fast_xmit_outbound && xmit.invalidate_on_route_change {
        result.warn(
            "xmit.invalidate_on_route_change: has no effect with both fast_xmit directions disabled",
        );
    }
}

fn validate_neighbor(config: &Config, result: &mut ValidationResult) {
    let n = &config.neighbor;

    if n.max_entries == 0 {
        result.error("neighbor.max_entries: must be at least 1");
    }
    if n.max_entries >= u32::MAX as usize {
        result.error(format!(
            "neighbor.max_entries: {} exceeds the index range",
            n.max_entries
        ));
    }

    if n.retry_interval_secs == 0 {
        result.error("neighbor.retry_interval_secs: must be at least 1");
    }

    if n.max_pending_per_entry == 0 {
        result.error("neighbor.max_pending_per_entry: must be at least 1");
    }

    if n.entry_ttl_secs < n.retry_interval_secs {
        result.error(format!(
            "neighbor.entry_ttl_secs ({}) is shorter than retry_interval_secs ({})",
            n.entry_ttl_secs, n.retry_interval_secs
        ));
    }

    if n.retry_limit == 0 {
        result.warn("neighbor.retry_limit: 0, pending packets are dropped at the first retry");
    }

    if n.aging_interval_ms == 0 {
        result.error("neighbor.aging_interval_ms: must be at least 1");
    } else if n.aging_interval_ms > n.retry_interval_secs.saturating_mul(1000) {
        result.warn(format!(
            "neighbor.aging_interval_ms ({}) is longer than the retry interval, retries will fire late",
            n.aging_interval_ms
        ));
    }
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    let level = config.logging.level.to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        result.error(format!(
            "logging.level: unknown level '{}'",
            config.logging.level
        ));
    }

    if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
        result.error(format!(
            "logging.format: unknown format '{}'",
            config.logging.format
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate(&Config::default());
        assert!(!result.has_errors(), "{:?}", result.errors);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = Config::default();
        config.neighbor.max_entries = 0;
        config.neighbor.max_pending_per_entry = 0;

        let result = validate(&config);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_ttl_shorter_than_retry() {
        let mut config = Config::default();
        config.neighbor.entry_ttl_secs = 1;
        config.neighbor.retry_interval_secs = 5;

        let result = validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("shorter than retry_interval_secs")));
    }

    #[test]
    fn test_unknown_logging() {
        let mut config = Config::default();
        config.logging.level = "verbose".into();
        config.logging.format = "xml".into();

        let result = validate(&config);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_warnings() {
        let mut config = Config::default();
        config.xmit.fast_xmit_inbound = false;
        config.xmit.fast_xmit_outbound = false;
        config.neighbor.retry_limit = 0;

        let result = validate(&config);
        assert!(!result.has_errors());
        assert_eq!(result.warnings.len(), 2);
    }
}
