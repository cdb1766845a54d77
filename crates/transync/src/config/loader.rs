use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::Settings;
use crate::error::ConfigError;

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_settings_from_str(&content)
}

pub fn load_settings_from_str(content: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = serde_json::from_str(content)?;

    validate_settings(&settings)?;

    Ok(settings)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.ingest.worker_count == 0 {
        return Err(invalid("ingest.worker_count must be at least 1"));
    }
    if settings.ingest.consecutive_failure_limit == 0 {
        return Err(invalid("ingest.consecutive_failure_limit must be at least 1"));
    }
    if settings.ingest.max_attempts == 0 {
        return Err(invalid("ingest.max_attempts must be at least 1"));
    }
    if settings.sync.batch_size == 0 {
        return Err(invalid("sync.batch_size must be at least 1"));
    }
    if settings.sync.max_attempts == 0 {
        return Err(invalid("sync.max_attempts must be at least 1"));
    }
    if settings.sync.consecutive_failure_limit == 0 {
        return Err(invalid("sync.consecutive_failure_limit must be at least 1"));
    }
    if settings.jobs.subscriber_buffer == 0 {
        return Err(invalid("jobs.subscriber_buffer must be at least 1"));
    }

    let retry = &settings.retry;
    if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
        return Err(invalid(format!(
            "retry.multiplier must be >= 1.0, got {}",
            retry.multiplier
        )));
    }
    if retry.initial_backoff_ms > retry.max_backoff_ms {
        return Err(invalid(format!(
            "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
            retry.initial_backoff_ms, retry.max_backoff_ms
        )));
    }

    let mut kinds = HashSet::new();
    for source in &settings.sources {
        if source.kind.as_str().trim().is_empty() {
            return Err(invalid("source kind must not be empty"));
        }
        if !kinds.insert(&source.kind) {
            return Err(invalid(format!("Duplicate source kind '{}'", source.kind)));
        }
        if source.entity_kind.as_str().trim().is_empty() {
            return Err(invalid(format!(
                "source '{}' has an empty entity_kind",
                source.kind
            )));
        }
        for pattern in &source.include {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(invalid(format!(
                    "source '{}' has invalid include pattern '{}': {}",
                    source.kind, pattern, e
                )));
            }
        }
    }

    Ok(())
}
