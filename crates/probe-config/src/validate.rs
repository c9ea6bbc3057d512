use crate::config::Config;
use crate::error::ConfigError;

/// Check every constraint on a parsed [`Config`].
///
/// Returns all violations, not just the first.
pub fn validate(config: &Config) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.server.port == 0 {
        errors.push(ConfigError::Validation {
            field: "server.port".to_string(),
            message: "must not be zero".to_string(),
        });
    }
    if config.server.timeout_secs == 0 {
        errors.push(ConfigError::Validation {
            field: "server.timeout_secs".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if config.server.response_timeout_secs == Some(0) {
        errors.push(ConfigError::Validation {
            field: "server.response_timeout_secs".to_string(),
            message: "must be at least 1 when set".to_string(),
        });
    }
    for (name, value) in &config.session.features {
        if name.is_empty() || value.is_empty() {
            errors.push(ConfigError::Validation {
                field: format!("session.features.{name}"),
                message: "feature names and values must be non-empty".to_string(),
            });
        }
    }
    for (remote, local) in &config.path_maps {
        if remote.is_empty() || local.is_empty() {
            errors.push(ConfigError::Validation {
                field: "path_maps".to_string(),
                message: "path map prefixes must be non-empty".to_string(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
