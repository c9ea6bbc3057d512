use std::path::Path;

use crate::config::Config;
use crate::error::ConfigError;
use crate::validate::validate;

/// Content written into a newly-created default config file.
const DEFAULT_CONFIG_CONTENT: &str = r#"# probe configuration
# Uncomment and edit settings below to override defaults.

# [server]
# host = ""
# port = 9000
# timeout_secs = 30
# response_timeout_secs = 10

# [session]
# ide_key = "IDEKEY"

# [session.features]
# max_depth = "1"
# max_children = "32"
# max_data = "512"

# [path_maps]
# "/remote/path" = "/local/path"

# [log]
# level = "info"
"#;

/// Load configuration from `config_dir/config.toml`.
///
/// If the file does not exist it is created with commented-out
/// defaults, and the defaults are returned. The parsed result is
/// validated before it is handed back.
///
/// # Errors
///
/// Returns [`ConfigError`] on I/O failure, parse failure, or
/// validation failure.
pub fn load_config(config_dir: &Path) -> Result<Config, ConfigError> {
    let path = config_dir.join("config.toml");

    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir)?;
    }

    if !path.exists() {
        std::fs::write(&path, DEFAULT_CONFIG_CONTENT).map_err(|e| {
            ConfigError::CreateDefault {
                path: path.clone(),
                source: e,
            }
        })?;
        tracing::info!("Created default config at {}", path.display());
    }

    let content = std::fs::read_to_string(&path)?;
    if !has_non_comment_content(&content) {
        return Ok(Config::default());
    }
    load_from_str(&content)
}

/// Parse a TOML string directly into a validated [`Config`].
///
/// Useful for tests or one-off parsing without file I/O.
///
/// # Errors
///
/// Returns [`ConfigError`] on parse or validation failure.
pub fn load_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml_str)?;

    validate(&config).map_err(|errors| {
        errors
            .into_iter()
            .next()
            .unwrap_or_else(|| ConfigError::Validation {
                field: "unknown".to_string(),
                message: "validation failed".to_string(),
            })
    })?;

    Ok(config)
}

/// Returns `true` when the content has at least one
/// non-empty, non-comment line.
fn has_non_comment_content(content: &str) -> bool {
    content.lines().any(|l| {
        let trimmed = l.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    })
}
