//! Loading the JSON configuration from disk.

use std::{io, path::Path};

use cgt_rules::{config, Config, MatcherError, Matchers};

/// Overrides the route table of the configuration file.
pub const ROUTE_TABLE_ENV: &str = "CGT_ROUTE_TABLE";

/// Why a configuration was not loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}")]
    Read { path: String, source: io::Error },
    /// The file is not a valid configuration document.
    #[error("failed to parse configuration")]
    Parse(#[from] serde_json::Error),
    /// The values are inconsistent.
    #[error("invalid configuration")]
    Invalid(#[from] config::Error),
    /// A rule does not compile.
    #[error("invalid rule")]
    Rule(#[from] MatcherError),
    /// An environment override could not be applied.
    #[error("invalid value for {name}: {reason}")]
    Env { name: String, reason: String },
}

/// Reads, parses and validates the configuration at `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    tracing::debug!(?path, "loading configuration");

    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;

    load_config_str(&contents)
}

/// Parses and validates a configuration.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json)?;
    validate(&config)?;
    Ok(config)
}

/// Like [`load_config`], then applies the environment overrides.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_overrides(&mut config, |name| std::env::var(name).ok())?;

    tracing::info!(
        route_table = config.route_table,
        tproxies = config.tproxies.len(),
        rules = config.rules.len(),
        bypass = config.bypass.len(),
        "configuration loaded"
    );

    Ok(config)
}

/// Applies the overrides found through `lookup`, then validates the result again.
pub fn apply_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(table) = lookup(ROUTE_TABLE_ENV) {
        config.route_table = table.trim().parse().map_err(|_| ConfigError::Env {
            name: ROUTE_TABLE_ENV.into(),
            reason: format!("invalid route table: {table}"),
        })?;
        tracing::debug!(route_table = config.route_table, "route table overridden");
    }

    validate(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    config.validate()?;
    // Patterns are compiled again by the rule manager; this only reports them early.
    Matchers::from_config(config)?;
    Ok(())
}
