/// `load_config` module: loads and adapts a static YAML config - including
/// environment secret injection - into the engine's typed configuration.
///
/// This is the only place where untrusted YAML is parsed and mapped to the
/// strongly-typed core structs.
///
/// # Responsibilities
/// - Parse user-supplied YAML configuration files into type-safe structs
/// - Validate cross-field constraints the serde schema cannot express
///   (clustered connections need a node id, quota integration needs a quota
///   endpoint)
/// - Ensure robust error messages for CLI and tests: any failure in loading
///   must result in clear diagnostics.
///
/// # Errors
/// All errors in this module use `anyhow::Error` for context-rich
/// diagnostics, surfaced at the CLI boundary.
use anyhow::Result;
use printsync_core::config::{ConnectionSettings, EngineConfig};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{error, info};

/// Environment variable holding the supplier API key.
pub const API_KEY_ENV: &str = "PRINTSYNC_API_KEY";

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionSettings>,
    /// Quota backend base URL; required when quota integration is on.
    #[serde(default)]
    pub quota_endpoint: Option<String>,
    /// User directory base URL; without one, unknown users are never
    /// provisioned.
    #[serde(default)]
    pub directory_endpoint: Option<String>,
}

/// Load a static YAML config file and validate it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(config) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            config
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &CliConfig) -> Result<()> {
    if config.connections.is_empty() {
        anyhow::bail!("configuration declares no supplier connections");
    }
    if config.engine.heartbeats_per_poll == 0 {
        anyhow::bail!("engine.heartbeats_per_poll must be at least 1");
    }
    for conn in &config.connections {
        if conn.account.trim().is_empty() {
            anyhow::bail!("a connection is missing its account identifier");
        }
        if conn.cluster && conn.node_id.as_deref().map_or(true, |n| n.trim().is_empty()) {
            anyhow::bail!(
                "connection {} is clustered but declares no node_id",
                conn.account
            );
        }
        let printers = &conn.printers;
        if printers.plain.is_none()
            && printers.duplex.is_none()
            && printers.grayscale.is_none()
            && printers.grayscale_duplex.is_none()
        {
            anyhow::bail!("connection {} declares no printers", conn.account);
        }
    }
    if config.engine.quota_integration && config.quota_endpoint.is_none() {
        anyhow::bail!("quota integration is enabled but no quota_endpoint is configured");
    }
    Ok(())
}

/// Read the supplier API key from the environment.
pub fn api_key_from_env() -> Result<String> {
    dotenvy::dotenv().ok();
    std::env::var(API_KEY_ENV)
        .map_err(|_| anyhow::anyhow!("{API_KEY_ENV} missing in environment"))
}
