//! Configuration loader
//!
//! Loads [`GatewayConfig`] from a file and layers environment overrides on
//! top.
//!
//! ## Loading Strategy
//! 1. Probe the standard locations for a config file
//! 2. Parse it as TOML or JSON by extension; no file means defaults
//! 3. Apply `SHEETGATE_*` environment overrides
//! 4. Validate the result
//!
//! ## Environment Variables
//! - `SHEETGATE_STATE_BACKEND`: `memory` or `sqlite`
//! - `SHEETGATE_STATE_PATH`: SQLite database file
//! - `SHEETGATE_CB_FAILURE_THRESHOLD`, `SHEETGATE_CB_TIMEOUT_MS`
//! - `SHEETGATE_HEALTH_RESET_THRESHOLD`, `SHEETGATE_HEALTH_MAX_IDLE_MS`
//! - `SHEETGATE_CACHE_TTL_MS`, `SHEETGATE_CACHE_MAX_ENTRIES`
//! - `SHEETGATE_TX_TIMEOUT_MS`
//! - `SHEETGATE_RETRY_MAX_ATTEMPTS`
//! - `SHEETGATE_LOG_LEVEL`, `SHEETGATE_LOG_FORMAT`
//!
//! ## File Locations
//! The loader checks `sheetgate.toml`, `sheetgate.json`, `config.toml` and
//! `config.json` in the working directory, its parent and grandparent, then
//! next to the executable.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sheetgate_domain::{GatewayConfig, GatewayError, LogFormat, Result, StateBackend};

const CONFIG_FILE_NAMES: [&str; 4] =
    ["sheetgate.toml", "sheetgate.json", "config.toml", "config.json"];

/// Load configuration: file (if any), then environment overrides
///
/// # Errors
/// Returns `GatewayError::Config` if a file exists but cannot be parsed, an
/// override has an invalid value, or the result fails validation.
pub fn load() -> Result<GatewayConfig> {
    let mut config = match find_config_file() {
        Some(path) => load_from_file(Some(path))?,
        None => {
            tracing::info!("No config file found; using defaults");
            GatewayConfig::default()
        }
    };
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, searches the standard locations. The format is chosen
/// by extension.
///
/// # Errors
/// Returns `GatewayError::Config` if the file is missing, unreadable or
/// malformed.
pub fn load_from_file(path: Option<PathBuf>) -> Result<GatewayConfig> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(GatewayError::config(format!("Config file not found: {}", p.display())));
            }
            p
        }
        None => find_config_file()
            .ok_or_else(|| {
                GatewayError::config("No config file found in any of the standard locations")
            })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| GatewayError::config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, &config_path)
}

fn parse_config(contents: &str, path: &Path) -> Result<GatewayConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| GatewayError::config(format!("Invalid TOML format: {e}"))),
        "json" => {
            serde_json::from_str(contents)
                .map_err(|e| GatewayError::config(format!("Invalid JSON format: {e}")))
        }
        _ => Err(GatewayError::config(format!("Unsupported config format: {extension}"))),
    }
}

/// First existing config file in the standard locations
pub fn find_config_file() -> Option<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        dirs.extend([cwd.clone(), cwd.join(".."), cwd.join("../..")]);
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            dirs.push(exe_dir.to_path_buf());
        }
    }

    dirs.iter()
        .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|path| path.is_file())
}

/// Apply every `SHEETGATE_*` variable that is set
///
/// # Errors
/// Returns `GatewayError::Config` naming the variable with a bad value.
pub fn apply_env_overrides(config: &mut GatewayConfig) -> Result<()> {
    if let Some(raw) = env_value("SHEETGATE_STATE_BACKEND") {
        config.state_store.backend = StateBackend::parse(&raw)
            .ok_or_else(|| {
                GatewayError::config(format!("Invalid SHEETGATE_STATE_BACKEND: {raw}"))
            })?;
    }
    if let Some(path) = env_value("SHEETGATE_STATE_PATH") {
        config.state_store.path = path;
    }
    override_number(
        "SHEETGATE_CB_FAILURE_THRESHOLD",
        &mut config.circuit_breaker.failure_threshold,
    )?;
    override_number("SHEETGATE_CB_TIMEOUT_MS", &mut config.circuit_breaker.timeout_ms)?;
    override_number(
        "SHEETGATE_HEALTH_RESET_THRESHOLD",
        &mut config.connection_health.reset_threshold,
    )?;
    override_number("SHEETGATE_HEALTH_MAX_IDLE_MS", &mut config.connection_health.max_idle_ms)?;
    override_number("SHEETGATE_CACHE_TTL_MS", &mut config.cache.ttl_ms)?;
    override_number("SHEETGATE_CACHE_MAX_ENTRIES", &mut config.cache.max_entries)?;
    override_number("SHEETGATE_TX_TIMEOUT_MS", &mut config.transactions.inactivity_timeout_ms)?;
    override_number("SHEETGATE_RETRY_MAX_ATTEMPTS", &mut config.retry.max_attempts)?;
    if let Some(level) = env_value("SHEETGATE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(raw) = env_value("SHEETGATE_LOG_FORMAT") {
        config.logging.format = LogFormat::parse(&raw)
            .ok_or_else(|| GatewayError::config(format!("Invalid SHEETGATE_LOG_FORMAT: {raw}")))?;
    }
    Ok(())
}

/// Set, non-blank environment variable
fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn override_number<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env_value(key) {
        *target = raw
            .parse()
            .map_err(|e| GatewayError::config(format!("Invalid {key} '{raw}': {e}")))?;
    }
    Ok(())
}
