use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use {
    anyhow::Context,
    tracing::{debug, warn},
};

use crate::schema::ModelgateConfig;

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "modelgate.toml",
    "modelgate.yaml",
    "modelgate.yml",
    "modelgate.json",
];

/// Environment variable that pins the config directory.
pub const CONFIG_DIR_ENV: &str = "MODELGATE_CONFIG_DIR";

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, config discovery only looks in
/// this directory and the token store defaults to living there too.
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
    {
        return Some(dir);
    }
    std::env::var_os(CONFIG_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<ModelgateConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `$MODELGATE_CONFIG_DIR` (or the `set_config_dir` override), exclusively
/// 2. `./modelgate.{toml,yaml,yml,json}` (project-local)
/// 3. `~/.config/modelgate/modelgate.{toml,yaml,yml,json}` (user-global)
///
/// Returns `ModelgateConfig::default()` if no config file is found or the
/// file cannot be parsed.
pub fn discover_and_load() -> ModelgateConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return ModelgateConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            ModelgateConfig::default()
        },
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        // Override is set, never fall through to other locations.
        return first_existing(&dir);
    }

    first_existing(Path::new(".")).or_else(|| first_existing(&user_config_dir()?))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

fn user_config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("modelgate"))
}

/// Returns the config directory: override, or `~/.config/modelgate/` on all platforms.
pub fn config_dir() -> PathBuf {
    config_dir_override()
        .or_else(user_config_dir)
        .unwrap_or_else(|| PathBuf::from(".modelgate"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<ModelgateConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
