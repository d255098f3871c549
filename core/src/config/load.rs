use std::path::{Path, PathBuf};

use super::types::{AnalysisProvider, AppConfig};

/// Get the default harvest data directory: ~/.harvest
pub fn get_harvest_data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("HARVEST_DATA_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(PathBuf::from(home).join(".harvest"))
}

/// Load an explicit config file, then apply environment overrides.
pub fn load_from_path(path: &Path) -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
    let mut cfg = toml::from_str::<AppConfig>(&s)?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

pub fn load_default() -> anyhow::Result<AppConfig> {
    // Priority 1: ~/.harvest/config.toml (highest)
    let data_dir = get_harvest_data_dir()?;
    let home_config = data_dir.join("config.toml");

    // Priority 2: ./config.toml (current directory)
    let local_config = Path::new("config.toml");

    let mut cfg: AppConfig = if home_config.exists() {
        let s = std::fs::read_to_string(&home_config)?;
        toml::from_str::<AppConfig>(&s)?
    } else if local_config.exists() {
        let s = std::fs::read_to_string(local_config)?;
        toml::from_str::<AppConfig>(&s)?
    } else {
        AppConfig::default()
    };

    if cfg.logging.file
        && cfg
            .logging
            .directory
            .as_deref()
            .map(|s| s.trim().is_empty())
            .unwrap_or(true)
    {
        cfg.logging.directory = Some(data_dir.join("logs").to_string_lossy().to_string());
    }

    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn apply_env_overrides(cfg: &mut AppConfig) {
    if let Some(v) = env_value("HARVEST_UPSTREAM_URL") {
        cfg.upstream.base_url = v;
    }
    if let Some(v) = env_value("HARVEST_UPSTREAM_QUERY") {
        cfg.upstream.feed_query = v;
    }
    if let Some(v) = env_value("HARVEST_DATA_DIR") {
        if cfg.persistence.directory.is_none() {
            cfg.persistence.directory =
                Some(PathBuf::from(v).join("store").to_string_lossy().to_string());
        }
    }

    let AnalysisProvider::Service(ref mut svc) = cfg.analysis.provider else {
        return;
    };
    if let Some(v) = env_value("HARVEST_ANALYZER_URL") {
        svc.base_url = v;
    }
    if let Some(v) = env_value("HARVEST_ANALYZER_API_KEY") {
        svc.api_key = v;
    }
}
