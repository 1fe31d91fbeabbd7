use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide service settings. Tenant behaviour lives in the per-domain
/// `.conf` files instead.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub listen: String,
    pub config_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub static_dir: PathBuf,
    pub rate_limit: RateLimitSettings,
    pub reputation: ReputationSettings,
    pub probe: ProbeSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RateLimitSettings {
    /// One submission token is refilled every `interval_seconds`.
    pub interval_seconds: u64,
    pub burst: u32,
    pub idle_expiry_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReputationSettings {
    pub endpoint: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ProbeSettings {
    pub port: u16,
    pub timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            config_dir: PathBuf::from("config"),
            templates_dir: PathBuf::from("templates"),
            static_dir: PathBuf::from("static"),
            rate_limit: RateLimitSettings::default(),
            reputation: ReputationSettings::default(),
            probe: ProbeSettings::default(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 5 * 60,
            burst: 1,
            idle_expiry_seconds: 30 * 60,
        }
    }
}

impl RateLimitSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn idle_expiry(&self) -> Duration {
        Duration::from_secs(self.idle_expiry_seconds)
    }
}

impl Default for ReputationSettings {
    fn default() -> Self {
        Self {
            endpoint: crate::reputation::ABUSEIPDB_ENDPOINT.to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            port: 25,
            timeout_seconds: 30,
        }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read settings file: {}", path.as_ref().display()))?;

    let settings: Settings = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML settings: {}", path.as_ref().display()))?;

    Ok(settings)
}

pub fn load_settings_or_default<P: AsRef<Path>>(path: P) -> Result<Settings> {
    if !path.as_ref().exists() {
        log::warn!(
            "Settings file '{}' not found, using defaults",
            path.as_ref().display()
        );
        return Ok(Settings::default());
    }

    let settings = load_settings(&path)?;
    log::info!("Loaded settings from: {}", path.as_ref().display());
    Ok(settings)
}

pub fn generate_default_settings<P: AsRef<Path>>(path: P) -> Result<()> {
    let yaml = serde_yaml::to_string(&Settings::default())?;
    fs::write(&path, yaml)
        .with_context(|| format!("Failed to write settings file: {}", path.as_ref().display()))?;
    Ok(())
}
