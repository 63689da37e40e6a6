//! Configuration for crucible paths and tuning.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CRUCIBLE_HOME)
//! 2. Config file (.crucible/config.yaml)
//! 3. Defaults (~/.crucible)
//!
//! Config file discovery:
//! - Searches current directory and parents for .crucible/config.yaml
//! - Paths in the config file are relative to the config file's directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::monitor::{MetricThresholds, MonitorConfig};
use crate::resilience::{BreakerConfig, HealthThresholds, ResilienceConfig};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<std::result::Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub resilience: Option<ResilienceSection>,
    #[serde(default)]
    pub monitor: Option<MonitorSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to config file)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceSection {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub recovery_timeout_ms: Option<u64>,
    pub health_window: Option<usize>,
    pub degraded_below: Option<f64>,
    pub unhealthy_below: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    pub monitoring_interval_secs: Option<u64>,
    pub cpu_warning: Option<f64>,
    pub cpu_critical: Option<f64>,
    pub memory_warning: Option<f64>,
    pub memory_critical: Option<f64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to crucible home (engine state)
    pub home: PathBuf,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,

    pub resilience: ResilienceConfig,
    pub monitor: MonitorConfig,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".crucible").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn resilience_from(section: Option<&ResilienceSection>) -> ResilienceConfig {
    let defaults = ResilienceConfig::default();
    let Some(section) = section else {
        return defaults;
    };

    ResilienceConfig {
        breaker: BreakerConfig {
            failure_threshold: section
                .failure_threshold
                .unwrap_or(defaults.breaker.failure_threshold),
            success_threshold: section
                .success_threshold
                .unwrap_or(defaults.breaker.success_threshold),
            recovery_timeout_ms: section
                .recovery_timeout_ms
                .unwrap_or(defaults.breaker.recovery_timeout_ms),
        },
        health: HealthThresholds {
            degraded_below: section
                .degraded_below
                .unwrap_or(defaults.health.degraded_below),
            unhealthy_below: section
                .unhealthy_below
                .unwrap_or(defaults.health.unhealthy_below),
        },
        health_window: section.health_window.unwrap_or(defaults.health_window),
        monitoring_interval: defaults.monitoring_interval,
    }
}

fn monitor_from(section: Option<&MonitorSection>) -> MonitorConfig {
    let defaults = MonitorConfig::default();
    let Some(section) = section else {
        return defaults;
    };

    MonitorConfig {
        monitoring_interval: section
            .monitoring_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.monitoring_interval),
        cpu: MetricThresholds {
            warning: section.cpu_warning.unwrap_or(defaults.cpu.warning),
            critical: section.cpu_critical.unwrap_or(defaults.cpu.critical),
        },
        memory: MetricThresholds {
            warning: section.memory_warning.unwrap_or(defaults.memory.warning),
            critical: section.memory_critical.unwrap_or(defaults.memory.critical),
        },
        window: defaults.window,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".crucible");

    let config_file = find_config_file();

    let (home, resilience, monitor) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        let home = if let Ok(env_home) = std::env::var("CRUCIBLE_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            // home is relative to the .crucible/ directory
            let crucible_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(crucible_dir, home_path)
        } else {
            default_home.clone()
        };

        (
            home,
            resilience_from(config.resilience.as_ref()),
            monitor_from(config.monitor.as_ref()),
        )
    } else {
        let home = std::env::var("CRUCIBLE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        (home, ResilienceConfig::default(), MonitorConfig::default())
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        resilience,
        monitor,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the crucible home directory (engine state).
pub fn crucible_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($CRUCIBLE_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}

/// Get the checkpoints directory ($CRUCIBLE_HOME/checkpoints)
pub fn checkpoints_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("checkpoints"))
}
