//! Configuration file management for weave.
//!
//! Provides a TOML-based config file at `~/.config/weave/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use weave_core::Cap;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineSection {
    /// Named resource totals, e.g. `cpu = 8.0`. A name absent here is
    /// treated as unbounded, matching `ResourceManager`'s default.
    #[serde(default)]
    pub resources: HashMap<String, f64>,
    /// Default `concurrency_limit` for workflows that don't set their own.
    #[serde(default)]
    pub default_concurrency: Option<usize>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the weave config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/weave` or `~/.config/weave`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("weave");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("weave")
}

/// Return the path to the weave config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use by `Engine::with_resource_totals`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeaveConfig {
    pub resource_totals: HashMap<String, Cap>,
    pub default_concurrency: Option<usize>,
}

/// Parse a single `name=amount` CLI/env resource entry.
pub fn parse_resource_arg(s: &str) -> Result<(String, f64)> {
    let (name, amount) = s
        .split_once('=')
        .with_context(|| format!("invalid resource spec {s:?}, expected name=amount"))?;
    let amount: f64 = amount
        .parse()
        .with_context(|| format!("invalid resource amount in {s:?}"))?;
    Ok((name.to_string(), amount))
}

impl WeaveConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default, per-field.
    ///
    /// - Resources: config file `engine.resources` is the base; `WEAVE_RESOURCES`
    ///   (comma-separated `name=amount` pairs) overlays it; `cli_resources`
    ///   (repeatable `--resource name=amount` flags) overlays both. A
    ///   resource absent everywhere is unbounded.
    /// - Concurrency: `cli_max_concurrency` > `WEAVE_MAX_CONCURRENCY` env >
    ///   `engine.default_concurrency` in the config file > unbounded.
    pub fn resolve(cli_resources: &[String], cli_max_concurrency: Option<usize>) -> Result<Self> {
        let file_config = load_config().ok();

        let mut resources: HashMap<String, f64> = file_config
            .as_ref()
            .map(|c| c.engine.resources.clone())
            .unwrap_or_default();

        if let Ok(env_resources) = std::env::var("WEAVE_RESOURCES") {
            for entry in env_resources.split(',').filter(|s| !s.trim().is_empty()) {
                let (name, amount) = parse_resource_arg(entry.trim())?;
                resources.insert(name, amount);
            }
        }

        for entry in cli_resources {
            let (name, amount) = parse_resource_arg(entry)?;
            resources.insert(name, amount);
        }

        let resource_totals = resources
            .into_iter()
            .map(|(name, amount)| (name, Cap::Bounded(amount)))
            .collect();

        let default_concurrency = if let Some(limit) = cli_max_concurrency {
            Some(limit)
        } else if let Ok(limit) = std::env::var("WEAVE_MAX_CONCURRENCY") {
            Some(
                limit
                    .parse()
                    .context("WEAVE_MAX_CONCURRENCY env var is not a valid number")?,
            )
        } else {
            file_config.as_ref().and_then(|c| c.engine.default_concurrency)
        };

        Ok(Self {
            resource_totals,
            default_concurrency,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn parse_resource_arg_accepts_name_equals_amount() {
        let (name, amount) = parse_resource_arg("cpu=8").unwrap();
        assert_eq!(name, "cpu");
        assert_eq!(amount, 8.0);
    }

    #[test]
    fn parse_resource_arg_rejects_missing_equals() {
        assert!(parse_resource_arg("cpu").is_err());
    }

    #[test]
    fn resolve_with_cli_resource_overrides_env_and_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WEAVE_RESOURCES", "cpu=4") };
        unsafe { std::env::remove_var("WEAVE_MAX_CONCURRENCY") };

        let config = WeaveConfig::resolve(&["cpu=8".to_string()], None).unwrap();
        assert_eq!(config.resource_totals.get("cpu"), Some(&Cap::Bounded(8.0)));

        unsafe { std::env::remove_var("WEAVE_RESOURCES") };
    }

    #[test]
    fn resolve_with_env_resource_applies_when_no_cli_override() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WEAVE_RESOURCES", "gpu=2") };

        let config = WeaveConfig::resolve(&[], None).unwrap();
        assert_eq!(config.resource_totals.get("gpu"), Some(&Cap::Bounded(2.0)));

        unsafe { std::env::remove_var("WEAVE_RESOURCES") };
    }

    #[test]
    fn resolve_defaults_to_no_resources_and_unbounded_concurrency() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("WEAVE_RESOURCES") };
        unsafe { std::env::remove_var("WEAVE_MAX_CONCURRENCY") };
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var("HOME", tmp.path()) };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };

        let config = WeaveConfig::resolve(&[], None).unwrap();

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        assert!(config.resource_totals.is_empty());
        assert_eq!(config.default_concurrency, None);
    }

    #[test]
    fn cli_max_concurrency_overrides_env() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WEAVE_MAX_CONCURRENCY", "2") };

        let config = WeaveConfig::resolve(&[], Some(5)).unwrap();
        assert_eq!(config.default_concurrency, Some(5));

        unsafe { std::env::remove_var("WEAVE_MAX_CONCURRENCY") };
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("weave");
        let path = dir.join("config.toml");

        let mut resources = HashMap::new();
        resources.insert("cpu".to_string(), 8.0);
        let original = ConfigFile {
            engine: EngineSection {
                resources,
                default_concurrency: Some(4),
            },
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.engine.resources.get("cpu"), Some(&8.0));
        assert_eq!(loaded.engine.default_concurrency, Some(4));
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("weave/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
