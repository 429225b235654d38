// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::connection::{ConnectionSettings, DEFAULT_VPN_TIMEOUT};
use crate::app::orchestrator::OrchestratorSettings;
use crate::app::services::retry::RetryPolicy;

const APP_DIR_NAME: &str = "rtlaunch";
const CONFIG_FILE_NAME: &str = "config.toml";
const HOSTS_FILE_NAME: &str = "hosts.toml";
const CONFIG_ENV_VAR: &str = "RTLAUNCH_CONFIG_PATH";
const DATA_DIR_NAME: &str = ".rtlaunch";
const DATABASE_FILE_NAME: &str = "jobs.sqlite";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_WALLTIME_GRACE_SECS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 2000;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_path: Option<String>,
    hosts_path: Option<String>,
    poll_interval_secs: Option<u64>,
    walltime_grace_secs: Option<u64>,
    connect_max_retries: Option<u32>,
    connect_backoff_ms: Option<u64>,
    poll_max_retries: Option<u32>,
    poll_backoff_ms: Option<u64>,
    verbose: Option<bool>,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub hosts_path: PathBuf,
    pub poll_interval_secs: u64,
    pub walltime_grace_secs: u64,
    pub connect_max_retries: u32,
    pub connect_backoff_ms: u64,
    pub poll_max_retries: u32,
    pub poll_backoff_ms: u64,
    pub verbose: bool,
}

impl Config {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            retry: RetryPolicy::new(
                self.connect_max_retries,
                Duration::from_millis(self.connect_backoff_ms),
            ),
            vpn_timeout: DEFAULT_VPN_TIMEOUT,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_retry: RetryPolicy::new(
                self.poll_max_retries,
                Duration::from_millis(self.poll_backoff_ms),
            ),
            walltime_grace: Duration::from_secs(self.walltime_grace_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub hosts_path: ConfigValue<PathBuf>,
    pub poll_interval_secs: ConfigValue<u64>,
    pub walltime_grace_secs: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
}

impl ConfigReport {
    /// Logged once at startup so operators can see where each value came from.
    pub fn log(&self) {
        tracing::debug!(
            config_path = ?self.config_path,
            config_path_source = self.config_path_source.map(ConfigSource::as_str),
            config_file_present = self.config_file_present,
            database_path = %self.database_path.value.display(),
            database_path_source = self.database_path.source.as_str(),
            hosts_path = %self.hosts_path.value.display(),
            hosts_path_source = self.hosts_path.source.as_str(),
            poll_interval_secs = self.poll_interval_secs.value,
            poll_interval_source = self.poll_interval_secs.source.as_str(),
            walltime_grace_secs = self.walltime_grace_secs.value,
            walltime_grace_source = self.walltime_grace_secs.source.as_str(),
            verbose = self.verbose.value,
            verbose_source = self.verbose.source.as_str(),
            "configuration resolved"
        );
    }
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub hosts_path: Option<PathBuf>,
    pub verbose: Option<bool>,
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

fn pick<T>(over: Option<T>, file: Option<T>, default: T) -> ConfigValue<T> {
    match (over, file) {
        (Some(value), _) => ConfigValue::new(value, ConfigSource::Override),
        (None, Some(value)) => ConfigValue::new(value, ConfigSource::ConfigFile),
        (None, None) => ConfigValue::new(default, ConfigSource::Default),
    }
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let database_path = match overrides.database_path {
        Some(path) => ConfigValue::new(expand_path(path), ConfigSource::Override),
        None => match file_config.database_path.as_deref() {
            Some(raw) => ConfigValue::new(resolve_path(raw, base_dir), ConfigSource::ConfigFile),
            None => ConfigValue::new(
                default_database_path().with_context(|| {
                    "failed to resolve default database path; pass --database or set database_path in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let hosts_path = match overrides.hosts_path {
        Some(path) => ConfigValue::new(expand_path(path), ConfigSource::Override),
        None => match file_config.hosts_path.as_deref() {
            Some(raw) => ConfigValue::new(resolve_path(raw, base_dir), ConfigSource::ConfigFile),
            None => ConfigValue::new(
                default_hosts_path().with_context(|| {
                    "failed to resolve default hosts path; pass --hosts or set hosts_path in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let poll_interval_secs = pick(
        None,
        file_config.poll_interval_secs,
        DEFAULT_POLL_INTERVAL_SECS,
    );
    if poll_interval_secs.value == 0 {
        anyhow::bail!("poll_interval_secs must be at least 1");
    }
    let walltime_grace_secs = pick(
        None,
        file_config.walltime_grace_secs,
        DEFAULT_WALLTIME_GRACE_SECS,
    );
    let verbose = pick(overrides.verbose, file_config.verbose, false);

    let config = Config {
        database_path: database_path.value.clone(),
        hosts_path: hosts_path.value.clone(),
        poll_interval_secs: poll_interval_secs.value,
        walltime_grace_secs: walltime_grace_secs.value,
        connect_max_retries: file_config.connect_max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        connect_backoff_ms: file_config.connect_backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS),
        poll_max_retries: file_config.poll_max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        poll_backoff_ms: file_config.poll_backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS),
        verbose: verbose.value,
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path,
        hosts_path,
        poll_interval_secs,
        walltime_grace_secs,
        verbose,
    };

    Ok(LoadResult { config, report })
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// `~` is expanded; relative paths are taken from `base_dir`.
pub(crate) fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join(CONFIG_FILE_NAME))
}

fn default_hosts_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join(HOSTS_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to resolve home directory")?;
    Ok(home.join(DATA_DIR_NAME).join(DATABASE_FILE_NAME))
}

fn default_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to resolve home directory")?;
    Ok(home.join(".config").join(APP_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                match &self.prev {
                    Some(value) => std::env::set_var(self.key, value),
                    None => std::env::remove_var(self.key),
                }
            }
        }
    }

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join("config.toml");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_required_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let err = read_config_file(&dir.path().join("missing.toml"), true).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn missing_optional_config_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let cfg = read_config_file(&dir.path().join("missing.toml"), false).unwrap();
        assert!(cfg.database_path.is_none());
        assert!(cfg.poll_interval_secs.is_none());
    }

    #[test]
    fn file_values_resolve_relative_to_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "database_path = \"db/jobs.sqlite\"\nhosts_path = \"hosts.toml\"\npoll_interval_secs = 10\nwalltime_grace_secs = 60\n",
        );
        let loaded = load_with_report(Some(path.clone()), Overrides::default()).unwrap();
        let config_dir = path.parent().unwrap();
        assert_eq!(
            loaded.config.database_path,
            config_dir.join("db").join("jobs.sqlite")
        );
        assert_eq!(loaded.config.hosts_path, config_dir.join("hosts.toml"));
        assert_eq!(loaded.config.poll_interval_secs, 10);
        assert_eq!(loaded.config.walltime_grace_secs, 60);
        assert_eq!(loaded.report.poll_interval_secs.source, ConfigSource::ConfigFile);
        assert_eq!(loaded.report.config_path_source, Some(ConfigSource::Override));
        assert!(loaded.report.config_file_present);
    }

    #[test]
    fn defaults_fill_missing_values() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"jobs.sqlite\"\n");
        let loaded = load_with_report(Some(path), Overrides::default()).unwrap();
        assert_eq!(loaded.config.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(loaded.config.walltime_grace_secs, DEFAULT_WALLTIME_GRACE_SECS);
        assert_eq!(loaded.config.connect_max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(loaded.config.poll_backoff_ms, DEFAULT_BACKOFF_MS);
        assert!(!loaded.config.verbose);
        assert_eq!(loaded.report.verbose.source, ConfigSource::Default);
        assert_eq!(loaded.report.hosts_path.source, ConfigSource::Default);
    }

    #[test]
    fn cli_overrides_take_precedence_over_file_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "database_path = \"from_config.sqlite\"\nhosts_path = \"from_config.toml\"\nverbose = false\n",
        );
        let loaded = load_with_report(
            Some(path),
            Overrides {
                database_path: Some(PathBuf::from("/tmp/from_flag.sqlite")),
                hosts_path: Some(PathBuf::from("/tmp/hosts.toml")),
                verbose: Some(true),
            },
        )
        .unwrap();
        assert_eq!(loaded.config.database_path, PathBuf::from("/tmp/from_flag.sqlite"));
        assert_eq!(loaded.config.hosts_path, PathBuf::from("/tmp/hosts.toml"));
        assert!(loaded.config.verbose);
        assert_eq!(loaded.report.database_path.source, ConfigSource::Override);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "poll_interval_secs = 0\n");
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "poll_intervall_secs = 5\n");
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    fn env_var_selects_config_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "poll_interval_secs = 7\n");
        let _guard = EnvVarGuard::set(CONFIG_ENV_VAR, path.to_str().unwrap());
        let loaded = load_with_report(None, Overrides::default()).unwrap();
        assert_eq!(loaded.config.poll_interval_secs, 7);
        assert_eq!(loaded.report.config_path_source, Some(ConfigSource::Env));
    }

    #[test]
    fn env_var_pointing_nowhere_is_an_error() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        let _guard = EnvVarGuard::set(CONFIG_ENV_VAR, missing.to_str().unwrap());
        assert!(load(None, Overrides::default()).is_err());
    }

    #[test]
    fn empty_env_var_is_an_error() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvVarGuard::set(CONFIG_ENV_VAR, "");
        let err = config_path_from_env().unwrap_err();
        assert!(err.to_string().contains("set but empty"));
    }

    #[test]
    fn unset_env_var_falls_back_to_default_location() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvVarGuard::clear(CONFIG_ENV_VAR);
        assert!(config_path_from_env().unwrap().is_none());
    }

    #[test]
    fn settings_carry_retry_budgets() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "connect_max_retries = 5\nconnect_backoff_ms = 100\npoll_max_retries = 1\npoll_backoff_ms = 50\n",
        );
        let config = load(Some(path), Overrides::default()).unwrap();
        let connection = config.connection_settings();
        assert_eq!(connection.retry, RetryPolicy::new(5, Duration::from_millis(100)));
        let orchestrator = config.orchestrator_settings();
        assert_eq!(orchestrator.poll_retry, RetryPolicy::new(1, Duration::from_millis(50)));
        assert_eq!(orchestrator.walltime_grace, Duration::from_secs(300));
    }

    #[test]
    fn ensure_database_dir_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("jobs.sqlite");
        ensure_database_dir(&db_path).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
