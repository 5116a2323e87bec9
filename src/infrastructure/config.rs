use crate::domain::ledger::CompletionCredit;
use crate::domain::time_format::TimeFormat;
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const REMOTE_JSON: &str = "remote.json";
const SYNC_JSON: &str = "sync.json";

const REMOTE_URL_KEYS: &[&str] = &["CHORESTAR_REMOTE_URL"];
const REALTIME_URL_KEYS: &[&str] = &["CHORESTAR_REALTIME_URL"];
const API_KEY_KEYS: &[&str] = &["CHORESTAR_API_KEY"];

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub remote: serde_json::Value,
    pub sync: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub timezone: Tz,
    pub time_format: TimeFormat,
    pub completion_credit: CompletionCredit,
}

/// Remote endpoints. Without a REST url and API key the app stays
/// local-only; the realtime url is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSettings {
    pub rest_url: Option<String>,
    pub realtime_url: Option<String>,
    pub api_key: Option<String>,
}

impl RemoteSettings {
    pub fn is_configured(&self) -> bool {
        self.rest_url.is_some() && self.api_key.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub guard_window: Duration,
    pub retry_max_attempts: u8,
    pub retry_base_delay_ms: u64,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            guard_window: Duration::from_secs(3),
            retry_max_attempts: 3,
            retry_base_delay_ms: 200,
            read_timeout: Duration::from_millis(8_000),
            write_timeout: Duration::from_millis(10_000),
            tick_interval: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub app: AppSettings,
    pub remote: RemoteSettings,
    pub sync: SyncSettings,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": "UTC",
                "timeFormat": "12h",
                "completionCredit": "none"
            }),
        ),
        (
            REMOTE_JSON,
            serde_json::json!({
                "schema": 1,
                "restUrl": null,
                "realtimeUrl": null,
                "apiKey": null
            }),
        ),
        (
            SYNC_JSON,
            serde_json::json!({
                "schema": 1,
                "guardWindowSeconds": 3,
                "retry": {
                    "maxAttempts": 3,
                    "baseDelayMs": 200
                },
                "readTimeoutMs": 8000,
                "writeTimeoutMs": 10000,
                "tickIntervalMs": 1000
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        remote: read_config(&config_dir.join(REMOTE_JSON))?,
        sync: read_config(&config_dir.join(SYNC_JSON))?,
    })
}

pub fn load_settings(config_dir: &Path) -> Result<Settings, InfraError> {
    load_settings_with_lookup(config_dir, |key| std::env::var(key).ok())
}

pub fn load_settings_with_lookup<F>(config_dir: &Path, lookup: F) -> Result<Settings, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let bundle = load_configs(config_dir)?;
    Ok(Settings {
        app: parse_app_settings(&bundle.app)?,
        remote: parse_remote_settings(&bundle.remote, &lookup),
        sync: parse_sync_settings(&bundle.sync)?,
    })
}

fn parse_app_settings(app: &serde_json::Value) -> Result<AppSettings, InfraError> {
    let timezone = match string_field(app, "timezone") {
        Some(name) => name
            .parse::<Tz>()
            .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone '{name}': {error}")))?,
        None => Tz::UTC,
    };
    let time_format = match string_field(app, "timeFormat") {
        Some(value) => serde_json::from_value(serde_json::Value::String(value.clone()))
            .map_err(|_| InfraError::InvalidConfig(format!("invalid timeFormat '{value}'")))?,
        None => TimeFormat::default(),
    };
    let completion_credit = match string_field(app, "completionCredit") {
        Some(value) => serde_json::from_value(serde_json::Value::String(value.clone()))
            .map_err(|_| InfraError::InvalidConfig(format!("invalid completionCredit '{value}'")))?,
        None => CompletionCredit::default(),
    };
    Ok(AppSettings {
        timezone,
        time_format,
        completion_credit,
    })
}

fn parse_remote_settings<F>(remote: &serde_json::Value, lookup: &F) -> RemoteSettings
where
    F: Fn(&str) -> Option<String>,
{
    RemoteSettings {
        rest_url: optional_lookup_value(lookup, REMOTE_URL_KEYS)
            .or_else(|| string_field(remote, "restUrl")),
        realtime_url: optional_lookup_value(lookup, REALTIME_URL_KEYS)
            .or_else(|| string_field(remote, "realtimeUrl")),
        api_key: optional_lookup_value(lookup, API_KEY_KEYS)
            .or_else(|| string_field(remote, "apiKey")),
    }
}

fn parse_sync_settings(sync: &serde_json::Value) -> Result<SyncSettings, InfraError> {
    let defaults = SyncSettings::default();
    let retry = sync.get("retry");
    let retry_max_attempts = match retry.and_then(|retry| u64_field(retry, "maxAttempts")) {
        Some(value) => u8::try_from(value)
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| InfraError::InvalidConfig(format!("invalid retry.maxAttempts {value}")))?,
        None => defaults.retry_max_attempts,
    };
    let tick_interval = u64_field(sync, "tickIntervalMs")
        .map(Duration::from_millis)
        .unwrap_or(defaults.tick_interval);
    if tick_interval.is_zero() {
        return Err(InfraError::InvalidConfig(
            "tickIntervalMs must be > 0".to_string(),
        ));
    }

    Ok(SyncSettings {
        guard_window: u64_field(sync, "guardWindowSeconds")
            .map(Duration::from_secs)
            .unwrap_or(defaults.guard_window),
        retry_max_attempts,
        retry_base_delay_ms: retry
            .and_then(|retry| u64_field(retry, "baseDelayMs"))
            .unwrap_or(defaults.retry_base_delay_ms),
        read_timeout: u64_field(sync, "readTimeoutMs")
            .map(Duration::from_millis)
            .unwrap_or(defaults.read_timeout),
        write_timeout: u64_field(sync, "writeTimeoutMs")
            .map(Duration::from_millis)
            .unwrap_or(defaults.write_timeout),
        tick_interval,
    })
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn u64_field(value: &serde_json::Value, key: &str) -> Option<u64> {
    value.get(key).and_then(serde_json::Value::as_u64)
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DIR: AtomicUsize = AtomicUsize::new(0);

    struct TempConfigDir {
        path: PathBuf,
    }

    impl TempConfigDir {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DIR.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "chorestar-config-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp dir");
            ensure_default_configs(&path).expect("write defaults");
            Self { path }
        }

        fn write(&self, name: &str, value: serde_json::Value) {
            fs::write(self.path.join(name), value.to_string()).expect("write config");
        }
    }

    impl Drop for TempConfigDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn defaults_load_as_local_only_settings() {
        let dir = TempConfigDir::new();
        let settings = load_settings_with_lookup(&dir.path, |_| None).expect("load settings");

        assert_eq!(settings.app.timezone, Tz::UTC);
        assert_eq!(settings.app.time_format, TimeFormat::TwelveHour);
        assert_eq!(settings.app.completion_credit, CompletionCredit::None);
        assert!(!settings.remote.is_configured());
        assert_eq!(settings.sync, SyncSettings::default());
    }

    #[test]
    fn environment_overrides_remote_file_values() {
        let dir = TempConfigDir::new();
        dir.write(
            REMOTE_JSON,
            serde_json::json!({
                "schema": 1,
                "restUrl": "https://file.example.com",
                "realtimeUrl": "wss://file.example.com",
                "apiKey": "file-key"
            }),
        );

        let settings = load_settings_with_lookup(&dir.path, |key| match key {
            "CHORESTAR_REMOTE_URL" => Some(" https://env.example.com ".to_string()),
            "CHORESTAR_API_KEY" => Some("   ".to_string()),
            _ => None,
        })
        .expect("load settings");

        assert_eq!(settings.remote.rest_url.as_deref(), Some("https://env.example.com"));
        assert_eq!(settings.remote.realtime_url.as_deref(), Some("wss://file.example.com"));
        assert_eq!(settings.remote.api_key.as_deref(), Some("file-key"));
        assert!(settings.remote.is_configured());
    }

    #[test]
    fn app_and_sync_values_are_validated() {
        let dir = TempConfigDir::new();
        dir.write(
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": "Europe/Berlin",
                "timeFormat": "24h",
                "completionCredit": "reward_points"
            }),
        );
        dir.write(
            SYNC_JSON,
            serde_json::json!({
                "schema": 1,
                "guardWindowSeconds": 5,
                "retry": { "maxAttempts": 4, "baseDelayMs": 50 }
            }),
        );
        let settings = load_settings_with_lookup(&dir.path, |_| None).expect("load settings");
        assert_eq!(settings.app.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(settings.app.time_format, TimeFormat::TwentyFourHour);
        assert_eq!(settings.app.completion_credit, CompletionCredit::RewardPoints);
        assert_eq!(settings.sync.guard_window, Duration::from_secs(5));
        assert_eq!(settings.sync.retry_max_attempts, 4);
        assert_eq!(settings.sync.read_timeout, Duration::from_millis(8_000));

        dir.write(
            APP_JSON,
            serde_json::json!({ "schema": 1, "timezone": "Mars/Olympus" }),
        );
        assert!(matches!(
            load_settings_with_lookup(&dir.path, |_| None),
            Err(InfraError::InvalidConfig(_))
        ));

        dir.write(APP_JSON, serde_json::json!({ "schema": 2 }));
        assert!(matches!(
            load_settings_with_lookup(&dir.path, |_| None),
            Err(InfraError::InvalidConfig(_))
        ));
    }
}
