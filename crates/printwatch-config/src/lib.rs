//! Configuration for the printwatch daemon.
//!
//! A single TOML file describes the fleet, monitor tuning, the relay
//! database, and alert routing. Environment variables prefixed
//! `PRINTWATCH_` override file values; secrets can be indirected
//! through `*_env` fields so the file never has to hold them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use printwatch_core::dispatch::{AlertConfig, QuietHours};
use printwatch_core::model::{AlertPreference, UserId};
use printwatch_core::monitor::MonitorConfig;
use printwatch_core::relay::RelayRetention;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no credential configured for printer '{printer}'")]
    NoCredentials { printer: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level daemon configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonSection,

    /// The fleet. One monitor task is spawned per entry.
    #[serde(default)]
    pub printers: Vec<PrinterEntry>,

    #[serde(default)]
    pub alerts: AlertsSection,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DaemonSection {
    /// SQLite file holding the event relay and the alert store.
    /// Defaults to the platform data directory.
    pub database: Option<PathBuf>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_spool_low_percent")]
    pub spool_low_percent: u8,

    #[serde(default = "default_retention_hours")]
    pub relay_retention_hours: u64,

    #[serde(default = "default_relay_max_rows")]
    pub relay_max_rows: u64,

    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            database: None,
            poll_interval_secs: default_poll_interval(),
            failure_threshold: default_failure_threshold(),
            backoff_initial_secs: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            spool_low_percent: default_spool_low_percent(),
            relay_retention_hours: default_retention_hours(),
            relay_max_rows: default_relay_max_rows(),
            janitor_interval_secs: default_janitor_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_backoff_initial() -> u64 {
    5
}
fn default_backoff_max() -> u64 {
    120
}
fn default_spool_low_percent() -> u8 {
    10
}
fn default_retention_hours() -> u64 {
    24
}
fn default_relay_max_rows() -> u64 {
    100_000
}
fn default_janitor_interval() -> u64 {
    300
}

/// One configured printer.
#[derive(Debug, Deserialize, Serialize)]
pub struct PrinterEntry {
    /// Stable id; used as the event source and in spool ids.
    pub id: String,

    /// Display name for alerts. Defaults to the id.
    pub name: Option<String>,

    /// "bambu", "prusa", "octo", or "sdcp".
    pub protocol: String,

    /// Hostname or IP for MQTT/WebSocket printers; base URL for REST
    /// printers (e.g. "http://prusa.local").
    pub address: String,

    /// Printer serial, required for the bambu protocol.
    pub serial: Option<String>,

    /// LAN access code (bambu) — plaintext, prefer the env variant.
    pub access_code: Option<String>,
    /// Environment variable holding the access code.
    pub access_code_env: Option<String>,

    /// API key (prusa and octo) — plaintext, prefer the env variant.
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,

    /// Per-request timeout override.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AlertsSection {
    #[serde(default = "default_suppression_mins")]
    pub suppression_window_mins: u64,

    #[serde(default = "default_channel_timeout")]
    pub channel_timeout_secs: u64,

    /// "HH:MM"-"HH:MM" daily quiet window.
    pub quiet_hours: Option<QuietHoursEntry>,

    /// Users who receive fleet-wide alerts.
    #[serde(default)]
    pub recipients: Vec<String>,

    pub smtp: Option<SmtpSection>,
    pub ntfy: Option<NtfySection>,
    pub mqtt: Option<MqttSection>,

    #[serde(default)]
    pub webhooks: Vec<WebhookEntry>,

    #[serde(default)]
    pub bot_webhooks: Vec<WebhookEntry>,

    #[serde(default)]
    pub push_subscriptions: Vec<PushEntry>,

    /// Per-user channel preference seeds.
    #[serde(default)]
    pub preferences: Vec<PreferenceEntry>,
}

fn default_suppression_mins() -> u64 {
    30
}
fn default_channel_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuietHoursEntry {
    /// "HH:MM" local time.
    pub start: String,
    /// "HH:MM" local time.
    pub end: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SmtpSection {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub password_env: Option<String>,
    /// From address, e.g. "printwatch <alerts@example.com>".
    pub from: String,
    /// user id -> email address.
    #[serde(default)]
    pub addresses: HashMap<String, String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NtfySection {
    pub base_url: String,
    pub topic: String,
    pub token: Option<String>,
    pub token_env: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_prefix")]
    pub topic_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_prefix() -> String {
    "printwatch/alerts".into()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WebhookEntry {
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PushEntry {
    pub user: String,
    pub endpoint: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PreferenceEntry {
    pub user: String,
    /// Alert type, or "*" for all.
    #[serde(default = "default_pref_type")]
    pub alert_type: String,
    #[serde(default = "default_true")]
    pub in_app: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub email: bool,
    pub threshold: Option<f64>,
}

fn default_pref_type() -> String {
    "*".into()
}
fn default_true() -> bool {
    true
}

// ── Loading ─────────────────────────────────────────────────────────

/// Default config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "printwatch", "printwatch").map_or_else(
        || PathBuf::from("printwatch.toml"),
        |dirs| dirs.config_dir().join("printwatch.toml"),
    )
}

/// Default database path when `[daemon].database` is unset.
pub fn default_database_path() -> PathBuf {
    ProjectDirs::from("io", "printwatch", "printwatch").map_or_else(
        || PathBuf::from("printwatch.db"),
        |dirs| dirs.data_dir().join("printwatch.db"),
    )
}

/// Load from `path` (or the default location) merged with
/// `PRINTWATCH_`-prefixed environment variables, then validate.
pub fn load(path: Option<&std::path::Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, PathBuf::from);
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("PRINTWATCH_").split("__"))
        .extract()?;
    validate(&config)?;
    Ok(config)
}

/// Structural validation beyond what serde enforces. Errors name the
/// offending field so a `check` run is actionable.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for printer in &config.printers {
        if printer.id.is_empty() {
            return Err(ConfigError::Validation {
                field: "printers.id".into(),
                reason: "must not be empty".into(),
            });
        }
        if !seen.insert(&printer.id) {
            return Err(ConfigError::Validation {
                field: format!("printers.{}", printer.id),
                reason: "duplicate printer id".into(),
            });
        }
        match printer.protocol.as_str() {
            "bambu" => {
                if printer.serial.is_none() {
                    return Err(ConfigError::Validation {
                        field: format!("printers.{}.serial", printer.id),
                        reason: "bambu printers need a serial".into(),
                    });
                }
                if printer.access_code.is_none() && printer.access_code_env.is_none() {
                    return Err(ConfigError::NoCredentials {
                        printer: printer.id.clone(),
                    });
                }
            }
            "prusa" | "octo" => {
                if printer.api_key.is_none() && printer.api_key_env.is_none() {
                    return Err(ConfigError::NoCredentials {
                        printer: printer.id.clone(),
                    });
                }
                if url::Url::parse(&printer.address).is_err() {
                    return Err(ConfigError::Validation {
                        field: format!("printers.{}.address", printer.id),
                        reason: format!("not a valid base URL: {}", printer.address),
                    });
                }
            }
            "sdcp" => {}
            other => {
                return Err(ConfigError::Validation {
                    field: format!("printers.{}.protocol", printer.id),
                    reason: format!("expected 'bambu', 'prusa', 'octo', or 'sdcp', got '{other}'"),
                });
            }
        }
    }

    if let Some(quiet) = &config.alerts.quiet_hours {
        parse_quiet_hours(quiet)?;
    }
    for hook in config
        .alerts
        .webhooks
        .iter()
        .chain(config.alerts.bot_webhooks.iter())
    {
        if url::Url::parse(&hook.url).is_err() {
            return Err(ConfigError::Validation {
                field: "alerts.webhooks.url".into(),
                reason: format!("not a valid URL: {}", hook.url),
            });
        }
    }
    for sub in &config.alerts.push_subscriptions {
        if url::Url::parse(&sub.endpoint).is_err() {
            return Err(ConfigError::Validation {
                field: "alerts.push_subscriptions.endpoint".into(),
                reason: format!("not a valid URL: {}", sub.endpoint),
            });
        }
    }
    if let Some(ntfy) = &config.alerts.ntfy {
        if url::Url::parse(&ntfy.base_url).is_err() {
            return Err(ConfigError::Validation {
                field: "alerts.ntfy.base_url".into(),
                reason: format!("not a valid URL: {}", ntfy.base_url),
            });
        }
    }
    Ok(())
}

fn parse_quiet_hours(entry: &QuietHoursEntry) -> Result<QuietHours, ConfigError> {
    let parse = |value: &str, field: &str| {
        chrono::NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| ConfigError::Validation {
            field: format!("alerts.quiet_hours.{field}"),
            reason: format!("expected HH:MM, got '{value}'"),
        })
    };
    Ok(QuietHours {
        start: parse(&entry.start, "start")?,
        end: parse(&entry.end, "end")?,
    })
}

// ── Secret resolution ───────────────────────────────────────────────

/// Env-variable indirection wins over plaintext.
pub fn resolve_secret(plain: Option<&str>, env_name: Option<&str>) -> Option<SecretString> {
    if let Some(name) = env_name {
        if let Ok(value) = std::env::var(name) {
            return Some(SecretString::from(value));
        }
    }
    plain.map(|value| SecretString::from(value.to_string()))
}

impl PrinterEntry {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.clone())
    }

    pub fn access_code(&self) -> Result<SecretString, ConfigError> {
        resolve_secret(self.access_code.as_deref(), self.access_code_env.as_deref()).ok_or_else(
            || ConfigError::NoCredentials {
                printer: self.id.clone(),
            },
        )
    }

    pub fn api_key(&self) -> Result<SecretString, ConfigError> {
        resolve_secret(self.api_key.as_deref(), self.api_key_env.as_deref()).ok_or_else(|| {
            ConfigError::NoCredentials {
                printer: self.id.clone(),
            }
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(10))
    }
}

// ── Translation to runtime types ────────────────────────────────────

impl Config {
    pub fn database_path(&self) -> PathBuf {
        self.daemon
            .database
            .clone()
            .unwrap_or_else(default_database_path)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.daemon.poll_interval_secs),
            failure_threshold: self.daemon.failure_threshold,
            backoff_initial: Duration::from_secs(self.daemon.backoff_initial_secs),
            backoff_max: Duration::from_secs(self.daemon.backoff_max_secs),
            spool_low_percent: self.daemon.spool_low_percent,
        }
    }

    pub fn relay_retention(&self) -> RelayRetention {
        RelayRetention {
            max_age: Duration::from_secs(self.daemon.relay_retention_hours * 3600),
            max_rows: self.daemon.relay_max_rows,
        }
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.janitor_interval_secs)
    }

    pub fn alert_config(&self) -> AlertConfig {
        AlertConfig {
            suppression_window: Duration::from_secs(self.alerts.suppression_window_mins * 60),
            channel_timeout: Duration::from_secs(self.alerts.channel_timeout_secs),
            ..AlertConfig::default()
        }
    }

    /// Parsed quiet-hours window, for the org settings capability.
    pub fn quiet_hours(&self) -> Result<Option<QuietHours>, ConfigError> {
        self.alerts
            .quiet_hours
            .as_ref()
            .map(parse_quiet_hours)
            .transpose()
    }

    pub fn recipients(&self) -> Vec<UserId> {
        self.alerts
            .recipients
            .iter()
            .map(|u| UserId(u.clone()))
            .collect()
    }

    pub fn preference_seeds(&self) -> Vec<AlertPreference> {
        self.alerts
            .preferences
            .iter()
            .map(|p| AlertPreference {
                user_id: UserId(p.user.clone()),
                alert_type: p.alert_type.clone(),
                in_app: p.in_app,
                push: p.push,
                email: p.email,
                threshold: p.threshold,
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config.daemon.poll_interval_secs, 5);
        assert_eq!(config.daemon.failure_threshold, 3);
        assert!(config.printers.is_empty());
        validate(&config).unwrap();
    }

    #[test]
    fn full_fleet_parses_and_validates() {
        let config = parse(
            r#"
            [daemon]
            database = "/tmp/pw.db"
            poll_interval_secs = 2

            [[printers]]
            id = "x1c"
            name = "Bambu X1C"
            protocol = "bambu"
            address = "192.168.1.40"
            serial = "00M09A350100001"
            access_code = "12345678"

            [[printers]]
            id = "mk4"
            protocol = "prusa"
            address = "http://mk4.local"
            api_key_env = "MK4_KEY"

            [[printers]]
            id = "voron"
            protocol = "octo"
            address = "http://voron.local"
            api_key = "abc"

            [[printers]]
            id = "saturn"
            protocol = "sdcp"
            address = "192.168.1.50"

            [alerts]
            recipients = ["admin"]
            quiet_hours = { start = "22:00", end = "07:00" }

            [[alerts.preferences]]
            user = "admin"
            push = true
            "#,
        );
        validate(&config).unwrap();
        assert_eq!(config.printers.len(), 4);
        assert_eq!(config.printers[1].display_name(), "mk4");

        let quiet = config.quiet_hours().unwrap().unwrap();
        assert_eq!(quiet.start, chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        assert_eq!(
            config.alert_config().suppression_window,
            Duration::from_secs(30 * 60)
        );

        let seeds = config.preference_seeds();
        assert_eq!(seeds.len(), 1);
        assert!(seeds[0].push);
        assert!(seeds[0].in_app);
        assert_eq!(seeds[0].alert_type, "*");
    }

    #[test]
    fn duplicate_printer_id_is_rejected() {
        let config = parse(
            r#"
            [[printers]]
            id = "p1"
            protocol = "sdcp"
            address = "192.168.1.50"

            [[printers]]
            id = "p1"
            protocol = "sdcp"
            address = "192.168.1.51"
            "#,
        );
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn bambu_without_access_code_is_rejected() {
        let config = parse(
            r#"
            [[printers]]
            id = "x1c"
            protocol = "bambu"
            address = "192.168.1.40"
            serial = "abc"
            "#,
        );
        assert!(matches!(
            validate(&config).unwrap_err(),
            ConfigError::NoCredentials { .. }
        ));
    }

    #[test]
    fn unknown_protocol_names_the_field() {
        let config = parse(
            r#"
            [[printers]]
            id = "p1"
            protocol = "klipper"
            address = "http://x.local"
            "#,
        );
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("protocol"));
        assert!(err.to_string().contains("klipper"));
    }

    #[test]
    fn malformed_quiet_hours_is_rejected() {
        let config = parse(
            r#"
            [alerts]
            quiet_hours = { start = "22h00", end = "07:00" }
            "#,
        );
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("quiet_hours"));
    }

    #[test]
    fn missing_env_falls_back_to_plaintext() {
        use secrecy::ExposeSecret;
        let secret = resolve_secret(Some("plaintext"), Some("PW_TEST_UNSET_VAR")).unwrap();
        assert_eq!(secret.expose_secret(), "plaintext");
        assert!(resolve_secret(None, Some("PW_TEST_UNSET_VAR")).is_none());
    }
}
