// Composition root: open storage, wire capabilities, spawn the task
// tree, and tear it down cleanly on Ctrl-C.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use printwatch_config::{Config, ConfigError, PrinterEntry};
use printwatch_core::dispatch::{
    AlertDispatcher, AlertStore, BotWebhookChannel, EmailChannel, MqttRepublishChannel,
    NotificationChannel, NtfyChannel, PushChannel, PushSubscription, SmtpSettings,
    StaticDirectory, WebhookChannel, spawn_dispatcher,
};
use printwatch_core::model::{PrinterId, PrinterInfo, PrinterProtocol, UserId};
use printwatch_core::registry::{NullJobState, OrgSettingsProvider, Runtime, StaticOrgSettings};
use printwatch_core::{
    CoreError, EventBus, EventRelay, FleetStore, MonitorHandle, register_writer, spawn_janitor,
    spawn_monitor,
};
use printwatch_proto::{
    BambuAdapter, BambuConfig, OctoAdapter, OctoConfig, PrinterAdapter, ProtoError, PrusaAdapter,
    PrusaConfig, SdcpAdapter, SdcpConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("adapter setup for '{printer}' failed: {source}")]
    Adapter {
        printer: String,
        #[source]
        source: ProtoError,
    },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn run_daemon(config_path: Option<&Path>) -> Result<(), DaemonError> {
    let config = printwatch_config::load(config_path)?;
    if config.printers.is_empty() {
        warn!("no printers configured; nothing to monitor");
    }

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let relay = Arc::new(EventRelay::open(&db_path)?);
    let alert_store = Arc::new(AlertStore::open(&db_path)?);
    alert_store.seed_preferences(&config.preference_seeds())?;
    info!(path = %db_path.display(), "database open");

    let cancel = CancellationToken::new();
    let bus = Arc::new(EventBus::new());
    register_writer(&bus, Arc::clone(&relay));

    let org = Arc::new(org_settings(&config)?);
    let channels = build_channels(&config, &org, &cancel)?;
    let dispatcher = AlertDispatcher::new(
        Arc::clone(&alert_store),
        Arc::new(StaticDirectory(config.recipients())),
        Arc::clone(&org) as _,
        channels,
        config.alert_config(),
    );
    let dispatcher = Arc::new(spawn_dispatcher(dispatcher, &bus, cancel.child_token()));
    let heartbeat = dispatcher.heartbeat_hook();

    let fleet = Arc::new(FleetStore::new());
    let monitor_config = config.monitor_config();
    let mut monitors: Vec<MonitorHandle> = Vec::new();
    for entry in &config.printers {
        let adapter = build_adapter(entry)?;
        let info = printer_info(entry)?;
        let id = info.id.clone();
        let handle = spawn_monitor(
            info,
            adapter,
            Arc::clone(&bus),
            monitor_config.clone(),
            cancel.child_token(),
            Some(Arc::clone(&heartbeat)),
        );
        fleet.register(id.clone(), handle.state());
        monitors.push(handle);
        info!(printer = %id, protocol = %entry.protocol, "monitor started");
    }

    let janitor = spawn_janitor(
        Arc::clone(&relay),
        config.relay_retention(),
        config.janitor_interval(),
        cancel.child_token(),
    );

    // Validate capability wiring up front; a consumer module added
    // later gets this runtime, not ad-hoc references.
    let _runtime = Runtime::builder()
        .printer_state(Arc::clone(&fleet) as _)
        .job_state(Arc::new(NullJobState))
        .notifications(Arc::clone(&dispatcher) as _)
        .org_settings(Arc::clone(&org) as _)
        .build()?;

    info!(printers = monitors.len(), "printwatchd running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    cancel.cancel();
    for monitor in monitors {
        monitor.stop().await;
    }
    let _ = janitor.await;
    info!("shutdown complete");
    Ok(())
}

fn printer_info(entry: &PrinterEntry) -> Result<PrinterInfo, DaemonError> {
    let protocol = match entry.protocol.as_str() {
        "bambu" => PrinterProtocol::Bambu,
        "prusa" => PrinterProtocol::Prusa,
        "octo" => PrinterProtocol::Octo,
        "sdcp" => PrinterProtocol::Sdcp,
        other => {
            return Err(DaemonError::Validation {
                field: format!("printers.{}.protocol", entry.id),
                reason: format!("unknown protocol '{other}'"),
            });
        }
    };
    Ok(PrinterInfo {
        id: PrinterId(entry.id.clone()),
        name: entry.display_name(),
        protocol,
        address: entry.address.clone(),
    })
}

fn build_adapter(entry: &PrinterEntry) -> Result<Arc<dyn PrinterAdapter>, DaemonError> {
    let adapter: Arc<dyn PrinterAdapter> = match entry.protocol.as_str() {
        "bambu" => {
            let serial = entry.serial.clone().ok_or_else(|| DaemonError::Validation {
                field: format!("printers.{}.serial", entry.id),
                reason: "bambu printers need a serial".into(),
            })?;
            Arc::new(BambuAdapter::new(BambuConfig {
                host: entry.address.clone(),
                serial,
                access_code: entry.access_code()?,
                timeout: entry.timeout(),
            }))
        }
        "prusa" => {
            let adapter = PrusaAdapter::new(PrusaConfig {
                base_url: parse_base_url(entry)?,
                api_key: entry.api_key()?,
                timeout: entry.timeout(),
            })
            .map_err(|source| DaemonError::Adapter {
                printer: entry.id.clone(),
                source,
            })?;
            Arc::new(adapter)
        }
        "octo" => {
            let adapter = OctoAdapter::new(OctoConfig {
                base_url: parse_base_url(entry)?,
                api_key: entry.api_key()?,
                timeout: entry.timeout(),
            })
            .map_err(|source| DaemonError::Adapter {
                printer: entry.id.clone(),
                source,
            })?;
            Arc::new(adapter)
        }
        "sdcp" => Arc::new(SdcpAdapter::new(SdcpConfig {
            host: entry.address.clone(),
            timeout: entry.timeout(),
        })),
        other => {
            return Err(DaemonError::Validation {
                field: format!("printers.{}.protocol", entry.id),
                reason: format!("unknown protocol '{other}'"),
            });
        }
    };
    Ok(adapter)
}

fn parse_base_url(entry: &PrinterEntry) -> Result<Url, DaemonError> {
    entry
        .address
        .parse()
        .map_err(|_| DaemonError::Validation {
            field: format!("printers.{}.address", entry.id),
            reason: format!("not a valid base URL: {}", entry.address),
        })
}

fn build_channels(
    config: &Config,
    org: &StaticOrgSettings,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<dyn NotificationChannel>>, DaemonError> {
    let client = reqwest::Client::new();
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    // Org-wide webhook endpoints come through the settings capability,
    // the same view later consumer modules get.
    for url in org.webhook_urls() {
        channels.push(Arc::new(WebhookChannel::new(client.clone(), url)));
    }
    for hook in &config.alerts.bot_webhooks {
        channels.push(Arc::new(BotWebhookChannel::new(
            client.clone(),
            parse_url(&hook.url, "alerts.bot_webhooks.url")?,
        )));
    }
    if let Some(ntfy) = &config.alerts.ntfy {
        let token = printwatch_config::resolve_secret(ntfy.token.as_deref(), ntfy.token_env.as_deref());
        channels.push(Arc::new(NtfyChannel::new(
            client.clone(),
            parse_url(&ntfy.base_url, "alerts.ntfy.base_url")?,
            ntfy.topic.clone(),
            token,
        )));
    }
    if !config.alerts.push_subscriptions.is_empty() {
        let mut subs = Vec::new();
        for entry in &config.alerts.push_subscriptions {
            subs.push(PushSubscription {
                user_id: UserId(entry.user.clone()),
                endpoint: parse_url(&entry.endpoint, "alerts.push_subscriptions.endpoint")?,
            });
        }
        channels.push(Arc::new(PushChannel::new(client.clone(), subs)));
    }
    if let Some(smtp) = &config.alerts.smtp {
        let password = printwatch_config::resolve_secret(
            smtp.password.as_deref(),
            smtp.password_env.as_deref(),
        )
        .ok_or_else(|| DaemonError::Validation {
            field: "alerts.smtp.password".into(),
            reason: "no password or password_env configured".into(),
        })?;
        let from = smtp
            .from
            .parse::<lettre::message::Mailbox>()
            .map_err(|e| DaemonError::Validation {
                field: "alerts.smtp.from".into(),
                reason: e.to_string(),
            })?;
        let mut addresses = HashMap::new();
        for (user, address) in &smtp.addresses {
            let mailbox =
                address
                    .parse::<lettre::message::Mailbox>()
                    .map_err(|e| DaemonError::Validation {
                        field: format!("alerts.smtp.addresses.{user}"),
                        reason: e.to_string(),
                    })?;
            addresses.insert(UserId(user.clone()), mailbox);
        }
        let email = EmailChannel::new(
            &SmtpSettings {
                host: smtp.host.clone(),
                port: smtp.port,
                username: smtp.username.clone(),
                password,
                from,
            },
            addresses,
        )
        .map_err(|e| DaemonError::Validation {
            field: "alerts.smtp".into(),
            reason: e.to_string(),
        })?;
        channels.push(Arc::new(email));
    }
    if let Some(mqtt) = &config.alerts.mqtt {
        channels.push(Arc::new(MqttRepublishChannel::new(
            &mqtt.host,
            mqtt.port,
            mqtt.topic_prefix.clone(),
            cancel.child_token(),
        )));
    }

    info!(channels = channels.len(), "notification channels configured");
    Ok(channels)
}

fn parse_url(value: &str, field: &str) -> Result<Url, DaemonError> {
    value.parse().map_err(|_| DaemonError::Validation {
        field: field.to_string(),
        reason: format!("not a valid URL: {value}"),
    })
}

fn org_settings(config: &Config) -> Result<StaticOrgSettings, DaemonError> {
    let webhook_urls = config
        .alerts
        .webhooks
        .iter()
        .map(|hook| parse_url(&hook.url, "alerts.webhooks.url"))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(StaticOrgSettings {
        quiet_hours: config.quiet_hours()?,
        webhook_urls,
    })
}
