// ── Notification channels ──
//
// One trait, one implementation per transport. Channels are attempted
// independently by the dispatcher under a per-channel timeout; a failed
// channel never blocks or cancels its siblings.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::StatusCode;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::model::{AlertRecord, Severity, UserId};

/// Channel delivery failure. Transient failures may be retried by the
/// channel's own policy; permanent ones must not be.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        // Connection-level errors are worth retrying later.
        Self::Transient(e.to_string())
    }
}

/// A single delivery transport.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this channel applies to `user`. Org-wide channels
    /// (webhooks, MQTT republish) accept everyone; per-user channels
    /// check preference flags upstream and subscription state here.
    fn accepts(&self, user: &UserId) -> bool;

    async fn deliver(&self, record: &AlertRecord) -> Result<(), ChannelError>;
}

fn status_to_error(status: StatusCode) -> ChannelError {
    if status.is_server_error() {
        ChannelError::Transient(format!("endpoint returned {status}"))
    } else {
        ChannelError::Permanent(format!("endpoint returned {status}"))
    }
}

// ── Generic webhook ─────────────────────────────────────────────────

/// POSTs the alert as JSON to a configured endpoint. Fire and forget;
/// failures are logged by the dispatcher, never retried synchronously.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: Url,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn accepts(&self, _user: &UserId) -> bool {
        true
    }

    async fn deliver(&self, record: &AlertRecord) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.url.clone())
            .json(record)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status()));
        }
        Ok(())
    }
}

// ── ntfy ────────────────────────────────────────────────────────────

/// Publishes to an ntfy topic. Severity maps onto ntfy's 1-5 priority
/// scale.
pub struct NtfyChannel {
    client: reqwest::Client,
    base_url: Url,
    topic: String,
    token: Option<SecretString>,
}

impl NtfyChannel {
    pub fn new(
        client: reqwest::Client,
        base_url: Url,
        topic: String,
        token: Option<SecretString>,
    ) -> Self {
        Self {
            client,
            base_url,
            topic,
            token,
        }
    }

    fn priority(severity: Severity) -> &'static str {
        match severity {
            Severity::Info => "2",
            Severity::Warning => "3",
            Severity::Critical => "5",
        }
    }
}

#[async_trait]
impl NotificationChannel for NtfyChannel {
    fn name(&self) -> &'static str {
        "ntfy"
    }

    fn accepts(&self, _user: &UserId) -> bool {
        true
    }

    async fn deliver(&self, record: &AlertRecord) -> Result<(), ChannelError> {
        let url = self
            .base_url
            .join(&self.topic)
            .map_err(|e| ChannelError::Permanent(format!("bad ntfy topic url: {e}")))?;
        let mut req = self
            .client
            .post(url)
            .header("Title", record.title.clone())
            .header("Priority", Self::priority(record.severity))
            .body(record.message.clone());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose_secret());
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status()));
        }
        Ok(())
    }
}

// ── Chat bot webhook ────────────────────────────────────────────────

/// Slack/Discord-compatible incoming webhook: a JSON body with a single
/// `text` field.
pub struct BotWebhookChannel {
    client: reqwest::Client,
    url: Url,
}

impl BotWebhookChannel {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl NotificationChannel for BotWebhookChannel {
    fn name(&self) -> &'static str {
        "bot_webhook"
    }

    fn accepts(&self, _user: &UserId) -> bool {
        true
    }

    async fn deliver(&self, record: &AlertRecord) -> Result<(), ChannelError> {
        let text = format!("[{}] {}: {}", record.severity, record.title, record.message);
        let resp = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_to_error(resp.status()));
        }
        Ok(())
    }
}

// ── Browser push ────────────────────────────────────────────────────

/// A registered browser push subscription endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSubscription {
    pub user_id: UserId,
    pub endpoint: Url,
}

/// Pushes to each of the user's registered subscription endpoints.
///
/// 404/410 from an endpoint means the browser dropped the subscription;
/// it is retired permanently. 5xx is retried a bounded number of times
/// within the delivery attempt.
pub struct PushChannel {
    client: reqwest::Client,
    subscriptions: Mutex<HashMap<UserId, Vec<PushSubscription>>>,
    max_attempts: u32,
}

impl PushChannel {
    pub fn new(client: reqwest::Client, subscriptions: Vec<PushSubscription>) -> Self {
        let mut by_user: HashMap<UserId, Vec<PushSubscription>> = HashMap::new();
        for sub in subscriptions {
            by_user.entry(sub.user_id.clone()).or_default().push(sub);
        }
        Self {
            client,
            subscriptions: Mutex::new(by_user),
            max_attempts: 3,
        }
    }

    fn user_endpoints(&self, user: &UserId) -> Vec<Url> {
        self.lock()
            .get(user)
            .map(|subs| subs.iter().map(|s| s.endpoint.clone()).collect())
            .unwrap_or_default()
    }

    fn retire(&self, user: &UserId, endpoint: &Url) {
        let mut subs = self.lock();
        if let Some(list) = subs.get_mut(user) {
            list.retain(|s| &s.endpoint != endpoint);
            if list.is_empty() {
                subs.remove(user);
            }
        }
        warn!(user = %user, endpoint = %endpoint, "push subscription retired");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Vec<PushSubscription>>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn push_one(&self, endpoint: &Url, body: &[u8]) -> Result<(), ChannelError> {
        let mut last = String::new();
        for attempt in 1..=self.max_attempts {
            let result = self
                .client
                .post(endpoint.clone())
                .header("TTL", "3600")
                .body(body.to_vec())
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp)
                    if resp.status() == StatusCode::NOT_FOUND
                        || resp.status() == StatusCode::GONE =>
                {
                    return Err(ChannelError::Permanent(format!(
                        "subscription gone: {}",
                        resp.status()
                    )));
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last = format!("endpoint returned {}", resp.status());
                }
                Ok(resp) => return Err(status_to_error(resp.status())),
                Err(e) => last = e.to_string(),
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
        }
        Err(ChannelError::Transient(last))
    }
}

#[async_trait]
impl NotificationChannel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    fn accepts(&self, user: &UserId) -> bool {
        self.lock().contains_key(user)
    }

    async fn deliver(&self, record: &AlertRecord) -> Result<(), ChannelError> {
        let body = serde_json::to_vec(record)
            .map_err(|e| ChannelError::Permanent(format!("push payload: {e}")))?;
        let endpoints = self.user_endpoints(&record.user_id);
        if endpoints.is_empty() {
            return Ok(());
        }
        let mut last_err = None;
        for endpoint in endpoints {
            match self.push_one(&endpoint, &body).await {
                Ok(()) => {}
                Err(ChannelError::Permanent(e)) => {
                    self.retire(&record.user_id, &endpoint);
                    last_err = Some(ChannelError::Permanent(e));
                }
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ── Email ───────────────────────────────────────────────────────────

/// SMTP relay settings for the email channel.
#[derive(Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from: Mailbox,
}

/// Sends one plain-text email per alert via an async SMTP transport.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    addresses: HashMap<UserId, Mailbox>,
}

impl EmailChannel {
    pub fn new(
        settings: &SmtpSettings,
        addresses: HashMap<UserId, Mailbox>,
    ) -> Result<Self, ChannelError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
            .map_err(|e| ChannelError::Permanent(format!("smtp relay: {e}")))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.expose_secret().to_string(),
            ))
            .build();
        Ok(Self {
            transport,
            from: settings.from.clone(),
            addresses,
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn accepts(&self, user: &UserId) -> bool {
        self.addresses.contains_key(user)
    }

    async fn deliver(&self, record: &AlertRecord) -> Result<(), ChannelError> {
        let Some(to) = self.addresses.get(&record.user_id) else {
            return Ok(());
        };
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.clone())
            .subject(format!("[{}] {}", record.severity, record.title))
            .body(record.message.clone())
            .map_err(|e| ChannelError::Permanent(format!("message build: {e}")))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| ChannelError::Transient(e.to_string()))?;
        Ok(())
    }
}

// ── MQTT republish ──────────────────────────────────────────────────

/// Republishes alerts as JSON onto an external broker, one topic per
/// alert type under a configured prefix. Best effort: the broker link
/// reconnects on its own and delivery is not confirmed.
pub struct MqttRepublishChannel {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttRepublishChannel {
    pub fn new(host: &str, port: u16, topic_prefix: String, cancel: CancellationToken) -> Self {
        let mut options = MqttOptions::new("printwatch-alerts", host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 16);

        // The event loop must be polled for the client to make progress.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => {
                        if let Err(e) = event {
                            debug!(error = %e, "alert broker link error");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        });

        Self {
            client,
            topic_prefix,
        }
    }
}

#[async_trait]
impl NotificationChannel for MqttRepublishChannel {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn accepts(&self, _user: &UserId) -> bool {
        true
    }

    async fn deliver(&self, record: &AlertRecord) -> Result<(), ChannelError> {
        let topic = format!("{}/{}", self.topic_prefix, record.alert_type);
        let payload = serde_json::to_vec(record)
            .map_err(|e| ChannelError::Permanent(format!("alert payload: {e}")))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ChannelError::Transient(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(user: &str) -> AlertRecord {
        AlertRecord {
            id: "a1".into(),
            user_id: UserId(user.to_string()),
            alert_type: "spool_low".into(),
            severity: Severity::Warning,
            title: "Spool low".into(),
            message: "Slot 0 is at 8%".into(),
            printer_id: Some("p1".into()),
            job_id: None,
            spool_id: Some("p1:0".into()),
            is_read: false,
            is_dismissed: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn webhook_posts_record_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/hook", server.uri())).unwrap();
        let channel = WebhookChannel::new(reqwest::Client::new(), url);
        channel.deliver(&record("u1")).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_5xx_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let channel = WebhookChannel::new(reqwest::Client::new(), url);
        let err = channel.deliver(&record("u1")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Transient(_)));
    }

    #[tokio::test]
    async fn push_410_retires_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let endpoint = Url::parse(&format!("{}/sub/abc", server.uri())).unwrap();
        let user = UserId("u1".to_string());
        let channel = PushChannel::new(
            reqwest::Client::new(),
            vec![PushSubscription {
                user_id: user.clone(),
                endpoint,
            }],
        );
        assert!(channel.accepts(&user));

        let err = channel.deliver(&record("u1")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Permanent(_)));
        // Subscription gone; the channel no longer applies to this user.
        assert!(!channel.accepts(&user));
    }

    #[tokio::test]
    async fn push_retries_5xx_then_gives_up_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri()).unwrap();
        let user = UserId("u1".to_string());
        let channel = PushChannel::new(
            reqwest::Client::new(),
            vec![PushSubscription {
                user_id: user.clone(),
                endpoint,
            }],
        );

        let err = channel.deliver(&record("u1")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Transient(_)));
        // 5xx does not retire the subscription.
        assert!(channel.accepts(&user));
    }

    #[tokio::test]
    async fn ntfy_sets_title_and_priority() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .and(wiremock::matchers::header("Title", "Spool low"))
            .and(wiremock::matchers::header("Priority", "3"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/", server.uri())).unwrap();
        let channel = NtfyChannel::new(reqwest::Client::new(), base, "alerts".into(), None);
        channel.deliver(&record("u1")).await.unwrap();
    }
}
