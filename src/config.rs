//! Runtime configuration.
//!
//! Configuration is immutable after [`crate::Runtime::start`]; every blocking
//! operation takes its deadline from here. [`RuntimeConfig::from_env`] reads
//! the conventional environment variables and falls back to the documented
//! defaults, so a bare `RuntimeConfig::from_env()?` is enough for local
//! development against `nats://localhost:4222`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::subject;

/// Broker authentication modes.
#[derive(Debug, Clone, Default)]
pub enum AuthMode {
    #[default]
    None,
    Token(String),
    UserPassword {
        user: String,
        password: String,
    },
    /// NKey seed string.
    NKeySeed(String),
    /// Path to a `.creds` file.
    CredentialsFile(PathBuf),
}

/// TLS material for the broker connection.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Root CA bundle; enables TLS when set.
    pub ca_file: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    pub cert_file: Option<PathBuf>,
    /// Client key for mutual TLS.
    pub key_file: Option<PathBuf>,
}

/// Connection manager options.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub urls: Vec<String>,
    pub auth: AuthMode,
    pub tls: Option<TlsConfig>,
    /// Delay between reconnect attempts; attempts are unbounded.
    pub reconnect_delay: Duration,
    /// Publishes allowed to wait for the connection while reconnecting;
    /// beyond this the caller gets a backpressure error.
    pub max_queued_while_reconnecting: usize,
    /// Deadline for the initial connect.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            auth: AuthMode::None,
            tls: None,
            reconnect_delay: Duration::from_secs(2),
            max_queued_while_reconnecting: 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Publisher options.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Route publishes through the outbox store instead of the broker.
    pub use_outbox: bool,
    /// Maximum serialized envelope size.
    pub max_payload_bytes: usize,
    /// Deadline for a direct publish to be acked by the broker.
    pub publish_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            use_outbox: false,
            max_payload_bytes: 1024 * 1024,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Outbox worker options.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Interval between drain cycles; inserts also wake the worker directly.
    pub poll_interval: Duration,
    /// Records leased per drain cycle.
    pub batch_size: i64,
    /// Age after which a `publishing` lease is considered abandoned.
    /// Must exceed the worst-case publish timeout.
    pub stale_after: Duration,
    /// Age after which `sent` rows are purged.
    pub retention: Duration,
    /// Interval of the stale-lease sweep.
    pub sweep_interval: Duration,
    /// Interval of the retention purge.
    pub cleanup_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            stale_after: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Per-subscriber consumption options; the runtime-level value is the
/// default, overridable per subscriber.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Messages processed concurrently per subscriber. `1` preserves
    /// delivery order.
    pub concurrency_limit: usize,
    /// Messages requested per pull fetch.
    pub batch_size: usize,
    /// Server-side expiry of a pull fetch.
    pub fetch_timeout: Duration,
    /// Broker redelivery window for an unacked message.
    pub ack_wait: Duration,
    /// Deliveries after which a message is routed to the DLQ.
    pub max_deliver: i64,
    /// Per-delivery retry delays; extended exponentially past the end,
    /// capped at 60s.
    pub backoff_schedule: Vec<Duration>,
    /// Route exhausted/permanent failures to the DLQ subject.
    pub use_dlq: bool,
    /// Override of the default `{env}.{app}.dlq` subject.
    pub dlq_subject: Option<String>,
    /// How long shutdown waits for in-flight handlers before aborting them.
    pub drain_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 16,
            batch_size: 32,
            fetch_timeout: Duration::from_secs(5),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            backoff_schedule: default_backoff_schedule(),
            use_dlq: true,
            dlq_subject: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Default retry schedule, extended exponentially with a 60s cap past the
/// last entry.
pub fn default_backoff_schedule() -> Vec<Duration> {
    [1, 2, 5, 10, 30].map(Duration::from_secs).to_vec()
}

/// Inbox deduplication options.
#[derive(Debug, Clone)]
pub struct InboxConfig {
    /// Enable the inbox middleware on every subscriber.
    pub use_inbox: bool,
    /// Age after which an abandoned `processing` row is flipped to `failed`.
    /// Must exceed the worst-case handler runtime.
    pub stale_after: Duration,
    /// Age after which `processed` rows are purged.
    pub retention: Duration,
    /// Interval of the stale/retention sweep.
    pub sweep_interval: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            use_inbox: false,
            stale_after: Duration::from_secs(300),
            retention: Duration::from_secs(7 * 24 * 3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub connection: ConnectionConfig,
    /// Deployment environment, first subject segment.
    pub env: String,
    /// Application name, second subject segment.
    pub app_name: String,
    pub publisher: PublisherConfig,
    pub outbox: OutboxConfig,
    pub consumer: ConsumerConfig,
    pub inbox: InboxConfig,
}

impl RuntimeConfig {
    pub fn new(env: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::default(),
            env: env.into(),
            app_name: app_name.into(),
            publisher: PublisherConfig::default(),
            outbox: OutboxConfig::default(),
            consumer: ConsumerConfig::default(),
            inbox: InboxConfig::default(),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// Recognized variables (all optional except `APP_ENV`/`APP_NAME`):
    /// `NATS_URLS` (comma-separated), `NATS_AUTH_TOKEN`, `NATS_USER`/`NATS_PASSWORD`,
    /// `NATS_NKEY_SEED`, `NATS_CREDS_FILE`, `NATS_CA_FILE`, `NATS_CERT_FILE`,
    /// `NATS_KEY_FILE`, `NATS_RECONNECT_DELAY_SECS`, `NATS_MAX_QUEUED_WHILE_RECONNECTING`,
    /// `PUBLISHER_USE_OUTBOX`, `PUBLISHER_MAX_PAYLOAD_BYTES`, `PUBLISHER_TIMEOUT_SECS`,
    /// `OUTBOX_POLL_INTERVAL_SECS`, `OUTBOX_BATCH_SIZE`, `OUTBOX_STALE_AFTER_SECS`,
    /// `OUTBOX_RETENTION_SECS`, `CONSUMER_CONCURRENCY`, `CONSUMER_BATCH_SIZE`,
    /// `CONSUMER_ACK_WAIT_SECS`, `CONSUMER_MAX_DELIVER`, `CONSUMER_USE_DLQ`,
    /// `CONSUMER_DLQ_SUBJECT`, `INBOX_ENABLED`, `INBOX_STALE_AFTER_SECS`,
    /// `INBOX_RETENTION_SECS`.
    pub fn from_env() -> Result<Self> {
        let env = require_var("APP_ENV")?;
        let app_name = require_var("APP_NAME")?;
        let mut config = RuntimeConfig::new(env, app_name);
        config.validate_identity()?;

        if let Ok(urls) = std::env::var("NATS_URLS") {
            config.connection.urls = urls.split(',').map(|s| s.trim().to_string()).collect();
        }
        config.connection.auth = auth_from_env();
        let tls = TlsConfig {
            ca_file: std::env::var("NATS_CA_FILE").ok().map(PathBuf::from),
            cert_file: std::env::var("NATS_CERT_FILE").ok().map(PathBuf::from),
            key_file: std::env::var("NATS_KEY_FILE").ok().map(PathBuf::from),
        };
        if tls.ca_file.is_some() || tls.cert_file.is_some() {
            config.connection.tls = Some(tls);
        }
        if let Some(secs) = parse_var::<u64>("NATS_RECONNECT_DELAY_SECS")? {
            config.connection.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var("NATS_MAX_QUEUED_WHILE_RECONNECTING")? {
            config.connection.max_queued_while_reconnecting = n;
        }

        if let Some(b) = parse_var("PUBLISHER_USE_OUTBOX")? {
            config.publisher.use_outbox = b;
        }
        if let Some(n) = parse_var("PUBLISHER_MAX_PAYLOAD_BYTES")? {
            config.publisher.max_payload_bytes = n;
        }
        if let Some(secs) = parse_var::<u64>("PUBLISHER_TIMEOUT_SECS")? {
            config.publisher.publish_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64>("OUTBOX_POLL_INTERVAL_SECS")? {
            config.outbox.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var("OUTBOX_BATCH_SIZE")? {
            config.outbox.batch_size = n;
        }
        if let Some(secs) = parse_var::<u64>("OUTBOX_STALE_AFTER_SECS")? {
            config.outbox.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("OUTBOX_RETENTION_SECS")? {
            config.outbox.retention = Duration::from_secs(secs);
        }

        if let Some(n) = parse_var("CONSUMER_CONCURRENCY")? {
            config.consumer.concurrency_limit = n;
        }
        if let Some(n) = parse_var("CONSUMER_BATCH_SIZE")? {
            config.consumer.batch_size = n;
        }
        if let Some(secs) = parse_var::<u64>("CONSUMER_ACK_WAIT_SECS")? {
            config.consumer.ack_wait = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var("CONSUMER_MAX_DELIVER")? {
            config.consumer.max_deliver = n;
        }
        if let Some(b) = parse_var("CONSUMER_USE_DLQ")? {
            config.consumer.use_dlq = b;
        }
        if let Ok(subject) = std::env::var("CONSUMER_DLQ_SUBJECT") {
            config.consumer.dlq_subject = Some(subject);
        }

        if let Some(b) = parse_var("INBOX_ENABLED")? {
            config.inbox.use_inbox = b;
        }
        if let Some(secs) = parse_var::<u64>("INBOX_STALE_AFTER_SECS")? {
            config.inbox.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("INBOX_RETENTION_SECS")? {
            config.inbox.retention = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Subject prefix `{env}.{app}` every topic is composed under.
    pub fn subject_prefix(&self) -> String {
        format!("{}.{}", self.env, self.app_name)
    }

    /// Default DLQ subject, unless overridden in [`ConsumerConfig`].
    pub fn dlq_subject(&self) -> String {
        self.consumer
            .dlq_subject
            .clone()
            .unwrap_or_else(|| format!("{}.dlq", self.subject_prefix()))
    }

    /// Reject identities that would produce invalid subjects.
    pub fn validate_identity(&self) -> Result<()> {
        subject::compose(&self.env, &self.app_name, "probe")
            .map_err(|e| Error::Config(format!("invalid env/app identity: {e}")))?;
        Ok(())
    }
}

fn require_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("{name} must be set")))
}

fn auth_from_env() -> AuthMode {
    if let Ok(token) = std::env::var("NATS_AUTH_TOKEN") {
        return AuthMode::Token(token);
    }
    if let (Ok(user), Ok(password)) = (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        return AuthMode::UserPassword { user, password };
    }
    if let Ok(seed) = std::env::var("NATS_NKEY_SEED") {
        return AuthMode::NKeySeed(seed);
    }
    if let Ok(path) = std::env::var("NATS_CREDS_FILE") {
        return AuthMode::CredentialsFile(PathBuf::from(path));
    }
    AuthMode::None
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::new("test", "orders");
        assert_eq!(config.connection.urls, ["nats://localhost:4222"]);
        assert_eq!(config.consumer.max_deliver, 5);
        assert_eq!(
            config.consumer.backoff_schedule,
            [1, 2, 5, 10, 30].map(Duration::from_secs)
        );
        assert!(!config.publisher.use_outbox);
        assert!(!config.inbox.use_inbox);
    }

    #[test]
    fn dlq_subject_defaults_and_overrides() {
        let mut config = RuntimeConfig::new("test", "orders");
        assert_eq!(config.dlq_subject(), "test.orders.dlq");
        config.consumer.dlq_subject = Some("test.orders.failures".into());
        assert_eq!(config.dlq_subject(), "test.orders.failures");
    }

    #[test]
    fn identity_is_validated() {
        assert!(RuntimeConfig::new("Test", "orders").validate_identity().is_err());
        assert!(RuntimeConfig::new("test", "orders").validate_identity().is_ok());
    }
}
