//! Broker connection lifecycle.
//!
//! One [`ConnectionManager`] is shared by every publisher and consumer in
//! the process. It owns authentication and TLS material, tracks the
//! connection state through the client's event callback, and gates direct
//! publishes with a bounded queue while the client is reconnecting.
//! Reconnect attempts are unbounded; authentication failures are terminal
//! and surface to the caller immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{AuthMode, ConnectionConfig};
use crate::error::{Error, Result};

/// Observable connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Manages the shared broker connection.
pub struct ConnectionManager {
    config: ConnectionConfig,
    client: RwLock<Option<async_nats::Client>>,
    jetstream: RwLock<Option<async_nats::jetstream::Context>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Publishes waiting for the connection to come back.
    reconnect_queue: Arc<Semaphore>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let reconnect_queue = Arc::new(Semaphore::new(config.max_queued_while_reconnecting));
        Self {
            config,
            client: RwLock::new(None),
            jetstream: RwLock::new(None),
            state_tx: Arc::new(state_tx),
            state_rx,
            reconnect_queue,
        }
    }

    /// Open the broker connection.
    ///
    /// Blocks until the initial connection is established or the connect
    /// timeout expires. Authentication failures are not retried.
    pub async fn connect(&self) -> Result<()> {
        if self.client.read().await.is_some() {
            return Ok(());
        }
        self.state_tx.send_replace(ConnectionState::Connecting);
        info!(urls = ?self.config.urls, "connecting to broker");

        let options = self.connect_options().await?;
        let addrs = self.config.urls.join(",");
        let client = options.connect(addrs).await.map_err(|e| {
            self.state_tx.send_replace(ConnectionState::Failed);
            let text = e.to_string();
            if text.to_lowercase().contains("auth") {
                Error::Auth(text)
            } else {
                Error::Connection(format!("failed to connect: {text}"))
            }
        })?;

        let jetstream = async_nats::jetstream::new(client.clone());
        *self.client.write().await = Some(client);
        *self.jetstream.write().await = Some(jetstream);
        self.state_tx.send_replace(ConnectionState::Connected);
        info!("broker connection established");
        Ok(())
    }

    async fn connect_options(&self) -> Result<async_nats::ConnectOptions> {
        let mut options = match &self.config.auth {
            AuthMode::None => async_nats::ConnectOptions::new(),
            AuthMode::Token(token) => async_nats::ConnectOptions::with_token(token.clone()),
            AuthMode::UserPassword { user, password } => {
                async_nats::ConnectOptions::with_user_and_password(user.clone(), password.clone())
            }
            AuthMode::NKeySeed(seed) => async_nats::ConnectOptions::with_nkey(seed.clone()),
            AuthMode::CredentialsFile(path) => {
                async_nats::ConnectOptions::with_credentials_file(path.clone())
                    .await
                    .map_err(|e| Error::Config(format!("unreadable credentials file: {e}")))?
            }
        };

        if let Some(tls) = &self.config.tls {
            if let Some(ca) = &tls.ca_file {
                options = options.add_root_certificates(ca.clone());
            }
            if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
                options = options.add_client_certificate(cert.clone(), key.clone());
            }
            options = options.require_tls(true);
        }

        let reconnect_delay = self.config.reconnect_delay;
        options = options
            .connection_timeout(self.config.connect_timeout)
            .reconnect_delay_callback(move |_attempts| reconnect_delay);

        let state_tx = self.state_tx.clone();
        options = options.event_callback(move |event| {
            let state_tx = state_tx.clone();
            async move {
                match event {
                    async_nats::Event::Connected => {
                        info!("broker connection restored");
                        state_tx.send_replace(ConnectionState::Connected);
                    }
                    async_nats::Event::Disconnected => {
                        warn!("broker connection lost, reconnecting");
                        state_tx.send_replace(ConnectionState::Reconnecting);
                    }
                    async_nats::Event::ClientError(err) => {
                        warn!(error = %err, "broker client error");
                    }
                    other => {
                        debug!(event = %other, "broker event");
                    }
                }
            }
        });

        Ok(options)
    }

    /// Flush and drop the connection.
    pub async fn close(&self) -> Result<()> {
        *self.jetstream.write().await = None;
        if let Some(client) = self.client.write().await.take() {
            client
                .flush()
                .await
                .map_err(|e| Error::Connection(format!("flush on close failed: {e}")))?;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("broker connection closed");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// False while reconnecting or failed.
    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Block until the connection is up or the deadline expires.
    pub async fn await_ready(&self, deadline: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(deadline, async {
            loop {
                if *rx.borrow() == ConnectionState::Connected {
                    return Ok(());
                }
                rx.changed()
                    .await
                    .map_err(|_| Error::Connection("connection manager dropped".into()))?;
            }
        })
        .await
        .map_err(|_| Error::Connection(format!("not ready within {deadline:?}")))?
    }

    /// The raw broker handle.
    pub async fn client(&self) -> Result<async_nats::Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Connection("not connected".into()))
    }

    /// The JetStream context over the shared connection.
    pub async fn jetstream(&self) -> Result<async_nats::jetstream::Context> {
        self.jetstream
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Connection("not connected".into()))
    }

    /// Gate a direct publish on connection health.
    ///
    /// Healthy connections pass straight through. While reconnecting, up to
    /// `max_queued_while_reconnecting` callers wait for readiness; the rest
    /// fail fast with a backpressure error. The returned permit must be held
    /// for the duration of the publish attempt.
    pub(crate) async fn reserve_publish_slot(
        &self,
        wait: Duration,
    ) -> Result<Option<tokio::sync::OwnedSemaphorePermit>> {
        if self.is_healthy() {
            return Ok(None);
        }
        let permit = self
            .reconnect_queue
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::Backpressure(self.config.max_queued_while_reconnecting))?;
        self.await_ready(wait).await?;
        Ok(Some(permit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ConnectionConfig {
            max_queued_while_reconnecting: 2,
            ..ConnectionConfig::default()
        })
    }

    #[tokio::test]
    async fn starts_disconnected_and_unhealthy() {
        let manager = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_healthy());
        assert!(manager.client().await.is_err());
    }

    #[tokio::test]
    async fn await_ready_times_out_when_down() {
        let manager = manager();
        let err = manager.await_ready(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn await_ready_wakes_on_state_change() {
        let manager = Arc::new(manager());
        let waiter = manager.clone();
        let handle =
            tokio::spawn(async move { waiter.await_ready(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.state_tx.send_replace(ConnectionState::Connected);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn publish_queue_is_bounded_while_down() {
        let manager = manager();
        manager.state_tx.send_replace(ConnectionState::Reconnecting);

        // Two slots queue; the third fails fast.
        let p1 = manager.reconnect_queue.clone().try_acquire_owned().unwrap();
        let _p2 = manager.reconnect_queue.clone().try_acquire_owned().unwrap();
        let err = manager
            .reserve_publish_slot(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure(2)));

        // Releasing a slot lets the next caller queue (and then time out
        // waiting for readiness, which is a connection error, not
        // backpressure).
        drop(p1);
        let err = manager
            .reserve_publish_slot(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn healthy_connection_skips_the_queue() {
        let manager = manager();
        manager.state_tx.send_replace(ConnectionState::Connected);
        let slot = manager
            .reserve_publish_slot(Duration::from_millis(10))
            .await
            .unwrap();
        assert!(slot.is_none());
    }
}
