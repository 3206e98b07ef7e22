//! Connection lifecycle
//!
//! The [`Supervisor`] owns the background task that opens the control
//! connection, fetches the full server status, keeps the [`StateStore`]
//! fed with notifications and reconnects whenever the link drops.

use crate::config::{ClientConfig, ReconnectConfig};
use crate::connection::Connection;
use crate::error::{Result, SnapError};
use crate::events::ServerEvent;
use crate::protocol::{Method, Notification};
use crate::status::parse_server_status;
use crate::store::StateStore;
use arc_swap::ArcSwapOption;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Not started
    Disconnected,
    /// Opening the socket, fetching status, or waiting to retry
    Connecting,
    /// Connected and in sync with the server
    Connected,
    /// Stopped for good
    ShuttingDown,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Doubling retry delay with a floor and a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            next: floor,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.initial_delay, config.max_delay)
    }

    /// Delay before the next attempt; each call doubles the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Start over from the floor
    pub fn reset(&mut self) {
        self.next = self.floor;
    }
}

/// The currently live connection, if any
///
/// Shared by the supervisor, which swaps connections in and out, and the
/// command client, which only reads it.
pub struct Link {
    current: ArcSwapOption<Connection>,
}

impl Link {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    /// The live connection, or [`SnapError::NotConnected`]
    pub fn connection(&self) -> Result<Arc<Connection>> {
        self.current
            .load_full()
            .filter(|connection| !connection.is_closed())
            .ok_or(SnapError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_ok()
    }

    fn set(&self, connection: Arc<Connection>) {
        self.current.store(Some(connection));
    }

    fn clear(&self) -> Option<Arc<Connection>> {
        self.current.swap(None)
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Move to `next` unless shutdown has begun
fn set_state(state: &watch::Sender<LinkState>, next: LinkState) {
    state.send_if_modified(|current| {
        if *current == LinkState::ShuttingDown || *current == next {
            return false;
        }
        tracing::debug!(from = %current, to = %next, "Link state changed");
        *current = next;
        true
    });
}

/// Apply a `Server.GetStatus` answer to the store
///
/// Meant for [`Connection::call_ordered`], so the status lands before any
/// notification the server sent after it.
pub(crate) fn full_status_hook(
    store: StateStore,
    host: String,
    port: u16,
) -> impl FnOnce(&Value) -> Result<()> + Send + 'static {
    move |payload: &Value| {
        let status = parse_server_status(payload, &host, port)?;
        store.apply_full_status(status);
        Ok(())
    }
}

/// Feeds server notifications into the store
///
/// Holds the connection weakly because it is owned by that connection's
/// handler slot.
struct NotificationRouter {
    store: StateStore,
    connection: Weak<Connection>,
    request_timeout: Duration,
}

impl NotificationRouter {
    fn handle(&self, notification: Notification) {
        match ServerEvent::from_notification(&notification) {
            Ok(ServerEvent::Unknown { method }) => {
                tracing::debug!(%method, "Ignoring unhandled notification");
            }
            Ok(event) => {
                self.store.apply_notification(&event);
                if event.needs_full_status(&self.store.current()) {
                    self.refresh();
                }
            }
            Err(e) => {
                tracing::warn!(method = %notification.method, "Dropping notification: {}", e);
            }
        }
    }

    /// Ask for the full status without blocking the reader
    fn refresh(&self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        tracing::debug!("Notification needs the full status, refreshing");

        let hook = full_status_hook(
            self.store.clone(),
            connection.host().to_string(),
            connection.port(),
        );
        let request_timeout = self.request_timeout;
        tokio::spawn(async move {
            if let Err(e) = connection
                .call_ordered(Method::ServerGetStatus, None, request_timeout, hook)
                .await
            {
                tracing::warn!("Status refresh failed: {}", e);
            }
        });
    }
}

/// Everything the background task needs
#[derive(Clone)]
struct Session {
    host: String,
    port: u16,
    config: ClientConfig,
    store: StateStore,
    link: Arc<Link>,
    state: watch::Sender<LinkState>,
}

impl Session {
    /// Open the socket and load the full status
    ///
    /// Only a connection that got this far counts as a successful attempt.
    async fn connect_and_sync(&self) -> Result<Arc<Connection>> {
        let connection =
            Arc::new(Connection::open(&self.host, self.port, self.config.connect_timeout).await?);

        let router = NotificationRouter {
            store: self.store.clone(),
            connection: Arc::downgrade(&connection),
            request_timeout: self.config.request_timeout,
        };
        connection.on_notification(Arc::new(move |notification| router.handle(notification)));

        connection
            .call_ordered(
                Method::ServerGetStatus,
                None,
                self.config.request_timeout,
                full_status_hook(self.store.clone(), self.host.clone(), self.port),
            )
            .await?;

        Ok(connection)
    }

    async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::from_config(&self.config.reconnect);

        loop {
            set_state(&self.state, LinkState::Connecting);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.connect_and_sync() => attempt,
            };

            match attempt {
                Ok(connection) => {
                    backoff.reset();
                    self.link.set(connection.clone());
                    set_state(&self.state, LinkState::Connected);
                    tracing::info!(host = %self.host, port = self.port, "Connected to snapserver");

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = connection.closed() => {}
                    }

                    self.link.clear();
                    self.store.mark_disconnected();
                    tracing::warn!(
                        reason = %connection.close_reason().map(|r| r.to_string()).unwrap_or_default(),
                        "Lost connection to snapserver, reconnecting"
                    );
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    let delay_ms = delay.as_millis() as u64;
                    if e.is_transient() {
                        tracing::warn!(
                            host = %self.host,
                            port = self.port,
                            delay_ms,
                            "Connection attempt failed: {}",
                            e
                        );
                    } else {
                        // The server answered but its status was unusable
                        tracing::error!(
                            host = %self.host,
                            port = self.port,
                            delay_ms,
                            "Server status rejected: {}",
                            e
                        );
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(connection) = self.link.clear() {
            connection.close();
        }
        tracing::info!("Supervisor stopped");
    }
}

/// Keeps one snapserver connection alive
///
/// Retries forever with exponential backoff until [`Supervisor::stop`].
pub struct Supervisor {
    config: ClientConfig,
    store: StateStore,
    link: Arc<Link>,
    state: watch::Sender<LinkState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: ClientConfig, store: StateStore, link: Arc<Link>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            store,
            link,
            state,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Begin connecting to `host:port` in the background
    ///
    /// A supervisor connects to one server once; starting it again, or
    /// after it was stopped, is an error.
    pub fn start(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shutdown.is_cancelled() {
            return Err(SnapError::InvalidArgument("Supervisor has been stopped".to_string()));
        }
        if task.is_some() {
            return Err(SnapError::InvalidArgument("Supervisor is already running".to_string()));
        }

        let session = Session {
            host: host.into(),
            port,
            config: self.config.clone(),
            store: self.store.clone(),
            link: self.link.clone(),
            state: self.state.clone(),
        };
        tracing::info!(host = %session.host, port, "Starting supervisor");
        *task = Some(tokio::spawn(session.run(self.shutdown.clone())));
        Ok(())
    }

    /// Stop for good
    ///
    /// Closes the live connection and cancels any pending retry. No
    /// reconnection attempt is made after this returns.
    pub async fn stop(&self) {
        self.state.send_replace(LinkState::ShuttingDown);
        self.shutdown.cancel();

        if let Some(connection) = self.link.clear() {
            connection.close();
        }

        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // Give it a moment to stop gracefully
            if tokio::time::timeout(Duration::from_millis(500), handle).await.is_err() {
                tracing::warn!("Supervisor task did not stop in time");
            }
        }
        self.store.mark_disconnected();
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
