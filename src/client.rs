use crate::commands::CommandClient;
use crate::config::{ClientConfig, ServerProfile};
use crate::error::{Result, SnapError};
use crate::store::StateStore;
use crate::subscription::SnapshotReceiver;
use crate::supervisor::{Link, LinkState, Supervisor};
use crate::types::{ServerIdentity, ServerSnapshot};
use std::sync::Arc;
use tokio::sync::watch;

/// Client session for one Snapcast server
///
/// The `SnapcastClient` owns the state store, the reconnecting supervisor
/// and the command surface for a single server. Sessions are independent;
/// any number can run side by side.
pub struct SnapcastClient {
    store: StateStore,
    supervisor: Supervisor,
    commands: CommandClient,
}

impl SnapcastClient {
    /// Start a session with the server at `host:port`
    ///
    /// Returns immediately; the connection is made in the background and
    /// retried until [`stop`](Self::stop). Watch [`link_state`](Self::link_state)
    /// or the snapshot's `connected` flag to know when it is up.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use snapcast_control::{ClientConfig, SnapcastClient};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = SnapcastClient::connect("192.168.1.20", 1705, ClientConfig::default())?;
    ///     let mut updates = client.subscribe();
    ///     while let Ok(snapshot) = updates.recv().await {
    ///         if snapshot.connected {
    ///             for client in snapshot.clients.values() {
    ///                 println!("{}: {}%", client.display_name(), client.volume);
    ///             }
    ///             break;
    ///         }
    ///     }
    ///     client.commands().set_client_volume("00:11:22:33:44:55", 40).await?;
    ///     client.stop().await;
    ///     Ok(())
    /// }
    /// ```
    pub fn connect(host: impl Into<String>, port: u16, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let host = host.into();

        let store = StateStore::with_server(ServerIdentity::unresolved(host.clone(), port));
        let link = Arc::new(Link::new());
        let commands = CommandClient::new(store.clone(), link.clone(), config.clone());
        let supervisor = Supervisor::new(config, store.clone(), link);
        supervisor.start(host, port)?;

        Ok(Self {
            store,
            supervisor,
            commands,
        })
    }

    /// Start a session with the server profile marked `auto_connect`
    pub fn start(config: ClientConfig) -> Result<Self> {
        let ServerProfile { host, port, .. } = config
            .auto_connect_server()
            .cloned()
            .ok_or_else(|| SnapError::Config("No server profile is marked auto_connect".to_string()))?;
        Self::connect(host, port, config)
    }

    /// The session's state store
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<ServerSnapshot> {
        self.store.current()
    }

    /// Subscribe to every subsequent snapshot
    pub fn subscribe(&self) -> SnapshotReceiver {
        self.store.subscribe()
    }

    pub fn commands(&self) -> &CommandClient {
        &self.commands
    }

    pub fn link_state(&self) -> LinkState {
        self.supervisor.state()
    }

    pub fn subscribe_link_state(&self) -> watch::Receiver<LinkState> {
        self.supervisor.subscribe_state()
    }

    /// Disconnect and stop reconnecting
    ///
    /// The last snapshot stays readable, flagged as disconnected.
    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }
}
