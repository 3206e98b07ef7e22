//! Typed control commands
//!
//! Each mutating command validates its arguments locally, publishes an
//! optimistic patch, sends the RPC, and then settles the patch with the
//! server's answer: confirmed on success, rolled back on failure.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Result, SnapError};
use crate::events::ServerEvent;
use crate::patch::Patch;
use crate::protocol::Method;
use crate::store::StateStore;
use crate::supervisor::{full_status_hook, Link};
use crate::types::{RpcVersion, ServerSnapshot, TimeStats, MAX_VOLUME};
use serde_json::{json, Value};
use std::sync::Arc;

/// Control surface for one snapserver session
///
/// Cheap to clone. Commands fail with [`SnapError::NotConnected`] while the
/// supervisor has no live connection.
#[derive(Clone)]
pub struct CommandClient {
    store: StateStore,
    link: Arc<Link>,
    config: Arc<ClientConfig>,
}

fn unknown(kind: &'static str, id: &str) -> SnapError {
    SnapError::UnknownEntity {
        kind,
        id: id.to_string(),
    }
}

impl CommandClient {
    pub fn new(store: StateStore, link: Arc<Link>, config: ClientConfig) -> Self {
        Self {
            store,
            link,
            config: Arc::new(config),
        }
    }

    fn require_client(snapshot: &ServerSnapshot, client_id: &str) -> Result<()> {
        snapshot
            .client(client_id)
            .map(|_| ())
            .ok_or_else(|| unknown("client", client_id))
    }

    fn require_group(snapshot: &ServerSnapshot, group_id: &str) -> Result<()> {
        snapshot
            .group(group_id)
            .map(|_| ())
            .ok_or_else(|| unknown("group", group_id))
    }

    async fn call(&self, connection: &Connection, method: Method, params: Value) -> Result<Value> {
        connection
            .call(method, Some(params), self.config.request_timeout)
            .await
    }

    /// Send a mutating command with an optimistic patch
    ///
    /// The patch is settled on the reader task as soon as the answer is
    /// decoded, so notifications that follow the answer on the wire are
    /// applied on top of it.
    async fn mutate(&self, method: Method, target: &str, params: Value, patch: Patch) -> Result<()> {
        let connection = self.link.connection()?;

        let token = self.store.current().version;
        let ticket = self.store.apply_optimistic(patch, token);

        let store = self.store.clone();
        let id = target.to_string();
        let settle = move |result: &Value| {
            let event = ServerEvent::from_result(method, &id, result).unwrap_or_else(|e| {
                tracing::warn!(%method, %id, "Unreadable command result, keeping prediction: {}", e);
                None
            });
            match ticket {
                Some(ticket) => {
                    if !store.confirm(ticket, event.as_ref()) {
                        tracing::debug!(%method, %id, "Command result superseded");
                    }
                }
                None => tracing::debug!(%method, %id, "Command sent without prediction"),
            }
            Ok(())
        };

        let result = connection
            .call_ordered(method, Some(params), self.config.request_timeout, settle)
            .await;
        if let Err(e) = result {
            if let Some(ticket) = ticket {
                self.store.reject(ticket);
            }
            tracing::warn!(%method, id = target, "Command failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Set a client's volume percentage
    ///
    /// Values outside 0..=100 are rejected without contacting the server.
    /// The client's mute state is left as it is.
    pub async fn set_client_volume(&self, client_id: &str, volume: i32) -> Result<()> {
        let volume = u8::try_from(volume)
            .ok()
            .filter(|v| *v <= MAX_VOLUME)
            .ok_or_else(|| {
                SnapError::InvalidArgument(format!("Volume {} is outside 0..={}", volume, MAX_VOLUME))
            })?;

        let snapshot = self.store.current();
        let muted = snapshot
            .client(client_id)
            .map(|client| client.muted)
            .ok_or_else(|| unknown("client", client_id))?;

        self.mutate(
            Method::ClientSetVolume,
            client_id,
            json!({ "id": client_id, "volume": { "percent": volume, "muted": muted } }),
            Patch::ClientVolume {
                client_id: client_id.to_string(),
                volume,
            },
        )
        .await
    }

    /// Mute or unmute a client without touching its volume
    pub async fn set_client_mute(&self, client_id: &str, muted: bool) -> Result<()> {
        Self::require_client(&self.store.current(), client_id)?;
        self.mutate(
            Method::ClientSetVolume,
            client_id,
            json!({ "id": client_id, "volume": { "muted": muted } }),
            Patch::ClientMute {
                client_id: client_id.to_string(),
                muted,
            },
        )
        .await
    }

    /// Set a client's latency offset in milliseconds
    pub async fn set_client_latency(&self, client_id: &str, latency_ms: i32) -> Result<()> {
        let range = self.config.latency_range();
        if !range.contains(&latency_ms) {
            return Err(SnapError::InvalidArgument(format!(
                "Latency {} ms is outside {}..={}",
                latency_ms,
                range.start(),
                range.end()
            )));
        }
        Self::require_client(&self.store.current(), client_id)?;

        self.mutate(
            Method::ClientSetLatency,
            client_id,
            json!({ "id": client_id, "latency": latency_ms }),
            Patch::ClientLatency {
                client_id: client_id.to_string(),
                latency: latency_ms,
            },
        )
        .await
    }

    pub async fn set_client_name(&self, client_id: &str, name: &str) -> Result<()> {
        Self::require_client(&self.store.current(), client_id)?;
        self.mutate(
            Method::ClientSetName,
            client_id,
            json!({ "id": client_id, "name": name }),
            Patch::ClientName {
                client_id: client_id.to_string(),
                name: name.to_string(),
            },
        )
        .await
    }

    pub async fn set_group_mute(&self, group_id: &str, muted: bool) -> Result<()> {
        Self::require_group(&self.store.current(), group_id)?;
        self.mutate(
            Method::GroupSetMute,
            group_id,
            json!({ "id": group_id, "mute": muted }),
            Patch::GroupMute {
                group_id: group_id.to_string(),
                muted,
            },
        )
        .await
    }

    /// Set every member of a group to the same volume
    ///
    /// The server has no group volume, so this sends one `Client.SetVolume`
    /// per member. Stops at the first failure; members already set stay set.
    pub async fn set_group_volume(&self, group_id: &str, volume: i32) -> Result<()> {
        if !(0..=i32::from(MAX_VOLUME)).contains(&volume) {
            return Err(SnapError::InvalidArgument(format!(
                "Volume {} is outside 0..={}",
                volume, MAX_VOLUME
            )));
        }

        let members = self.store.current().clients_in_group(group_id);
        if members.is_empty() {
            Self::require_group(&self.store.current(), group_id)?;
            return Ok(());
        }
        for client in members {
            self.set_client_volume(&client.id, volume).await?;
        }
        Ok(())
    }

    /// Switch a group to another source
    pub async fn set_group_stream(&self, group_id: &str, stream_id: &str) -> Result<()> {
        let snapshot = self.store.current();
        Self::require_group(&snapshot, group_id)?;
        if snapshot.source(stream_id).is_none() {
            return Err(unknown("stream", stream_id));
        }

        self.mutate(
            Method::GroupSetStream,
            group_id,
            json!({ "id": group_id, "stream_id": stream_id }),
            Patch::GroupStream {
                group_id: group_id.to_string(),
                stream_id: stream_id.to_string(),
            },
        )
        .await
    }

    pub async fn set_group_name(&self, group_id: &str, name: &str) -> Result<()> {
        Self::require_group(&self.store.current(), group_id)?;
        self.mutate(
            Method::GroupSetName,
            group_id,
            json!({ "id": group_id, "name": name }),
            Patch::GroupName {
                group_id: group_id.to_string(),
                name: name.to_string(),
            },
        )
        .await
    }

    /// Move a client into another group
    ///
    /// The server answers with its full status, which replaces the
    /// predicted membership.
    pub async fn move_client(&self, client_id: &str, group_id: &str) -> Result<()> {
        let snapshot = self.store.current();
        Self::require_client(&snapshot, client_id)?;
        let group = snapshot
            .group(group_id)
            .ok_or_else(|| unknown("group", group_id))?;
        if group.contains(client_id) {
            return Ok(());
        }

        let mut members = group.client_ids.clone();
        members.push(client_id.to_string());

        self.mutate(
            Method::GroupSetClients,
            group_id,
            json!({ "id": group_id, "clients": members }),
            Patch::MoveClient {
                client_id: client_id.to_string(),
                group_id: group_id.to_string(),
            },
        )
        .await
    }

    /// Server-measured latency statistics for a client
    ///
    /// Returns `None` when the server does not implement
    /// `Client.GetTimeStats` or its answer lacks the expected fields.
    pub async fn client_time_stats(&self, client_id: &str) -> Result<Option<TimeStats>> {
        let connection = self.link.connection()?;
        let result = match self
            .call(&connection, Method::ClientGetTimeStats, json!({ "id": client_id }))
            .await
        {
            Ok(result) => result,
            Err(e) if e.is_method_not_found() => {
                tracing::debug!("Server does not support Client.GetTimeStats");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match serde_json::from_value::<TimeStats>(result) {
            Ok(stats) => Ok(Some(stats)),
            Err(e) => {
                tracing::debug!(client_id, "Incomplete time stats: {}", e);
                Ok(None)
            }
        }
    }

    /// JSON-RPC protocol version of the server
    pub async fn rpc_version(&self) -> Result<RpcVersion> {
        let connection = self.link.connection()?;
        let result = connection
            .call(Method::ServerGetRpcVersion, None, self.config.request_timeout)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| SnapError::InvalidResponse(format!("Malformed RPC version: {}", e)))
    }

    /// Re-read the full server status
    ///
    /// Pending optimistic changes are discarded. The returned snapshot may
    /// already include notifications that followed the status.
    pub async fn refresh_status(&self) -> Result<Arc<ServerSnapshot>> {
        let connection = self.link.connection()?;
        let hook = full_status_hook(
            self.store.clone(),
            connection.host().to_string(),
            connection.port(),
        );
        connection
            .call_ordered(Method::ServerGetStatus, None, self.config.request_timeout, hook)
            .await?;
        Ok(self.store.current())
    }
}
