//! Typed server events
//!
//! Server pushes and the results of mutating commands both describe an
//! authoritative change to the server state. Both are decoded into a
//! [`ServerEvent`] before they reach the state store.

use crate::error::{Result, SnapError};
use crate::patch::PatchKey;
use crate::protocol::{Method, Notification};
use crate::status::{self, ServerStatus, WireVolume};
use crate::types::{Client, ClientId, GroupId, ServerSnapshot, Source, SourceId, SourceMetadata};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// An authoritative change reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client connected, or a new client appeared
    ClientConnected(Client),
    ClientDisconnected(Client),
    ClientVolumeChanged {
        client_id: ClientId,
        volume: Option<u8>,
        muted: Option<bool>,
    },
    ClientLatencyChanged { client_id: ClientId, latency: i32 },
    ClientNameChanged { client_id: ClientId, name: String },
    GroupMuteChanged { group_id: GroupId, muted: bool },
    GroupStreamChanged { group_id: GroupId, stream_id: SourceId },
    GroupNameChanged { group_id: GroupId, name: String },
    StreamUpdated(Source),
    StreamPropertiesChanged {
        stream_id: SourceId,
        metadata: Option<SourceMetadata>,
    },
    /// The whole server state was resent
    ServerUpdated(ServerStatus),
    /// A notification this library does not interpret
    Unknown { method: String },
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct ClientParams {
    id: String,
    client: Value,
}

#[derive(Deserialize)]
struct VolumeParams {
    #[serde(default)]
    volume: WireVolume,
}

#[derive(Deserialize)]
struct LatencyParams {
    latency: i64,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct MuteParams {
    mute: bool,
}

#[derive(Deserialize)]
struct StreamIdParams {
    stream_id: String,
}

#[derive(Deserialize)]
struct StreamParams {
    stream: Value,
}

#[derive(Deserialize)]
struct PropertiesParams {
    #[serde(default)]
    properties: Value,
}

fn params<T: for<'de> Deserialize<'de>>(method: &str, value: &Value) -> Result<T> {
    T::deserialize(value)
        .map_err(|e| SnapError::InvalidResponse(format!("Malformed {} payload: {}", method, e)))
}

fn volume_event(client_id: ClientId, value: &Value, method: &str) -> Result<ServerEvent> {
    let VolumeParams { volume } = params(method, value)?;
    Ok(ServerEvent::ClientVolumeChanged {
        volume: volume
            .percent
            .map(|percent| status::clamp_volume(&client_id, percent)),
        muted: volume.muted,
        client_id,
    })
}

impl ServerEvent {
    /// Decode a server notification
    pub fn from_notification(notification: &Notification) -> Result<Self> {
        let method = notification.method.as_str();
        let p = &notification.params;

        let event = match method {
            "Client.OnConnect" | "Client.OnDisconnect" => {
                let ClientParams { id, client } = params(method, p)?;
                let mut client = status::parse_client(&client)?;
                if client.id != id {
                    tracing::debug!(notified = %id, payload = %client.id, "Client id mismatch, using notified id");
                    client.id = id;
                }
                if method == "Client.OnConnect" {
                    ServerEvent::ClientConnected(client)
                } else {
                    client.connected = false;
                    ServerEvent::ClientDisconnected(client)
                }
            }
            "Client.OnVolumeChanged" => {
                let IdParams { id } = params(method, p)?;
                volume_event(id, p, method)?
            }
            "Client.OnLatencyChanged" => {
                let IdParams { id } = params(method, p)?;
                let LatencyParams { latency } = params(method, p)?;
                ServerEvent::ClientLatencyChanged {
                    client_id: id,
                    latency: status::clamp_latency(latency),
                }
            }
            "Client.OnNameChanged" => {
                let IdParams { id } = params(method, p)?;
                let NameParams { name } = params(method, p)?;
                ServerEvent::ClientNameChanged { client_id: id, name }
            }
            "Group.OnMute" => {
                let IdParams { id } = params(method, p)?;
                let MuteParams { mute } = params(method, p)?;
                ServerEvent::GroupMuteChanged { group_id: id, muted: mute }
            }
            "Group.OnStreamChanged" => {
                let IdParams { id } = params(method, p)?;
                let StreamIdParams { stream_id } = params(method, p)?;
                ServerEvent::GroupStreamChanged { group_id: id, stream_id }
            }
            "Group.OnNameChanged" => {
                let IdParams { id } = params(method, p)?;
                let NameParams { name } = params(method, p)?;
                ServerEvent::GroupNameChanged { group_id: id, name }
            }
            "Stream.OnUpdate" => {
                let IdParams { id } = params(method, p)?;
                let StreamParams { stream } = params(method, p)?;
                let mut source = status::parse_source(&stream)?;
                source.id = id;
                ServerEvent::StreamUpdated(source)
            }
            "Stream.OnProperties" => {
                let IdParams { id } = params(method, p)?;
                let PropertiesParams { properties } = params(method, p)?;
                ServerEvent::StreamPropertiesChanged {
                    stream_id: id,
                    metadata: status::parse_metadata(&properties),
                }
            }
            "Server.OnUpdate" => ServerEvent::ServerUpdated(status::parse_server_status(p, "", 0)?),
            other => ServerEvent::Unknown {
                method: other.to_string(),
            },
        };
        Ok(event)
    }

    /// Decode the result of a mutating command on `target`
    ///
    /// Returns `None` for methods whose result carries no state.
    pub fn from_result(method: Method, target: &str, result: &Value) -> Result<Option<Self>> {
        let name = method.as_str();
        let event = match method {
            Method::ClientSetVolume => volume_event(target.to_string(), result, name)?,
            Method::ClientSetLatency => {
                let LatencyParams { latency } = params(name, result)?;
                ServerEvent::ClientLatencyChanged {
                    client_id: target.to_string(),
                    latency: status::clamp_latency(latency),
                }
            }
            Method::ClientSetName => {
                let NameParams { name } = params(name, result)?;
                ServerEvent::ClientNameChanged {
                    client_id: target.to_string(),
                    name,
                }
            }
            Method::GroupSetMute => {
                let MuteParams { mute } = params(name, result)?;
                ServerEvent::GroupMuteChanged {
                    group_id: target.to_string(),
                    muted: mute,
                }
            }
            Method::GroupSetStream => {
                let StreamIdParams { stream_id } = params(name, result)?;
                ServerEvent::GroupStreamChanged {
                    group_id: target.to_string(),
                    stream_id,
                }
            }
            Method::GroupSetName => {
                let NameParams { name } = params(name, result)?;
                ServerEvent::GroupNameChanged {
                    group_id: target.to_string(),
                    name,
                }
            }
            Method::GroupSetClients => {
                ServerEvent::ServerUpdated(status::parse_server_status(result, "", 0)?)
            }
            Method::ServerGetStatus | Method::ServerGetRpcVersion | Method::ClientGetTimeStats => {
                return Ok(None)
            }
        };
        Ok(Some(event))
    }

    /// Whether this event replaces the whole server state
    pub fn is_full_update(&self) -> bool {
        matches!(self, ServerEvent::ServerUpdated(_))
    }

    /// Whether the snapshot needs a full status to place what this event names
    ///
    /// A client connecting for the first time is announced without the
    /// group the server put it in; only the full status carries that.
    pub fn needs_full_status(&self, snapshot: &ServerSnapshot) -> bool {
        match self {
            ServerEvent::ClientConnected(client) => snapshot.group_for_client(&client.id).is_none(),
            _ => false,
        }
    }

    /// Fields this event reports authoritatively
    pub fn keys(&self) -> Vec<PatchKey> {
        match self {
            ServerEvent::ClientConnected(client) | ServerEvent::ClientDisconnected(client) => vec![
                PatchKey::ClientVolume(client.id.clone()),
                PatchKey::ClientMute(client.id.clone()),
                PatchKey::ClientLatency(client.id.clone()),
                PatchKey::ClientName(client.id.clone()),
            ],
            ServerEvent::ClientVolumeChanged {
                client_id,
                volume,
                muted,
            } => {
                let mut keys = Vec::with_capacity(2);
                if volume.is_some() {
                    keys.push(PatchKey::ClientVolume(client_id.clone()));
                }
                if muted.is_some() {
                    keys.push(PatchKey::ClientMute(client_id.clone()));
                }
                keys
            }
            ServerEvent::ClientLatencyChanged { client_id, .. } => {
                vec![PatchKey::ClientLatency(client_id.clone())]
            }
            ServerEvent::ClientNameChanged { client_id, .. } => {
                vec![PatchKey::ClientName(client_id.clone())]
            }
            ServerEvent::GroupMuteChanged { group_id, .. } => {
                vec![PatchKey::GroupMute(group_id.clone())]
            }
            ServerEvent::GroupStreamChanged { group_id, .. } => {
                vec![PatchKey::GroupStream(group_id.clone())]
            }
            ServerEvent::GroupNameChanged { group_id, .. } => {
                vec![PatchKey::GroupName(group_id.clone())]
            }
            ServerEvent::StreamUpdated(_)
            | ServerEvent::StreamPropertiesChanged { .. }
            | ServerEvent::ServerUpdated(_)
            | ServerEvent::Unknown { .. } => Vec::new(),
        }
    }

    /// Merge into a draft snapshot
    ///
    /// Events naming an unknown client, group or stream are ignored.
    /// Full updates are handled by the store, not here.
    pub(crate) fn apply(&self, snapshot: &mut ServerSnapshot) -> bool {
        match self {
            ServerEvent::ClientConnected(client) | ServerEvent::ClientDisconnected(client) => {
                match snapshot.clients.get(&client.id) {
                    Some(existing) if **existing == *client => false,
                    _ => {
                        snapshot
                            .clients
                            .insert(client.id.clone(), Arc::new(client.clone()));
                        true
                    }
                }
            }
            ServerEvent::ClientVolumeChanged {
                client_id,
                volume,
                muted,
            } => snapshot.update_client(client_id, |c| {
                if let Some(volume) = volume {
                    c.volume = *volume;
                }
                if let Some(muted) = muted {
                    c.muted = *muted;
                }
            }),
            ServerEvent::ClientLatencyChanged { client_id, latency } => {
                snapshot.update_client(client_id, |c| c.latency = *latency)
            }
            ServerEvent::ClientNameChanged { client_id, name } => {
                snapshot.update_client(client_id, |c| c.name.clone_from(name))
            }
            ServerEvent::GroupMuteChanged { group_id, muted } => {
                snapshot.update_group(group_id, |g| g.muted = *muted)
            }
            ServerEvent::GroupStreamChanged {
                group_id,
                stream_id,
            } => snapshot.update_group(group_id, |g| g.stream_id.clone_from(stream_id)),
            ServerEvent::GroupNameChanged { group_id, name } => {
                snapshot.update_group(group_id, |g| g.name.clone_from(name))
            }
            ServerEvent::StreamUpdated(source) => match snapshot.sources.get(&source.id) {
                Some(existing) if **existing == *source => false,
                _ => {
                    snapshot
                        .sources
                        .insert(source.id.clone(), Arc::new(source.clone()));
                    true
                }
            },
            ServerEvent::StreamPropertiesChanged {
                stream_id,
                metadata,
            } => snapshot.update_source(stream_id, |s| s.metadata.clone_from(metadata)),
            ServerEvent::ServerUpdated(_) | ServerEvent::Unknown { .. } => false,
        }
    }
}
