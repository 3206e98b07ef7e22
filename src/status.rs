//! Parsing of snapserver status payloads into domain types
//!
//! `Server.GetStatus`, `Server.OnUpdate` and `Group.SetClients` all carry the
//! same `{"server": {...}}` document:
//!
//! ```text
//! server
//! ├── server   { snapserver: { version }, host: { name, ip, mac } }
//! ├── groups   [ { id, name, stream_id, muted, clients: [ ... ] } ]
//! └── streams  [ { id, status, uri: { raw, scheme, query }, properties } ]
//! ```

use crate::error::{Result, SnapError};
use crate::types::{
    Client, Group, LastSeen, ServerIdentity, Source, SourceMetadata, SourceStatus, MAX_VOLUME,
};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_VOLUME: i64 = 50;

/// A fully parsed server status document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub server: ServerIdentity,
    pub groups: Vec<Group>,
    pub clients: Vec<Client>,
    pub sources: Vec<Source>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireStatus {
    server: WireServerInfo,
    groups: Vec<WireGroup>,
    streams: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireServerInfo {
    snapserver: WireSnapserver,
    host: WireHost,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireSnapserver {
    version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireHost {
    name: String,
    ip: String,
    mac: String,
    os: String,
    arch: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireGroup {
    id: String,
    name: String,
    stream_id: String,
    muted: bool,
    clients: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireClient {
    id: String,
    connected: Option<bool>,
    config: WireClientConfig,
    host: WireHost,
    #[serde(rename = "lastSeen")]
    last_seen: LastSeen,
    snapclient: WireSnapclient,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireClientConfig {
    name: String,
    latency: i64,
    volume: WireVolume,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct WireVolume {
    pub(crate) percent: Option<i64>,
    pub(crate) muted: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireSnapclient {
    version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireStream {
    id: String,
    status: String,
    uri: WireUri,
    properties: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireUri {
    raw: String,
    scheme: String,
    query: Value,
}

/// Parse a `{"server": {...}}` status document
pub fn parse_server_status(payload: &Value, host: &str, port: u16) -> Result<ServerStatus> {
    let server = payload
        .get("server")
        .ok_or_else(|| SnapError::InvalidResponse("No server in status payload".to_string()))?;
    let wire: WireStatus = serde_json::from_value(server.clone())
        .map_err(|e| SnapError::InvalidResponse(format!("Malformed status payload: {}", e)))?;

    let identity = ServerIdentity {
        host: host.to_string(),
        port,
        version: wire.server.snapserver.version,
        hostname: wire.server.host.name,
        ip: wire.server.host.ip,
        mac: wire.server.host.mac,
    };

    let mut groups = Vec::with_capacity(wire.groups.len());
    let mut clients = Vec::new();
    for group in wire.groups {
        let mut client_ids = Vec::with_capacity(group.clients.len());
        for raw_client in &group.clients {
            match parse_client(raw_client) {
                Ok(client) => {
                    client_ids.push(client.id.clone());
                    clients.push(client);
                }
                Err(e) => tracing::warn!(group = %group.id, "Skipping client: {}", e),
            }
        }
        groups.push(Group {
            id: group.id,
            name: group.name,
            stream_id: group.stream_id,
            muted: group.muted,
            client_ids,
        });
    }

    let mut sources = Vec::with_capacity(wire.streams.len());
    for raw_stream in &wire.streams {
        match parse_source(raw_stream) {
            Ok(source) => sources.push(source),
            Err(e) => tracing::warn!("Skipping stream: {}", e),
        }
    }

    Ok(ServerStatus {
        server: identity,
        groups,
        clients,
        sources,
    })
}

/// Parse one client object
pub fn parse_client(value: &Value) -> Result<Client> {
    let wire: WireClient = serde_json::from_value(value.clone())
        .map_err(|e| SnapError::InvalidResponse(format!("Malformed client: {}", e)))?;
    if wire.id.is_empty() {
        return Err(SnapError::InvalidResponse("Client without id".to_string()));
    }

    let volume = clamp_volume(&wire.id, wire.config.volume.percent.unwrap_or(DEFAULT_VOLUME));

    Ok(Client {
        name: wire.config.name,
        host: wire.host.ip,
        mac: wire.host.mac,
        volume,
        muted: wire.config.volume.muted.unwrap_or(false),
        connected: wire.connected.unwrap_or(true),
        latency: clamp_latency(wire.config.latency),
        last_seen: wire.last_seen,
        snapclient_version: wire.snapclient.version,
        host_os: wire.host.os,
        host_arch: wire.host.arch,
        host_name: wire.host.name,
        id: wire.id,
    })
}

/// Parse one stream object
pub fn parse_source(value: &Value) -> Result<Source> {
    let wire: WireStream = serde_json::from_value(value.clone())
        .map_err(|e| SnapError::InvalidResponse(format!("Malformed stream: {}", e)))?;
    if wire.id.is_empty() {
        return Err(SnapError::InvalidResponse("Stream without id".to_string()));
    }

    let query = &wire.uri.query;
    let name = str_field(query, "name").unwrap_or_else(|| wire.id.clone());

    // Modern servers report the codec under properties, older ones in the URI
    let codec = match wire.properties.get("codec") {
        Some(Value::String(codec)) => Some(codec.clone()),
        Some(codec) => str_field(codec, "name"),
        None => None,
    }
    .filter(|codec| !codec.is_empty())
    .or_else(|| str_field(query, "codec"))
    .unwrap_or_default();

    let sample_format = str_field(&wire.properties, "sampleFormat")
        .or_else(|| str_field(query, "sampleformat"))
        .unwrap_or_default();

    Ok(Source {
        name,
        status: SourceStatus::from_wire(&wire.status),
        codec,
        sample_format,
        uri_scheme: wire.uri.scheme,
        uri_raw: wire.uri.raw,
        metadata: parse_metadata(&wire.properties),
        id: wire.id,
    })
}

/// Extract track metadata from a stream's `properties` object
pub fn parse_metadata(properties: &Value) -> Option<SourceMetadata> {
    let metadata = properties.get("metadata")?.as_object()?;

    let text = |key: &str| -> String {
        match metadata.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    };

    let parsed = SourceMetadata {
        title: text("title"),
        artist: text("artist"),
        album: text("album"),
        art_url: text("artUrl"),
    };
    (!parsed.is_empty()).then_some(parsed)
}

pub(crate) fn clamp_volume(client_id: &str, percent: i64) -> u8 {
    let clamped = percent.clamp(0, i64::from(MAX_VOLUME));
    if clamped != percent {
        tracing::warn!(
            client = client_id,
            "Volume {} out of range, clamped to {}",
            percent,
            clamped
        );
    }
    u8::try_from(clamped).unwrap_or(MAX_VOLUME)
}

pub(crate) fn clamp_latency(latency: i64) -> i32 {
    i32::try_from(latency).unwrap_or(if latency < 0 { i32::MIN } else { i32::MAX })
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
