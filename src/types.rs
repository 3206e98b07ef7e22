use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Client identifier, server-assigned (usually MAC-derived)
pub type ClientId = String;

/// Group identifier
pub type GroupId = String;

/// Source (stream) identifier
pub type SourceId = String;

/// Default snapserver JSON-RPC control port
pub const DEFAULT_CONTROL_PORT: u16 = 1705;

/// Highest volume percentage
pub const MAX_VOLUME: u8 = 100;

/// Identity of the snapserver a snapshot was read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Host used to connect
    pub host: String,
    /// Control port used to connect
    pub port: u16,
    /// Reported snapserver version
    pub version: String,
    /// Reported host name
    pub hostname: String,
    /// Reported IP address
    pub ip: String,
    /// Reported MAC address
    pub mac: String,
}

impl ServerIdentity {
    /// Identity known before the server has reported anything
    pub fn unresolved(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            version: String::new(),
            hostname: String::new(),
            ip: String::new(),
            mac: String::new(),
        }
    }

    /// `host:port` of the control endpoint
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self::unresolved("", DEFAULT_CONTROL_PORT)
    }
}

/// Last time the server heard from a client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSeen {
    pub sec: i64,
    pub usec: i64,
}

/// A snapclient endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    /// IP address of the client
    pub host: String,
    pub mac: String,
    /// Volume percentage, always within 0..=100
    pub volume: u8,
    pub muted: bool,
    pub connected: bool,
    /// Latency offset in milliseconds
    pub latency: i32,
    pub last_seen: LastSeen,
    pub snapclient_version: String,
    pub host_os: String,
    pub host_arch: String,
    pub host_name: String,
}

impl Client {
    /// Name, falling back to the host address
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }

    /// "os / arch", or whichever of the two is known
    pub fn display_system(&self) -> String {
        [self.host_os.as_str(), self.host_arch.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" / ")
    }
}

/// A set of clients playing the same source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Current source, empty when none is assigned
    pub stream_id: SourceId,
    pub muted: bool,
    /// Member client ids in server order
    pub client_ids: Vec<ClientId>,
}

impl Group {
    pub fn client_count(&self) -> usize {
        self.client_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.client_ids.is_empty()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.client_ids.iter().any(|id| id == client_id)
    }
}

/// Playback status of a source, as reported by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Idle,
    Playing,
    #[default]
    Unknown,
}

impl SourceStatus {
    /// Parse the server's status string
    pub fn from_wire(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "idle" => SourceStatus::Idle,
            "playing" => SourceStatus::Playing,
            _ => SourceStatus::Unknown,
        }
    }
}

/// Track metadata published by a source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Album art reference (URL or data URI)
    pub art_url: String,
}

impl SourceMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.artist.is_empty()
            && self.album.is_empty()
            && self.art_url.is_empty()
    }
}

/// An audio stream offered by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub status: SourceStatus,
    pub codec: String,
    pub sample_format: String,
    pub uri_scheme: String,
    pub uri_raw: String,
    pub metadata: Option<SourceMetadata>,
}

impl Source {
    pub fn is_playing(&self) -> bool {
        self.status == SourceStatus::Playing
    }
}

/// One complete, immutable view of the server
///
/// Entities are held behind `Arc` so a snapshot derived from another shares
/// every entity it did not change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSnapshot {
    /// Publication counter, bumped on every published change
    pub version: u64,
    pub connected: bool,
    pub server: ServerIdentity,
    pub groups: BTreeMap<GroupId, Arc<Group>>,
    pub clients: BTreeMap<ClientId, Arc<Client>>,
    pub sources: BTreeMap<SourceId, Arc<Source>>,
}

impl ServerSnapshot {
    pub fn client(&self, client_id: &str) -> Option<&Arc<Client>> {
        self.clients.get(client_id)
    }

    pub fn group(&self, group_id: &str) -> Option<&Arc<Group>> {
        self.groups.get(group_id)
    }

    pub fn source(&self, source_id: &str) -> Option<&Arc<Source>> {
        self.sources.get(source_id)
    }

    /// Members of a group that resolve to a known client
    ///
    /// Dangling member ids are skipped.
    pub fn clients_in_group(&self, group_id: &str) -> Vec<Arc<Client>> {
        self.groups
            .get(group_id)
            .map(|group| {
                group
                    .client_ids
                    .iter()
                    .filter_map(|id| self.clients.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The group a client belongs to
    pub fn group_for_client(&self, client_id: &str) -> Option<&Arc<Group>> {
        self.groups.values().find(|group| group.contains(client_id))
    }

    /// Case-insensitive lookup of a source by name
    pub fn find_source_by_name(&self, name: &str) -> Option<&Arc<Source>> {
        self.sources
            .values()
            .find(|source| source.name.eq_ignore_ascii_case(name))
    }

    /// Replace a client with an edited copy. Returns `false` if the client
    /// is unknown or the edit changed nothing, leaving the entry untouched.
    pub(crate) fn update_client(&mut self, client_id: &str, edit: impl FnOnce(&mut Client)) -> bool {
        update_entry(&mut self.clients, client_id, edit)
    }

    pub(crate) fn update_group(&mut self, group_id: &str, edit: impl FnOnce(&mut Group)) -> bool {
        update_entry(&mut self.groups, group_id, edit)
    }

    pub(crate) fn update_source(&mut self, source_id: &str, edit: impl FnOnce(&mut Source)) -> bool {
        update_entry(&mut self.sources, source_id, edit)
    }
}

fn update_entry<T: Clone + PartialEq>(
    entries: &mut BTreeMap<String, Arc<T>>,
    id: &str,
    edit: impl FnOnce(&mut T),
) -> bool {
    let Some(entry) = entries.get_mut(id) else {
        return false;
    };
    let mut edited = T::clone(entry);
    edit(&mut edited);
    if edited == **entry {
        return false;
    }
    *entry = Arc::new(edited);
    true
}

/// Server-measured timing statistics for one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeStats {
    pub latency_median_ms: f64,
    pub latency_p95_ms: f64,
    pub jitter_ms: f64,
    pub samples: u64,
    #[serde(default)]
    pub suggested_buffer_ms: Option<f64>,
}

/// JSON-RPC protocol version reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}
