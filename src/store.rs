//! Single source of truth for server state
//!
//! The store keeps the last authoritative server state and a queue of
//! optimistic patches, and publishes their composition as an immutable
//! [`ServerSnapshot`]. Every publication is a complete snapshot with a new
//! version; nothing is ever mutated after it has been published.
//!
//! Reconciliation rules:
//!
//! - pending patches are layered over the authoritative state in the order
//!   they were issued
//! - a patch computed against a version older than the last authoritative
//!   change to its field is discarded on arrival
//! - a notification touching a field discards pending patches on that field;
//!   a full status discards all of them
//! - a command confirmation applies the server's result and drops its patch
//!   together with any earlier patch on the same field; a confirmation whose
//!   patch is already gone is stale and ignored
//! - a failed command rolls its patch back

use crate::events::ServerEvent;
use crate::patch::{Patch, PatchKey};
use crate::status::ServerStatus;
use crate::subscription::SnapshotReceiver;
use crate::types::{ServerIdentity, ServerSnapshot};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

const SNAPSHOT_CHANNEL_CAPACITY: usize = 256;

/// Handle returned for an accepted optimistic patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchTicket {
    seq: u64,
}

impl PatchTicket {
    /// Issue sequence number of the patch
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

struct PendingPatch {
    patch: Patch,
    key: PatchKey,
}

struct StoreState {
    /// Last authoritative state; its `version` field is not meaningful
    base: ServerSnapshot,
    /// Pending optimistic patches by issue sequence
    pending: BTreeMap<u64, PendingPatch>,
    /// Version at which the server last reported each field
    key_versions: HashMap<PatchKey, u64>,
    /// Version of the last full status; older patches are all superseded
    floor_version: u64,
    next_seq: u64,
    published: Arc<ServerSnapshot>,
}

impl StoreState {
    fn is_superseded(&self, key: &PatchKey, version_token: u64) -> bool {
        self.floor_version > version_token
            || self
                .key_versions
                .get(key)
                .is_some_and(|version| *version > version_token)
    }

    fn compose(&self) -> ServerSnapshot {
        let mut draft = self.base.clone();
        for pending in self.pending.values() {
            pending.patch.apply(&mut draft);
        }
        draft
    }

    fn replace_base(&mut self, status: ServerStatus) {
        let mut server = status.server;
        if server.host.is_empty() {
            server.host.clone_from(&self.base.server.host);
            server.port = self.base.server.port;
        }

        self.base.server = server;
        self.base.connected = true;
        self.base.groups = status
            .groups
            .into_iter()
            .map(|group| (group.id.clone(), Arc::new(group)))
            .collect();
        self.base.clients = status
            .clients
            .into_iter()
            .map(|client| (client.id.clone(), Arc::new(client)))
            .collect();
        self.base.sources = status
            .sources
            .into_iter()
            .map(|source| (source.id.clone(), Arc::new(source)))
            .collect();
    }

    fn discard_all_patches(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(count = self.pending.len(), "Discarding optimistic patches");
            self.pending.clear();
        }
        self.key_versions.clear();
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
    latest: watch::Sender<Arc<ServerSnapshot>>,
    updates: broadcast::Sender<Arc<ServerSnapshot>>,
}

/// Observable store of the current [`ServerSnapshot`]
///
/// Cheap to clone; all clones share the same state. Reads never block on
/// writers for longer than it takes to clone an `Arc`.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Create an empty, disconnected store
    pub fn new() -> Self {
        Self::with_server(ServerIdentity::default())
    }

    /// Create an empty, disconnected store for a known endpoint
    pub fn with_server(server: ServerIdentity) -> Self {
        let base = ServerSnapshot {
            server,
            ..ServerSnapshot::default()
        };
        let published = Arc::new(base.clone());
        let (latest, _) = watch::channel(published.clone());
        let (updates, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    base,
                    pending: BTreeMap::new(),
                    key_versions: HashMap::new(),
                    floor_version: 0,
                    next_seq: 1,
                    published,
                }),
                latest,
                updates,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compose and publish a new snapshot. Must be called with the state lock held.
    fn publish(&self, state: &mut StoreState) -> Arc<ServerSnapshot> {
        let mut snapshot = state.compose();
        snapshot.version = state.published.version + 1;
        let snapshot = Arc::new(snapshot);

        state.published = snapshot.clone();
        self.inner.latest.send_replace(snapshot.clone());
        // No subscribers is not an error
        let _ = self.inner.updates.send(snapshot.clone());

        tracing::trace!(version = snapshot.version, "Published snapshot");
        snapshot
    }

    /// Latest published snapshot
    pub fn current(&self) -> Arc<ServerSnapshot> {
        self.inner.latest.borrow().clone()
    }

    /// Receive every subsequent snapshot, in publication order
    pub fn subscribe(&self) -> SnapshotReceiver {
        SnapshotReceiver::new(self.inner.updates.subscribe())
    }

    /// Watch only the latest snapshot, skipping intermediate ones
    pub fn watch(&self) -> watch::Receiver<Arc<ServerSnapshot>> {
        self.inner.latest.subscribe()
    }

    /// Number of optimistic patches not yet confirmed or discarded
    pub fn pending_patches(&self) -> usize {
        self.lock().pending.len()
    }

    /// Replace the whole state after a (re)connect
    ///
    /// Outstanding optimistic patches are discarded.
    pub fn apply_full_status(&self, status: ServerStatus) -> Arc<ServerSnapshot> {
        let mut state = self.lock();
        state.replace_base(status);
        state.discard_all_patches();
        let snapshot = self.publish(&mut state);
        state.floor_version = snapshot.version;

        tracing::info!(
            version = snapshot.version,
            groups = snapshot.groups.len(),
            clients = snapshot.clients.len(),
            sources = snapshot.sources.len(),
            "Applied full status"
        );
        snapshot
    }

    /// Merge one server notification
    ///
    /// Returns `false` if nothing visible changed, for example when the
    /// event names a client that is not in the snapshot.
    pub fn apply_notification(&self, event: &ServerEvent) -> bool {
        if let ServerEvent::ServerUpdated(status) = event {
            self.apply_full_status(status.clone());
            return true;
        }

        let mut state = self.lock();
        let changed = event.apply(&mut state.base);

        let keys = event.keys();
        let before = state.pending.len();
        state.pending.retain(|_, pending| !keys.contains(&pending.key));
        let dropped = before - state.pending.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Notification superseded optimistic patches");
        }

        if !changed && dropped == 0 {
            tracing::debug!(?event, "Notification changed nothing");
            return false;
        }

        let version = self.publish(&mut state).version;
        for key in keys {
            state.key_versions.insert(key, version);
        }
        true
    }

    /// Tentatively apply a command's expected effect
    ///
    /// `version_token` is the version of the snapshot the patch was
    /// computed against. Returns `None` if the server has reported the
    /// patched field since then, in which case nothing is published.
    pub fn apply_optimistic(&self, patch: Patch, version_token: u64) -> Option<PatchTicket> {
        let mut state = self.lock();
        let key = patch.key();
        if state.is_superseded(&key, version_token) {
            tracing::debug!(?key, version_token, "Optimistic patch superseded before apply");
            return None;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(seq, PendingPatch { patch, key });
        self.publish(&mut state);
        Some(PatchTicket { seq })
    }

    /// Settle a patch with the server's answer
    ///
    /// With `event`, the result is applied as authoritative; without it, the
    /// patch itself is promoted. Returns `false` when the confirmation is
    /// stale because its patch was already settled or discarded.
    pub fn confirm(&self, ticket: PatchTicket, event: Option<&ServerEvent>) -> bool {
        let mut state = self.lock();
        let Some(pending) = state.pending.remove(&ticket.seq) else {
            tracing::debug!(seq = ticket.seq, "Ignoring stale confirmation");
            return false;
        };

        state
            .pending
            .retain(|seq, other| *seq > ticket.seq || other.key != pending.key);

        match event {
            Some(ServerEvent::ServerUpdated(status)) => state.replace_base(status.clone()),
            Some(event) => {
                event.apply(&mut state.base);
            }
            None => {
                pending.patch.apply(&mut state.base);
            }
        }

        self.publish(&mut state);
        true
    }

    /// Roll back a patch whose command failed
    pub fn reject(&self, ticket: PatchTicket) -> bool {
        let mut state = self.lock();
        if state.pending.remove(&ticket.seq).is_none() {
            return false;
        }
        tracing::debug!(seq = ticket.seq, "Rolled back optimistic patch");
        self.publish(&mut state);
        true
    }

    /// Flag the snapshot stale after losing the connection
    ///
    /// All entity data is retained.
    pub fn mark_disconnected(&self) -> bool {
        let mut state = self.lock();
        if !state.base.connected {
            return false;
        }
        state.base.connected = false;
        self.publish(&mut state);
        tracing::info!("Marked server state disconnected");
        true
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
