use crate::types::{ClientId, GroupId, ServerSnapshot, SourceId};
use std::sync::Arc;

/// The single field an optimistic patch predicts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatchKey {
    ClientVolume(ClientId),
    ClientMute(ClientId),
    ClientLatency(ClientId),
    ClientName(ClientId),
    ClientMembership(ClientId),
    GroupMute(GroupId),
    GroupStream(GroupId),
    GroupName(GroupId),
}

/// Locally predicted effect of a command, shown before the server confirms it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    ClientVolume { client_id: ClientId, volume: u8 },
    ClientMute { client_id: ClientId, muted: bool },
    ClientLatency { client_id: ClientId, latency: i32 },
    ClientName { client_id: ClientId, name: String },
    GroupMute { group_id: GroupId, muted: bool },
    GroupStream { group_id: GroupId, stream_id: SourceId },
    GroupName { group_id: GroupId, name: String },
    /// Client leaves its current group and joins `group_id`
    MoveClient { client_id: ClientId, group_id: GroupId },
}

impl Patch {
    pub fn key(&self) -> PatchKey {
        match self {
            Patch::ClientVolume { client_id, .. } => PatchKey::ClientVolume(client_id.clone()),
            Patch::ClientMute { client_id, .. } => PatchKey::ClientMute(client_id.clone()),
            Patch::ClientLatency { client_id, .. } => PatchKey::ClientLatency(client_id.clone()),
            Patch::ClientName { client_id, .. } => PatchKey::ClientName(client_id.clone()),
            Patch::MoveClient { client_id, .. } => PatchKey::ClientMembership(client_id.clone()),
            Patch::GroupMute { group_id, .. } => PatchKey::GroupMute(group_id.clone()),
            Patch::GroupStream { group_id, .. } => PatchKey::GroupStream(group_id.clone()),
            Patch::GroupName { group_id, .. } => PatchKey::GroupName(group_id.clone()),
        }
    }

    /// Apply to a draft snapshot; unknown targets are left alone
    pub(crate) fn apply(&self, snapshot: &mut ServerSnapshot) -> bool {
        match self {
            Patch::ClientVolume { client_id, volume } => {
                snapshot.update_client(client_id, |c| c.volume = *volume)
            }
            Patch::ClientMute { client_id, muted } => {
                snapshot.update_client(client_id, |c| c.muted = *muted)
            }
            Patch::ClientLatency { client_id, latency } => {
                snapshot.update_client(client_id, |c| c.latency = *latency)
            }
            Patch::ClientName { client_id, name } => {
                snapshot.update_client(client_id, |c| c.name.clone_from(name))
            }
            Patch::GroupMute { group_id, muted } => {
                snapshot.update_group(group_id, |g| g.muted = *muted)
            }
            Patch::GroupStream { group_id, stream_id } => {
                snapshot.update_group(group_id, |g| g.stream_id.clone_from(stream_id))
            }
            Patch::GroupName { group_id, name } => {
                snapshot.update_group(group_id, |g| g.name.clone_from(name))
            }
            Patch::MoveClient { client_id, group_id } => move_client(snapshot, client_id, group_id),
        }
    }
}

fn move_client(snapshot: &mut ServerSnapshot, client_id: &str, group_id: &str) -> bool {
    if !snapshot.groups.contains_key(group_id) {
        return false;
    }

    let mut changed = false;
    for group in snapshot.groups.values_mut() {
        let is_target = group.id == group_id;
        let is_member = group.contains(client_id);
        if is_target && !is_member {
            Arc::make_mut(group).client_ids.push(client_id.to_string());
            changed = true;
        } else if !is_target && is_member {
            Arc::make_mut(group).client_ids.retain(|id| id != client_id);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Client, Group, LastSeen};

    fn snapshot() -> ServerSnapshot {
        let mut snapshot = ServerSnapshot::default();
        for (id, members) in [("g1", vec!["a", "b"]), ("g2", vec!["c"])] {
            snapshot.groups.insert(
                id.to_string(),
                Arc::new(Group {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    stream_id: "default".to_string(),
                    muted: false,
                    client_ids: members.into_iter().map(String::from).collect(),
                }),
            );
        }
        snapshot.clients.insert(
            "a".to_string(),
            Arc::new(Client {
                id: "a".to_string(),
                name: "A".to_string(),
                host: "10.0.0.1".to_string(),
                mac: String::new(),
                volume: 10,
                muted: false,
                connected: true,
                latency: 0,
                last_seen: LastSeen::default(),
                snapclient_version: String::new(),
                host_os: String::new(),
                host_arch: String::new(),
                host_name: String::new(),
            }),
        );
        snapshot
    }

    #[test]
    fn volume_patch_only_touches_target() {
        let mut draft = snapshot();
        let before = draft.clone();
        let patch = Patch::ClientVolume {
            client_id: "a".into(),
            volume: 80,
        };
        assert!(patch.apply(&mut draft));
        assert_eq!(draft.clients["a"].volume, 80);
        assert!(Arc::ptr_eq(&draft.groups["g1"], &before.groups["g1"]));
    }

    #[test]
    fn patch_on_unknown_client_is_noop() {
        let mut draft = snapshot();
        let patch = Patch::ClientMute {
            client_id: "ghost".into(),
            muted: true,
        };
        assert!(!patch.apply(&mut draft));
        assert_eq!(draft, snapshot());
    }

    #[test]
    fn move_client_updates_both_groups() {
        let mut draft = snapshot();
        let patch = Patch::MoveClient {
            client_id: "b".into(),
            group_id: "g2".into(),
        };
        assert!(patch.apply(&mut draft));
        assert_eq!(draft.groups["g1"].client_ids, vec!["a"]);
        assert_eq!(draft.groups["g2"].client_ids, vec!["c", "b"]);

        // Moving into the group it is already in changes nothing
        assert!(!patch.apply(&mut draft));
    }

    #[test]
    fn keys_identify_field() {
        let patch = Patch::GroupStream {
            group_id: "g1".into(),
            stream_id: "radio".into(),
        };
        assert_eq!(patch.key(), PatchKey::GroupStream("g1".into()));
    }
}
