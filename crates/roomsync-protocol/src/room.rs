//! Room data model shared by the host and its clients.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// A member of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Host-assigned member id.
    pub id: String,
    /// Name shown to other members.
    #[serde(default, alias = "name")]
    pub display_name: String,
    /// Whether this member created the room.
    #[serde(default)]
    pub is_host: bool,
    /// Optional application-defined role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Member {
    /// Creates a member that is not the host.
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_host: false,
            role: None,
        }
    }

    /// Builder: mark as host.
    pub fn host(mut self) -> Self {
        self.is_host = true;
        self
    }
}

/// Room visibility requested when hosting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Listed and reachable through quick play.
    #[default]
    Public,
    /// Reachable only by join code.
    Private,
}

/// Options sent with a `createRoom` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomOptions {
    /// Maximum number of members.
    pub max: u32,
    /// Room visibility.
    pub visibility: Visibility,
}

/// Why the host moved leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderChangeReason {
    /// The previous leader disconnected.
    Disconnected,
    /// The previous leader stopped responding.
    Timeout,
    /// Leadership was handed over explicitly.
    Transfer,
}

/// Room snapshot as it travels on the wire.
///
/// Every field is optional: replies to room requests carry most of them,
/// `roomState` pushes only the ones that changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "playerId")]
    pub self_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_leader: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "playerCount")]
    pub member_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "players")]
    pub members: Option<Vec<Member>>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "maxPlayers")]
    pub max_members: Option<u32>,
}

/// The client's mirror of the room it is in.
///
/// `is_leader` is always `leader_id == Some(self_id)`; the two are only
/// changed together through [`RoomState::set_leader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub join_code: String,
    pub game_id: String,
    pub self_id: String,
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub member_count: u32,
    pub members: Vec<Member>,
    pub max_members: u32,
}

impl RoomState {
    /// Builds room state from a reply snapshot.
    ///
    /// `room_id` comes from the snapshot or, failing that, the envelope.
    /// `fallback_self_id` is used when the host does not echo our id.
    pub fn from_info(
        info: RoomInfo,
        envelope_room_id: Option<&str>,
        fallback_self_id: &str,
    ) -> ProtocolResult<Self> {
        let room_id = info
            .room_id
            .or_else(|| envelope_room_id.map(str::to_string))
            .ok_or(ProtocolError::MissingField("roomId"))?;
        let self_id = info
            .self_id
            .unwrap_or_else(|| fallback_self_id.to_string());
        let members = info.members.unwrap_or_default();

        let mut state = Self {
            room_id,
            join_code: info.join_code.unwrap_or_default(),
            game_id: info.game_id.unwrap_or_default(),
            self_id,
            is_leader: false,
            leader_id: None,
            member_count: info.member_count.unwrap_or_else(|| member_count(members.len())),
            members,
            max_members: info.max_members.unwrap_or_default(),
        };
        let leader = state.resolve_leader(info.leader_id, info.is_leader);
        state.set_leader(leader);
        Ok(state)
    }

    /// Replaces the leader id and recomputes `is_leader` in one step.
    pub fn set_leader(&mut self, leader_id: Option<String>) {
        self.is_leader = leader_id.as_deref() == Some(self.self_id.as_str());
        self.leader_id = leader_id;
    }

    /// Replaces the member list and count.
    pub fn set_members(&mut self, members: Vec<Member>, member_count: Option<u32>) {
        self.member_count = member_count.unwrap_or_else(|| self::member_count(members.len()));
        self.members = members;
    }

    /// Applies every field present in a pushed snapshot.
    ///
    /// The room id never changes.
    pub fn merge(&mut self, info: RoomInfo) {
        if let Some(join_code) = info.join_code {
            self.join_code = join_code;
        }
        if let Some(game_id) = info.game_id {
            self.game_id = game_id;
        }
        if let Some(self_id) = info.self_id {
            self.self_id = self_id;
        }
        if let Some(max) = info.max_members {
            self.max_members = max;
        }
        if let Some(members) = info.members {
            self.set_members(members, info.member_count);
        } else if let Some(count) = info.member_count {
            self.member_count = count;
        }
        if info.leader_id.is_some() || info.is_leader.is_some() {
            let leader = self.resolve_leader(info.leader_id, info.is_leader);
            self.set_leader(leader);
        } else {
            // self_id may have changed
            let leader = self.leader_id.take();
            self.set_leader(leader);
        }
    }

    /// Looks up a member by id.
    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    fn resolve_leader(&self, leader_id: Option<String>, is_leader: Option<bool>) -> Option<String> {
        match (leader_id, is_leader) {
            (Some(leader), _) => Some(leader),
            (None, Some(true)) => Some(self.self_id.clone()),
            (None, Some(false)) if self.is_leader => None,
            (None, _) => self.leader_id.clone(),
        }
    }
}

/// A list length as a member count, saturating at `u32::MAX`.
fn member_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_count_saturates() {
        assert_eq!(member_count(3), 3);
        assert_eq!(member_count(usize::MAX), u32::MAX);
    }

    fn info(room_id: &str) -> RoomInfo {
        RoomInfo {
            room_id: Some(room_id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn leader_flag_without_leader_id_points_at_self() {
        let mut snapshot = info("r1");
        snapshot.join_code = Some("AB12".into());
        snapshot.is_leader = Some(true);

        let state = RoomState::from_info(snapshot, None, "me").unwrap();
        assert!(state.is_leader);
        assert_eq!(state.leader_id.as_deref(), Some("me"));
        assert_eq!(state.join_code, "AB12");
    }

    #[test]
    fn leader_id_wins_over_flag() {
        let mut snapshot = info("r1");
        snapshot.is_leader = Some(true);
        snapshot.leader_id = Some("peer".into());

        let state = RoomState::from_info(snapshot, None, "me").unwrap();
        assert!(!state.is_leader);
        assert_eq!(state.leader_id.as_deref(), Some("peer"));
    }

    #[test]
    fn room_id_falls_back_to_envelope() {
        let state = RoomState::from_info(RoomInfo::default(), Some("r9"), "me").unwrap();
        assert_eq!(state.room_id, "r9");

        let missing = RoomState::from_info(RoomInfo::default(), None, "me");
        assert!(matches!(missing, Err(ProtocolError::MissingField("roomId"))));
    }

    #[test]
    fn member_count_defaults_to_list_length() {
        let mut snapshot = info("r1");
        snapshot.members = Some(vec![Member::new("a", "Ann").host(), Member::new("b", "Bo")]);

        let state = RoomState::from_info(snapshot, None, "a").unwrap();
        assert_eq!(state.member_count, 2);
        assert!(state.member("a").unwrap().is_host);
    }

    #[test]
    fn merge_keeps_absent_fields() {
        let mut snapshot = info("r1");
        snapshot.join_code = Some("AB12".into());
        snapshot.leader_id = Some("me".into());
        let mut state = RoomState::from_info(snapshot, None, "me").unwrap();

        state.merge(RoomInfo {
            member_count: Some(3),
            ..Default::default()
        });
        assert_eq!(state.join_code, "AB12");
        assert_eq!(state.member_count, 3);
        assert!(state.is_leader);

        state.merge(RoomInfo {
            leader_id: Some("peer".into()),
            ..Default::default()
        });
        assert!(!state.is_leader);
        assert_eq!(state.leader_id.as_deref(), Some("peer"));
    }

    #[test]
    fn wire_aliases_from_legacy_hosts() {
        let json = r#"{"roomId":"r1","playerId":"p1","playerCount":1,
            "players":[{"id":"p1","name":"Ann","isHost":true}],"maxPlayers":4}"#;
        let snapshot: RoomInfo = serde_json::from_str(json).unwrap();
        let state = RoomState::from_info(snapshot, None, "fallback").unwrap();

        assert_eq!(state.self_id, "p1");
        assert_eq!(state.max_members, 4);
        assert_eq!(state.members[0].display_name, "Ann");
    }
}
