//! Core types for the membership store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a conversation (owned by the conversations collaborator).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub u64);

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationId({})", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a player.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

impl fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlayerId({})", self.0)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primary key of a membership row (assigned by the store).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MembershipId(pub u64);

impl fmt::Debug for MembershipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MembershipId({})", self.0)
    }
}

impl fmt::Display for MembershipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Discriminant of [`MembershipStatus`].
///
/// The declaration order is the index order: every non-terminal kind sorts
/// before `Left`, so the active memberships of a player form one contiguous
/// range in the player index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusKind {
    Invited,
    WalkingOver,
    Participating,
    Left,
}

impl StatusKind {
    /// The three non-terminal kinds, in index order.
    pub const NON_TERMINAL: [StatusKind; 3] = [
        StatusKind::Invited,
        StatusKind::WalkingOver,
        StatusKind::Participating,
    ];

    pub fn is_terminal(self) -> bool {
        self == StatusKind::Left
    }
}

/// Phase of a player's engagement with a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MembershipStatus {
    /// Invited, not yet moving.
    Invited,

    /// En route to the conversation location.
    WalkingOver,

    /// Actively in the conversation.
    Participating { started: Timestamp },

    /// Terminal. `started` is absent when the player never participated.
    Left {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started: Option<Timestamp>,
        ended: Timestamp,
        #[serde(rename = "with")]
        with_player: PlayerId,
    },
}

impl MembershipStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            MembershipStatus::Invited => StatusKind::Invited,
            MembershipStatus::WalkingOver => StatusKind::WalkingOver,
            MembershipStatus::Participating { .. } => StatusKind::Participating,
            MembershipStatus::Left { .. } => StatusKind::Left,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// When participation began, if it did.
    pub fn started(&self) -> Option<Timestamp> {
        match self {
            MembershipStatus::Participating { started } => Some(*started),
            MembershipStatus::Left { started, .. } => *started,
            _ => None,
        }
    }

    /// `status.ended` index component.
    pub fn ended(&self) -> Option<Timestamp> {
        match self {
            MembershipStatus::Left { ended, .. } => Some(*ended),
            _ => None,
        }
    }

    /// `status.with` index component.
    pub fn with_player(&self) -> Option<PlayerId> {
        match self {
            MembershipStatus::Left { with_player, .. } => Some(*with_player),
            _ => None,
        }
    }

    /// Whether a row in this status may move to `next`.
    ///
    /// Rows only move forward along `invited -> walkingOver ->
    /// participating -> left`, possibly skipping phases (an abandoned walk
    /// goes straight to `left`). `left` is final.
    pub fn can_transition_to(&self, next: &MembershipStatus) -> bool {
        !self.is_terminal() && next.kind() > self.kind()
    }
}

/// One player's membership in one conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMembership {
    /// Primary key (assigned by the store).
    pub id: MembershipId,

    pub conversation_id: ConversationId,

    pub player_id: PlayerId,

    pub status: MembershipStatus,
}

impl ConversationMembership {
    /// True iff the status is not `left`.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Shape checks that a schema would enforce at write time.
    pub fn validate_shape(&self) -> Result<(), String> {
        if let MembershipStatus::Left {
            started,
            ended,
            with_player,
        } = self.status
        {
            if with_player == self.player_id {
                return Err(format!(
                    "membership {} left with its own player {}",
                    self.id, self.player_id
                ));
            }
            if let Some(started) = started {
                if ended < started {
                    return Err(format!(
                        "membership {} ended at {} before it started at {}",
                        self.id, ended.0, started.0
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub membership_count: u64,
    pub active_count: u64,
    pub left_count: u64,
    pub commit_count: u64,
    pub log_size_bytes: u64,
}
