//! Membership indices for efficient lookups.
//!
//! The primary map is the single source of truth. The three ordered key
//! sets are access paths over it and are always updated together by
//! [`MembershipIndex::put`] and [`MembershipIndex::remove`].

use crate::types::{
    ConversationId, ConversationMembership, MembershipId, PlayerId, StatusKind, Timestamp,
};
use std::collections::{BTreeSet, HashMap};

/// `(conversationId, playerId)`.
type ConversationKey = (ConversationId, PlayerId, MembershipId);

/// `(playerId, status.kind, status.ended)`.
type PlayerKey = (PlayerId, StatusKind, Option<Timestamp>, MembershipId);

/// `(playerId, status.kind, status.with, status.ended)`.
type PartnerKey = (
    PlayerId,
    StatusKind,
    Option<PlayerId>,
    Option<Timestamp>,
    MembershipId,
);

const MIN_ID: MembershipId = MembershipId(0);
const MAX_ID: MembershipId = MembershipId(u64::MAX);
const MAX_ENDED: Option<Timestamp> = Some(Timestamp(i64::MAX));

/// In-memory membership index.
#[derive(Clone, Debug, Default)]
pub struct MembershipIndex {
    /// Membership ID to row.
    rows: HashMap<MembershipId, ConversationMembership>,

    /// Index A: conversation roster lookups.
    by_conversation: BTreeSet<ConversationKey>,

    /// Index B: a player's memberships by state, ordered by end time.
    by_player: BTreeSet<PlayerKey>,

    /// Index C: a player's memberships by partner, ordered by end time.
    by_partner: BTreeSet<PartnerKey>,
}

fn conversation_key(row: &ConversationMembership) -> ConversationKey {
    (row.conversation_id, row.player_id, row.id)
}

fn player_key(row: &ConversationMembership) -> PlayerKey {
    (row.player_id, row.status.kind(), row.status.ended(), row.id)
}

fn partner_key(row: &ConversationMembership) -> PartnerKey {
    (
        row.player_id,
        row.status.kind(),
        row.status.with_player(),
        row.status.ended(),
        row.id,
    )
}

impl MembershipIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row, re-keying every index.
    pub fn put(&mut self, row: ConversationMembership) {
        self.remove(row.id);

        self.by_conversation.insert(conversation_key(&row));
        self.by_player.insert(player_key(&row));
        self.by_partner.insert(partner_key(&row));
        self.rows.insert(row.id, row);
    }

    /// Remove a row from the primary map and every index.
    pub fn remove(&mut self, id: MembershipId) -> Option<ConversationMembership> {
        let row = self.rows.remove(&id)?;

        self.by_conversation.remove(&conversation_key(&row));
        self.by_player.remove(&player_key(&row));
        self.by_partner.remove(&partner_key(&row));

        Some(row)
    }

    /// Point lookup by primary key.
    pub fn get(&self, id: MembershipId) -> Option<&ConversationMembership> {
        self.rows.get(&id)
    }

    /// All rows for an exact `(conversation, player)` pair.
    pub fn get_by_pair(
        &self,
        conversation: ConversationId,
        player: PlayerId,
    ) -> Vec<ConversationMembership> {
        self.by_conversation
            .range((conversation, player, MIN_ID)..=(conversation, player, MAX_ID))
            .filter_map(|(_, _, id)| self.rows.get(id).cloned())
            .collect()
    }

    /// All rows for a conversation, ordered by player.
    pub fn get_by_conversation(&self, conversation: ConversationId) -> Vec<ConversationMembership> {
        self.by_conversation
            .range((conversation, PlayerId(0), MIN_ID)..=(conversation, PlayerId(u64::MAX), MAX_ID))
            .filter_map(|(_, _, id)| self.rows.get(id).cloned())
            .collect()
    }

    /// A player's rows in one state, ordered by end time.
    pub fn get_by_player_kind(
        &self,
        player: PlayerId,
        kind: StatusKind,
    ) -> Vec<ConversationMembership> {
        self.by_player
            .range((player, kind, None, MIN_ID)..=(player, kind, MAX_ENDED, MAX_ID))
            .filter_map(|(_, _, _, id)| self.rows.get(id).cloned())
            .collect()
    }

    /// A player's non-terminal rows.
    ///
    /// Non-terminal kinds sort before `Left`, so this is one range scan
    /// instead of one equality lookup per kind.
    pub fn get_active_for_player(&self, player: PlayerId) -> Vec<ConversationMembership> {
        self.by_player
            .range((player, StatusKind::Invited, None, MIN_ID)..(player, StatusKind::Left, None, MIN_ID))
            .filter_map(|(_, _, _, id)| self.rows.get(id).cloned())
            .collect()
    }

    /// A player's `left` rows with a given partner, ordered by end time.
    pub fn get_left_with(&self, player: PlayerId, partner: PlayerId) -> Vec<ConversationMembership> {
        let kind = StatusKind::Left;
        self.by_partner
            .range(
                (player, kind, Some(partner), None, MIN_ID)
                    ..=(player, kind, Some(partner), MAX_ENDED, MAX_ID),
            )
            .filter_map(|(_, _, _, _, id)| self.rows.get(id).cloned())
            .collect()
    }

    /// Iterate all rows (unordered).
    pub fn iter(&self) -> impl Iterator<Item = &ConversationMembership> {
        self.rows.values()
    }

    /// Highest assigned membership ID.
    pub fn max_id(&self) -> Option<MembershipId> {
        self.rows.keys().max().copied()
    }

    /// Get count of rows.
    pub fn count(&self) -> usize {
        self.rows.len()
    }

    /// Get count of non-terminal rows.
    pub fn active_count(&self) -> usize {
        self.rows.values().filter(|row| row.is_active()).count()
    }

    /// Check that all three indexes hold exactly one key per row.
    pub fn is_consistent(&self) -> bool {
        self.by_conversation.len() == self.rows.len()
            && self.by_player.len() == self.rows.len()
            && self.by_partner.len() == self.rows.len()
            && self.rows.values().all(|row| {
                self.by_conversation.contains(&conversation_key(row))
                    && self.by_player.contains(&player_key(row))
                    && self.by_partner.contains(&partner_key(row))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MembershipStatus;

    fn row(id: u64, conversation: u64, player: u64, status: MembershipStatus) -> ConversationMembership {
        ConversationMembership {
            id: MembershipId(id),
            conversation_id: ConversationId(conversation),
            player_id: PlayerId(player),
            status,
        }
    }

    fn left(ended: i64, with: u64) -> MembershipStatus {
        MembershipStatus::Left {
            started: None,
            ended: Timestamp(ended),
            with_player: PlayerId(with),
        }
    }

    #[test]
    fn test_put_and_lookup() {
        let mut index = MembershipIndex::new();
        index.put(row(1, 10, 1, MembershipStatus::Invited));

        assert_eq!(index.get(MembershipId(1)).unwrap().player_id, PlayerId(1));
        assert_eq!(index.get_by_pair(ConversationId(10), PlayerId(1)).len(), 1);
        assert!(index.get_by_pair(ConversationId(10), PlayerId(2)).is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_put_rekeys_on_status_change() {
        let mut index = MembershipIndex::new();
        index.put(row(1, 10, 1, MembershipStatus::Invited));
        index.put(row(1, 10, 1, MembershipStatus::WalkingOver));

        assert!(index
            .get_by_player_kind(PlayerId(1), StatusKind::Invited)
            .is_empty());
        assert_eq!(
            index
                .get_by_player_kind(PlayerId(1), StatusKind::WalkingOver)
                .len(),
            1
        );
        assert_eq!(index.count(), 1);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_conversation_prefix() {
        let mut index = MembershipIndex::new();
        index.put(row(1, 10, 1, MembershipStatus::Invited));
        index.put(row(2, 10, 2, MembershipStatus::WalkingOver));
        index.put(row(3, 11, 3, MembershipStatus::Invited));

        let roster = index.get_by_conversation(ConversationId(10));
        assert_eq!(roster.len(), 2);
        assert!(roster.iter().all(|m| m.conversation_id == ConversationId(10)));
    }

    #[test]
    fn test_active_scan_excludes_left() {
        let mut index = MembershipIndex::new();
        index.put(row(1, 10, 1, left(5, 2)));
        index.put(row(2, 11, 1, left(6, 3)));
        index.put(row(3, 12, 1, MembershipStatus::Participating { started: Timestamp(7) }));
        index.put(row(4, 12, 2, MembershipStatus::Invited));

        let active = index.get_active_for_player(PlayerId(1));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, MembershipId(3));
        assert_eq!(index.active_count(), 2);
    }

    #[test]
    fn test_left_with_ordered_by_end() {
        let mut index = MembershipIndex::new();
        index.put(row(1, 10, 1, left(30, 2)));
        index.put(row(2, 11, 1, left(10, 2)));
        index.put(row(3, 12, 1, left(20, 3)));

        let with_two = index.get_left_with(PlayerId(1), PlayerId(2));
        let ended: Vec<_> = with_two.iter().map(|m| m.status.ended().unwrap().0).collect();
        assert_eq!(ended, vec![10, 30]);

        let history = index.get_by_player_kind(PlayerId(1), StatusKind::Left);
        let ended: Vec<_> = history.iter().map(|m| m.status.ended().unwrap().0).collect();
        assert_eq!(ended, vec![10, 20, 30]);
    }

    #[test]
    fn test_remove_clears_all_indexes() {
        let mut index = MembershipIndex::new();
        index.put(row(1, 10, 1, left(30, 2)));
        let removed = index.remove(MembershipId(1)).unwrap();

        assert_eq!(removed.id, MembershipId(1));
        assert!(index.get_left_with(PlayerId(1), PlayerId(2)).is_empty());
        assert!(index.get_by_conversation(ConversationId(10)).is_empty());
        assert!(index.remove(MembershipId(1)).is_none());
        assert!(index.is_consistent());
    }
}
