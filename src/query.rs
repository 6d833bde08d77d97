//! Membership queries.
//!
//! [`resolve_active_membership`] is the authoritative answer to "is this
//! player free to be invited". It never picks between two active rows: a
//! player with more than one non-terminal membership is reported as an
//! [`StoreError::InvariantViolation`].

use crate::error::{Result, StoreError};
use crate::memberships::MembershipIndex;
use crate::types::{ConversationId, ConversationMembership, MembershipId, PlayerId, StatusKind};
use tracing::error;

/// Read access to membership rows through the store's indexes.
///
/// Implemented by the store (committed state), by a [`Transaction`]
/// (committed state plus the transaction's own writes) and by a bare
/// [`MembershipIndex`].
///
/// [`Transaction`]: crate::Transaction
pub trait MembershipReader {
    /// Point lookup by primary key.
    fn membership(&self, id: MembershipId) -> Result<Option<ConversationMembership>>;

    /// All rows for an exact `(conversation, player)` pair, active or not.
    fn memberships_for_pair(
        &self,
        conversation: ConversationId,
        player: PlayerId,
    ) -> Result<Vec<ConversationMembership>>;

    /// All rows of a conversation, ordered by player.
    fn memberships_in_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ConversationMembership>>;

    /// A player's rows in one state, ordered by end time.
    fn memberships_by_kind(
        &self,
        player: PlayerId,
        kind: StatusKind,
    ) -> Result<Vec<ConversationMembership>>;

    /// A player's non-terminal rows.
    fn active_memberships_for_player(&self, player: PlayerId) -> Result<Vec<ConversationMembership>>;

    /// A player's `left` rows with `partner`, ordered by end time.
    fn left_with(&self, player: PlayerId, partner: PlayerId) -> Result<Vec<ConversationMembership>>;
}

impl MembershipReader for MembershipIndex {
    fn membership(&self, id: MembershipId) -> Result<Option<ConversationMembership>> {
        Ok(self.get(id).cloned())
    }

    fn memberships_for_pair(
        &self,
        conversation: ConversationId,
        player: PlayerId,
    ) -> Result<Vec<ConversationMembership>> {
        Ok(self.get_by_pair(conversation, player))
    }

    fn memberships_in_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ConversationMembership>> {
        Ok(self.get_by_conversation(conversation))
    }

    fn memberships_by_kind(
        &self,
        player: PlayerId,
        kind: StatusKind,
    ) -> Result<Vec<ConversationMembership>> {
        Ok(self.get_by_player_kind(player, kind))
    }

    fn active_memberships_for_player(&self, player: PlayerId) -> Result<Vec<ConversationMembership>> {
        Ok(self.get_active_for_player(player))
    }

    fn left_with(&self, player: PlayerId, partner: PlayerId) -> Result<Vec<ConversationMembership>> {
        Ok(self.get_left_with(player, partner))
    }
}

/// Resolve a player's current membership.
///
/// Returns `None` when the player has no non-terminal membership and the row
/// when exactly one exists. Two or more is an invariant violation.
pub fn resolve_active_membership<R: MembershipReader + ?Sized>(
    reader: &R,
    player: PlayerId,
) -> Result<Option<ConversationMembership>> {
    let mut active = reader.active_memberships_for_player(player)?;

    if active.len() > 1 {
        let conversations: Vec<_> = active.iter().map(|m| m.conversation_id).collect();
        error!(
            %player,
            ?conversations,
            "player has more than one active conversation membership"
        );
        return Err(StoreError::InvariantViolation(player));
    }

    Ok(active.pop())
}

/// The most recent conversation `player` left with `partner`, if any.
pub fn last_conversation_with<R: MembershipReader + ?Sized>(
    reader: &R,
    player: PlayerId,
    partner: PlayerId,
) -> Result<Option<ConversationMembership>> {
    Ok(reader.left_with(player, partner)?.pop())
}

/// A player's finished memberships, newest first.
pub fn conversation_history<R: MembershipReader + ?Sized>(
    reader: &R,
    player: PlayerId,
) -> Result<Vec<ConversationMembership>> {
    let mut history = reader.memberships_by_kind(player, StatusKind::Left)?;
    history.reverse();
    Ok(history)
}
