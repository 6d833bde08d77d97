//! Per-tick working set of active conversation memberships.

use crate::error::{Result, StoreError};
use crate::query::MembershipReader;
use crate::table::{GameTable, TableRow, WritePath};
use crate::types::{
    ConversationId, ConversationMembership, MembershipId, MembershipStatus, PlayerId, Timestamp,
};
use std::collections::BTreeSet;
use tracing::{debug, error};

impl TableRow for ConversationMembership {
    const TABLE: &'static str = "conversationMembers";
    type Id = MembershipId;

    fn id(&self) -> MembershipId {
        self.id
    }
}

/// All non-terminal memberships of the given conversations.
///
/// Each conversation is read through its roster prefix and `left` rows are
/// filtered out, however many of them the conversation has accumulated.
pub fn load_active_memberships<R, I>(reader: &R, conversations: I) -> Result<Vec<ConversationMembership>>
where
    R: MembershipReader + ?Sized,
    I: IntoIterator<Item = ConversationId>,
{
    active_rows_of(reader, &conversations.into_iter().collect())
}

fn active_rows_of<R>(
    reader: &R,
    conversations: &BTreeSet<ConversationId>,
) -> Result<Vec<ConversationMembership>>
where
    R: MembershipReader + ?Sized,
{
    let mut rows = Vec::new();
    for &conversation in conversations {
        rows.extend(
            reader
                .memberships_in_conversation(conversation)?
                .into_iter()
                .filter(ConversationMembers::is_active),
        );
    }
    Ok(rows)
}

/// The active memberships of the known conversations, loaded for one tick.
///
/// Mutations write through to the supplied [`WritePath`] (normally the
/// tick's [`Transaction`]) one row at a time.
///
/// [`Transaction`]: crate::Transaction
pub struct ConversationMembers {
    table: GameTable<ConversationMembership>,
}

impl ConversationMembers {
    /// Load the active memberships of `conversations`.
    pub fn load<R, I>(reader: &R, conversations: I) -> Result<Self>
    where
        R: MembershipReader + ?Sized,
        I: IntoIterator<Item = ConversationId>,
    {
        let conversations: BTreeSet<_> = conversations.into_iter().collect();
        let rows = active_rows_of(reader, &conversations)?;
        debug!(
            conversations = conversations.len(),
            memberships = rows.len(),
            "loaded active conversation memberships"
        );
        Ok(Self::from_rows(rows))
    }

    /// Build a working set from rows already in hand.
    pub fn from_rows(rows: impl IntoIterator<Item = ConversationMembership>) -> Self {
        Self {
            table: GameTable::new(rows, Self::is_active),
        }
    }

    /// A membership belongs in the working set until it has left.
    pub fn is_active(row: &ConversationMembership) -> bool {
        row.is_active()
    }

    pub fn table(&self) -> &GameTable<ConversationMembership> {
        &self.table
    }

    pub fn lookup(&self, id: MembershipId) -> Result<&ConversationMembership> {
        self.table.lookup(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationMembership> {
        self.table.iter()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Loaded memberships of one conversation.
    pub fn members_of(&self, conversation: ConversationId) -> Vec<&ConversationMembership> {
        self.table
            .iter()
            .filter(|m| m.conversation_id == conversation)
            .collect()
    }

    /// The loaded, still-active membership of `player`, if any.
    ///
    /// More than one is reported as [`StoreError::InvariantViolation`],
    /// the same as [`resolve_active_membership`].
    ///
    /// [`resolve_active_membership`]: crate::resolve_active_membership
    pub fn membership_for(&self, player: PlayerId) -> Result<Option<&ConversationMembership>> {
        let active: Vec<_> = self
            .table
            .iter()
            .filter(|m| m.player_id == player && m.is_active())
            .collect();

        if active.len() > 1 {
            let conversations: Vec<_> = active.iter().map(|m| m.conversation_id).collect();
            error!(
                %player,
                ?conversations,
                "player has more than one active conversation membership"
            );
            return Err(StoreError::InvariantViolation(player));
        }

        Ok(active.first().copied())
    }

    /// Invite `player` to `conversation`.
    pub fn invite<W>(
        &mut self,
        writer: &mut W,
        conversation: ConversationId,
        player: PlayerId,
    ) -> Result<&ConversationMembership>
    where
        W: WritePath<ConversationMembership> + ?Sized,
    {
        self.add(writer, conversation, player, MembershipStatus::Invited)
    }

    /// Add `player` to `conversation` already walking over, as the
    /// conversation's initiator does.
    pub fn join_walking<W>(
        &mut self,
        writer: &mut W,
        conversation: ConversationId,
        player: PlayerId,
    ) -> Result<&ConversationMembership>
    where
        W: WritePath<ConversationMembership> + ?Sized,
    {
        self.add(writer, conversation, player, MembershipStatus::WalkingOver)
    }

    /// `invited -> walkingOver`.
    pub fn start_walking<W>(&mut self, writer: &mut W, id: MembershipId) -> Result<&ConversationMembership>
    where
        W: WritePath<ConversationMembership> + ?Sized,
    {
        self.table
            .update(writer, id, |m| m.status = MembershipStatus::WalkingOver)
    }

    /// `walkingOver -> participating`.
    pub fn start_participating<W>(
        &mut self,
        writer: &mut W,
        id: MembershipId,
        started: Timestamp,
    ) -> Result<&ConversationMembership>
    where
        W: WritePath<ConversationMembership> + ?Sized,
    {
        self.table
            .update(writer, id, |m| m.status = MembershipStatus::Participating { started })
    }

    /// Any non-terminal status `-> left`, carrying over the participation
    /// start if there was one.
    pub fn leave<W>(
        &mut self,
        writer: &mut W,
        id: MembershipId,
        ended: Timestamp,
        with_player: PlayerId,
    ) -> Result<&ConversationMembership>
    where
        W: WritePath<ConversationMembership> + ?Sized,
    {
        self.table.update(writer, id, |m| {
            m.status = MembershipStatus::Left {
                started: m.status.started(),
                ended,
                with_player,
            }
        })
    }

    /// Drop memberships that left during this tick.
    pub fn sweep(&mut self) -> usize {
        self.table.sweep()
    }

    fn add<W>(
        &mut self,
        writer: &mut W,
        conversation: ConversationId,
        player: PlayerId,
        status: MembershipStatus,
    ) -> Result<&ConversationMembership>
    where
        W: WritePath<ConversationMembership> + ?Sized,
    {
        let draft = ConversationMembership {
            id: MembershipId(0),
            conversation_id: conversation,
            player_id: player,
            status,
        };
        self.table.insert(writer, draft)
    }
}
