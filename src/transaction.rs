//! Serialized write transactions.
//!
//! A [`Transaction`] holds the store's write lock for its whole lifetime, so
//! a simulation tick sees a stable committed state and no other writer can
//! interleave. Writes are staged in an overlay that every read through the
//! transaction observes immediately. [`Transaction::commit`] makes them
//! durable as one log frame and visible to other readers at once; dropping
//! the transaction discards them.

use crate::error::{Result, StoreError};
use crate::memberships::LogOp;
use crate::query::{self, MembershipReader};
use crate::store::MembershipStore;
use crate::table::WritePath;
use crate::types::{
    ConversationId, ConversationMembership, MembershipId, MembershipStatus, PlayerId, StatusKind,
};
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// A single-writer transaction over a [`MembershipStore`].
pub struct Transaction<'s> {
    store: &'s MembershipStore,

    _guard: MutexGuard<'s, ()>,

    /// Staged writes by ID; `None` marks a delete.
    overlay: BTreeMap<MembershipId, Option<ConversationMembership>>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s MembershipStore, guard: MutexGuard<'s, ()>) -> Self {
        Self {
            store,
            _guard: guard,
            overlay: BTreeMap::new(),
        }
    }

    /// Create a membership for `player` in `conversation`.
    ///
    /// New rows must start in a non-terminal status. Fails with
    /// [`StoreError::MembershipExists`] if the pair already has an active
    /// row, and with [`StoreError::PlayerAlreadyActive`] if the store
    /// enforces one active membership per player and `player` has one.
    pub fn insert(
        &mut self,
        conversation: ConversationId,
        player: PlayerId,
        status: MembershipStatus,
    ) -> Result<ConversationMembership> {
        if status.is_terminal() {
            return Err(StoreError::MalformedStatus(format!(
                "membership for player {} in conversation {} cannot be created as left",
                player, conversation
            )));
        }

        if self
            .memberships_for_pair(conversation, player)?
            .iter()
            .any(ConversationMembership::is_active)
        {
            return Err(StoreError::MembershipExists {
                conversation,
                player,
            });
        }

        if self.store.enforces_single_active() {
            if let Some(existing) = self.active_memberships_for_player(player)?.first() {
                return Err(StoreError::PlayerAlreadyActive {
                    player,
                    conversation: existing.conversation_id,
                });
            }
        }

        let row = ConversationMembership {
            id: self.store.next_membership_id(),
            conversation_id: conversation,
            player_id: player,
            status,
        };

        trace!(id = %row.id, %conversation, %player, kind = ?status.kind(), "staged insert");
        self.overlay.insert(row.id, Some(row.clone()));
        Ok(row)
    }

    /// Replace a row. Only the status may change, and only along a legal
    /// transition. Writing back an unchanged row is a no-op.
    pub fn replace(&mut self, row: ConversationMembership) -> Result<()> {
        let current = self
            .membership(row.id)?
            .ok_or(StoreError::MembershipNotFound(row.id))?;

        if current.conversation_id != row.conversation_id || current.player_id != row.player_id {
            return Err(StoreError::KeyChanged(row.id));
        }

        if current.status == row.status {
            return Ok(());
        }

        if !current.status.can_transition_to(&row.status) {
            return Err(StoreError::IllegalTransition {
                id: row.id,
                from: current.status.kind(),
                to: row.status.kind(),
            });
        }

        // `left.started` records the participation that actually happened.
        if row.status.is_terminal() && row.status.started() != current.status.started() {
            return Err(StoreError::MalformedStatus(format!(
                "membership {} left with started {:?}, but its participation started {:?}",
                row.id,
                row.status.started(),
                current.status.started()
            )));
        }

        row.validate_shape().map_err(StoreError::MalformedStatus)?;

        trace!(
            id = %row.id,
            from = ?current.status.kind(),
            to = ?row.status.kind(),
            "staged transition"
        );
        self.overlay.insert(row.id, Some(row));
        Ok(())
    }

    /// Move a row to `status`, returning the updated row.
    pub fn update_status(
        &mut self,
        id: MembershipId,
        status: MembershipStatus,
    ) -> Result<ConversationMembership> {
        let mut row = self
            .membership(id)?
            .ok_or(StoreError::MembershipNotFound(id))?;
        row.status = status;
        self.replace(row.clone())?;
        Ok(row)
    }

    /// Delete a row.
    pub fn delete(&mut self, id: MembershipId) -> Result<()> {
        if self.membership(id)?.is_none() {
            return Err(StoreError::MembershipNotFound(id));
        }

        trace!(%id, "staged delete");
        self.overlay.insert(id, None);
        Ok(())
    }

    /// Resolve a player's current membership, including staged writes.
    pub fn resolve_active_membership(
        &self,
        player: PlayerId,
    ) -> Result<Option<ConversationMembership>> {
        query::resolve_active_membership(self, player)
    }

    /// Number of rows with staged writes.
    pub fn pending_writes(&self) -> usize {
        self.overlay.len()
    }

    /// Commit staged writes. Returns the commit's tick sequence, or `None`
    /// if there was nothing to write.
    pub fn commit(self) -> Result<Option<u64>> {
        if self.overlay.is_empty() {
            return Ok(None);
        }

        let writes = self.overlay.len();
        let ops: Vec<LogOp> = self
            .overlay
            .into_iter()
            .map(|(id, row)| match row {
                Some(row) => LogOp::Put(row),
                None => LogOp::Delete(id),
            })
            .collect();

        let tick = self.store.apply_commit(ops)?;
        debug!(tick, writes, "committed membership transaction");
        Ok(Some(tick))
    }

    /// Discard staged writes.
    pub fn rollback(self) {
        if !self.overlay.is_empty() {
            debug!(writes = self.overlay.len(), "rolled back membership transaction");
        }
    }

    /// Committed rows from `base` with staged writes applied, restricted to
    /// staged rows matching `keep` and re-sorted by `order`.
    fn merged<K: Ord>(
        &self,
        base: Vec<ConversationMembership>,
        keep: impl Fn(&ConversationMembership) -> bool,
        order: impl Fn(&ConversationMembership) -> K,
    ) -> Vec<ConversationMembership> {
        if self.overlay.is_empty() {
            return base;
        }

        let mut rows: Vec<_> = base
            .into_iter()
            .filter(|row| !self.overlay.contains_key(&row.id))
            .collect();
        rows.extend(
            self.overlay
                .values()
                .flatten()
                .filter(|row| keep(*row))
                .cloned(),
        );
        rows.sort_by_key(|row| order(row));
        rows
    }
}

impl MembershipReader for Transaction<'_> {
    fn membership(&self, id: MembershipId) -> Result<Option<ConversationMembership>> {
        match self.overlay.get(&id) {
            Some(staged) => Ok(staged.clone()),
            None => self.store.committed().read().membership(id),
        }
    }

    fn memberships_for_pair(
        &self,
        conversation: ConversationId,
        player: PlayerId,
    ) -> Result<Vec<ConversationMembership>> {
        let base = self
            .store
            .committed()
            .read()
            .memberships_for_pair(conversation, player)?;
        Ok(self.merged(
            base,
            |row| row.conversation_id == conversation && row.player_id == player,
            |row| row.id,
        ))
    }

    fn memberships_in_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ConversationMembership>> {
        let base = self
            .store
            .committed()
            .read()
            .memberships_in_conversation(conversation)?;
        Ok(self.merged(
            base,
            |row| row.conversation_id == conversation,
            |row| (row.player_id, row.id),
        ))
    }

    fn memberships_by_kind(
        &self,
        player: PlayerId,
        kind: StatusKind,
    ) -> Result<Vec<ConversationMembership>> {
        let base = self
            .store
            .committed()
            .read()
            .memberships_by_kind(player, kind)?;
        Ok(self.merged(
            base,
            |row| row.player_id == player && row.status.kind() == kind,
            |row| (row.status.ended(), row.id),
        ))
    }

    fn active_memberships_for_player(&self, player: PlayerId) -> Result<Vec<ConversationMembership>> {
        let base = self
            .store
            .committed()
            .read()
            .active_memberships_for_player(player)?;
        Ok(self.merged(
            base,
            |row| row.player_id == player && row.is_active(),
            |row| (row.status.kind(), row.id),
        ))
    }

    fn left_with(&self, player: PlayerId, partner: PlayerId) -> Result<Vec<ConversationMembership>> {
        let base = self.store.committed().read().left_with(player, partner)?;
        Ok(self.merged(
            base,
            |row| row.player_id == player && row.status.with_player() == Some(partner),
            |row| (row.status.ended(), row.id),
        ))
    }
}

impl WritePath<ConversationMembership> for Transaction<'_> {
    /// Inserts through [`Transaction::insert`]; the row's ID is ignored and
    /// a fresh one assigned.
    fn insert_row(&mut self, row: ConversationMembership) -> Result<ConversationMembership> {
        self.insert(row.conversation_id, row.player_id, row.status)
    }

    fn replace_row(&mut self, row: &ConversationMembership) -> Result<()> {
        self.replace(row.clone())
    }

    fn delete_row(&mut self, id: MembershipId) -> Result<()> {
        self.delete(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::types::Timestamp;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> MembershipStore {
        MembershipStore::create(StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_staged_writes_visible_inside_only() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut tx = store.begin();
        let row = tx
            .insert(ConversationId(1), PlayerId(1), MembershipStatus::Invited)
            .unwrap();

        assert_eq!(tx.resolve_active_membership(PlayerId(1)).unwrap(), Some(row.clone()));
        assert!(store.membership(row.id).unwrap().is_none());
        assert_eq!(tx.pending_writes(), 1);

        tx.commit().unwrap();
        assert_eq!(store.membership(row.id).unwrap(), Some(row));
    }

    #[test]
    fn test_rollback_discards() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut tx = store.begin();
        tx.insert(ConversationId(1), PlayerId(1), MembershipStatus::Invited)
            .unwrap();
        tx.rollback();

        assert!(store.resolve_active_membership(PlayerId(1)).unwrap().is_none());
        assert_eq!(store.stats().commit_count, 0);
    }

    #[test]
    fn test_empty_commit_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        assert_eq!(store.begin().commit().unwrap(), None);
        assert_eq!(store.stats().commit_count, 0);
    }

    #[test]
    fn test_unchanged_replace_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut tx = store.begin();
        let row = tx
            .insert(ConversationId(1), PlayerId(1), MembershipStatus::Invited)
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        tx.replace(row).unwrap();
        assert_eq!(tx.pending_writes(), 0);
    }

    #[test]
    fn test_key_change_rejected() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut tx = store.begin();
        let mut row = tx
            .insert(ConversationId(1), PlayerId(1), MembershipStatus::Invited)
            .unwrap();
        row.conversation_id = ConversationId(2);
        row.status = MembershipStatus::WalkingOver;

        assert!(matches!(tx.replace(row), Err(StoreError::KeyChanged(_))));
    }

    #[test]
    fn test_overlay_orders_history_by_end() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut tx = store.begin();
        let first = tx
            .insert(ConversationId(1), PlayerId(1), MembershipStatus::Invited)
            .unwrap();
        tx.update_status(
            first.id,
            MembershipStatus::Left {
                started: None,
                ended: Timestamp(50),
                with_player: PlayerId(2),
            },
        )
        .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        let second = tx
            .insert(ConversationId(2), PlayerId(1), MembershipStatus::Invited)
            .unwrap();
        tx.update_status(
            second.id,
            MembershipStatus::Left {
                started: None,
                ended: Timestamp(10),
                with_player: PlayerId(2),
            },
        )
        .unwrap();

        let ended: Vec<_> = tx
            .left_with(PlayerId(1), PlayerId(2))
            .unwrap()
            .iter()
            .map(|m| m.status.ended().unwrap().0)
            .collect();
        assert_eq!(ended, vec![10, 50]);
    }
}
