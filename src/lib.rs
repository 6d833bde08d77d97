//! # Conversation Members
//!
//! Bookkeeping for which players are in which conversations, and in what
//! phase, inside a tick-based multiplayer simulation.
//!
//! ## Core Concepts
//!
//! - **Memberships**: one row per (conversation, player), moving through
//!   `invited -> walkingOver -> participating -> left`
//! - **Indexes**: by conversation, by player and state, and by player,
//!   state and partner, all kept in step on every write
//! - **Transactions**: one writer per tick; a tick's writes commit as a unit
//! - **Working sets**: the active memberships of the known conversations,
//!   loaded once per tick
//!
//! A player has at most one non-terminal membership across all
//! conversations. [`resolve_active_membership`] reports a breach of that as
//! [`StoreError::InvariantViolation`], and with
//! [`StoreConfig::enforce_single_active`] set the store also refuses the
//! write that would cause one.
//!
//! ## Example
//!
//! ```ignore
//! use conversation_members::{
//!     ConversationId, ConversationMembers, MembershipStore, PlayerId, StoreConfig, Timestamp,
//! };
//!
//! let store = MembershipStore::open_or_create(StoreConfig {
//!     path: "./members".into(),
//!     ..Default::default()
//! })?;
//!
//! let mut tx = store.begin();
//! let mut members = ConversationMembers::load(&tx, [ConversationId(1)])?;
//! let id = members.invite(&mut tx, ConversationId(1), PlayerId(7))?.id;
//! members.start_walking(&mut tx, id)?;
//! tx.commit()?;
//!
//! assert!(store.resolve_active_membership(PlayerId(7))?.is_some());
//! ```

pub mod conversation_members;
pub mod error;
pub mod memberships;
pub mod query;
pub mod store;
pub mod table;
pub mod transaction;
pub mod types;

// Re-exports
pub use conversation_members::{load_active_memberships, ConversationMembers};
pub use error::{Result, StoreError};
pub use memberships::{CommitFrame, LogOp, MembershipIndex, MembershipLog};
pub use query::{
    conversation_history, last_conversation_with, resolve_active_membership, MembershipReader,
};
pub use store::{MembershipStore, StoreConfig};
pub use table::{GameTable, TableRow, WritePath};
pub use transaction::Transaction;
pub use types::*;
