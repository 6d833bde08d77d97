//! Membership storage.
//!
//! Rows live in an in-memory index rebuilt on open from an append-only
//! commit log with one frame per committed transaction.

mod index;
mod log;

pub use index::MembershipIndex;
pub use log::{CommitFrame, LogOp, MembershipLog};
