//! Main store tying the log, the indexes and transactions together.

use crate::error::{Result, StoreError};
use crate::memberships::{CommitFrame, LogOp, MembershipIndex, MembershipLog};
use crate::query::{self, MembershipReader};
use crate::transaction::Transaction;
use crate::types::{
    ConversationId, ConversationMembership, MembershipId, PlayerId, StatusKind, StoreStats,
};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync the log after every commit.
    pub sync_every_commit: bool,

    /// Reject, at write time, any write that would give a player a second
    /// non-terminal membership. When disabled the store only detects such
    /// states at query time via [`query::resolve_active_membership`].
    pub enforce_single_active: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./members"),
            create_if_missing: true,
            sync_every_commit: true,
            enforce_single_active: true,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"CMS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Log file name inside the store directory.
const LOG_FILE: &str = "members.log";

/// The conversation membership store.
///
/// Reads go straight to the committed indexes. Writes go through a
/// [`Transaction`] obtained from [`MembershipStore::begin`]; only one
/// transaction can be open at a time and its writes become visible to other
/// readers all at once on commit.
pub struct MembershipStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Commit log.
    log: MembershipLog,

    /// Committed rows and their indexes.
    index: RwLock<MembershipIndex>,

    /// Next membership ID to assign.
    next_id: AtomicU64,

    /// Held by the open transaction.
    write_lock: Mutex<()>,
}

impl MembershipStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        Self::init(config)
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if !config.path.join("MANIFEST").exists() {
            return Err(StoreError::NotInitialized);
        }
        Self::verify_manifest(&config.path)?;
        Self::init(config)
    }

    fn init(config: StoreConfig) -> Result<Self> {
        let lock_file = Self::acquire_lock(&config.path)?;

        let (log, frames) =
            MembershipLog::open(config.path.join(LOG_FILE), config.sync_every_commit)?;
        let (index, max_id) = Self::replay(&frames);

        debug!(
            path = %config.path.display(),
            frames = frames.len(),
            memberships = index.count(),
            "opened membership store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index: RwLock::new(index),
            next_id: AtomicU64::new(max_id + 1),
            write_lock: Mutex::new(()),
        })
    }

    /// Rebuild the indexes from the log. Also returns the highest ID ever
    /// written so deleted IDs are not handed out again.
    fn replay(frames: &[CommitFrame]) -> (MembershipIndex, u64) {
        let mut index = MembershipIndex::new();
        let mut max_id = 0u64;

        for frame in frames {
            for op in &frame.ops {
                match op {
                    LogOp::Put(row) => {
                        max_id = max_id.max(row.id.0);
                        index.put(row.clone());
                    }
                    LogOp::Delete(id) => {
                        max_id = max_id.max(id.0);
                        index.remove(*id);
                    }
                }
            }
        }

        (index, max_id)
    }

    // --- Transactions ---

    /// Begin a transaction.
    ///
    /// Blocks while another transaction is open.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self, self.write_lock.lock())
    }

    /// Write a transaction's ops to the log, then apply them to the indexes
    /// under a single write lock. Returns the commit's tick sequence.
    pub(crate) fn apply_commit(&self, ops: Vec<LogOp>) -> Result<u64> {
        let tick = self.log.append(&ops)?;

        let mut index = self.index.write();
        for op in ops {
            match op {
                LogOp::Put(row) => index.put(row),
                LogOp::Delete(id) => {
                    index.remove(id);
                }
            }
        }

        Ok(tick)
    }

    pub(crate) fn next_membership_id(&self) -> MembershipId {
        MembershipId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn enforces_single_active(&self) -> bool {
        self.config.enforce_single_active
    }

    pub(crate) fn committed(&self) -> &RwLock<MembershipIndex> {
        &self.index
    }

    // --- Reads ---

    /// Run several reads against one consistent view of the committed rows.
    pub fn read<T>(&self, f: impl FnOnce(&MembershipIndex) -> T) -> T {
        f(&self.index.read())
    }

    /// Resolve a player's current membership from committed state.
    pub fn resolve_active_membership(
        &self,
        player: PlayerId,
    ) -> Result<Option<ConversationMembership>> {
        self.read(|index| query::resolve_active_membership(index, player))
    }

    // --- Store Operations ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        let membership_count = index.count() as u64;
        let active_count = index.active_count() as u64;

        StoreStats {
            membership_count,
            active_count,
            left_count: membership_count - active_count,
            commit_count: self.log.frame_count(),
            log_size_bytes: self.log.size(),
        }
    }

    /// Rewrite the log as a single frame holding the current rows.
    ///
    /// Waits for any open transaction, so it must not be called while the
    /// calling thread holds one.
    pub fn compact(&self) -> Result<()> {
        let _lock = self.write_lock.lock();

        let mut rows: Vec<_> = self.index.read().iter().cloned().collect();
        rows.sort_by_key(|row| row.id);
        let count = rows.len();

        let ops: Vec<_> = rows.into_iter().map(LogOp::Put).collect();
        let before = self.log.size();
        self.log.rewrite(&ops)?;

        debug!(
            memberships = count,
            bytes_before = before,
            bytes_after = self.log.size(),
            "compacted membership log"
        );
        Ok(())
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl MembershipReader for MembershipStore {
    fn membership(&self, id: MembershipId) -> Result<Option<ConversationMembership>> {
        self.index.read().membership(id)
    }

    fn memberships_for_pair(
        &self,
        conversation: ConversationId,
        player: PlayerId,
    ) -> Result<Vec<ConversationMembership>> {
        self.index.read().memberships_for_pair(conversation, player)
    }

    fn memberships_in_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ConversationMembership>> {
        self.index.read().memberships_in_conversation(conversation)
    }

    fn memberships_by_kind(
        &self,
        player: PlayerId,
        kind: StatusKind,
    ) -> Result<Vec<ConversationMembership>> {
        self.index.read().memberships_by_kind(player, kind)
    }

    fn active_memberships_for_player(&self, player: PlayerId) -> Result<Vec<ConversationMembership>> {
        self.index.read().active_memberships_for_player(player)
    }

    fn left_with(&self, player: PlayerId, partner: PlayerId) -> Result<Vec<ConversationMembership>> {
        self.index.read().left_with(player, partner)
    }
}

impl Drop for MembershipStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MembershipStatus, Timestamp};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = MembershipStore::create(test_config(&dir)).unwrap();

        assert!(store.path().join("MANIFEST").exists());
        assert!(store.path().join(LOG_FILE).exists());
        assert_eq!(store.stats().membership_count, 0);
    }

    #[test]
    fn test_open_missing_store() {
        let dir = TempDir::new().unwrap();
        let result = MembershipStore::open(test_config(&dir));
        assert!(matches!(result, Err(StoreError::NotInitialized)));

        let result = MembershipStore::open_or_create(StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        });
        assert!(matches!(result, Err(StoreError::NotInitialized)));
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let _store = MembershipStore::create(test_config(&dir)).unwrap();

        let result = MembershipStore::open(test_config(&dir));
        assert!(matches!(result, Err(StoreError::Locked)));
    }

    #[test]
    fn test_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        fs::create_dir_all(&config.path).unwrap();
        fs::write(config.path.join("MANIFEST"), b"NOPE\x01").unwrap();

        let result = MembershipStore::open(config);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        let id = {
            let store = MembershipStore::create(test_config(&dir)).unwrap();
            let mut tx = store.begin();
            let row = tx
                .insert(ConversationId(1), PlayerId(1), MembershipStatus::Invited)
                .unwrap();
            tx.commit().unwrap();
            row.id
        };

        let store = MembershipStore::open(test_config(&dir)).unwrap();
        let row = store.membership(id).unwrap().unwrap();
        assert_eq!(row.status, MembershipStatus::Invited);

        // IDs keep increasing across reopen.
        let mut tx = store.begin();
        let next = tx
            .insert(ConversationId(1), PlayerId(2), MembershipStatus::Invited)
            .unwrap();
        assert!(next.id > id);
    }

    #[test]
    fn test_stats_and_compaction() {
        let dir = TempDir::new().unwrap();
        let store = MembershipStore::create(test_config(&dir)).unwrap();

        let mut tx = store.begin();
        let row = tx
            .insert(ConversationId(1), PlayerId(1), MembershipStatus::Invited)
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        tx.update_status(
            row.id,
            MembershipStatus::Left {
                started: None,
                ended: Timestamp(5),
                with_player: PlayerId(2),
            },
        )
        .unwrap();
        tx.insert(ConversationId(2), PlayerId(1), MembershipStatus::Invited)
            .unwrap();
        tx.commit().unwrap();

        let stats = store.stats();
        assert_eq!(stats.membership_count, 2);
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.left_count, 1);
        assert_eq!(stats.commit_count, 2);

        store.compact().unwrap();
        let compacted = store.stats();
        assert_eq!(compacted.commit_count, 1);
        assert_eq!(compacted.membership_count, 2);

        drop(store);
        let store = MembershipStore::open(test_config(&dir)).unwrap();
        assert_eq!(store.stats().membership_count, 2);
        assert!(store.resolve_active_membership(PlayerId(1)).unwrap().is_some());
    }
}
