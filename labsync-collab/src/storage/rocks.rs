//! RocksDB-backed `SessionStore`.
//!
//! Column families:
//! - `sessions`: Session rows keyed by session_id (16 bytes)
//! - `members`:  Member rows keyed by `<session_id:16><user_id:16>`
//! - `actions`:  Action records keyed by `<session_id:16><sequence:8 BE>`
//!
//! Every value is JSON compressed with LZ4. Multi-row mutations (join,
//! leave, undo) are one atomic `WriteBatch`.
//!
//! Reference: Kleppmann - DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, SliceTransform, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use labsync_core::{ActionId, CollaborativeAction, Member, Session, SessionId, UserId};

use super::{decode_value, encode_value, SessionStore, StoreError};

const CF_SESSIONS: &str = "sessions";
const CF_MEMBERS: &str = "members";
const CF_ACTIONS: &str = "actions";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSIONS, CF_MEMBERS, CF_ACTIONS];

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("labsync_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl RocksConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub struct RocksStore {
    /// Single-threaded column family mode; the hub serializes access per session
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened session store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &RocksConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SESSIONS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_MEMBERS | CF_ACTIONS => {
                // Prefix-scanned by session_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// `<session_id:16><user_id:16>`
    fn member_key(session_id: SessionId, user_id: UserId) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(session_id.as_bytes());
        key.extend_from_slice(user_id.as_bytes());
        key
    }

    /// `<session_id:16><sequence:8 BE>` so keys sort by sequence.
    fn action_key(session_id: SessionId, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(session_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn put_session(&self, batch: &mut WriteBatch, session: &Session) -> Result<(), StoreError> {
        batch.put_cf(self.cf(CF_SESSIONS)?, session.id.as_bytes(), encode_value(session)?);
        Ok(())
    }

    fn put_member(&self, batch: &mut WriteBatch, member: &Member) -> Result<(), StoreError> {
        batch.put_cf(
            self.cf(CF_MEMBERS)?,
            Self::member_key(member.session_id, member.user_id),
            encode_value(member)?,
        );
        Ok(())
    }

    fn put_action(
        &self,
        batch: &mut WriteBatch,
        action: &CollaborativeAction,
    ) -> Result<(), StoreError> {
        batch.put_cf(
            self.cf(CF_ACTIONS)?,
            Self::action_key(action.session_id, action.sequence),
            encode_value(action)?,
        );
        Ok(())
    }

    fn action_exists(&self, action: &CollaborativeAction) -> Result<bool, StoreError> {
        let key = Self::action_key(action.session_id, action.sequence);
        Ok(self.db.get_cf(self.cf(CF_ACTIONS)?, key)?.is_some())
    }

    /// Visit every value under `prefix` in key order until `f` returns false.
    fn scan_prefix(
        &self,
        cf_name: &str,
        prefix: &[u8],
        start: &[u8],
        mut f: impl FnMut(&[u8], &[u8]) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let iter = self.db.iterator_cf(cf, IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !f(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

impl SessionStore for RocksStore {
    fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        self.put_session(&mut batch, session)?;
        self.write(batch)
    }

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        match self.db.get_cf(self.cf(CF_SESSIONS)?, session_id.as_bytes())? {
            Some(bytes) => decode_value(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            sessions.push(decode_value::<Session>(&value)?);
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn upsert_member(&self, member: &Member) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        self.put_member(&mut batch, member)?;
        self.write(batch)
    }

    fn remove_member(&self, session_id: SessionId, user_id: UserId) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_MEMBERS)?, Self::member_key(session_id, user_id));
        self.write(batch)
    }

    fn load_members(&self, session_id: SessionId) -> Result<Vec<Member>, StoreError> {
        let prefix = session_id.as_bytes();
        let mut members = Vec::new();
        self.scan_prefix(CF_MEMBERS, prefix, prefix, |_, value| {
            members.push(decode_value::<Member>(value)?);
            Ok(true)
        })?;
        // Keys sort by user id; callers expect join order.
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    fn insert_action(&self, action: &CollaborativeAction) -> Result<(), StoreError> {
        if self.action_exists(action)? {
            return Err(StoreError::DatabaseError(format!(
                "duplicate sequence {} in session {}",
                action.sequence, action.session_id
            )));
        }
        let mut batch = WriteBatch::default();
        self.put_action(&mut batch, action)?;
        self.write(batch)
    }

    fn update_action(&self, action: &CollaborativeAction) -> Result<(), StoreError> {
        if !self.action_exists(action)? {
            return Err(StoreError::DatabaseError(format!(
                "no action at sequence {}",
                action.sequence
            )));
        }
        let mut batch = WriteBatch::default();
        self.put_action(&mut batch, action)?;
        self.write(batch)
    }

    fn load_actions_since(
        &self,
        session_id: SessionId,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<CollaborativeAction>, StoreError> {
        let start = Self::action_key(session_id, after_seq.saturating_add(1));
        let mut actions = Vec::new();
        if limit == 0 {
            return Ok(actions);
        }
        self.scan_prefix(CF_ACTIONS, session_id.as_bytes(), &start, |_, value| {
            actions.push(decode_value::<CollaborativeAction>(value)?);
            Ok(actions.len() < limit)
        })?;
        Ok(actions)
    }

    fn load_action(
        &self,
        session_id: SessionId,
        action_id: ActionId,
    ) -> Result<Option<CollaborativeAction>, StoreError> {
        let prefix = session_id.as_bytes();
        let mut found = None;
        self.scan_prefix(CF_ACTIONS, prefix, prefix, |_, value| {
            let action = decode_value::<CollaborativeAction>(value)?;
            if action.id == action_id {
                found = Some(action);
                return Ok(false);
            }
            Ok(true)
        })?;
        Ok(found)
    }

    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_ACTIONS)?;
        let end = Self::action_key(session_id, u64::MAX);
        let mut iter = self.db.iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() == 24 && key.starts_with(session_id.as_bytes()) {
                    let mut seq = [0u8; 8];
                    seq.copy_from_slice(&key[16..24]);
                    Ok(u64::from_be_bytes(seq))
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    fn upsert_members(&self, members: &[Member]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for member in members {
            self.put_member(&mut batch, member)?;
        }
        self.write(batch)
    }

    fn record_join(&self, session: &Session, member: &Member) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        self.put_member(&mut batch, member)?;
        self.put_session(&mut batch, session)?;
        self.write(batch)
    }

    fn record_leave(
        &self,
        session: &Session,
        user_id: UserId,
        updated: &[Member],
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_MEMBERS)?, Self::member_key(session.id, user_id));
        for member in updated {
            self.put_member(&mut batch, member)?;
        }
        self.put_session(&mut batch, session)?;
        self.write(batch)
    }

    fn record_undo(
        &self,
        reverted: &CollaborativeAction,
        undo: &CollaborativeAction,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        self.put_action(&mut batch, reverted)?;
        self.put_action(&mut batch, undo)?;
        self.write(batch)
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use labsync_core::{ActionKind, DisplayProfile, Role, SessionConfig, VectorClock};
    use uuid::Uuid;

    fn open(dir: &tempfile::TempDir) -> RocksStore {
        RocksStore::open(RocksConfig::for_testing(dir.path())).unwrap()
    }

    fn session() -> Session {
        Session::from_config(
            Uuid::new_v4(),
            SessionConfig::new(Uuid::new_v4(), "Electrochemistry", 8),
            Uuid::new_v4(),
            100,
        )
        .unwrap()
    }

    fn action(session_id: SessionId, sequence: u64) -> CollaborativeAction {
        let user = Uuid::new_v4();
        let mut clock = VectorClock::new();
        clock.increment(user);
        CollaborativeAction {
            id: Uuid::new_v4(),
            session_id,
            user_id: user,
            sequence,
            timestamp: 1_000 + sequence,
            kind: ActionKind::Measurement {
                instrument: "voltmeter".into(),
                value: sequence as f64 * 0.5,
                unit: "V".into(),
            },
            requires_approval: sequence % 2 == 0,
            approved_by: None,
            reverted_at: None,
            vector_clock: clock,
        }
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_session_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let mut s = session();
        s.set_data("electrode", serde_json::json!("Pt"), 200);
        store.save_session(&s).unwrap();

        assert_eq!(store.load_session(s.id).unwrap(), Some(s));
        assert_eq!(store.load_session(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_members_isolated_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let (a, b) = (session(), session());
        for (i, sid) in [a.id, a.id, b.id].iter().enumerate() {
            let m = Member::new(*sid, Uuid::new_v4(), Role::Member, DisplayProfile::named("m"), i as u64);
            store.upsert_member(&m).unwrap();
        }
        let members_a = store.load_members(a.id).unwrap();
        assert_eq!(members_a.len(), 2);
        assert!(members_a[0].joined_at < members_a[1].joined_at);
        assert_eq!(store.load_members(b.id).unwrap().len(), 1);

        store.remove_member(a.id, members_a[0].user_id).unwrap();
        assert_eq!(store.load_members(a.id).unwrap().len(), 1);
    }

    #[test]
    fn test_actions_ordered_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let sid = Uuid::new_v4();
        // Insert out of order; 256 > 255 checks big-endian key ordering.
        for seq in [3u64, 1, 256, 2, 255] {
            store.insert_action(&action(sid, seq)).unwrap();
        }
        store.insert_action(&action(Uuid::new_v4(), 4)).unwrap();

        let all = store.load_actions_since(sid, 0, usize::MAX).unwrap();
        let seqs: Vec<u64> = all.iter().map(|a| a.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 255, 256]);

        let page = store.load_actions_since(sid, 2, 2).unwrap();
        assert_eq!(page.iter().map(|a| a.sequence).collect::<Vec<_>>(), vec![3, 255]);

        assert_eq!(store.last_sequence(sid).unwrap(), 256);
        assert_eq!(store.last_sequence(Uuid::new_v4()).unwrap(), 0);
        assert!(store.insert_action(&action(sid, 3)).is_err());
    }

    #[test]
    fn test_undo_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let sid = Uuid::new_v4();
        let target = action(sid, 1);
        store.insert_action(&target).unwrap();

        let mut reverted = target.clone();
        reverted.reverted_at = Some(5_000);
        let mut undo = action(sid, 2);
        undo.kind = ActionKind::Undo { target: target.id };
        store.record_undo(&reverted, &undo).unwrap();

        let loaded = store.load_action(sid, target.id).unwrap().unwrap();
        assert_eq!(loaded.reverted_at, Some(5_000));
        let tail = store.load_actions_since(sid, 1, 10).unwrap();
        assert_eq!(tail[0].kind, ActionKind::Undo { target: target.id });
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let s = session();
        let a = action(s.id, 1);
        {
            let store = open(&dir);
            store.save_session(&s).unwrap();
            store.insert_action(&a).unwrap();
            store.sync().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.load_session(s.id).unwrap(), Some(s.clone()));
        assert_eq!(store.load_action(s.id, a.id).unwrap(), Some(a));
    }
}
