// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

//! The durable-log contract between the core and the host, plus the
//! in-memory reference implementation the tests run against.

use std::cmp;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{Error, Result, StorageError};
use crate::raftpb::*;
use crate::util;

/// What a restarting node recovers from its storage: the persisted term,
/// vote and commit index, and the membership as of the last snapshot.
#[derive(Debug, Clone, Default)]
pub struct RaftState {
    /// The persisted term, vote and commit index.
    pub hard_state: HardState,

    /// The membership as of the last applied snapshot.
    pub conf_state: ConfState,
}

impl RaftState {
    /// Create a new RaftState.
    pub fn new(hard_state: HardState, conf_state: ConfState) -> RaftState {
        RaftState {
            hard_state,
            conf_state,
        }
    }

    /// Whether this storage has ever held a configuration.
    pub fn initialized(&self) -> bool {
        self.conf_state != ConfState::default()
    }
}

/// The core's read-only view of the durable log. The core never writes
/// through this trait: the host persists `Ready.entries` and snapshots on
/// its own before calling `advance`.
///
/// Any error out of these methods leaves the raft inoperable; recovery is
/// the host's problem.
pub trait Storage {
    /// Called once at construction to recover the persisted state.
    fn initial_state(&self) -> Result<RaftState>;

    /// The entries in `[low, high)`, within `max_size` bytes in total. A
    /// non-empty result always holds at least one entry regardless of the
    /// cap. Fails with `Compacted` when `low` has been compacted away and
    /// `Unavailable` when `high` lies past the end.
    fn entries(&self, low: u64, high: u64, max_size: impl Into<Option<u64>>) -> Result<Vec<Entry>>;

    /// The term of the entry at `idx`. Valid from `first_index() - 1` (whose
    /// term survives compaction for matching) through `last_index()`.
    fn term(&self, idx: u64) -> Result<u64>;

    /// The first index still present, which is one past the last snapshot.
    fn first_index(&self) -> Result<u64>;

    /// The last index present, or the snapshot index when no entries follow
    /// it.
    fn last_index(&self) -> Result<u64>;

    /// The most recent snapshot. A storage that is still building one
    /// returns `SnapshotTemporarilyUnavailable` and the core will come back
    /// later.
    fn snapshot(&self) -> Result<Snapshot>;
}

/// The inner state of a [`MemStorage`], reached through its `rl`/`wl`
/// guards.
#[derive(Default)]
pub struct MemStorageCore {
    raft_state: RaftState,
    // entries[i] has raft log position i + snapshot_metadata.index + 1
    entries: Vec<Entry>,
    // metadata of the last applied snapshot
    snapshot_metadata: SnapshotMetadata,
    // fail the next snapshot() call, for the retry path
    trigger_snap_unavailable: bool,
}

impl MemStorageCore {
    /// Saves the current HardState.
    pub fn set_hardstate(&mut self, hs: HardState) {
        self.raft_state.hard_state = hs;
    }

    /// Get the hard state.
    pub fn hard_state(&self) -> &HardState {
        &self.raft_state.hard_state
    }

    /// Get the mut hard state.
    pub fn mut_hard_state(&mut self) -> &mut HardState {
        &mut self.raft_state.hard_state
    }

    /// Records that everything through `index` is committed and applied, so
    /// a snapshot may be cut there.
    ///
    /// # Panics
    ///
    /// Panics if the log holds no entry at `index`.
    pub fn commit_to(&mut self, index: u64) -> Result<()> {
        assert!(
            self.has_entry_at(index),
            "commit_to {} but the entry does not exist",
            index
        );

        let diff = (index - self.entries[0].index) as usize;
        self.raft_state.hard_state.commit = index;
        self.raft_state.hard_state.term = self.entries[diff].term;
        Ok(())
    }

    #[inline]
    fn has_entry_at(&self, index: u64) -> bool {
        !self.entries.is_empty() && index >= self.first_index() && index <= self.last_index()
    }

    /// Saves the current conf state.
    pub fn set_conf_state(&mut self, cs: ConfState) {
        self.raft_state.conf_state = cs;
    }

    #[inline]
    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(e) => e.index,
            None => self.snapshot_metadata.index + 1,
        }
    }

    #[inline]
    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(e) => e.index,
            None => self.snapshot_metadata.index,
        }
    }

    /// Replaces the log with an incoming snapshot.
    pub fn apply_snapshot(&mut self, mut snapshot: Snapshot) -> Result<()> {
        let mut meta = snapshot.take_metadata();
        let index = meta.index;

        if self.first_index() > index {
            return Err(Error::Store(StorageError::SnapshotOutOfDate));
        }

        self.snapshot_metadata = meta.clone();

        self.raft_state.hard_state.term = cmp::max(self.raft_state.hard_state.term, meta.term);
        self.raft_state.hard_state.commit = index;
        self.entries.clear();

        self.raft_state.conf_state = meta.take_conf_state();
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();

        // The commit watermark doubles as the applied index here, since this
        // storage holds no state machine of its own.
        let meta = snapshot.mut_metadata();
        meta.index = self.raft_state.hard_state.commit;
        meta.term = match meta.index.cmp(&self.snapshot_metadata.index) {
            cmp::Ordering::Equal => self.snapshot_metadata.term,
            cmp::Ordering::Greater => {
                let offset = self.entries[0].index;
                self.entries[(meta.index - offset) as usize].term
            }
            cmp::Ordering::Less => {
                panic!(
                    "commit {} < snapshot_metadata.index {}",
                    meta.index, self.snapshot_metadata.index
                );
            }
        };

        meta.conf_state = Some(self.raft_state.conf_state.clone());
        snapshot
    }

    /// Discards the entries before `compact_index`. Compacting past the
    /// applied index is the host's mistake to avoid.
    ///
    /// # Panics
    ///
    /// Panics when `compact_index` lies past `last_index() + 1`.
    pub fn compact(&mut self, compact_index: u64) -> Result<()> {
        if compact_index <= self.first_index() {
            // already gone
            return Ok(());
        }

        if compact_index > self.last_index() + 1 {
            panic!(
                "compact not received raft logs: {}, last index: {}",
                compact_index,
                self.last_index()
            );
        }

        if let Some(entry) = self.entries.first() {
            let offset = compact_index - entry.index;
            self.entries.drain(..offset as usize);
        }
        Ok(())
    }

    /// Appends entries, overwriting any overlapping suffix.
    ///
    /// # Panics
    ///
    /// Panics when the entries would rewrite compacted positions or leave a
    /// gap after the current end.
    pub fn append(&mut self, ents: &[Entry]) -> Result<()> {
        if ents.is_empty() {
            return Ok(());
        }

        if self.first_index() > ents[0].index {
            panic!(
                "overwrite compacted raft logs, compacted: {}, append: {}",
                self.first_index() - 1,
                ents[0].index,
            );
        }

        if self.last_index() + 1 < ents[0].index {
            panic!(
                "raft logs should be continuous, last index: {}, new appended: {}",
                self.last_index(),
                ents[0].index,
            );
        }

        let diff = ents[0].index - self.first_index();
        self.entries.drain(diff as usize..);
        self.entries.extend_from_slice(ents);
        Ok(())
    }

    /// Commit to `idx` and update the configuration in one step. Only used
    /// by tests preparing a snapshot.
    pub fn commit_to_and_set_conf_states(&mut self, idx: u64, cs: Option<ConfState>) -> Result<()> {
        self.commit_to(idx)?;
        if let Some(cs) = cs {
            self.raft_state.conf_state = cs;
        }
        Ok(())
    }

    /// Makes the next `snapshot()` call fail with
    /// `SnapshotTemporarilyUnavailable`.
    pub fn trigger_snap_unavailable(&mut self) {
        self.trigger_snap_unavailable = true;
    }
}

/// A thread-safe in-memory [`Storage`]. It holds raft state only; the
/// snapshots it produces carry no state-machine data, which is why it stays
/// a test fixture rather than a real storage.
#[derive(Clone, Default)]
pub struct MemStorage {
    core: Arc<RwLock<MemStorageCore>>,
}

impl MemStorage {
    /// Returns an empty memory storage.
    pub fn new() -> MemStorage {
        MemStorage {
            ..Default::default()
        }
    }

    /// Returns a storage holding the given initial membership. Every node
    /// of a group must be initialized with the same input.
    pub fn new_with_conf_state<T>(conf_state: T) -> MemStorage
    where
        ConfState: From<T>,
    {
        let store = MemStorage::new();
        store.initialize_with_conf_state(conf_state);
        store
    }

    /// Writes the initial membership into a fresh storage.
    ///
    /// # Panics
    ///
    /// Panics when the storage was already initialized.
    pub fn initialize_with_conf_state<T>(&self, conf_state: T)
    where
        ConfState: From<T>,
    {
        assert!(!self.initial_state().unwrap().initialized());
        let mut core = self.wl();
        core.raft_state.conf_state = ConfState::from(conf_state);
    }

    /// Takes the read lock on the inner state.
    pub fn rl(&self) -> RwLockReadGuard<'_, MemStorageCore> {
        self.core.read().unwrap()
    }

    /// Takes the write lock on the inner state.
    pub fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.core.write().unwrap()
    }
}

impl Storage for MemStorage {
    /// Implements the Storage trait.
    fn initial_state(&self) -> Result<RaftState> {
        Ok(self.rl().raft_state.clone())
    }

    /// Implements the Storage trait.
    fn entries(&self, low: u64, high: u64, max_size: impl Into<Option<u64>>) -> Result<Vec<Entry>> {
        let max_size = max_size.into();
        let core = self.rl();
        if low < core.first_index() {
            return Err(Error::Store(StorageError::Compacted));
        }

        if high > core.last_index() + 1 {
            return Err(Error::Store(StorageError::Unavailable));
        }

        if low == high || core.entries.is_empty() {
            return Ok(vec![]);
        }

        let offset = core.entries[0].index;
        let lo = (low - offset) as usize;
        let hi = (high - offset) as usize;
        let mut ents = core.entries[lo..hi].to_vec();
        util::limit_size(&mut ents, max_size);
        Ok(ents)
    }

    /// Implements the Storage trait.
    fn term(&self, idx: u64) -> Result<u64> {
        let core = self.rl();
        if idx == core.snapshot_metadata.index {
            return Ok(core.snapshot_metadata.term);
        }

        let offset = core.first_index();
        if idx < offset {
            return Err(Error::Store(StorageError::Compacted));
        }

        if idx > core.last_index() {
            return Err(Error::Store(StorageError::Unavailable));
        }
        Ok(core.entries[(idx - offset) as usize].term)
    }

    /// Implements the Storage trait.
    fn first_index(&self) -> Result<u64> {
        Ok(self.rl().first_index())
    }

    /// Implements the Storage trait.
    fn last_index(&self) -> Result<u64> {
        Ok(self.rl().last_index())
    }

    /// Implements the Storage trait.
    fn snapshot(&self) -> Result<Snapshot> {
        let mut core = self.wl();
        if core.trigger_snap_unavailable {
            core.trigger_snap_unavailable = false;
            Err(Error::Store(StorageError::SnapshotTemporarilyUnavailable))
        } else {
            Ok(core.snapshot())
        }
    }
}
