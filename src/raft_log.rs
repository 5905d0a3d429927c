// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

use std::cmp;

use crate::errors::{Error, Result, StorageError};
use crate::log_unstable::Unstable;
use crate::raftpb::{Entry, Snapshot};
use crate::storage::Storage;
use crate::util;

use slog::Logger;

pub use crate::util::NO_LIMIT;

/// One log out of two halves: the durable prefix in `store` and the
/// in-memory tail in `unstable`, with the `committed` and `applied`
/// watermarks riding on top.
pub struct RaftLog<T: Storage> {
    /// The durable log, written by the host.
    pub store: T,

    /// The tail not yet handed to the host for persistence, possibly
    /// overlapping `store` while a truncation is pending.
    pub unstable: Unstable,

    /// The highest position known to be replicated on a quorum.
    pub committed: u64,

    /// The highest position the host has been told to apply.
    ///
    /// Invariant: applied <= committed
    pub applied: u64,

    /// Byte cap on the committed entries returned by a single
    /// `next_entries` call.
    pub max_next_ents_size: u64,
}

impl<T> ToString for RaftLog<T>
where
    T: Storage,
{
    fn to_string(&self) -> String {
        format!(
            "committed={}, applied={}, unstable.offset={}, unstable.entries.len()={}",
            self.committed,
            self.applied,
            self.unstable.offset,
            self.unstable.entries.len()
        )
    }
}

impl<T: Storage> RaftLog<T> {
    /// Creates a log over the given storage, with both watermarks at the
    /// storage's first index minus one.
    pub fn new(store: T, logger: Logger) -> RaftLog<T> {
        let first_index = store.first_index().unwrap();
        let last_index = store.last_index().unwrap();

        RaftLog {
            store,
            committed: first_index - 1,
            applied: first_index - 1,
            unstable: Unstable::new(last_index + 1, logger),
            max_next_ents_size: NO_LIMIT,
        }
    }

    /// The term of the last entry.
    ///
    /// # Panics
    ///
    /// Panics when the last entry's term is unavailable, which would mean
    /// the log compacted past its own end.
    pub fn last_term(&self) -> u64 {
        match self.term(self.last_index()) {
            Ok(t) => t,
            Err(e) => fatal!(
                self.unstable.logger,
                "unexpected error when getting the last term: {:?}",
                e
            ),
        }
    }

    /// Grab a read-only reference to the underlying storage.
    #[inline]
    pub fn store(&self) -> &T {
        &self.store
    }

    /// Grab a mutable reference to the underlying storage.
    #[inline]
    pub fn mut_store(&mut self) -> &mut T {
        &mut self.store
    }

    /// The term of the entry at `idx`, answered from the unstable tail first
    /// and the storage second. Indexes outside the known range answer with
    /// term 0; storage errors inside it propagate to the caller.
    pub fn term(&self, idx: u64) -> Result<u64> {
        // the valid range starts at the dummy position before first_index,
        // whose term the storage keeps for matching
        let dummy_idx = self.first_index() - 1;
        if idx < dummy_idx || idx > self.last_index() {
            return Ok(0u64);
        }

        match self.unstable.maybe_term(idx) {
            Some(term) => Ok(term),
            _ => self.store.term(idx).map_err(|e| {
                match e {
                    Error::Store(StorageError::Compacted)
                    | Error::Store(StorageError::Unavailable) => {}
                    _ => fatal!(self.unstable.logger, "unexpected error: {:?}", e),
                }
                e
            }),
        }
    }

    /// The first index available through this log.
    pub fn first_index(&self) -> u64 {
        match self.unstable.maybe_first_index() {
            Some(idx) => idx,
            None => self.store.first_index().unwrap(),
        }
    }

    /// The last index available through this log.
    pub fn last_index(&self) -> u64 {
        match self.unstable.maybe_last_index() {
            Some(idx) => idx,
            None => self.store.last_index().unwrap(),
        }
    }

    /// Compares the given entries against our log. Returns 0 when every one
    /// is already present unchanged; otherwise the index of the first entry
    /// that differs in term or lies past our end. The entries must be
    /// contiguous and start inside our range.
    pub fn find_conflict(&self, ents: &[Entry]) -> u64 {
        for e in ents {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    info!(
                        self.unstable.logger,
                        "found conflict at index {index}",
                        index = e.index;
                        "existing term" => self.term(e.index).unwrap_or(0),
                        "conflicting term" => e.term,
                    );
                }
                return e.index;
            }
        }
        0
    }

    /// Whether our entry at `idx` carries the given term.
    pub fn match_term(&self, idx: u64, term: u64) -> bool {
        self.term(idx).map(|t| t == term).unwrap_or(false)
    }

    /// The append half of the AppendEntries RPC: when our log matches the
    /// leader's at `(idx, term)`, splice in the entries from the first
    /// conflict onwards, advance `committed` to the smaller of the leader's
    /// commit and the last new index, and return
    /// `Some((conflict_index, last_new_index))`. Returns None on a mismatch.
    ///
    /// # Panics
    ///
    /// Panics when a conflict lies at or below `committed`; committed
    /// entries must never change.
    pub fn maybe_append(
        &mut self,
        idx: u64,
        term: u64,
        committed: u64,
        ents: &[Entry],
    ) -> Option<(u64, u64)> {
        if self.match_term(idx, term) {
            let conflict_idx = self.find_conflict(ents);
            if conflict_idx == 0 {
            } else if conflict_idx <= self.committed {
                fatal!(
                    self.unstable.logger,
                    "entry {} conflict with committed entry {}",
                    conflict_idx,
                    self.committed
                )
            } else {
                let start = (conflict_idx - (idx + 1)) as usize;
                self.append(&ents[start..]);
            }
            let last_new_index = idx + ents.len() as u64;
            self.commit_to(cmp::min(committed, last_new_index));
            return Some((conflict_idx, last_new_index));
        }
        None
    }

    /// Advances `committed`. Moving it backwards is a no-op.
    ///
    /// # Panics
    ///
    /// Panics when asked to commit past the last index.
    pub fn commit_to(&mut self, to_commit: u64) {
        if self.committed >= to_commit {
            return;
        }
        if self.last_index() < to_commit {
            fatal!(
                self.unstable.logger,
                "to_commit {} is out of range [last_index {}]",
                to_commit,
                self.last_index()
            )
        }
        self.committed = to_commit;
    }

    /// Advances `applied` to `idx`.
    ///
    /// # Panics
    ///
    /// Panics when `idx` moves backwards or past `committed`.
    pub fn applied_to(&mut self, idx: u64) {
        if idx == 0 {
            return;
        }
        if self.committed < idx || idx < self.applied {
            fatal!(
                self.unstable.logger,
                "applied({}) is out of range [prev_applied({}), committed({})]",
                idx,
                self.applied,
                self.committed
            )
        }
        self.applied = idx;
    }

    /// Returns the last applied index.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Hands `unstable.stable_to` the persisted watermark.
    pub fn stable_to(&mut self, idx: u64, term: u64) {
        self.unstable.stable_to(idx, term)
    }

    /// Hands `unstable.stable_snap_to` the persisted snapshot index.
    pub fn stable_snap_to(&mut self, idx: u64) {
        self.unstable.stable_snap_to(idx)
    }

    /// Returns a reference to the unstable log.
    pub fn unstable(&self) -> &Unstable {
        &self.unstable
    }

    /// Appends entries to the unstable tail and returns the new last index.
    ///
    /// # Panics
    ///
    /// Panics when the entries would rewrite anything below `committed`.
    pub fn append(&mut self, ents: &[Entry]) -> u64 {
        if ents.is_empty() {
            return self.last_index();
        }

        let after = ents[0].index - 1;
        if after < self.committed {
            fatal!(
                self.unstable.logger,
                "after {} is out of range [committed {}]",
                after,
                self.committed
            )
        }
        self.unstable.truncate_and_append(ents);
        self.last_index()
    }

    /// The entries not yet handed to the host for persistence, if any.
    pub fn unstable_entries(&self) -> Option<&[Entry]> {
        if self.unstable.entries.is_empty() {
            return None;
        }
        Some(&self.unstable.entries)
    }

    /// The entries from `idx` through the end, within a byte cap.
    pub fn entries(&self, idx: u64, max_size: impl Into<Option<u64>>) -> Result<Vec<Entry>> {
        let max_size = max_size.into();
        let last = self.last_index();
        if idx > last {
            return Ok(Vec::new());
        }
        self.slice(idx, last + 1, max_size)
    }

    /// Every entry currently in the log.
    ///
    /// # Panics
    ///
    /// Panics on storage errors other than a racing compaction, which is
    /// retried.
    pub fn all_entries(&self) -> Vec<Entry> {
        let first_index = self.first_index();
        match self.entries(first_index, None) {
            Err(e) => {
                if e == Error::Store(StorageError::Compacted) {
                    return self.all_entries();
                }
                fatal!(self.unstable.logger, "unexpected error: {:?}", e);
            }
            Ok(ents) => ents,
        }
    }

    /// Whether a log ending at `(last_index, term)` is at least as up to
    /// date as ours: a later last term wins outright, an equal one is
    /// decided by length.
    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> bool {
        term > self.last_term() || (term == self.last_term() && last_index >= self.last_index())
    }

    /// The committed entries past `since_idx` that are ready to apply, up to
    /// `max_next_ents_size` bytes.
    pub fn next_entries_since(&self, since_idx: u64) -> Option<Vec<Entry>> {
        let offset = cmp::max(since_idx + 1, self.first_index());
        let committed = self.committed;
        if committed + 1 > offset {
            match self.slice(offset, committed + 1, self.max_next_ents_size) {
                Ok(vec) => return Some(vec),
                Err(e) => fatal!(self.unstable.logger, "{}", e),
            }
        }
        None
    }

    /// The committed-but-unapplied entries, up to `max_next_ents_size`
    /// bytes.
    pub fn next_entries(&self) -> Option<Vec<Entry>> {
        self.next_entries_since(self.applied)
    }

    /// Whether committed entries past `since_idx` are waiting to apply.
    pub fn has_next_entries_since(&self, since_idx: u64) -> bool {
        let offset = cmp::max(since_idx + 1, self.first_index());
        self.committed + 1 > offset
    }

    /// Whether committed-but-unapplied entries are waiting.
    pub fn has_next_entries(&self) -> bool {
        self.has_next_entries_since(self.applied)
    }

    /// The pending snapshot if one is waiting, the storage's otherwise.
    pub fn snapshot(&self) -> Result<Snapshot> {
        if let Some(snap) = self.unstable.snapshot.as_ref() {
            return Ok(snap.clone());
        }
        self.store.snapshot()
    }

    pub(crate) fn pending_snapshot(&self) -> Option<&Snapshot> {
        self.unstable.snapshot.as_ref()
    }

    fn must_check_outofbounds(&self, low: u64, high: u64) -> Option<Error> {
        if low > high {
            fatal!(self.unstable.logger, "invalid slice {} > {}", low, high)
        }
        let first_index = self.first_index();
        if low < first_index {
            return Some(Error::Store(StorageError::Compacted));
        }

        let length = self.last_index() + 1 - first_index;
        if low < first_index || high > first_index + length {
            fatal!(
                self.unstable.logger,
                "slice[{},{}] out of bound[{},{}]",
                low,
                high,
                first_index,
                self.last_index()
            )
        }
        None
    }

    /// Commits `max_index` if it is new, within reach and carries the given
    /// term. The term check is what keeps a leader from counting replicas
    /// for entries of an earlier term.
    pub fn maybe_commit(&mut self, max_index: u64, term: u64) -> bool {
        if max_index > self.committed && self.term(max_index).map_or(false, |t| t == term) {
            debug!(
                self.unstable.logger,
                "committing index {index}",
                index = max_index
            );
            self.commit_to(max_index);
            true
        } else {
            false
        }
    }

    /// The entries in `[low, high)` merged from both halves of the log, as
    /// owned values, truncated to `max_size` bytes but never to zero
    /// entries.
    pub fn slice(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
    ) -> Result<Vec<Entry>> {
        let max_size = max_size.into();
        if let Some(err) = self.must_check_outofbounds(low, high) {
            return Err(err);
        }

        let mut ents = vec![];
        if low == high {
            return Ok(ents);
        }

        if low < self.unstable.offset {
            let unstable_high = cmp::min(high, self.unstable.offset);
            match self.store.entries(low, unstable_high, max_size) {
                Err(e) => match e {
                    Error::Store(StorageError::Compacted) => return Err(e),
                    Error::Store(StorageError::Unavailable) => fatal!(
                        self.unstable.logger,
                        "entries[{}:{}] is unavailable from storage",
                        low,
                        unstable_high,
                    ),
                    _ => fatal!(self.unstable.logger, "unexpected error: {:?}", e),
                },
                Ok(entries) => {
                    ents = entries;
                    if (ents.len() as u64) < unstable_high - low {
                        // the storage applied its own size cap; stop here
                        return Ok(ents);
                    }
                }
            }
        }

        if high > self.unstable.offset {
            let offset = self.unstable.offset;
            let unstable = self.unstable.slice(cmp::max(low, offset), high);
            ents.extend_from_slice(unstable);
        }
        util::limit_size(&mut ents, max_size);
        Ok(ents)
    }

    /// Adopts a snapshot: `committed` jumps to its index and the unstable
    /// tail restarts after it.
    pub fn restore(&mut self, snapshot: Snapshot) {
        info!(
            self.unstable.logger,
            "log [{log}] starts to restore snapshot [index: {snapshot_index}, term: {snapshot_term}]",
            log = self.to_string(),
            snapshot_index = snapshot.get_metadata().index,
            snapshot_term = snapshot.get_metadata().term,
        );
        self.committed = snapshot.get_metadata().index;
        self.unstable.restore(snapshot);
    }
}
