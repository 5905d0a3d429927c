// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

//! The in-memory tail of the log: entries produced by the state machine that
//! the host has not yet made durable, plus a received-but-unpersisted
//! snapshot.

use crate::raftpb::{Entry, Snapshot};
use slog::Logger;

/// `entries[i]` holds the entry at log position `i + offset`. The offset may
/// lie below the end of the durable log, in which case the durable tail is
/// stale and will be truncated when the host persists these entries.
#[derive(Debug)]
pub struct Unstable {
    /// The incoming unstable snapshot, if any.
    pub snapshot: Option<Snapshot>,

    /// All entries that have not yet been written to storage.
    pub entries: Vec<Entry>,

    /// The log position of the first unstable entry.
    pub offset: u64,

    /// The tag to use when logging.
    pub logger: Logger,
}

impl Unstable {
    /// Creates an empty unstable log starting at `offset`.
    pub fn new(offset: u64, logger: Logger) -> Unstable {
        Unstable {
            offset,
            snapshot: None,
            entries: vec![],
            logger,
        }
    }

    /// The first index covered here, which is the one right after the
    /// pending snapshot. None without a snapshot.
    pub fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot
            .as_ref()
            .map(|snap| snap.get_metadata().index + 1)
    }

    /// The last index covered here: the last entry's, or the pending
    /// snapshot's. None when this buffer is empty.
    pub fn maybe_last_index(&self) -> Option<u64> {
        match self.entries.len() {
            0 => self.snapshot.as_ref().map(|snap| snap.get_metadata().index),
            len => Some(self.offset + len as u64 - 1),
        }
    }

    /// The term of the entry at `idx`, or of the pending snapshot when `idx`
    /// is exactly its index. None when `idx` is not covered here.
    pub fn maybe_term(&self, idx: u64) -> Option<u64> {
        if idx < self.offset {
            let snapshot = self.snapshot.as_ref()?;
            let meta = snapshot.get_metadata();
            if idx == meta.index {
                Some(meta.term)
            } else {
                None
            }
        } else {
            self.maybe_last_index().and_then(|last| {
                if idx > last {
                    return None;
                }
                Some(self.entries[(idx - self.offset) as usize].term)
            })
        }
    }

    /// Drops the entries up to and including `idx` now that the host has
    /// persisted them, provided `(idx, term)` still names one of our entries.
    /// A mismatch means the tail was overwritten since and must stay.
    pub fn stable_to(&mut self, idx: u64, term: u64) {
        match self.maybe_term(idx) {
            Some(t) if t == term && idx >= self.offset => {
                self.entries.drain(..(idx + 1 - self.offset) as usize);
                self.offset = idx + 1;
            }
            _ => {}
        }
    }

    /// Drops the pending snapshot once the host has persisted it, provided
    /// `idx` still names it.
    pub fn stable_snap_to(&mut self, idx: u64) {
        if let Some(snap) = &self.snapshot {
            if snap.get_metadata().index == idx {
                self.snapshot = None;
            }
        }
    }

    /// Replaces everything with an incoming snapshot; the log restarts right
    /// after it.
    pub fn restore(&mut self, snap: Snapshot) {
        self.entries.clear();
        self.offset = snap.get_metadata().index + 1;
        self.snapshot = Some(snap);
    }

    /// Appends, cutting away whatever the incoming entries overwrite: nothing
    /// when they continue the buffer, the overlapping tail when they land
    /// inside it, or the entire buffer when they start at or before `offset`.
    pub fn truncate_and_append(&mut self, ents: &[Entry]) {
        let after = ents[0].index;
        if after == self.offset + self.entries.len() as u64 {
            // a straight continuation
        } else if after <= self.offset {
            self.offset = after;
            self.entries.clear();
        } else {
            let off = self.offset;
            self.must_check_outofbounds(off, after);
            self.entries.truncate((after - off) as usize);
        }
        self.entries.extend_from_slice(ents);
    }

    /// Returns the entries in `[lo, hi)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not fully covered by this buffer.
    pub fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        self.must_check_outofbounds(lo, hi);
        let l = lo as usize;
        let h = hi as usize;
        let off = self.offset as usize;
        &self.entries[l - off..h - off]
    }

    /// Checks that `[lo, hi)` lies within the buffer.
    ///
    /// # Panics
    ///
    /// Panics when it does not, or when `lo > hi`.
    pub fn must_check_outofbounds(&self, lo: u64, hi: u64) {
        if lo > hi {
            fatal!(self.logger, "invalid unstable.slice {} > {}", lo, hi)
        }
        let upper = self.offset + self.entries.len() as u64;
        if lo < self.offset || hi > upper {
            fatal!(
                self.logger,
                "unstable.slice[{}, {}] out of bound[{}, {}]",
                lo,
                hi,
                self.offset,
                upper
            )
        }
    }
}
