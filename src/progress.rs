// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

//! The leader's per-peer replication bookkeeping: how far each follower has
//! confirmed the log, which mode governs traffic to it, and the container
//! that keeps voters and learners apart.

use std::cmp;
use std::collections::hash_map::{Iter, IterMut};
use std::iter::Chain;

use crate::errors::{Error, Result};
use crate::HashMap;

/// The replication mode towards one follower.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ProgressState {
    /// Feeling out where the follower's log ends: one append in flight at a
    /// time, paused until it is answered.
    #[default]
    Probe,
    /// The follower is known to match; appends are pipelined optimistically
    /// up to the inflight window.
    Replicate,
    /// The follower is too far behind for the log; a snapshot is on its way
    /// and appends wait until it is resolved.
    Snapshot,
}

/// What the leader knows about one peer's log.
#[derive(Debug, Default, Clone)]
pub struct Progress {
    /// The highest index known to be replicated on the peer.
    pub matched: u64,
    /// The index of the next entry to send. Always above `matched`.
    pub next_idx: u64,
    /// The replication mode governing traffic to this peer.
    pub state: ProgressState,
    /// In `Probe`, set after sending an append and cleared by a response;
    /// while set, no further appends go out.
    pub paused: bool,
    /// In `Snapshot`, the index of the snapshot in flight. Replication rests
    /// until the transfer succeeds, fails or is overtaken by an ack.
    pub pending_snapshot: u64,
    /// Set whenever a message arrives from the peer; check_quorum clears it
    /// once per election timeout.
    pub recent_active: bool,
    /// The indexes of the optimistically pipelined appends, oldest first.
    /// When this window is full the peer has enough on its plate.
    pub ins: Inflights,
    /// Indicates the Progress is a learner or not.
    pub is_learner: bool,
}

impl Progress {
    /// Creates a progress that will send from `next_idx` with an inflight
    /// window of `ins_size` appends.
    pub fn new(next_idx: u64, ins_size: usize) -> Self {
        Progress {
            next_idx,
            ins: Inflights::new(ins_size),
            ..Default::default()
        }
    }

    fn reset_state(&mut self, state: ProgressState) {
        self.paused = false;
        self.pending_snapshot = 0;
        self.state = state;
        self.ins.reset();
    }

    pub(crate) fn reset(&mut self, next_idx: u64) {
        self.matched = 0;
        self.next_idx = next_idx;
        self.state = ProgressState::default();
        self.paused = false;
        self.pending_snapshot = 0;
        self.recent_active = false;
        self.ins.reset();
    }

    /// Changes the progress to probe mode. Coming out of `Snapshot` the
    /// probe starts after the shipped snapshot, since the peer is assumed to
    /// hold it now.
    pub fn become_probe(&mut self) {
        if self.state == ProgressState::Snapshot {
            let pending_snapshot = self.pending_snapshot;
            self.reset_state(ProgressState::Probe);
            self.next_idx = cmp::max(self.matched + 1, pending_snapshot + 1);
        } else {
            self.reset_state(ProgressState::Probe);
            self.next_idx = self.matched + 1;
        }
    }

    /// Changes the progress to replicate mode.
    pub fn become_replicate(&mut self) {
        self.reset_state(ProgressState::Replicate);
        self.next_idx = self.matched + 1;
    }

    /// Changes the progress to snapshot mode, with a snapshot at
    /// `snapshot_idx` in flight.
    pub fn become_snapshot(&mut self, snapshot_idx: u64) {
        self.reset_state(ProgressState::Snapshot);
        self.pending_snapshot = snapshot_idx;
    }

    /// Clears the pending snapshot after the host reported its transfer
    /// failed.
    pub fn snapshot_failure(&mut self) {
        self.pending_snapshot = 0;
    }

    /// Whether the pending snapshot has become moot because the peer caught
    /// up to it anyway.
    pub fn maybe_snapshot_abort(&self) -> bool {
        self.state == ProgressState::Snapshot && self.matched >= self.pending_snapshot
    }

    /// Confirms replication up to `n`. Returns false when `n` comes from an
    /// outdated message and changes nothing.
    pub fn maybe_update(&mut self, n: u64) -> bool {
        let need_update = self.matched < n;
        if need_update {
            self.matched = n;
            self.resume();
        }

        if self.next_idx < n + 1 {
            self.next_idx = n + 1
        }

        need_update
    }

    /// Advances `next_idx` past an append that was just sent, without
    /// waiting for its confirmation.
    pub fn optimistic_update(&mut self, n: u64) {
        self.next_idx = n + 1;
    }

    /// Backs `next_idx` off after the peer rejected the append at `rejected`,
    /// using `last` (the peer's last index) as a hint. Returns false when the
    /// rejection is stale and changes nothing.
    pub fn maybe_decr_to(&mut self, rejected: u64, last: u64) -> bool {
        if self.state == ProgressState::Replicate {
            // An index at or below `matched` was confirmed already; the
            // rejection must predate that.
            if rejected <= self.matched {
                return false;
            }
            self.next_idx = self.matched + 1;
            return true;
        }

        // In probe mode only the one in-flight append, at next_idx - 1, can
        // be rejected.
        if self.next_idx == 0 || self.next_idx - 1 != rejected {
            return false;
        }

        self.next_idx = cmp::min(rejected, last + 1);
        if self.next_idx < 1 {
            self.next_idx = 1;
        }
        self.resume();
        true
    }

    /// Whether sends to this peer should hold off right now.
    pub fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe => self.paused,
            ProgressState::Replicate => self.ins.full(),
            ProgressState::Snapshot => true,
        }
    }

    /// Clears the probe pause.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Sets the probe pause.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Books an append that was just sent, whose last entry has the given
    /// index: a probe pauses, a replicate pipelines.
    pub fn update_state(&mut self, last: u64) {
        match self.state {
            ProgressState::Replicate => {
                self.optimistic_update(last);
                self.ins.add(last);
            }
            ProgressState::Probe => self.pause(),
            ProgressState::Snapshot => {
                panic!("updating progress state in unhandled state {:?}", self.state)
            }
        }
    }
}

/// A fixed-size window over the indexes of unacknowledged appends, oldest
/// first.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Inflights {
    // the offset of the oldest inflight in the buffer
    start: usize,
    // how many are outstanding
    count: usize,

    // ring buffer
    buffer: Vec<u64>,
}

impl Inflights {
    /// Creates a window admitting up to `cap` outstanding appends.
    pub fn new(cap: usize) -> Inflights {
        Inflights {
            buffer: Vec::with_capacity(cap),
            ..Default::default()
        }
    }

    /// Returns true if the window is full.
    #[inline]
    pub fn full(&self) -> bool {
        self.count == self.cap()
    }

    /// The window capacity.
    #[inline]
    pub fn cap(&self) -> usize {
        self.buffer.capacity()
    }

    /// The number of outstanding appends.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Books an append. Indexes must be added in ascending order.
    ///
    /// # Panics
    ///
    /// Panics when the window is full.
    pub fn add(&mut self, inflight: u64) {
        if self.full() {
            panic!("cannot add into a full inflights")
        }

        let mut next = self.start + self.count;
        if next >= self.cap() {
            next -= self.cap();
        }
        if next == self.buffer.len() {
            self.buffer.push(inflight);
        } else {
            self.buffer[next] = inflight;
        }
        self.count += 1;
    }

    /// Frees every append up to and including index `to`.
    pub fn free_to(&mut self, to: u64) {
        if self.count == 0 || to < self.buffer[self.start] {
            // nothing in the window is that old
            return;
        }

        let mut freed = 0;
        let mut idx = self.start;
        while freed < self.count {
            if to < self.buffer[idx] {
                break;
            }
            idx += 1;
            if idx >= self.cap() {
                idx -= self.cap();
            }
            freed += 1;
        }

        self.count -= freed;
        self.start = idx;
    }

    /// Frees the oldest append alone.
    pub fn free_first_one(&mut self) {
        let oldest = self.buffer[self.start];
        self.free_to(oldest);
    }

    /// Frees the whole window.
    pub fn reset(&mut self) {
        self.count = 0;
        self.start = 0;
    }
}

/// The progress of all peers, with voters and learners kept disjoint.
#[derive(Default, Clone)]
pub struct ProgressSet {
    voters: HashMap<u64, Progress>,
    learners: HashMap<u64, Progress>,
}

impl ProgressSet {
    /// Creates a progress set sized for the given number of voters and
    /// learners.
    pub fn with_capacity(voter_size: usize, learner_size: usize) -> Self {
        ProgressSet {
            voters: HashMap::with_capacity_and_hasher(voter_size, Default::default()),
            learners: HashMap::with_capacity_and_hasher(learner_size, Default::default()),
        }
    }

    /// Returns the map of voters.
    #[inline]
    pub fn voters(&self) -> &HashMap<u64, Progress> {
        &self.voters
    }

    /// Returns the map of learners.
    #[inline]
    pub fn learners(&self) -> &HashMap<u64, Progress> {
        &self.learners
    }

    /// Returns the ids of the voters, sorted.
    pub fn nodes(&self) -> Vec<u64> {
        let mut nodes: Vec<u64> = self.voters.keys().cloned().collect();
        nodes.sort_unstable();
        nodes
    }

    /// Returns the ids of the learners, sorted.
    pub fn learner_nodes(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.learners.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Grabs a reference to the progress of a node.
    pub fn get(&self, id: u64) -> Option<&Progress> {
        self.voters.get(&id).or_else(|| self.learners.get(&id))
    }

    /// Grabs a mutable reference to the progress of a node.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Progress> {
        match self.voters.get_mut(&id) {
            None => self.learners.get_mut(&id),
            some => some,
        }
    }

    /// Returns an iterator across all the nodes and their progress.
    pub fn iter(&self) -> Chain<Iter<'_, u64, Progress>, Iter<'_, u64, Progress>> {
        self.voters.iter().chain(&self.learners)
    }

    /// Returns a mutable iterator across all the nodes and their progress.
    pub fn iter_mut(&mut self) -> Chain<IterMut<'_, u64, Progress>, IterMut<'_, u64, Progress>> {
        self.voters.iter_mut().chain(&mut self.learners)
    }

    /// Adds a voter.
    pub fn insert_voter(&mut self, id: u64, pr: Progress) -> Result<()> {
        if self.learners.contains_key(&id) {
            return Err(Error::Exists(id, "learners"));
        }
        if self.voters.contains_key(&id) {
            return Err(Error::Exists(id, "voters"));
        }
        self.voters.insert(id, pr);
        Ok(())
    }

    /// Adds a learner.
    pub fn insert_learner(&mut self, id: u64, mut pr: Progress) -> Result<()> {
        if self.voters.contains_key(&id) {
            return Err(Error::Exists(id, "voters"));
        }
        if self.learners.contains_key(&id) {
            return Err(Error::Exists(id, "learners"));
        }
        pr.is_learner = true;
        self.learners.insert(id, pr);
        Ok(())
    }

    /// Removes the peer from the set of voters or learners.
    pub fn remove(&mut self, id: u64) -> Result<Option<Progress>> {
        if !self.voters.contains_key(&id) && !self.learners.contains_key(&id) {
            return Err(Error::NotExists(id, "voters or learners"));
        }
        let removed = match self.voters.remove(&id) {
            None => self.learners.remove(&id),
            some => some,
        };
        Ok(removed)
    }

    /// Promotes a learner to a voter, keeping its progress.
    pub fn promote_learner(&mut self, id: u64) -> Result<()> {
        match self.learners.remove(&id) {
            Some(mut pr) => {
                pr.is_learner = false;
                self.voters.insert(id, pr);
                Ok(())
            }
            None => Err(Error::NotExists(id, "learners")),
        }
    }
}
