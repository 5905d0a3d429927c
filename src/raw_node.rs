// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

//! The host-facing shell around the raft state machine.
//!
//! [`RawNode`] converts the raft's internal outputs into [`Ready`] batches
//! for the host to persist, transmit and apply, and turns host requests into
//! the corresponding local messages.

use std::mem;

use prost::Message as PbMessage;
use slog::Logger;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::raft::{Raft, SoftState};
use crate::raftpb::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType,
    Snapshot,
};
use crate::read_only::ReadState;
use crate::storage::Storage;
use crate::INVALID_ID;

/// The host's verdict on a snapshot transfer it was asked to perform.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SnapshotStatus {
    /// The snapshot reached the peer.
    Finish,
    /// The snapshot could not be built or did not arrive.
    Failure,
}

/// Checks if certain message type should be used internally.
pub fn is_local_msg(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::MsgHup
            | MessageType::MsgBeat
            | MessageType::MsgUnreachable
            | MessageType::MsgSnapStatus
            | MessageType::MsgCheckQuorum
    )
}

fn is_response_msg(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::MsgAppendResponse
            | MessageType::MsgRequestVoteResponse
            | MessageType::MsgHeartbeatResponse
            | MessageType::MsgUnreachable
            | MessageType::MsgRequestPreVoteResponse
    )
}

/// Everything the core wants done since the last batch: state to record,
/// entries to persist, messages to transmit, committed entries to apply.
/// All fields are read-only for the host.
#[derive(Default, Debug, PartialEq)]
pub struct Ready {
    ss: Option<SoftState>,

    hs: Option<HardState>,

    /// Answered read-index requests, to be matched with waiting readers.
    pub read_states: Vec<ReadState>,

    /// Entries to persist to the durable log BEFORE `messages` are sent.
    pub entries: Vec<Entry>,

    /// A snapshot to persist and hand to the state machine, if one arrived.
    pub snapshot: Snapshot,

    /// Entries already durable on a quorum, ready for the state machine.
    pub committed_entries: Option<Vec<Entry>>,

    /// Messages to transmit once `entries` are durable. A `MsgSnapshot` in
    /// here obliges the host to call `report_snapshot` with the outcome.
    pub messages: Vec<Message>,

    // The applied cursor to advance to once this Ready is handed back, kept
    // aside so the host may freely take `committed_entries` out.
    last_committed: u64,

    must_sync: bool,
}

impl Ready {
    fn new<T: Storage>(
        raft: &mut Raft<T>,
        prev_ss: &SoftState,
        prev_hs: &HardState,
        since_idx: Option<u64>,
    ) -> Ready {
        let mut rd = Ready {
            entries: raft.raft_log.unstable_entries().unwrap_or(&[]).to_vec(),
            ..Default::default()
        };

        let ss = raft.soft_state();
        if &ss != prev_ss {
            rd.ss = Some(ss);
        }
        let hs = raft.hard_state();
        if &hs != prev_hs {
            if hs.vote != prev_hs.vote || hs.term != prev_hs.term {
                rd.must_sync = true;
            }
            rd.hs = Some(hs);
        }
        if !rd.entries.is_empty() {
            rd.must_sync = true;
        }

        if let Some(snapshot) = raft.raft_log.pending_snapshot() {
            rd.snapshot = snapshot.clone();
            rd.last_committed = rd.snapshot.get_metadata().index;
        }
        rd.committed_entries = match since_idx {
            None => raft.raft_log.next_entries(),
            Some(idx) => raft.raft_log.next_entries_since(idx),
        };
        if let Some(e) = rd.committed_entries.as_ref().and_then(|ents| ents.last()) {
            rd.last_committed = std::cmp::max(rd.last_committed, e.index);
        }
        if !raft.msgs.is_empty() {
            mem::swap(&mut raft.msgs, &mut rd.messages);
        }
        if !raft.read_states.is_empty() {
            mem::swap(&mut raft.read_states, &mut rd.read_states);
        }
        rd
    }

    /// The new role/leader pair, present only when it changed.
    /// It does not need to be persisted.
    #[inline]
    pub fn ss(&self) -> Option<&SoftState> {
        self.ss.as_ref()
    }

    /// The new hard state, present only when it changed. It must be
    /// persisted before any of `messages` is sent.
    #[inline]
    pub fn hs(&self) -> Option<&HardState> {
        self.hs.as_ref()
    }

    /// The snapshot to persist, empty when there is none.
    #[inline]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Whether `entries` and the hard state must hit disk synchronously
    /// before this batch's messages are released.
    #[inline]
    pub fn must_sync(&self) -> bool {
        self.must_sync
    }
}

/// A thread-unsafe raft node. The host must serialize all calls.
pub struct RawNode<T: Storage> {
    /// The internal raft state.
    pub raft: Raft<T>,
    prev_ss: SoftState,
    prev_hs: HardState,
}

impl<T: Storage> RawNode<T> {
    /// Create a new RawNode from a [`Config`](../struct.Config.html) and a storage.
    pub fn new(config: &Config, store: T, logger: &Logger) -> Result<RawNode<T>> {
        assert_ne!(config.id, 0, "config.id must not be zero");
        let r = Raft::new(config, store, logger)?;
        let mut rn = RawNode {
            raft: r,
            prev_hs: Default::default(),
            prev_ss: Default::default(),
        };
        rn.prev_hs = rn.raft.hard_state();
        rn.prev_ss = rn.raft.soft_state();
        Ok(rn)
    }

    /// Create a new RawNode with the default logger, an `slog` to `log`
    /// adapter.
    #[cfg(feature = "default-logger")]
    pub fn with_default_logger(c: &Config, store: T) -> Result<RawNode<T>> {
        Self::new(c, store, &crate::default_logger())
    }

    /// Advances the internal logical clock by a single tick.
    ///
    /// Returns true when the tick produced something for the next Ready.
    pub fn tick(&mut self) -> bool {
        self.raft.tick()
    }

    /// Campaign causes this RawNode to transition to candidate state.
    pub fn campaign(&mut self) -> Result<()> {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgHup);
        self.raft.step(m)
    }

    /// Proposes data to be appended to the raft log.
    pub fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> Result<()> {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgPropose);
        m.from = self.raft.id;
        let mut e = Entry::default();
        e.data = data;
        e.context = context;
        m.entries = vec![e];
        self.raft.step(m)
    }

    /// Proposes a membership change, to be applied once its entry commits.
    pub fn propose_conf_change(&mut self, context: Vec<u8>, cc: ConfChange) -> Result<()> {
        let data = cc.encode_to_vec();
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgPropose);
        let mut e = Entry::default();
        e.set_entry_type(EntryType::EntryConfChange);
        e.data = data;
        e.context = context;
        m.entries = vec![e];
        self.raft.step(m)
    }

    /// Applies a committed membership change to the local node and returns
    /// the resulting configuration. The host must call this when it applies
    /// a conf-change entry, unless it decided to reject the change.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<ConfState> {
        if cc.node_id != INVALID_ID {
            let nid = cc.node_id;
            match cc.change_type() {
                ConfChangeType::AddNode => self.raft.add_node(nid)?,
                ConfChangeType::AddLearnerNode => self.raft.add_learner(nid)?,
                ConfChangeType::RemoveNode => self.raft.remove_node(nid)?,
                ConfChangeType::UpdateNode => self.raft.update_node(nid),
            }
        }

        Ok(ConfState::from((
            self.raft.prs().nodes(),
            self.raft.prs().learner_nodes(),
        )))
    }

    /// Steps the state machine with a message received from a peer.
    pub fn step(&mut self, m: Message) -> Result<()> {
        // Local message types must come through the wrappers above, not off
        // the wire.
        if is_local_msg(m.msg_type()) {
            return Err(Error::StepLocalMsg);
        }
        if self.raft.prs().get(m.from).is_some() || !is_response_msg(m.msg_type()) {
            return self.raft.step(m);
        }
        Err(Error::StepPeerNotFound)
    }

    /// Builds a Ready that skips committed entries at or below `applied_idx`.
    pub fn ready_since(&mut self, applied_idx: u64) -> Ready {
        Ready::new(
            &mut self.raft,
            &self.prev_ss,
            &self.prev_hs,
            Some(applied_idx),
        )
    }

    /// Returns the current point-in-time state of this RawNode.
    pub fn ready(&mut self) -> Ready {
        Ready::new(&mut self.raft, &self.prev_ss, &self.prev_hs, None)
    }

    /// Like `has_ready`, taking committed entries relative to `applied_idx`.
    pub fn has_ready_since(&self, applied_idx: Option<u64>) -> bool {
        let raft = &self.raft;
        if !raft.msgs.is_empty() || raft.raft_log.unstable_entries().is_some() {
            return true;
        }
        if !raft.read_states.is_empty() {
            return true;
        }
        if self.snap().map_or(false, |s| !s.is_empty()) {
            return true;
        }
        let has_unapplied_entries = match applied_idx {
            None => raft.raft_log.has_next_entries(),
            Some(idx) => raft.raft_log.has_next_entries_since(idx),
        };
        if has_unapplied_entries {
            return true;
        }
        if raft.soft_state() != self.prev_ss {
            return true;
        }
        let hs = raft.hard_state();
        if hs != HardState::default() && hs != self.prev_hs {
            return true;
        }
        false
    }

    /// Whether the next `ready()` would return a non-empty batch.
    #[inline]
    pub fn has_ready(&self) -> bool {
        self.has_ready_since(None)
    }

    fn commit_ready(&mut self, rd: Ready) {
        if let Some(ss) = rd.ss {
            self.prev_ss = ss;
        }
        if let Some(hs) = rd.hs {
            if hs != HardState::default() {
                self.prev_hs = hs;
            }
        }
        if !rd.entries.is_empty() {
            let e = rd.entries.last().unwrap();
            self.raft.raft_log.stable_to(e.index, e.term);
        }
        if !rd.snapshot.is_empty() {
            self.raft
                .raft_log
                .stable_snap_to(rd.snapshot.get_metadata().index);
        }
    }

    /// Reports that the last Ready has been persisted, its messages sent and
    /// its committed entries applied.
    pub fn advance(&mut self, rd: Ready) {
        let applied_to = rd.last_committed;
        self.advance_append(rd);
        if applied_to > 0 {
            self.advance_apply(applied_to);
        }
    }

    /// Records the persisted portion of the Ready without touching the
    /// applied cursor; pair with `advance_apply`.
    #[inline]
    pub fn advance_append(&mut self, rd: Ready) {
        self.commit_ready(rd);
    }

    /// Advances the applied cursor to `applied`.
    #[inline]
    pub fn advance_apply(&mut self, applied: u64) {
        self.raft.raft_log.applied_to(applied);
    }

    /// Grabs the snapshot from the raft if available.
    #[inline]
    pub fn snap(&self) -> Option<&Snapshot> {
        self.raft.snap()
    }

    /// Reports that the last send to `id` failed; replication to it falls
    /// back to probing.
    pub fn report_unreachable(&mut self, id: u64) {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgUnreachable);
        m.from = id;
        // an error here is nothing the host could act on
        let _ = self.raft.step(m);
    }

    /// Reports how the snapshot transfer to `id` went.
    pub fn report_snapshot(&mut self, id: u64, status: SnapshotStatus) {
        let rej = status == SnapshotStatus::Failure;
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgSnapStatus);
        m.from = id;
        m.reject = rej;
        // an error here is nothing the host could act on
        let _ = self.raft.step(m);
    }

    /// Tries to transfer leadership to the given transferee.
    pub fn transfer_leader(&mut self, transferee: u64) {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgTransferLeader);
        m.from = transferee;
        let _ = self.raft.step(m);
    }

    /// Requests a linearizable read. Once confirmed, a `ReadState` carrying
    /// `rctx` and the commit watermark appears in a Ready; reads received
    /// before the request may be served as soon as the state machine has
    /// applied up to that watermark.
    pub fn read_index(&mut self, rctx: Vec<u8>) {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgReadIndex);
        let mut e = Entry::default();
        e.data = rctx;
        m.entries = vec![e];
        let _ = self.raft.step(m);
    }

    /// Returns the store as an immutable reference.
    #[inline]
    pub fn store(&self) -> &T {
        self.raft.store()
    }

    /// Returns the store as a mutable reference.
    #[inline]
    pub fn mut_store(&mut self) -> &mut T {
        self.raft.mut_store()
    }
}
