// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

use std::cmp;

use prost::Message as PbMessage;
use rand::Rng;
use slog::Logger;

use crate::config::Config;
use crate::errors::{Error, Result, StorageError};
use crate::progress::{Progress, ProgressSet, ProgressState};
use crate::raft_log::RaftLog;
use crate::raftpb::{ConfChange, Entry, EntryType, HardState, Message, MessageType, Snapshot};
use crate::read_only::{ReadOnly, ReadOnlyOption, ReadState};
use crate::storage::Storage;
use crate::util;
use crate::HashMap;

const CAMPAIGN_PRE_ELECTION: &[u8] = b"CampaignPreElection";
const CAMPAIGN_ELECTION: &[u8] = b"CampaignElection";
const CAMPAIGN_TRANSFER: &[u8] = b"CampaignTransfer";

/// The role of the node.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum StateRole {
    /// The node is a follower of the leader.
    #[default]
    Follower,
    /// The node could become a leader.
    Candidate,
    /// The node is a leader.
    Leader,
    /// The node could become a candidate, if `prevote` is enabled.
    PreCandidate,
}

/// A constant represents invalid id of raft.
pub const INVALID_ID: u64 = 0;
/// A constant represents invalid index of raft log.
pub const INVALID_INDEX: u64 = 0;

/// SoftState provides state that is useful for logging and debugging.
/// The state is volatile and does not need to be persisted to the WAL.
#[derive(Default, PartialEq, Debug)]
pub struct SoftState {
    /// The potential leader of the cluster.
    pub leader_id: u64,
    /// The soft role this node may take.
    pub raft_state: StateRole,
}

/// The deterministic Raft state machine itself. All inputs arrive through
/// [`Raft::step`] and [`Raft::tick`]; all outputs accumulate in `msgs`,
/// `read_states` and the log until the host drains them.
#[derive(CopyGetters)]
pub struct Raft<T: Storage> {
    /// The current election term.
    pub term: u64,

    /// Which peer this raft is voting for.
    pub vote: u64,

    /// The ID of this node.
    pub id: u64,

    /// The current read states.
    pub read_states: Vec<ReadState>,

    /// The persistent log.
    pub raft_log: RaftLog<T>,

    /// The maximum number of messages that can be inflight.
    pub max_inflight: usize,

    /// The maximum length (in bytes) of all the entries.
    pub max_msg_size: u64,

    /// The leader-side admission limit on proposed-but-uncommitted payload
    /// bytes.
    pub max_uncommitted_size: u64,

    prs: Option<ProgressSet>,

    /// The current role of this node.
    pub state: StateRole,

    /// Indicates this peer replicates the log without voting.
    pub is_learner: bool,

    /// The current votes for this node in an election.
    ///
    /// Reset when changing role.
    pub votes: HashMap<u64, bool>,

    /// The list of messages.
    pub msgs: Vec<Message>,

    /// The leader id.
    pub leader_id: u64,

    /// ID of the leader transfer target when its value is not None.
    ///
    /// If this is Some(id), we follow the procedure defined in raft thesis 3.10.
    pub lead_transferee: Option<u64>,

    /// An index at or above the latest unapplied configuration change.
    /// Conf-change proposals are admitted only once `applied` has caught up
    /// with it, keeping at most one change in flight.
    pub pending_conf_index: u64,

    /// The payload bytes of entries proposed at this term but not yet
    /// committed.
    #[get_copy = "pub"]
    uncommitted_size: u64,

    /// The queue of read-only requests.
    pub read_only: ReadOnly,

    /// Ticks since the last election timeout, or since the last message from
    /// the current leader while a follower.
    pub election_elapsed: usize,

    // Ticks since the last heartbeat. Only the leader maintains it.
    heartbeat_elapsed: usize,

    /// Whether to check the quorum.
    pub check_quorum: bool,

    /// Enable the pre-vote round before real elections.
    pub pre_vote: bool,

    /// Followers drop proposals instead of forwarding them to the leader.
    pub disable_proposal_forwarding: bool,

    heartbeat_timeout: usize,
    election_timeout: usize,

    // A fresh draw from [election_timeout, 2 * election_timeout) on every
    // reset, so peers do not campaign in lockstep.
    randomized_election_timeout: usize,

    pub(crate) logger: Logger,
}

fn new_message(to: u64, field_type: MessageType, from: Option<u64>) -> Message {
    let mut m = Message::default();
    m.to = to;
    if let Some(id) = from {
        m.from = id;
    }
    m.set_msg_type(field_type);
    m
}

fn num_of_pending_conf(entries: &[Entry]) -> usize {
    entries
        .iter()
        .filter(|e| e.entry_type() == EntryType::EntryConfChange)
        .count()
}

/// Maps vote and pre_vote message types to their correspond responses.
pub fn vote_resp_msg_type(t: MessageType) -> MessageType {
    match t {
        MessageType::MsgRequestVote => MessageType::MsgRequestVoteResponse,
        MessageType::MsgRequestPreVote => MessageType::MsgRequestPreVoteResponse,
        _ => panic!("Not a vote message: {:?}", t),
    }
}

impl<T: Storage> Raft<T> {
    /// Creates a new raft for use on the node.
    pub fn new(c: &Config, store: T, logger: &Logger) -> Result<Raft<T>> {
        c.validate()?;
        let logger = logger.new(o!("raft_id" => c.id));
        let raft_state = store.initial_state()?;
        let conf_state = &raft_state.conf_state;

        let mut peers: &[u64] = &c.peers;
        let mut learners: &[u64] = &c.learners;
        if !conf_state.nodes.is_empty() || !conf_state.learners.is_empty() {
            if !peers.is_empty() || !learners.is_empty() {
                // tests; the argument should be removed and these tests should
                // be updated to specify their nodes through a snapshot.
                return Err(Error::ConfigInvalid(
                    "cannot specify both new(peers/learners) and ConfState.(Nodes/Learners)"
                        .to_owned(),
                ));
            }
            peers = &conf_state.nodes;
            learners = &conf_state.learners;
        }

        let mut r = Raft {
            id: c.id,
            read_states: Default::default(),
            raft_log: RaftLog::new(store, logger.clone()),
            max_inflight: c.max_inflight_msgs,
            max_msg_size: c.max_size_per_msg,
            max_uncommitted_size: c.max_uncommitted_entries_size,
            prs: Some(ProgressSet::with_capacity(peers.len(), learners.len())),
            state: StateRole::Follower,
            is_learner: false,
            check_quorum: c.check_quorum,
            pre_vote: c.pre_vote,
            disable_proposal_forwarding: c.disable_proposal_forwarding,
            read_only: ReadOnly::new(c.read_only_option),
            heartbeat_timeout: c.heartbeat_tick,
            election_timeout: c.election_tick,
            votes: Default::default(),
            msgs: Default::default(),
            leader_id: Default::default(),
            lead_transferee: None,
            term: Default::default(),
            election_elapsed: Default::default(),
            pending_conf_index: Default::default(),
            uncommitted_size: 0,
            vote: Default::default(),
            heartbeat_elapsed: Default::default(),
            randomized_election_timeout: 0,
            logger,
        };
        r.raft_log.max_next_ents_size = c.max_committed_size_per_ready;
        for p in peers {
            let pr = Progress::new(1, r.max_inflight);
            if let Err(e) = r.mut_prs().insert_voter(*p, pr) {
                fatal!(r.logger, "{}", e);
            }
        }
        for p in learners {
            let pr = Progress::new(1, r.max_inflight);
            if let Err(e) = r.mut_prs().insert_learner(*p, pr) {
                fatal!(r.logger, "{}", e);
            }
            if *p == r.id {
                r.is_learner = true;
            }
        }

        if raft_state.hard_state != HardState::default() {
            r.load_state(&raft_state.hard_state);
        }
        if c.applied > 0 {
            r.raft_log.applied_to(c.applied);
        }
        let term = r.term;
        r.become_follower(term, INVALID_ID);

        info!(
            r.logger,
            "raft created";
            "peers" => ?r.prs().nodes(),
            "term" => r.term,
            "commit" => r.raft_log.committed,
            "applied" => r.raft_log.applied,
            "last index" => r.raft_log.last_index(),
            "last term" => r.raft_log.last_term(),
        );
        Ok(r)
    }

    /// Grabs an immutable reference to the store.
    #[inline]
    pub fn store(&self) -> &T {
        &self.raft_log.store
    }

    /// Grabs a mutable reference to the store.
    #[inline]
    pub fn mut_store(&mut self) -> &mut T {
        &mut self.raft_log.store
    }

    /// Grabs a reference to the snapshot, if one is pending.
    #[inline]
    pub fn snap(&self) -> Option<&Snapshot> {
        self.raft_log.unstable.snapshot.as_ref()
    }

    /// Returns a value representing the softstate at the time of calling.
    pub fn soft_state(&self) -> SoftState {
        SoftState {
            leader_id: self.leader_id,
            raft_state: self.state,
        }
    }

    /// Returns a value representing the hardstate at the time of calling.
    pub fn hard_state(&self) -> HardState {
        let mut hs = HardState::default();
        hs.term = self.term;
        hs.vote = self.vote;
        hs.commit = self.raft_log.committed;
        hs
    }

    /// For deterministic tests of timer behavior.
    #[doc(hidden)]
    pub fn set_randomized_election_timeout(&mut self, t: usize) {
        assert!(self.election_timeout <= t && t < 2 * self.election_timeout);
        self.randomized_election_timeout = t;
    }

    /// Fetch the length of the election timeout.
    pub fn get_election_timeout(&self) -> usize {
        self.election_timeout
    }

    /// Fetch the length of the heartbeat timeout.
    pub fn get_heartbeat_timeout(&self) -> usize {
        self.heartbeat_timeout
    }

    /// Return the length of the current randomized election timeout.
    pub fn get_randomized_election_timeout(&self) -> usize {
        self.randomized_election_timeout
    }

    /// The number of voters that constitute a majority.
    #[inline]
    pub fn quorum(&self) -> usize {
        util::majority(self.prs().voters().len())
    }

    /// Whether this node may campaign: only a voter that is present in its
    /// own progress list can.
    pub fn promotable(&self) -> bool {
        self.prs().voters().contains_key(&self.id)
    }

    // send stamps the sender and term onto the message and queues it for the
    // host to transmit.
    fn send(&mut self, mut m: Message) {
        m.from = self.id;
        if m.msg_type() == MessageType::MsgRequestVote
            || m.msg_type() == MessageType::MsgRequestPreVote
            || m.msg_type() == MessageType::MsgRequestVoteResponse
            || m.msg_type() == MessageType::MsgRequestPreVoteResponse
        {
            if m.term == 0 {
                // All {pre-,}campaign messages need to have the term set when
                // sending.
                // - MsgVote: m.term is the term the node is campaigning for,
                //   non-zero as we increment the term when campaigning.
                // - MsgVoteResp: m.term is the new r.term if the MsgVote was
                //   granted, non-zero for the same reason MsgVote is
                // - MsgPreVote: m.term is the term the node will campaign,
                //   non-zero as we use m.term to indicate the next term we'll be
                //   campaigning for
                // - MsgPreVoteResp: m.term is the term received in the original
                //   MsgPreVote if the pre-vote was granted, non-zero for the
                //   same reasons MsgPreVote is
                fatal!(
                    self.logger,
                    "term should be set when sending {:?}",
                    m.msg_type()
                );
            }
        } else {
            if m.term != 0 {
                fatal!(
                    self.logger,
                    "term should not be set when sending {:?} (was {})",
                    m.msg_type(),
                    m.term
                );
            }
            // do not attach term to MsgPropose, MsgReadIndex
            // proposals are a way to forward to the leader and
            // should be treated as local message.
            // MsgReadIndex is also forwarded to leader.
            if m.msg_type() != MessageType::MsgPropose && m.msg_type() != MessageType::MsgReadIndex
            {
                m.term = self.term;
            }
        }
        self.msgs.push(m);
    }

    fn prepare_send_snapshot(&mut self, m: &mut Message, pr: &mut Progress, to: u64) -> bool {
        if !pr.recent_active {
            debug!(
                self.logger,
                "ignore sending snapshot to {} since it is not recently active",
                to;
            );
            return false;
        }

        m.set_msg_type(MessageType::MsgSnapshot);
        let snapshot_r = self.raft_log.snapshot();
        if let Err(e) = snapshot_r {
            if e == Error::Store(StorageError::SnapshotTemporarilyUnavailable) {
                debug!(
                    self.logger,
                    "snapshot for {} is temporarily unavailable",
                    to;
                );
                return false;
            }
            fatal!(self.logger, "unexpected error: {:?}", e);
        }
        let snapshot = snapshot_r.unwrap();
        if snapshot.get_metadata().index == 0 {
            fatal!(self.logger, "need non-empty snapshot");
        }
        let (sindex, sterm) = (snapshot.get_metadata().index, snapshot.get_metadata().term);
        m.snapshot = Some(snapshot);
        debug!(
            self.logger,
            "sent snapshot[index: {snapshot_index}, term: {snapshot_term}] to {to}",
            snapshot_index = sindex,
            snapshot_term = sterm,
            to = to;
            "progress" => ?pr,
        );
        pr.become_snapshot(sindex);
        true
    }

    fn prepare_send_entries(
        &mut self,
        m: &mut Message,
        pr: &mut Progress,
        term: u64,
        ents: Vec<Entry>,
    ) {
        m.set_msg_type(MessageType::MsgAppend);
        m.index = pr.next_idx - 1;
        m.log_term = term;
        m.entries = ents;
        m.commit = self.raft_log.committed;
        if !m.entries.is_empty() {
            let last = m.entries.last().unwrap().index;
            pr.update_state(last);
        }
    }

    /// Sends an append RPC with new entries (if any) and the current commit
    /// index to the given peer.
    pub fn send_append(&mut self, to: u64, pr: &mut Progress) {
        self.maybe_send_append(to, pr, true);
    }

    /// Sends an append RPC with new entries to the given peer, if necessary.
    /// Returns true if a message was sent. The `send_if_empty` argument
    /// controls whether messages with no entries will be sent ("empty"
    /// messages are useful to convey updated commit indexes, but are
    /// undesirable when we're sending multiple messages in a batch).
    pub fn maybe_send_append(&mut self, to: u64, pr: &mut Progress, send_if_empty: bool) -> bool {
        if pr.is_paused() {
            return false;
        }
        let term = self.raft_log.term(pr.next_idx - 1);
        let ents = self.raft_log.entries(pr.next_idx, self.max_msg_size);
        if !send_if_empty && ents.as_ref().map_or(true, |e| e.is_empty()) {
            return false;
        }
        let mut m = Message::default();
        m.to = to;
        if term.is_err() || ents.is_err() {
            // the next index is already compacted away; ship a snapshot instead
            if !self.prepare_send_snapshot(&mut m, pr, to) {
                return false;
            }
        } else {
            self.prepare_send_entries(&mut m, pr, term.unwrap(), ents.unwrap());
        }
        self.send(m);
        true
    }

    // A heartbeat carries min(pr.matched, committed): the follower may not
    // have everything we committed yet, and commit must never point past the
    // entries it actually holds.
    fn send_heartbeat(&mut self, to: u64, pr: &Progress, ctx: Option<Vec<u8>>) {
        let mut m = Message::default();
        m.to = to;
        m.set_msg_type(MessageType::MsgHeartbeat);
        m.commit = cmp::min(pr.matched, self.raft_log.committed);
        if let Some(context) = ctx {
            m.context = context;
        }
        self.send(m);
    }

    /// Sends an append RPC to every other peer.
    pub fn bcast_append(&mut self) {
        let self_id = self.id;
        let mut prs = self.take_prs();
        prs.iter_mut()
            .filter(|&(id, _)| *id != self_id)
            .for_each(|(id, pr)| self.send_append(*id, pr));
        self.set_prs(prs);
    }

    /// Sends a heartbeat to every other peer.
    pub fn bcast_heartbeat(&mut self) {
        let ctx = self.read_only.last_pending_request_ctx();
        self.bcast_heartbeat_with_ctx(ctx)
    }

    fn bcast_heartbeat_with_ctx(&mut self, ctx: Option<Vec<u8>>) {
        let self_id = self.id;
        let mut prs = self.take_prs();
        prs.iter_mut()
            .filter(|&(id, _)| *id != self_id)
            .for_each(|(id, pr)| self.send_heartbeat(*id, pr, ctx.clone()));
        self.set_prs(prs);
    }

    /// Attempts to advance the commit index to the highest index a quorum of
    /// voters has matched. Returns true if the commit index changed (in which
    /// case the caller should call `bcast_append`).
    pub fn maybe_commit(&mut self) -> bool {
        let mci = {
            let prs = self.prs();
            let mut matched: Vec<u64> = prs.voters().values().map(|pr| pr.matched).collect();
            matched.sort_unstable_by(|a, b| b.cmp(a));
            matched[self.quorum() - 1]
        };
        let committed_before = self.raft_log.committed;
        if self.raft_log.maybe_commit(mci, self.term) {
            let committed = self.raft_log.committed;
            if committed > committed_before {
                if let Ok(ents) =
                    self.raft_log
                        .slice(committed_before + 1, committed + 1, util::NO_LIMIT)
                {
                    self.reduce_uncommitted_size(&ents);
                }
            }
            true
        } else {
            false
        }
    }

    /// Adds the payload sizes of the proposed entries to the uncommitted
    /// tally. Returns false (and leaves the tally alone) when the proposal
    /// would push the tally past `max_uncommitted_size`, unless nothing is
    /// currently uncommitted.
    pub fn increase_uncommitted_size(&mut self, ents: &[Entry]) -> bool {
        let size: u64 = ents.iter().map(util::payload_size).sum();
        if self.uncommitted_size > 0
            && size > 0
            && self.uncommitted_size + size > self.max_uncommitted_size
        {
            return false;
        }
        self.uncommitted_size += size;
        true
    }

    /// Reduces the uncommitted tally by the payload sizes of newly committed
    /// entries.
    pub fn reduce_uncommitted_size(&mut self, ents: &[Entry]) {
        if self.uncommitted_size == 0 {
            // followers do not track the tally
            return;
        }
        let size: u64 = ents.iter().map(util::payload_size).sum();
        if size > self.uncommitted_size {
            // the tally may underestimate the tail after a leader change
            self.uncommitted_size = 0;
        } else {
            self.uncommitted_size -= size;
        }
    }

    /// Resets the node for a given term: forgets the leader, the election
    /// bookkeeping and any in-flight transfer or read, and restarts every
    /// peer's progress from the end of the log.
    pub fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = INVALID_ID;
        }
        self.leader_id = INVALID_ID;

        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();

        self.abort_leader_transfer();

        self.votes.clear();

        let last_index = self.raft_log.last_index();
        let self_id = self.id;
        for (&id, pr) in self.mut_prs().iter_mut() {
            pr.reset(last_index + 1);
            if id == self_id {
                pr.matched = last_index;
            }
        }

        self.pending_conf_index = 0;
        self.uncommitted_size = 0;
        self.read_only.pending_read_index.clear();
        self.read_only.read_index_queue.clear();
    }

    /// Appends a slice of entries to the log. The entries are updated to match
    /// the current index and term. Returns false when the entries are refused
    /// by the uncommitted-size admission check.
    pub fn append_entry(&mut self, es: &mut [Entry]) -> bool {
        if !self.increase_uncommitted_size(es) {
            return false;
        }

        let mut li = self.raft_log.last_index();
        for (i, e) in es.iter_mut().enumerate() {
            e.term = self.term;
            e.index = li + 1 + i as u64;
        }
        li = self.raft_log.append(es);

        let self_id = self.id;
        self.mut_prs().get_mut(self_id).unwrap().maybe_update(li);

        // The caller is on the propose path and will broadcast afterwards.
        self.maybe_commit();
        true
    }

    /// Advances the logical clock by one tick. Returns true if the tick
    /// produced output for the host to drain.
    pub fn tick(&mut self) -> bool {
        match self.state {
            StateRole::Follower | StateRole::PreCandidate | StateRole::Candidate => {
                self.tick_election()
            }
            StateRole::Leader => self.tick_heartbeat(),
        }
    }

    /// The follower/candidate tick: count up towards the randomized election
    /// timeout and campaign when it fires.
    pub fn tick_election(&mut self) -> bool {
        self.election_elapsed += 1;
        if !self.promotable() || !self.past_election_timeout() {
            return false;
        }

        self.election_elapsed = 0;
        let m = new_message(INVALID_ID, MessageType::MsgHup, Some(self.id));
        let _ = self.step(m);
        true
    }

    // The leader tick: heartbeat on every heartbeat interval, and once per
    // election interval verify the quorum is still reachable and give up on
    // a stalled leadership transfer.
    fn tick_heartbeat(&mut self) -> bool {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        let mut has_ready = false;
        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                let m = new_message(INVALID_ID, MessageType::MsgCheckQuorum, Some(self.id));
                has_ready = true;
                let _ = self.step(m);
            }
            if self.state == StateRole::Leader && self.lead_transferee.is_some() {
                self.abort_leader_transfer()
            }
        }

        if self.state != StateRole::Leader {
            return has_ready;
        }

        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            has_ready = true;
            let m = new_message(INVALID_ID, MessageType::MsgBeat, Some(self.id));
            let _ = self.step(m);
        }
        has_ready
    }

    /// Converts this node to a follower.
    pub fn become_follower(&mut self, term: u64, leader_id: u64) {
        self.reset(term);
        self.leader_id = leader_id;
        self.state = StateRole::Follower;
        info!(
            self.logger,
            "became follower at term {term}",
            term = self.term;
        );
    }

    /// Converts this node to a candidate.
    ///
    /// # Panics
    ///
    /// Panics if called on a leader.
    pub fn become_candidate(&mut self) {
        assert_ne!(
            self.state,
            StateRole::Leader,
            "invalid transition [leader -> candidate]"
        );
        let term = self.term + 1;
        self.reset(term);
        let id = self.id;
        self.vote = id;
        self.state = StateRole::Candidate;
        info!(
            self.logger,
            "became candidate at term {term}",
            term = self.term;
        );
    }

    /// Converts this node to a pre-candidate. Unlike a real candidacy this
    /// changes neither the term nor the vote.
    ///
    /// # Panics
    ///
    /// Panics if called on a leader.
    pub fn become_pre_candidate(&mut self) {
        assert_ne!(
            self.state,
            StateRole::Leader,
            "invalid transition [leader -> pre-candidate]"
        );
        self.state = StateRole::PreCandidate;
        self.votes.clear();
        // A leader stepping down in a minority partition cannot tell anyone,
        // so stop following it from here.
        self.leader_id = INVALID_ID;
        info!(
            self.logger,
            "became pre-candidate at term {term}",
            term = self.term;
        );
    }

    /// Makes this raft the leader.
    ///
    /// # Panics
    ///
    /// Panics if called on a follower.
    pub fn become_leader(&mut self) {
        assert_ne!(
            self.state,
            StateRole::Follower,
            "invalid transition [follower -> leader]"
        );
        let term = self.term;
        self.reset(term);
        self.leader_id = self.id;
        self.state = StateRole::Leader;

        let id = self.id;
        self.mut_prs().get_mut(id).unwrap().become_replicate();

        // There may be a conf change somewhere in the unapplied tail; block
        // further conf proposals until the whole tail is applied rather than
        // scanning it.
        self.pending_conf_index = self.raft_log.last_index();

        // The no-op has an empty payload, so the uncommitted-size admission
        // check never refuses it.
        self.append_entry(&mut [Entry::default()]);

        info!(
            self.logger,
            "became leader at term {term}",
            term = self.term;
        );
    }

    /// Campaign to attempt to become a leader.
    pub fn campaign(&mut self, campaign_type: &[u8]) {
        let (vote_msg, term) = if campaign_type == CAMPAIGN_PRE_ELECTION {
            self.become_pre_candidate();
            // PreVote RPCs are sent for the next term before we've incremented r.Term.
            (MessageType::MsgRequestPreVote, self.term + 1)
        } else {
            self.become_candidate();
            (MessageType::MsgRequestVote, self.term)
        };
        let self_id = self.id;
        if self.quorum() == self.poll(self_id, vote_resp_msg_type(vote_msg), true) {
            // We won the election after voting for ourselves (which must mean that
            // this is a single-node cluster). Advance to the next state.
            if campaign_type == CAMPAIGN_PRE_ELECTION {
                self.campaign(CAMPAIGN_ELECTION);
            } else {
                self.become_leader();
            }
            return;
        }

        let prs = self.take_prs();
        prs.nodes()
            .iter()
            .filter(|&id| *id != self_id)
            .for_each(|&id| {
                info!(
                    self.logger,
                    "[logterm: {log_term}, index: {log_index}] sent {msg:?} request to {id} at term {term}",
                    log_term = self.raft_log.last_term(),
                    log_index = self.raft_log.last_index(),
                    msg = format!("{vote_msg:?}"),
                    id = id,
                    term = self.term;
                );
                let mut m = new_message(id, vote_msg, None);
                m.term = term;
                m.index = self.raft_log.last_index();
                m.log_term = self.raft_log.last_term();
                if campaign_type == CAMPAIGN_TRANSFER {
                    m.context = campaign_type.to_vec();
                }
                self.send(m);
            });
        self.set_prs(prs);
    }

    /// Records the vote of `id` and returns how many grants this candidacy
    /// has collected so far.
    fn poll(&mut self, id: u64, t: MessageType, vote: bool) -> usize {
        if vote {
            info!(
                self.logger,
                "received {msg_type:?} from {from} at term {term}",
                msg_type = format!("{t:?}"),
                from = id,
                term = self.term;
            );
        } else {
            info!(
                self.logger,
                "received {msg_type:?} rejection from {from} at term {term}",
                msg_type = format!("{t:?}"),
                from = id,
                term = self.term;
            );
        }
        self.votes.entry(id).or_insert(vote);
        self.votes.values().filter(|x| **x).count()
    }

    /// Steps the raft along via a message. This should be called every time
    /// the raft receives a message from a peer or the host.
    pub fn step(&mut self, m: Message) -> Result<()> {
        // First reconcile terms; this may demote us to follower.
        if m.term == 0 {
            // local message
        } else if m.term > self.term {
            if m.msg_type() == MessageType::MsgRequestVote
                || m.msg_type() == MessageType::MsgRequestPreVote
            {
                // While we still hear from a live leader, a vote request is
                // noise from a disconnected peer; only a leadership transfer
                // may force its way through the lease.
                let force = m.context == CAMPAIGN_TRANSFER;
                let in_lease = self.check_quorum
                    && self.leader_id != INVALID_ID
                    && self.election_elapsed < self.election_timeout;
                if !force && in_lease {
                    info!(
                        self.logger,
                        "ignored vote of type {msg_type:?} from {from}: lease is not expired",
                        msg_type = format!("{:?}", m.msg_type()),
                        from = m.from;
                        "term" => self.term,
                        "msg term" => m.term,
                    );
                    return Ok(());
                }
            }

            if m.msg_type() == MessageType::MsgRequestPreVote
                || (m.msg_type() == MessageType::MsgRequestPreVoteResponse && !m.reject)
            {
                // A pre-vote request never moves our term, and neither does a
                // granted pre-vote response: the term in it is the future term
                // we put there ourselves. A REJECTED pre-vote response with a
                // higher term falls through and demotes us below.
            } else {
                info!(
                    self.logger,
                    "received a message with higher term from {from}",
                    from = m.from;
                    "term" => self.term,
                    "message_term" => m.term,
                    "msg type" => ?m.msg_type(),
                );
                if m.msg_type() == MessageType::MsgAppend
                    || m.msg_type() == MessageType::MsgHeartbeat
                    || m.msg_type() == MessageType::MsgSnapshot
                {
                    self.become_follower(m.term, m.from);
                } else {
                    self.become_follower(m.term, INVALID_ID);
                }
            }
        } else if m.term < self.term {
            if (self.check_quorum || self.pre_vote)
                && (m.msg_type() == MessageType::MsgHeartbeat
                    || m.msg_type() == MessageType::MsgAppend)
            {
                // With check_quorum or pre_vote on, a deposed leader may never
                // learn about the new term through vote requests. Answer its
                // stale traffic with an (empty) append response carrying our
                // term so it can step down.
                let to_send = new_message(m.from, MessageType::MsgAppendResponse, None);
                self.send(to_send);
            } else if m.msg_type() == MessageType::MsgRequestPreVote {
                // Reject explicitly rather than dropping, or a mixed cluster
                // upgraded to pre-vote could end up with a candidate stuck at
                // a higher term that no one ever answers.
                info!(
                    self.logger,
                    "rejected pre-vote from {from} at lower term {msg_term}",
                    from = m.from,
                    msg_term = m.term;
                    "term" => self.term,
                );
                let mut to_send = new_message(m.from, MessageType::MsgRequestPreVoteResponse, None);
                to_send.term = self.term;
                to_send.reject = true;
                self.send(to_send);
            } else {
                info!(
                    self.logger,
                    "ignored a message with lower term from {from}",
                    from = m.from;
                    "term" => self.term,
                    "msg type" => ?m.msg_type(),
                    "msg term" => m.term
                );
            }
            return Ok(());
        }

        match m.msg_type() {
            MessageType::MsgHup => self.hup(false),
            MessageType::MsgRequestVote | MessageType::MsgRequestPreVote => {
                if self.is_learner {
                    // Learners replicate the log but have no say in elections.
                    info!(
                        self.logger,
                        "ignored vote request from {from} since this node is a learner",
                        from = m.from;
                        "term" => self.term,
                        "msg type" => ?m.msg_type(),
                    );
                    return Ok(());
                }

                // Grant when this repeats a vote we already cast, or we have
                // neither voted nor heard a leader this term, or it is a
                // pre-vote for a future term; and in all cases only when the
                // candidate's log is at least as up to date as ours.
                let can_vote = (self.vote == m.from)
                    || (self.vote == INVALID_ID && self.leader_id == INVALID_ID)
                    || (m.msg_type() == MessageType::MsgRequestPreVote && m.term > self.term);
                if can_vote && self.raft_log.is_up_to_date(m.index, m.log_term) {
                    info!(
                        self.logger,
                        "[logterm: {log_term}, index: {log_index}, vote: {vote}] cast vote for {from} at term {term}",
                        log_term = self.raft_log.last_term(),
                        log_index = self.raft_log.last_index(),
                        vote = self.vote,
                        from = m.from,
                        term = self.term;
                        "msg type" => ?m.msg_type(),
                    );
                    // Respond with the term from the request, not our own: a
                    // pre-vote is for a term we have not adopted, and the
                    // campaigner would discard a response at its old term.
                    let mut to_send = new_message(m.from, vote_resp_msg_type(m.msg_type()), None);
                    to_send.reject = false;
                    to_send.term = m.term;
                    self.send(to_send);
                    if m.msg_type() == MessageType::MsgRequestVote {
                        // Only record real votes.
                        self.election_elapsed = 0;
                        self.vote = m.from;
                    }
                } else {
                    info!(
                        self.logger,
                        "[logterm: {log_term}, index: {log_index}, vote: {vote}] rejected vote from {from} at term {term}",
                        log_term = self.raft_log.last_term(),
                        log_index = self.raft_log.last_index(),
                        vote = self.vote,
                        from = m.from,
                        term = self.term;
                        "msg type" => ?m.msg_type(),
                    );
                    let mut to_send = new_message(m.from, vote_resp_msg_type(m.msg_type()), None);
                    to_send.reject = true;
                    to_send.term = self.term;
                    self.send(to_send);
                }
            }
            _ => match self.state {
                StateRole::PreCandidate | StateRole::Candidate => self.step_candidate(m)?,
                StateRole::Follower => self.step_follower(m)?,
                StateRole::Leader => self.step_leader(m)?,
            },
        }
        Ok(())
    }

    fn hup(&mut self, transfer_leader: bool) {
        if self.state == StateRole::Leader {
            debug!(
                self.logger,
                "ignoring MsgHup because already leader";
            );
            return;
        }

        let ents = self
            .raft_log
            .slice(
                self.raft_log.applied + 1,
                self.raft_log.committed + 1,
                None,
            )
            .unwrap_or_else(|e| {
                fatal!(
                    self.logger,
                    "unexpected error getting unapplied entries ({:?})",
                    e
                );
            });
        let pending = num_of_pending_conf(&ents);
        if pending > 0 && self.raft_log.committed > self.raft_log.applied {
            warn!(
                self.logger,
                "cannot campaign at term {term} since there are still {pending} pending \
                 configuration changes to apply",
                term = self.term,
                pending = pending;
            );
            return;
        }
        info!(
            self.logger,
            "starting a new election";
            "term" => self.term,
        );
        if transfer_leader {
            self.campaign(CAMPAIGN_TRANSFER);
        } else if self.pre_vote {
            self.campaign(CAMPAIGN_PRE_ELECTION);
        } else {
            self.campaign(CAMPAIGN_ELECTION);
        }
    }

    fn handle_append_response(
        &mut self,
        m: &Message,
        prs: &mut ProgressSet,
        old_paused: &mut bool,
        send_append: &mut bool,
        progress_updated: &mut bool,
    ) {
        let pr = prs.get_mut(m.from).unwrap();
        pr.recent_active = true;

        if m.reject {
            debug!(
                self.logger,
                "received msgAppend rejection";
                "reject hint" => m.reject_hint,
                "from" => m.from,
                "index" => m.index,
            );

            if pr.maybe_decr_to(m.index, m.reject_hint) {
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                *send_append = true;
            }
            return;
        }

        *old_paused = pr.is_paused();
        if !pr.maybe_update(m.index) {
            return;
        }

        if let Some(lead_transferee) = self.lead_transferee {
            if m.from == lead_transferee && pr.matched == self.raft_log.last_index() {
                info!(
                    self.logger,
                    "sent MsgTimeoutNow to {from} after received MsgAppResp",
                    from = m.from;
                );
                self.send_timeout_now(m.from);
            }
        }

        match pr.state {
            ProgressState::Probe => pr.become_replicate(),
            ProgressState::Snapshot => {
                if !pr.maybe_snapshot_abort() {
                    return;
                }
                debug!(
                    self.logger,
                    "snapshot caught up, resumed sending replication messages to {from}",
                    from = m.from;
                    "progress" => ?pr,
                );
                pr.become_probe();
            }
            ProgressState::Replicate => pr.ins.free_to(m.index),
        }
        *progress_updated = true;
    }

    fn handle_heartbeat_response(
        &mut self,
        m: &Message,
        prs: &mut ProgressSet,
        send_append: &mut bool,
        more_to_send: &mut Vec<Message>,
    ) {
        {
            let pr = prs.get_mut(m.from).unwrap();
            pr.recent_active = true;
            pr.resume();

            // free one slot for the full inflights window to allow progress.
            if pr.state == ProgressState::Replicate && pr.ins.full() {
                pr.ins.free_first_one();
            }
            if pr.matched < self.raft_log.last_index() {
                *send_append = true;
            }

            if self.read_only.option != ReadOnlyOption::Safe || m.context.is_empty() {
                return;
            }
        }

        let quorum = util::majority(prs.voters().len());
        if self.read_only.recv_ack(m.from, &m.context) < quorum {
            return;
        }

        for rs in self.read_only.advance(&m.context) {
            let mut req = rs.req;
            if req.from == INVALID_ID || req.from == self.id {
                // from local member
                let rs = ReadState {
                    index: rs.index,
                    request_ctx: std::mem::take(&mut req.entries[0].data),
                };
                self.read_states.push(rs);
            } else {
                let mut to_send = Message::default();
                to_send.set_msg_type(MessageType::MsgReadIndexResp);
                to_send.to = req.from;
                to_send.index = rs.index;
                to_send.entries = std::mem::take(&mut req.entries);
                more_to_send.push(to_send);
            }
        }
    }

    fn handle_transfer_leader(&mut self, m: &Message, prs: &mut ProgressSet) {
        let from = m.from;
        if prs.learners().contains_key(&from) {
            debug!(
                self.logger,
                "ignored transferring leadership to a learner";
            );
            return;
        }
        let lead_transferee = from;
        if let Some(last) = self.lead_transferee {
            if last == lead_transferee {
                info!(
                    self.logger,
                    "[term {term}] transfer leadership to {lead_transferee} is in progress, ignores request \
                     to same node {lead_transferee}",
                    term = self.term,
                    lead_transferee = lead_transferee;
                );
                return;
            }
            self.abort_leader_transfer();
            info!(
                self.logger,
                "[term {term}] abort previous transferring leadership to {last}",
                term = self.term,
                last = last;
            );
        }
        if lead_transferee == self.id {
            debug!(
                self.logger,
                "already leader; ignored transferring leadership to self";
            );
            return;
        }
        info!(
            self.logger,
            "[term {term}] starts to transfer leadership to {lead_transferee}",
            term = self.term,
            lead_transferee = lead_transferee;
        );
        // The transfer must finish within one election timeout, or it is
        // aborted and normal operation resumes.
        self.election_elapsed = 0;
        self.lead_transferee = Some(lead_transferee);
        let pr = prs.get_mut(from).unwrap();
        if pr.matched == self.raft_log.last_index() {
            self.send_timeout_now(lead_transferee);
            info!(
                self.logger,
                "sends MsgTimeoutNow to {lead_transferee} immediately as {lead_transferee} already has up-to-date log",
                lead_transferee = lead_transferee;
            );
        } else {
            self.send_append(lead_transferee, pr);
        }
    }

    fn handle_snapshot_status(&mut self, m: &Message, pr: &mut Progress) {
        if m.reject {
            pr.snapshot_failure();
            pr.become_probe();
            debug!(
                self.logger,
                "snapshot failed, resumed sending replication messages to {from}",
                from = m.from;
                "progress" => ?pr,
            );
        } else {
            pr.become_probe();
            debug!(
                self.logger,
                "snapshot succeeded, resumed sending replication messages to {from}",
                from = m.from;
                "progress" => ?pr,
            );
        }
        // On success, wait for the append response before probing further; on
        // failure, wait out a heartbeat interval before the next try.
        pr.pause();
    }

    fn step_leader(&mut self, mut m: Message) -> Result<()> {
        match m.msg_type() {
            MessageType::MsgBeat => {
                self.bcast_heartbeat();
                return Ok(());
            }
            MessageType::MsgCheckQuorum => {
                if !self.check_quorum_active() {
                    warn!(
                        self.logger,
                        "stepped down to follower since quorum is not active";
                    );
                    let term = self.term;
                    self.become_follower(term, INVALID_ID);
                }
                return Ok(());
            }
            MessageType::MsgPropose => {
                if m.entries.is_empty() {
                    fatal!(self.logger, "stepped empty MsgProp");
                }
                if !self.prs().voters().contains_key(&self.id) {
                    // This node was removed from the configuration while
                    // serving as leader; drop any new proposals.
                    return Err(Error::ProposalDropped);
                }
                if self.lead_transferee.is_some() {
                    debug!(
                        self.logger,
                        "[term {term}] transfer leadership to {lead_transferee} is in progress; dropping \
                         proposal",
                        term = self.term,
                        lead_transferee = self.lead_transferee.unwrap();
                    );
                    return Err(Error::ProposalDropped);
                }

                for (i, e) in m.entries.iter_mut().enumerate() {
                    if e.entry_type() == EntryType::EntryConfChange {
                        if self.has_pending_conf() {
                            info!(
                                self.logger,
                                "propose conf entry ignored since pending unapplied configuration";
                                "index" => self.pending_conf_index,
                                "applied" => self.raft_log.applied,
                            );
                            *e = Entry::default();
                            e.set_entry_type(EntryType::EntryNormal);
                        } else {
                            self.pending_conf_index = self.raft_log.last_index() + i as u64 + 1;
                        }
                    }
                }
                if !self.append_entry(&mut m.entries) {
                    debug!(
                        self.logger,
                        "dropping proposal, the uncommitted log is full";
                        "uncommitted size" => self.uncommitted_size,
                    );
                    return Err(Error::ProposalDropped);
                }
                self.bcast_append();
                return Ok(());
            }
            MessageType::MsgReadIndex => {
                if self.raft_log.term(self.raft_log.committed).unwrap_or(0) != self.term {
                    // No entry of this term has committed yet, so the commit
                    // index may still move backwards relative to what a prior
                    // leader promised. Ignore the read until the no-op lands.
                    return Ok(());
                }

                if self.quorum() > 1 {
                    match self.read_only.option {
                        ReadOnlyOption::Safe => {
                            let ctx = m.entries[0].data.to_vec();
                            let id = self.id;
                            self.read_only.add_request(self.raft_log.committed, m, id);
                            self.bcast_heartbeat_with_ctx(Some(ctx));
                        }
                        ReadOnlyOption::LeaseBased => {
                            let read_index = self.raft_log.committed;
                            if m.from == INVALID_ID || m.from == self.id {
                                let rs = ReadState {
                                    index: read_index,
                                    request_ctx: std::mem::take(&mut m.entries[0].data),
                                };
                                self.read_states.push(rs);
                            } else {
                                let mut to_send = Message::default();
                                to_send.set_msg_type(MessageType::MsgReadIndexResp);
                                to_send.to = m.from;
                                to_send.index = read_index;
                                to_send.entries = std::mem::take(&mut m.entries);
                                self.send(to_send);
                            }
                        }
                    }
                } else {
                    // Sole voter; the commit index is the read index.
                    if m.from == INVALID_ID || m.from == self.id {
                        let rs = ReadState {
                            index: self.raft_log.committed,
                            request_ctx: std::mem::take(&mut m.entries[0].data),
                        };
                        self.read_states.push(rs);
                    } else {
                        let mut to_send = Message::default();
                        to_send.set_msg_type(MessageType::MsgReadIndexResp);
                        to_send.to = m.from;
                        to_send.index = self.raft_log.committed;
                        to_send.entries = std::mem::take(&mut m.entries);
                        self.send(to_send);
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        // Everything below is a response from a specific peer and means
        // nothing without its progress.
        if self.prs().get(m.from).is_none() {
            debug!(
                self.logger,
                "no progress available for {}",
                m.from;
            );
            return Ok(());
        }

        let mut send_append = false;
        let mut old_paused = false;
        let mut progress_updated = false;
        let mut more_to_send = vec![];

        let mut prs = self.take_prs();
        match m.msg_type() {
            MessageType::MsgAppendResponse => {
                self.handle_append_response(
                    &m,
                    &mut prs,
                    &mut old_paused,
                    &mut send_append,
                    &mut progress_updated,
                );
            }
            MessageType::MsgHeartbeatResponse => {
                self.handle_heartbeat_response(&m, &mut prs, &mut send_append, &mut more_to_send);
            }
            MessageType::MsgSnapStatus => {
                let pr = prs.get_mut(m.from).unwrap();
                if pr.state == ProgressState::Snapshot {
                    self.handle_snapshot_status(&m, pr);
                }
            }
            MessageType::MsgUnreachable => {
                let pr = prs.get_mut(m.from).unwrap();
                // An optimistically pipelined append has likely been lost;
                // fall back to probing.
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                debug!(
                    self.logger,
                    "failed to send message to {from} because it is unreachable",
                    from = m.from;
                    "progress" => ?pr,
                );
            }
            MessageType::MsgTransferLeader => {
                self.handle_transfer_leader(&m, &mut prs);
            }
            _ => {}
        }
        self.set_prs(prs);

        if progress_updated {
            if self.maybe_commit() {
                self.bcast_append();
            } else if old_paused {
                // The peer was blocked before this response freed it; resume
                // the probe we were holding back.
                send_append = true;
            }
        }

        if send_append {
            let from = m.from;
            let mut prs = self.take_prs();
            if let Some(pr) = prs.get_mut(from) {
                self.send_append(from, pr);
            }
            self.set_prs(prs);
        }
        if progress_updated && self.prs().get(m.from).is_some() {
            // The window may have opened; keep pipelining entries to the
            // peer until it fills or the log drains.
            let from = m.from;
            let mut prs = self.take_prs();
            while self.maybe_send_append(from, prs.get_mut(from).unwrap(), false) {}
            self.set_prs(prs);
        }
        for to_send in more_to_send.drain(..) {
            self.send(to_send);
        }

        Ok(())
    }

    // step_candidate is shared by state Candidate and PreCandidate; the difference is
    // whether they respond to MsgRequestVote or MsgRequestPreVote.
    fn step_candidate(&mut self, m: Message) -> Result<()> {
        match m.msg_type() {
            MessageType::MsgPropose => {
                info!(
                    self.logger,
                    "no leader at term {term}; dropping proposal",
                    term = self.term;
                );
                return Err(Error::ProposalDropped);
            }
            MessageType::MsgAppend => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_append_entries(&m);
            }
            MessageType::MsgHeartbeat => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m);
            }
            MessageType::MsgSnapshot => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m);
            }
            MessageType::MsgRequestPreVoteResponse | MessageType::MsgRequestVoteResponse => {
                // A candidate that just left pre-candidacy may still receive
                // stale pre-vote responses in this term; count only responses
                // that match the current candidacy.
                if (self.state == StateRole::PreCandidate
                    && m.msg_type() != MessageType::MsgRequestPreVoteResponse)
                    || (self.state == StateRole::Candidate
                        && m.msg_type() != MessageType::MsgRequestVoteResponse)
                {
                    return Ok(());
                }

                let acceptance = !m.reject;
                let msg_type = m.msg_type();
                let from_id = m.from;
                let gr = self.poll(from_id, msg_type, acceptance);
                let quorum = self.quorum();
                if quorum == gr {
                    if self.state == StateRole::PreCandidate {
                        self.campaign(CAMPAIGN_ELECTION);
                    } else {
                        self.become_leader();
                        self.bcast_append();
                    }
                } else if quorum == self.votes.len() - gr {
                    // A quorum of rejections dooms this candidacy; fall back
                    // to follower at the current term (a pre-vote response
                    // carries our future term, which must not be adopted).
                    let term = self.term;
                    self.become_follower(term, INVALID_ID);
                }
            }
            MessageType::MsgTimeoutNow => debug!(
                self.logger,
                "{term} ignored MsgTimeoutNow from {from}",
                term = self.term,
                from = m.from;
                "state" => ?self.state,
            ),
            _ => {}
        }
        Ok(())
    }

    fn step_follower(&mut self, mut m: Message) -> Result<()> {
        match m.msg_type() {
            MessageType::MsgPropose => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping proposal",
                        term = self.term;
                    );
                    return Err(Error::ProposalDropped);
                } else if self.disable_proposal_forwarding {
                    info!(
                        self.logger,
                        "not forwarding to leader {leader_id} at term {term}; dropping proposal",
                        leader_id = self.leader_id,
                        term = self.term;
                    );
                    return Err(Error::ProposalDropped);
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::MsgAppend => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_append_entries(&m);
            }
            MessageType::MsgHeartbeat => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_heartbeat(m);
            }
            MessageType::MsgSnapshot => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_snapshot(m);
            }
            MessageType::MsgTransferLeader => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping leader transfer msg",
                        term = self.term;
                    );
                    return Ok(());
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::MsgTimeoutNow => {
                if self.promotable() {
                    info!(
                        self.logger,
                        "[term {term}] received MsgTimeoutNow from {from} and starts an election to \
                         get leadership",
                        term = self.term,
                        from = m.from;
                    );
                    // A transfer target is not recovering from a partition, so
                    // the campaign skips the pre-vote round.
                    self.hup(true);
                } else {
                    info!(
                        self.logger,
                        "received MsgTimeoutNow from {} but is not promotable",
                        m.from;
                    );
                }
            }
            MessageType::MsgReadIndex => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping index reading msg",
                        term = self.term;
                    );
                    return Ok(());
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::MsgReadIndexResp => {
                if m.entries.len() != 1 {
                    error!(
                        self.logger,
                        "invalid format of MsgReadIndexResp from {}",
                        m.from;
                        "entries count" => m.entries.len(),
                    );
                    return Ok(());
                }
                let rs = ReadState {
                    index: m.index,
                    request_ctx: std::mem::take(&mut m.entries[0].data),
                };
                self.read_states.push(rs);
            }
            _ => {}
        }
        Ok(())
    }

    /// For a given message, append the entries to the log.
    pub fn handle_append_entries(&mut self, m: &Message) {
        if m.index < self.raft_log.committed {
            // A duplicate of something already committed; just report where
            // we are.
            let mut to_send = Message::default();
            to_send.set_msg_type(MessageType::MsgAppendResponse);
            to_send.to = m.from;
            to_send.index = self.raft_log.committed;
            self.send(to_send);
            return;
        }

        let mut to_send = Message::default();
        to_send.to = m.from;
        to_send.set_msg_type(MessageType::MsgAppendResponse);

        if let Some((_, last_idx)) = self
            .raft_log
            .maybe_append(m.index, m.log_term, m.commit, &m.entries)
        {
            to_send.index = last_idx;
            self.send(to_send);
        } else {
            debug!(
                self.logger,
                "rejected msgApp [logterm: {msg_log_term}, index: {msg_index}] \
                 from {from}",
                msg_log_term = m.log_term,
                msg_index = m.index,
                from = m.from;
                "logterm" => ?self.raft_log.term(m.index),
            );
            to_send.index = m.index;
            to_send.reject = true;
            to_send.reject_hint = self.raft_log.last_index();
            self.send(to_send);
        }
    }

    /// For a message, commit and send out heartbeat.
    pub fn handle_heartbeat(&mut self, mut m: Message) {
        self.raft_log.commit_to(m.commit);
        let mut to_send = Message::default();
        to_send.set_msg_type(MessageType::MsgHeartbeatResponse);
        to_send.to = m.from;
        to_send.context = std::mem::take(&mut m.context);
        self.send(to_send);
    }

    fn handle_snapshot(&mut self, mut m: Message) {
        let metadata = m.get_snapshot().get_metadata();
        let (sindex, sterm) = (metadata.index, metadata.term);
        if self.restore(m.take_snapshot()) {
            info!(
                self.logger,
                "[commit: {commit}, term: {term}] restored snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                term = self.term,
                commit = self.raft_log.committed,
                snapshot_index = sindex,
                snapshot_term = sterm;
            );
            let mut to_send = Message::default();
            to_send.set_msg_type(MessageType::MsgAppendResponse);
            to_send.to = m.from;
            to_send.index = self.raft_log.last_index();
            self.send(to_send);
        } else {
            info!(
                self.logger,
                "[commit: {commit}] ignored snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                commit = self.raft_log.committed,
                snapshot_index = sindex,
                snapshot_term = sterm;
            );
            let mut to_send = Message::default();
            to_send.set_msg_type(MessageType::MsgAppendResponse);
            to_send.to = m.from;
            to_send.index = self.raft_log.committed;
            self.send(to_send);
        }
    }

    /// Recovers the state machine from a snapshot: adopts its log position
    /// and its membership.
    pub fn restore(&mut self, snap: Snapshot) -> bool {
        if snap.get_metadata().index <= self.raft_log.committed {
            return false;
        }

        let meta = snap.get_metadata();
        if self.raft_log.match_term(meta.index, meta.term) {
            // We already hold the snapshot's last entry; only the commit
            // index needs to move.
            info!(
                self.logger,
                "fast-forwarded commit to snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                snapshot_index = meta.index,
                snapshot_term = meta.term;
                "commit" => self.raft_log.committed,
            );
            let index = meta.index;
            self.raft_log.commit_to(index);
            return false;
        }

        // A voter never demotes itself to a learner on the say-so of a
        // snapshot.
        if self.promotable() {
            for &id in &meta.get_conf_state().learners {
                if id == self.id {
                    error!(
                        self.logger,
                        "can't become learner when restores snapshot";
                        "snapshot index" => meta.index,
                        "snapshot term" => meta.term,
                    );
                    return false;
                }
            }
        }

        info!(
            self.logger,
            "starts to restore snapshot [index: {snapshot_index}, term: {snapshot_term}]",
            snapshot_index = meta.index,
            snapshot_term = meta.term;
            "commit" => self.raft_log.committed,
            "last index" => self.raft_log.last_index(),
            "last term" => self.raft_log.last_term(),
        );

        let nodes = meta.get_conf_state().nodes.clone();
        let learners = meta.get_conf_state().learners.clone();
        self.raft_log.restore(snap);

        self.prs = Some(ProgressSet::with_capacity(nodes.len(), learners.len()));
        let next_idx = self.raft_log.last_index() + 1;
        let self_id = self.id;
        for &id in &nodes {
            let matched = if id == self_id { next_idx - 1 } else { 0 };
            self.set_progress(id, matched, next_idx, false);
        }
        for &id in &learners {
            let matched = if id == self_id { next_idx - 1 } else { 0 };
            self.set_progress(id, matched, next_idx, true);
        }
        self.is_learner = learners.contains(&self_id);
        true
    }

    /// Check if there is any unapplied confchange. May report a false
    /// positive, never a false negative.
    #[inline]
    pub fn has_pending_conf(&self) -> bool {
        self.pending_conf_index > self.raft_log.applied
    }

    fn add_node_or_learner(&mut self, id: u64, learner: bool) -> Result<()> {
        if let Some(pr) = self.prs().get(id) {
            if learner && !pr.is_learner {
                // can only change Learner to Voter
                info!(
                    self.logger,
                    "ignored addLearner: do not support changing {id} from raft peer to learner",
                    id = id;
                );
                return Ok(());
            }
            if learner == pr.is_learner {
                // Ignore any redundant addNode calls (which can happen because the
                // initial bootstrapping entries are applied twice).
                return Ok(());
            }
            // a learner rejoining as a voter keeps its replication progress
            self.mut_prs().promote_learner(id)?;
        } else {
            let next_idx = self.raft_log.last_index() + 1;
            self.set_progress(id, 0, next_idx, learner);
        }

        if self.id == id {
            self.is_learner = learner;
        }
        // When a node is first added, we should mark it as recently active.
        // Otherwise, CheckQuorum may cause us to step down if it is invoked
        // before the added node has a chance to communicate with us.
        self.mut_prs().get_mut(id).unwrap().recent_active = true;
        Ok(())
    }

    /// Adds a voter to the cluster. Adding an existing voter again is a
    /// no-op; adding a current learner promotes it.
    pub fn add_node(&mut self, id: u64) -> Result<()> {
        self.add_node_or_learner(id, false)
    }

    /// Adds a learner to the cluster.
    pub fn add_learner(&mut self, id: u64) -> Result<()> {
        self.add_node_or_learner(id, true)
    }

    /// Removes a voter or learner from the cluster.
    ///
    /// # Errors
    ///
    /// * `id` is not a voter or learner.
    pub fn remove_node(&mut self, id: u64) -> Result<()> {
        self.mut_prs().remove(id)?;

        // nothing more to settle if there are no voters left
        if self.prs().voters().is_empty() {
            return Ok(());
        }

        // The quorum just shrank, so entries that were one ack short may now
        // be committed.
        if self.maybe_commit() {
            self.bcast_append();
        }
        if self.state == StateRole::Leader && self.lead_transferee == Some(id) {
            self.abort_leader_transfer();
        }

        Ok(())
    }

    /// Updates metadata of a node. Membership and replication progress are
    /// unaffected.
    pub fn update_node(&mut self, id: u64) {
        debug!(
            self.logger,
            "updating node with ID {id}",
            id = id,
        );
    }

    /// Inserts a fresh progress for the learner or voter.
    pub fn set_progress(&mut self, id: u64, matched: u64, next_idx: u64, is_learner: bool) {
        let mut p = Progress::new(next_idx, self.max_inflight);
        p.matched = matched;
        if is_learner {
            if let Err(e) = self.mut_prs().insert_learner(id, p) {
                fatal!(self.logger, "{}", e);
            }
        } else if let Err(e) = self.mut_prs().insert_voter(id, p) {
            fatal!(self.logger, "{}", e);
        }
    }

    /// Takes the progress set (destructively turns to `None`).
    pub fn take_prs(&mut self) -> ProgressSet {
        self.prs.take().unwrap()
    }

    /// Sets the progress set.
    pub fn set_prs(&mut self, prs: ProgressSet) {
        self.prs = Some(prs);
    }

    /// Returns a read-only reference to the progress set.
    pub fn prs(&self) -> &ProgressSet {
        self.prs.as_ref().unwrap()
    }

    /// Returns a mutable reference to the progress set.
    pub fn mut_prs(&mut self) -> &mut ProgressSet {
        self.prs.as_mut().unwrap()
    }

    /// For a given hardstate, load the state into self.
    pub fn load_state(&mut self, hs: &HardState) {
        if hs.commit < self.raft_log.committed || hs.commit > self.raft_log.last_index() {
            fatal!(
                self.logger,
                "hs.commit {} is out of range [{}, {}]",
                hs.commit,
                self.raft_log.committed,
                self.raft_log.last_index()
            )
        }
        self.raft_log.committed = hs.commit;
        self.term = hs.term;
        self.vote = hs.vote;
    }

    /// Whether the randomized election timeout has elapsed.
    pub fn past_election_timeout(&self) -> bool {
        self.election_elapsed >= self.randomized_election_timeout
    }

    /// Draws a fresh randomized election timeout from
    /// [`election_timeout`, 2 * `election_timeout`).
    pub fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout =
            self.election_timeout + rand::thread_rng().gen_range(0..self.election_timeout);
    }

    // Counts the voters heard from since the last check, clearing the
    // activity flags for the next period. The local node always counts.
    fn check_quorum_active(&mut self) -> bool {
        let self_id = self.id;
        let quorum = self.quorum();
        let mut active = 0;
        for (&id, pr) in self.mut_prs().iter_mut() {
            if id == self_id {
                active += 1;
                continue;
            }
            if !pr.is_learner && pr.recent_active {
                active += 1;
            }
            pr.recent_active = false;
        }
        active >= quorum
    }

    /// Issues a message to timeout immediately.
    pub fn send_timeout_now(&mut self, to: u64) {
        let msg = new_message(to, MessageType::MsgTimeoutNow, None);
        self.send(msg);
    }

    /// Stops the transfer of a leader.
    pub fn abort_leader_transfer(&mut self) {
        self.lead_transferee = None;
    }
}

/// Decodes the `ConfChange` carried in the data of an `EntryConfChange`
/// entry.
pub fn conf_change_from_entry(e: &Entry) -> Result<ConfChange> {
    ConfChange::decode(&*e.data).map_err(Error::CodecError)
}
