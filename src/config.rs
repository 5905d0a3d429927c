// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

pub use super::read_only::{ReadOnlyOption, ReadState};
use super::util::NO_LIMIT;
use super::{
    errors::{Error, Result},
    INVALID_ID,
};

/// Config contains the parameters to start a raft.
#[derive(Clone)]
pub struct Config {
    /// The identity of the local raft. It cannot be 0, and must be unique in the group.
    pub id: u64,

    /// The IDs of all voters (including self) when starting from scratch.
    /// Set this only when the storage holds no configuration yet; a
    /// restarting node takes its membership from the storage instead.
    pub peers: Vec<u64>,

    /// The IDs of all learners when starting from scratch. Learners receive
    /// the log but count for neither elections nor commitment. Must be
    /// disjoint from `peers`.
    pub learners: Vec<u64>,

    /// How many ticks a follower waits without hearing from a leader before
    /// it campaigns. The effective timeout is re-randomized within
    /// [election_tick, 2 * election_tick) after every reset. Must be larger
    /// than `heartbeat_tick`.
    pub election_tick: usize,

    /// How many ticks pass between leader heartbeats. Must be nonzero.
    pub heartbeat_tick: usize,

    /// The index the state machine had already applied when restarting.
    /// Entries at or below it are never handed out again.
    pub applied: u64,

    /// Byte cap on the entries carried by a single append message. Zero
    /// means one entry per message; `NO_LIMIT` means no cap.
    pub max_size_per_msg: u64,

    /// Byte cap on the committed entries handed out by a single Ready. A
    /// non-empty batch always contains at least one entry regardless of the
    /// cap.
    pub max_committed_size_per_ready: u64,

    /// Byte cap on the payloads a leader keeps proposed-but-uncommitted.
    /// Proposals past the cap are dropped, except that a proposal made while
    /// nothing is uncommitted is always admitted.
    pub max_uncommitted_entries_size: u64,

    /// How many append messages a leader may have in flight to one follower
    /// during optimistic replication.
    pub max_inflight_msgs: usize,

    /// Have the leader step down when it has not heard from a quorum of
    /// voters for an election timeout.
    pub check_quorum: bool,

    /// Run a pre-vote round before real elections, so a rejoining partitioned
    /// node cannot disrupt a settled group.
    pub pre_vote: bool,

    /// Choose how linearizable reads are confirmed. `LeaseBased` requires
    /// `check_quorum`.
    pub read_only_option: ReadOnlyOption,

    /// Have followers drop proposals rather than forward them to the leader.
    pub disable_proposal_forwarding: bool,
}

impl Default for Config {
    fn default() -> Self {
        const HEARTBEAT_TICK: usize = 2;
        Self {
            id: 0,
            peers: vec![],
            learners: vec![],
            election_tick: HEARTBEAT_TICK * 10,
            heartbeat_tick: HEARTBEAT_TICK,
            applied: 0,
            max_size_per_msg: 0,
            max_committed_size_per_ready: NO_LIMIT,
            max_uncommitted_entries_size: NO_LIMIT,
            max_inflight_msgs: 256,
            check_quorum: false,
            pre_vote: false,
            read_only_option: ReadOnlyOption::Safe,
            disable_proposal_forwarding: false,
        }
    }
}

impl Config {
    /// Creates a new config with the given id.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Runs validations against the config.
    pub fn validate(&self) -> Result<()> {
        if self.id == INVALID_ID {
            return Err(Error::ConfigInvalid("invalid node id".to_owned()));
        }

        if self.heartbeat_tick == 0 {
            return Err(Error::ConfigInvalid(
                "heartbeat tick must be greater than 0".to_owned(),
            ));
        }

        if self.election_tick <= self.heartbeat_tick {
            return Err(Error::ConfigInvalid(
                "election tick must be greater than heartbeat tick".to_owned(),
            ));
        }

        if self.max_inflight_msgs == 0 {
            return Err(Error::ConfigInvalid(
                "max inflight messages must be greater than 0".to_owned(),
            ));
        }

        if self.read_only_option == ReadOnlyOption::LeaseBased && !self.check_quorum {
            return Err(Error::ConfigInvalid(
                "read_only_option == LeaseBased requires check_quorum == true".into(),
            ));
        }

        if self.max_uncommitted_entries_size < self.max_size_per_msg {
            return Err(Error::ConfigInvalid(
                "max uncommitted entries size must not be below max_size_per_msg".to_owned(),
            ));
        }

        for id in &self.learners {
            if self.peers.contains(id) {
                return Err(Error::ConfigInvalid(format!(
                    "node {} is in both peers and learners",
                    id
                )));
            }
        }

        Ok(())
    }
}
