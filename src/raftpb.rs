// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

//! The wire and persistence model of the consensus core.
//!
//! Everything a peer sends, persists, or applies is expressed with the value
//! types in this module. They are plain prost messages so hosts can ship them
//! over any transport and store them in any log format without an extra
//! translation layer.

use std::sync::OnceLock;

/// The entry is a change that needs to be applied to the state machine.
///
/// For normal entries the data field carries the host's opaque payload (for a
/// key-value store, an encoded command). The context field is available for
/// host correlation and is never interpreted by the core.
///
/// For configuration changes the data field carries an encoded [`ConfChange`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entry {
    /// The type of the entry.
    #[prost(enumeration = "EntryType", tag = "1")]
    pub entry_type: i32,
    /// The term the entry was proposed in.
    #[prost(uint64, tag = "2")]
    pub term: u64,
    /// The position of the entry in the log.
    #[prost(uint64, tag = "3")]
    pub index: u64,
    /// The payload of the entry.
    #[prost(bytes = "vec", tag = "4")]
    pub data: ::std::vec::Vec<u8>,
    /// Opaque data passed through for the host.
    #[prost(bytes = "vec", tag = "6")]
    pub context: ::std::vec::Vec<u8>,
}

/// Metadata of a snapshot: where the snapshot cuts the log and the membership
/// at that point.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotMetadata {
    /// The membership configuration at the snapshot index.
    #[prost(message, optional, tag = "1")]
    pub conf_state: ::std::option::Option<ConfState>,
    /// The last log index covered by the snapshot.
    #[prost(uint64, tag = "2")]
    pub index: u64,
    /// The term of the entry at `index`.
    #[prost(uint64, tag = "3")]
    pub term: u64,
}

/// A point-in-time image of the applied state machine plus the metadata
/// needed to resume the log after it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Snapshot {
    /// The serialized state machine data.
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::std::vec::Vec<u8>,
    /// The metadata of the snapshot.
    #[prost(message, optional, tag = "2")]
    pub metadata: ::std::option::Option<SnapshotMetadata>,
}

/// A protocol message between peers (or, for local types, between the host
/// and its own raft). Field meaning depends on `msg_type`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    /// The type of the message.
    #[prost(enumeration = "MessageType", tag = "1")]
    pub msg_type: i32,
    /// The destination peer id.
    #[prost(uint64, tag = "2")]
    pub to: u64,
    /// The origin peer id.
    #[prost(uint64, tag = "3")]
    pub from: u64,
    /// The term the message is sent at.
    #[prost(uint64, tag = "4")]
    pub term: u64,
    /// For appends, the term of the entry preceding `entries`; for vote
    /// requests, the term of the candidate's last entry.
    #[prost(uint64, tag = "5")]
    pub log_term: u64,
    /// For appends, the index of the entry preceding `entries`; for vote
    /// requests, the candidate's last index; on responses, the acknowledged
    /// or rejected position.
    #[prost(uint64, tag = "6")]
    pub index: u64,
    /// Entries to replicate.
    #[prost(message, repeated, tag = "7")]
    pub entries: ::std::vec::Vec<Entry>,
    /// The sender's commit index, capped to what the receiver has matched.
    #[prost(uint64, tag = "8")]
    pub commit: u64,
    /// The snapshot carried by a `MsgSnapshot`.
    #[prost(message, optional, tag = "9")]
    pub snapshot: ::std::option::Option<Snapshot>,
    /// Set on responses that refuse the request.
    #[prost(bool, tag = "10")]
    pub reject: bool,
    /// On an append rejection, the follower's last index, hinting where the
    /// leader should probe next.
    #[prost(uint64, tag = "11")]
    pub reject_hint: u64,
    /// Campaign type on votes, read-index token on heartbeats.
    #[prost(bytes = "vec", tag = "12")]
    pub context: ::std::vec::Vec<u8>,
}

/// The state a peer must persist before sending any message reflecting it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HardState {
    /// The current term.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// The peer voted for in `term`, or zero.
    #[prost(uint64, tag = "2")]
    pub vote: u64,
    /// The highest committed log index.
    #[prost(uint64, tag = "3")]
    pub commit: u64,
}

/// The membership of the group: voters and non-voting learners. The two sets
/// are disjoint and each is sorted.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfState {
    /// The ids of the voters.
    #[prost(uint64, repeated, tag = "1")]
    pub nodes: ::std::vec::Vec<u64>,
    /// The ids of the learners.
    #[prost(uint64, repeated, tag = "2")]
    pub learners: ::std::vec::Vec<u64>,
}

/// A single-step membership change, carried as the data of an
/// `EntryConfChange` entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfChange {
    /// A host-chosen identifier for the change.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// What kind of change this is.
    #[prost(enumeration = "ConfChangeType", tag = "2")]
    pub change_type: i32,
    /// The peer the change applies to.
    #[prost(uint64, tag = "3")]
    pub node_id: u64,
    /// Opaque data passed through for the host.
    #[prost(bytes = "vec", tag = "4")]
    pub context: ::std::vec::Vec<u8>,
}

/// The type of a log entry.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum EntryType {
    /// A normal proposal, applied by the host state machine.
    EntryNormal = 0,
    /// A membership change; data decodes as a `ConfChange`.
    EntryConfChange = 1,
}

/// The type of a message. `raw_node::is_local_msg` is the authority on which
/// types never travel between peers.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum MessageType {
    /// Local: start an election.
    MsgHup = 0,
    /// Local: the leader should broadcast heartbeats.
    MsgBeat = 1,
    /// A proposal from the host (forwarded to the leader by followers).
    MsgPropose = 2,
    /// Log replication from the leader.
    MsgAppend = 3,
    /// Response to `MsgAppend`.
    MsgAppendResponse = 4,
    /// A vote request from a candidate.
    MsgRequestVote = 5,
    /// Response to `MsgRequestVote`.
    MsgRequestVoteResponse = 6,
    /// A full snapshot from the leader.
    MsgSnapshot = 7,
    /// A leadership heartbeat.
    MsgHeartbeat = 8,
    /// Response to `MsgHeartbeat`.
    MsgHeartbeatResponse = 9,
    /// Local: a peer could not be reached for the last send.
    MsgUnreachable = 10,
    /// Local: the result of an attempted snapshot transfer.
    MsgSnapStatus = 11,
    /// Local: the leader should verify it still has an active quorum.
    MsgCheckQuorum = 12,
    /// Ask the leader to hand leadership to the sender.
    MsgTransferLeader = 13,
    /// Tell the transfer target to campaign immediately.
    MsgTimeoutNow = 14,
    /// A linearizable read request.
    MsgReadIndex = 15,
    /// Response to `MsgReadIndex` with the commit watermark.
    MsgReadIndexResp = 16,
    /// A pre-vote request; does not disturb terms.
    MsgRequestPreVote = 17,
    /// Response to `MsgRequestPreVote`.
    MsgRequestPreVoteResponse = 18,
}

/// The type of a membership change.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ConfChangeType {
    /// Add a voter.
    AddNode = 0,
    /// Remove a voter or learner.
    RemoveNode = 1,
    /// Update peer metadata without a membership change.
    UpdateNode = 2,
    /// Add a non-voting learner.
    AddLearnerNode = 3,
}

impl Snapshot {
    /// A snapshot with no metadata carries nothing; peers treat it as absent.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.get_metadata().index == 0
    }

    /// Returns the metadata, or an empty default if unset.
    #[inline]
    pub fn get_metadata(&self) -> &SnapshotMetadata {
        self.metadata
            .as_ref()
            .unwrap_or_else(|| SnapshotMetadata::default_ref())
    }

    /// Returns the metadata, initializing it first if unset.
    #[inline]
    pub fn mut_metadata(&mut self) -> &mut SnapshotMetadata {
        self.metadata.get_or_insert_with(SnapshotMetadata::default)
    }

    /// Takes the metadata out, leaving an unset field behind.
    #[inline]
    pub fn take_metadata(&mut self) -> SnapshotMetadata {
        self.metadata.take().unwrap_or_default()
    }

    fn default_ref() -> &'static Snapshot {
        static DEFAULT: OnceLock<Snapshot> = OnceLock::new();
        DEFAULT.get_or_init(Snapshot::default)
    }
}

impl SnapshotMetadata {
    /// Returns the configuration state, or an empty default if unset.
    #[inline]
    pub fn get_conf_state(&self) -> &ConfState {
        self.conf_state
            .as_ref()
            .unwrap_or_else(|| ConfState::default_ref())
    }

    /// Returns the configuration state, initializing it first if unset.
    #[inline]
    pub fn mut_conf_state(&mut self) -> &mut ConfState {
        self.conf_state.get_or_insert_with(ConfState::default)
    }

    /// Takes the configuration state out, leaving an unset field behind.
    #[inline]
    pub fn take_conf_state(&mut self) -> ConfState {
        self.conf_state.take().unwrap_or_default()
    }

    fn default_ref() -> &'static SnapshotMetadata {
        static DEFAULT: OnceLock<SnapshotMetadata> = OnceLock::new();
        DEFAULT.get_or_init(SnapshotMetadata::default)
    }
}

impl Message {
    /// Returns the snapshot, or an empty default if unset.
    #[inline]
    pub fn get_snapshot(&self) -> &Snapshot {
        self.snapshot
            .as_ref()
            .unwrap_or_else(|| Snapshot::default_ref())
    }

    /// Takes the snapshot out, leaving an unset field behind.
    #[inline]
    pub fn take_snapshot(&mut self) -> Snapshot {
        self.snapshot.take().unwrap_or_default()
    }
}

impl ConfState {
    fn default_ref() -> &'static ConfState {
        static DEFAULT: OnceLock<ConfState> = OnceLock::new();
        DEFAULT.get_or_init(ConfState::default)
    }
}

impl<Iter1, Iter2> From<(Iter1, Iter2)> for ConfState
where
    Iter1: IntoIterator<Item = u64>,
    Iter2: IntoIterator<Item = u64>,
{
    fn from((nodes, learners): (Iter1, Iter2)) -> Self {
        let mut conf_state = ConfState::default();
        conf_state.nodes.extend(nodes);
        conf_state.learners.extend(learners);
        conf_state
    }
}
