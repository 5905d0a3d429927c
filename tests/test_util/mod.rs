// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

//! A lossless in-memory message exchange for wiring a handful of rafts
//! together, plus builders for the messages the tests feed them.

use std::collections::{BTreeMap, HashSet, VecDeque};

use kvraft::raftpb::*;
use kvraft::storage::MemStorage;
use kvraft::*;
use slog::Logger;

pub fn new_test_config(id: u64, election_tick: usize, heartbeat_tick: usize) -> Config {
    Config {
        id,
        election_tick,
        heartbeat_tick,
        max_size_per_msg: NO_LIMIT,
        max_inflight_msgs: 256,
        ..Default::default()
    }
}

pub fn new_test_raft(
    id: u64,
    peers: Vec<u64>,
    election: usize,
    heartbeat: usize,
    storage: MemStorage,
    l: &Logger,
) -> Raft<MemStorage> {
    let mut config = new_test_config(id, election, heartbeat);
    if !storage.initial_state().unwrap().initialized() {
        config.peers = peers;
    }
    Raft::new(&config, storage, l).unwrap()
}

pub fn new_test_learner_raft(
    id: u64,
    peers: Vec<u64>,
    learners: Vec<u64>,
    election: usize,
    heartbeat: usize,
    storage: MemStorage,
    l: &Logger,
) -> Raft<MemStorage> {
    let mut config = new_test_config(id, election, heartbeat);
    if !storage.initial_state().unwrap().initialized() {
        config.peers = peers;
        config.learners = learners;
    }
    Raft::new(&config, storage, l).unwrap()
}

pub fn ent(term: u64, index: u64) -> Entry {
    let mut e = Entry::default();
    e.term = term;
    e.index = index;
    e
}

pub fn msg(from: u64, to: u64, t: MessageType) -> Message {
    let mut m = Message::default();
    m.from = from;
    m.to = to;
    m.set_msg_type(t);
    m
}

/// A proposal of one entry carrying `data`, issued at `id`.
pub fn prop(id: u64, data: &[u8]) -> Message {
    let mut e = Entry::default();
    e.data = data.to_vec();
    let mut m = msg(id, id, MessageType::MsgPropose);
    m.entries = vec![e];
    m
}

/// A read-index request carrying `ctx`, issued at `id`.
pub fn read_request(id: u64, ctx: &[u8]) -> Message {
    let mut e = Entry::default();
    e.data = ctx.to_vec();
    let mut m = msg(id, id, MessageType::MsgReadIndex);
    m.entries = vec![e];
    m
}

pub fn snapshot(index: u64, term: u64, voters: Vec<u64>) -> Snapshot {
    let mut s = Snapshot::default();
    s.mut_metadata().index = index;
    s.mut_metadata().term = term;
    s.mut_metadata().mut_conf_state().nodes = voters;
    s
}

/// One seat in a [`Cluster`].
pub enum Member {
    /// A raft built from the default test config.
    Fresh,
    /// A raft the test configured itself. Its id and peer set must match the
    /// seat it is placed in.
    Configured(Raft<MemStorage>),
    /// A dead node: everything sent to it disappears.
    Hole,
}

/// A group of rafts exchanging messages in memory. Ids are assigned from 1
/// by seat order. Delivery is lossless and in order unless a link has been
/// severed.
pub struct Cluster {
    peers: BTreeMap<u64, Option<Raft<MemStorage>>>,
    storage: BTreeMap<u64, MemStorage>,
    severed: HashSet<(u64, u64)>,
}

impl Cluster {
    pub fn new(members: Vec<Member>, l: &Logger) -> Cluster {
        Cluster::with_config(members, |_| {}, l)
    }

    /// Builds a cluster whose `Fresh` members get `tweak` applied to their
    /// config before construction.
    pub fn with_config(
        members: Vec<Member>,
        tweak: impl Fn(&mut Config),
        l: &Logger,
    ) -> Cluster {
        let ids: Vec<u64> = (1..=members.len() as u64).collect();
        let mut peers = BTreeMap::new();
        let mut storage = BTreeMap::new();
        for (member, id) in members.into_iter().zip(ids.iter().cloned()) {
            match member {
                Member::Fresh => {
                    let mut config = new_test_config(id, 10, 1);
                    config.peers = ids.clone();
                    tweak(&mut config);
                    let store = MemStorage::new();
                    storage.insert(id, store.clone());
                    peers.insert(id, Some(Raft::new(&config, store, l).unwrap()));
                }
                Member::Configured(r) => {
                    peers.insert(id, Some(r));
                }
                Member::Hole => {
                    peers.insert(id, None);
                }
            }
        }
        Cluster {
            peers,
            storage,
            severed: HashSet::new(),
        }
    }

    pub fn raft(&self, id: u64) -> &Raft<MemStorage> {
        self.peers[&id].as_ref().unwrap()
    }

    pub fn raft_mut(&mut self, id: u64) -> &mut Raft<MemStorage> {
        self.peers.get_mut(&id).unwrap().as_mut().unwrap()
    }

    pub fn store(&self, id: u64) -> &MemStorage {
        &self.storage[&id]
    }

    /// Feeds the messages in and keeps routing the responses they provoke
    /// until the group goes quiet.
    pub fn send(&mut self, seed: Vec<Message>) {
        let mut inbox: VecDeque<Message> = seed.into();
        while let Some(m) = inbox.pop_front() {
            let responses = match self.peers.get_mut(&m.to) {
                Some(Some(raft)) => {
                    let _ = raft.step(m);
                    raft.msgs.drain(..).collect::<Vec<_>>()
                }
                // holes and unknown peers swallow their mail
                _ => vec![],
            };
            for resp in responses {
                assert_ne!(
                    resp.msg_type(),
                    MessageType::MsgHup,
                    "MsgHup never goes over the wire"
                );
                if !self.severed.contains(&(resp.from, resp.to)) {
                    inbox.push_back(resp);
                }
            }
        }
    }

    /// Has `id` campaign and routes the election to completion.
    pub fn elect(&mut self, id: u64) {
        self.send(vec![msg(id, id, MessageType::MsgHup)]);
    }

    /// Drops every message queued at `id`.
    pub fn take_msgs(&mut self, id: u64) -> Vec<Message> {
        self.raft_mut(id).msgs.drain(..).collect()
    }

    /// Severs the link between `a` and `b` in both directions.
    pub fn cut(&mut self, a: u64, b: u64) {
        self.severed.insert((a, b));
        self.severed.insert((b, a));
    }

    /// Severs every link of `id`.
    pub fn isolate(&mut self, id: u64) {
        let ids: Vec<u64> = self.peers.keys().cloned().collect();
        for other in ids {
            if other != id {
                self.cut(id, other);
            }
        }
    }

    /// Restores all severed links.
    pub fn heal(&mut self) {
        self.severed.clear();
    }

    /// Persists `id`'s unstable entries to its storage, advances its applied
    /// cursor and returns the newly committed entries, like a host working
    /// off a Ready.
    pub fn next_committed(&mut self, id: u64) -> Vec<Entry> {
        let store = self.storage[&id].clone();
        let r = self.raft_mut(id);
        persist(r, &store);
        let ents = r.raft_log.next_entries();
        let committed = r.raft_log.committed;
        r.raft_log.applied_to(committed);
        ents.unwrap_or_default()
    }
}

/// Appends a raft's unstable entries to the given storage and marks them
/// stable.
pub fn persist(r: &mut Raft<MemStorage>, s: &MemStorage) {
    let unstable: Vec<Entry> = r.raft_log.unstable_entries().unwrap_or(&[]).to_vec();
    if let Some(e) = unstable.last() {
        s.wl().append(&unstable).expect("");
        r.raft_log.stable_to(e.index, e.term);
    }
}
