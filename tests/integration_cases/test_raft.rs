// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

use kvraft::raftpb::*;
use kvraft::storage::MemStorage;
use kvraft::util::payload_size;
use kvraft::*;
use prost::Message as PbMessage;
use slog::Logger;

use crate::test_util::*;

// Builds a raft whose log already holds one entry per term in `terms`, as a
// peer that lived through those elections would.
fn raft_with_log(terms: &[u64], pre_vote: bool, id: u64, peers: &[u64], l: &Logger) -> Raft<MemStorage> {
    let store = MemStorage::new_with_conf_state((peers.to_vec(), vec![]));
    for (i, &term) in terms.iter().enumerate() {
        store.wl().append(&[ent(term, i as u64 + 1)]).expect("");
    }
    let mut config = new_test_config(id, 10, 1);
    config.pre_vote = pre_vote;
    let mut r = Raft::new(&config, store, l).unwrap();
    let last = *terms.last().unwrap();
    r.reset(last);
    r
}

// Builds a raft that voted in `term` but never received a single entry.
fn raft_with_vote(vote: u64, term: u64, pre_vote: bool, id: u64, peers: &[u64], l: &Logger) -> Raft<MemStorage> {
    let store = MemStorage::new_with_conf_state((peers.to_vec(), vec![]));
    store.wl().mut_hard_state().term = term;
    store.wl().mut_hard_state().vote = vote;
    let mut config = new_test_config(id, 10, 1);
    config.pre_vote = pre_vote;
    let mut r = Raft::new(&config, store, l).unwrap();
    r.reset(term);
    r
}

#[test]
fn test_progress_leader() {
    let l = default_logger();
    let mut r = new_test_raft(1, vec![1, 2], 5, 1, MemStorage::new(), &l);
    r.become_candidate();
    r.become_leader();
    r.mut_prs().get_mut(2).unwrap().become_replicate();

    // every accepted proposal advances the leader's own progress in step
    for i in 0..5u64 {
        let pr = r.prs().get(1).unwrap();
        assert_eq!(pr.state, ProgressState::Replicate, "#{}", i);
        assert_eq!(pr.matched, i + 1, "#{}", i);
        assert_eq!(pr.next_idx, pr.matched + 1, "#{}", i);
        r.step(prop(1, b"foo")).expect("");
    }
}

// A heartbeat response resumes a paused peer; the heartbeat itself does not.
#[test]
fn test_progress_resume_by_heartbeat_resp() {
    let l = default_logger();
    let mut r = new_test_raft(1, vec![1, 2], 5, 1, MemStorage::new(), &l);
    r.become_candidate();
    r.become_leader();

    r.mut_prs().get_mut(2).unwrap().paused = true;
    r.step(msg(1, 1, MessageType::MsgBeat)).expect("");
    assert!(r.prs().get(2).unwrap().paused);

    r.mut_prs().get_mut(2).unwrap().become_replicate();
    r.step(msg(2, 1, MessageType::MsgHeartbeatResponse))
        .expect("");
    assert!(!r.prs().get(2).unwrap().paused);
}

// In probe state a peer gets one append and then silence until it answers.
#[test]
fn test_progress_paused() {
    let l = default_logger();
    let mut r = new_test_raft(1, vec![1, 2], 5, 1, MemStorage::new(), &l);
    r.become_candidate();
    r.become_leader();

    r.step(prop(1, b"somedata")).expect("");
    r.step(prop(1, b"somedata")).expect("");
    r.step(prop(1, b"somedata")).expect("");

    let ms: Vec<Message> = r.msgs.drain(..).collect();
    assert_eq!(ms.len(), 1);
}

#[test]
fn test_progress_flow_control() {
    let l = default_logger();
    let mut cfg = new_test_config(1, 5, 1);
    cfg.peers = vec![1, 2];
    cfg.max_inflight_msgs = 3;
    cfg.max_size_per_msg = 2048;
    let mut r = Raft::new(&cfg, MemStorage::new(), &l).unwrap();
    r.become_candidate();
    r.become_leader();

    // Throw away all the messages relating to the initial election.
    r.msgs.clear();

    // While node 2 is in probe state, propose a bunch of entries.
    r.mut_prs().get_mut(2).unwrap().become_probe();
    let blob = vec![b'a'; 1000];
    for _ in 0..10 {
        r.step(prop(1, &blob)).expect("");
    }

    // The first append has two entries: the empty entry to confirm the
    // election, and the first proposal (only one proposal gets sent
    // because we're in probe state).
    let mut ms: Vec<Message> = r.msgs.drain(..).collect();
    assert_eq!(ms.len(), 1);
    assert_eq!(ms[0].msg_type(), MessageType::MsgAppend);
    assert_eq!(ms[0].entries.len(), 2);
    assert_eq!(ms[0].entries[0].data.len(), 0);
    assert_eq!(ms[0].entries[1].data.len(), 1000);

    // When this append is acked, we change to replicate state and can
    // send multiple messages at once, up to the inflight window.
    let mut reply = msg(2, 1, MessageType::MsgAppendResponse);
    reply.index = ms[0].entries[1].index;
    r.step(reply).expect("");
    ms = r.msgs.drain(..).collect();
    assert_eq!(ms.len(), 3);
    for (i, m) in ms.iter().enumerate() {
        assert_eq!(m.msg_type(), MessageType::MsgAppend, "#{}", i);
        assert_eq!(m.entries.len(), 2, "#{}", i);
    }

    // Acking all three at once frees the whole window; the tail of the log
    // (three entries) goes out in two more size-capped messages.
    let mut reply = msg(2, 1, MessageType::MsgAppendResponse);
    reply.index = ms[2].entries[1].index;
    r.step(reply).expect("");
    ms = r.msgs.drain(..).collect();
    assert_eq!(ms.len(), 2);
    assert_eq!(ms[0].entries.len(), 2);
    assert_eq!(ms[1].entries.len(), 1);
}

#[test]
fn test_uncommitted_entry_limit() {
    let l = default_logger();
    // Use a relatively large number of entries here to prevent regression of a
    // bug which computed the size of the tally faultily.
    const MAX_ENTRIES: u64 = 1024;
    let mut test_entry = Entry::default();
    test_entry.data = b"testdata".to_vec();
    let max_entry_size = MAX_ENTRIES * payload_size(&test_entry);

    let mut cfg = new_test_config(1, 5, 1);
    cfg.peers = vec![1, 2, 3];
    cfg.max_uncommitted_entries_size = max_entry_size;
    cfg.max_inflight_msgs = 2 * 1024; // avoid interference
    let mut r = Raft::new(&cfg, MemStorage::new(), &l).unwrap();
    assert_eq!(r.uncommitted_size(), 0);

    r.become_candidate();
    r.become_leader();
    assert_eq!(r.uncommitted_size(), 0);

    const NUM_FOLLOWERS: u64 = 2;
    r.mut_prs().get_mut(2).unwrap().become_replicate();
    r.mut_prs().get_mut(3).unwrap().become_replicate();

    // The first MAX_ENTRIES proposals fill the allowance exactly...
    for i in 0..MAX_ENTRIES {
        if let Err(e) = r.step(prop(1, b"testdata")) {
            panic!("#{}: unexpected error {}", i, e);
        }
    }
    // ...and the next one is dropped.
    assert_eq!(r.step(prop(1, b"testdata")), Err(Error::ProposalDropped));

    let ms: Vec<Message> = r.msgs.drain(..).collect();
    assert_eq!(ms.len(), (MAX_ENTRIES * NUM_FOLLOWERS) as usize);

    // Committing everything clears the tally.
    let proposed = vec![test_entry.clone(); MAX_ENTRIES as usize];
    r.reduce_uncommitted_size(&proposed);
    assert_eq!(r.uncommitted_size(), 0);

    // A single huge proposal is admitted when the tally is empty, even
    // though it blows through the allowance...
    let large = vec![test_entry; 2 * MAX_ENTRIES as usize];
    let mut large_prop = msg(1, 1, MessageType::MsgPropose);
    large_prop.entries = large.clone();
    r.step(large_prop).expect("");

    // ...after which ordinary proposals are dropped again...
    assert_eq!(r.step(prop(1, b"testdata")), Err(Error::ProposalDropped));

    // ...while empty-payload entries always pass.
    r.step(prop(1, b"")).expect("");

    let ms: Vec<Message> = r.msgs.drain(..).collect();
    assert_eq!(ms.len(), (2 * NUM_FOLLOWERS) as usize);
    r.reduce_uncommitted_size(&large);
    assert_eq!(r.uncommitted_size(), 0);
}

// The message-level view of a three-voter election: campaigning broadcasts
// votes at term 1, two grants make a leader, and the new leader appends its
// no-op at {term: 1, index: 1} and announces it to both peers.
#[test]
fn test_three_voter_election_message_flow() {
    let l = default_logger();
    let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, MemStorage::new(), &l);

    r.step(msg(1, 1, MessageType::MsgHup)).expect("");
    let requests: Vec<Message> = r.msgs.drain(..).collect();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.msg_type(), MessageType::MsgRequestVote);
        assert_eq!(request.term, 1);
        assert_eq!(request.index, 0);
        assert_eq!(request.log_term, 0);
    }

    for from in 2..=3u64 {
        let mut grant = msg(from, 1, MessageType::MsgRequestVoteResponse);
        grant.term = 1;
        r.step(grant).expect("");
    }

    assert_eq!(r.state, StateRole::Leader);
    assert_eq!(r.raft_log.last_index(), 1);
    assert_eq!(r.raft_log.term(1).expect(""), 1);

    let appends: Vec<Message> = r.msgs.drain(..).collect();
    assert_eq!(appends.len(), 2);
    for append in &appends {
        assert_eq!(append.msg_type(), MessageType::MsgAppend);
        assert_eq!(append.entries.len(), 1);
        assert_eq!(append.entries[0].index, 1);
        assert_eq!(append.entries[0].term, 1);
        assert!(append.entries[0].data.is_empty());
    }
}

#[test]
fn test_leader_election() {
    let l = default_logger();
    leader_election_with(false, &l);
}

#[test]
fn test_leader_election_pre_vote() {
    let l = default_logger();
    leader_election_with(true, &l);
}

fn leader_election_with(pre_vote: bool, l: &Logger) {
    use Member::{Fresh, Hole};

    // With pre-vote, an election that cannot complete leaves the candidate
    // in pre-candidate state with its term untouched.
    let (stuck_state, stuck_term) = if pre_vote {
        (StateRole::PreCandidate, 0)
    } else {
        (StateRole::Candidate, 1)
    };

    let mut tests = vec![
        (vec![Fresh, Fresh, Fresh], StateRole::Leader, 1),
        (vec![Fresh, Fresh, Hole], StateRole::Leader, 1),
        (vec![Fresh, Hole, Hole], stuck_state, stuck_term),
        (vec![Fresh, Hole, Hole, Fresh], stuck_state, stuck_term),
        (vec![Fresh, Hole, Hole, Fresh, Fresh], StateRole::Leader, 1),
    ];

    for (i, (members, wstate, wterm)) in tests.drain(..).enumerate() {
        let mut c = Cluster::with_config(members, |cfg| cfg.pre_vote = pre_vote, l);
        c.elect(1);
        assert_eq!(c.raft(1).state, wstate, "#{}", i);
        assert_eq!(c.raft(1).term, wterm, "#{}", i);
    }
}

#[test]
fn test_leader_cycle() {
    let l = default_logger();
    leader_cycle_with(false, &l);
}

#[test]
fn test_leader_cycle_pre_vote() {
    let l = default_logger();
    leader_cycle_with(true, &l);
}

// Each node in turn can campaign and win, also when the group does not start
// from a blank slate.
fn leader_cycle_with(pre_vote: bool, l: &Logger) {
    use Member::Fresh;
    let mut c = Cluster::with_config(vec![Fresh, Fresh, Fresh], |cfg| cfg.pre_vote = pre_vote, l);
    for campaigner in 1..=3u64 {
        c.elect(campaigner);
        for id in 1..=3u64 {
            if id == campaigner {
                assert_eq!(c.raft(id).state, StateRole::Leader, "campaigner {}", id);
            } else {
                assert_eq!(
                    c.raft(id).state,
                    StateRole::Follower,
                    "node {} after campaign of {}",
                    id,
                    campaigner
                );
            }
        }
    }
}

#[test]
fn test_leader_election_overwrite_newer_logs() {
    let l = default_logger();
    leader_election_overwrite_newer_logs_with(false, &l);
}

#[test]
fn test_leader_election_overwrite_newer_logs_pre_vote() {
    let l = default_logger();
    leader_election_overwrite_newer_logs_with(true, &l);
}

// Five peers as left behind by two interrupted elections:
// - node 1 won term 1 and replicated one entry to node 2 before dying;
// - node 3 won term 2 and wrote an entry nobody else saw;
// - nodes 4 and 5 voted in term 2 but hold empty logs.
// Node 1's first campaign must fail against the term-2 voters, pushing its
// term to 2. Its second campaign wins, and its term-1 entry overwrites node
// 3's newer-term entry everywhere.
fn leader_election_overwrite_newer_logs_with(pre_vote: bool, l: &Logger) {
    let peers: Vec<u64> = vec![1, 2, 3, 4, 5];
    let members = vec![
        Member::Configured(raft_with_log(&[1], pre_vote, 1, &peers, l)),
        Member::Configured(raft_with_log(&[1], pre_vote, 2, &peers, l)),
        Member::Configured(raft_with_log(&[2], pre_vote, 3, &peers, l)),
        Member::Configured(raft_with_vote(3, 2, pre_vote, 4, &peers, l)),
        Member::Configured(raft_with_vote(3, 2, pre_vote, 5, &peers, l)),
    ];
    let mut c = Cluster::new(members, l);

    c.elect(1);
    assert_eq!(c.raft(1).state, StateRole::Follower);
    assert_eq!(c.raft(1).term, 2);

    c.elect(1);
    assert_eq!(c.raft(1).state, StateRole::Leader);
    assert_eq!(c.raft(1).term, 3);

    for id in 1..=5u64 {
        let entries = c.raft(id).raft_log.all_entries();
        assert_eq!(entries.len(), 2, "node {}", id);
        assert_eq!(entries[0].term, 1, "node {}", id);
        assert_eq!(entries[1].term, 3, "node {}", id);
    }
}

#[test]
fn test_vote_from_any_state() {
    let l = default_logger();
    vote_from_any_state_for(MessageType::MsgRequestVote, &l);
}

#[test]
fn test_prevote_from_any_state() {
    let l = default_logger();
    vote_from_any_state_for(MessageType::MsgRequestPreVote, &l);
}

// An up-to-date candidate for a future term is granted its (pre-)vote from
// every role. A real vote demotes the granter; a pre-vote changes nothing.
fn vote_from_any_state_for(vt: MessageType, l: &Logger) {
    let roles = [
        StateRole::Follower,
        StateRole::PreCandidate,
        StateRole::Candidate,
        StateRole::Leader,
    ];
    for role in roles {
        let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, MemStorage::new(), l);
        r.term = 1;
        match role {
            StateRole::Follower => {
                let term = r.term;
                r.become_follower(term, 3);
            }
            StateRole::PreCandidate => r.become_pre_candidate(),
            StateRole::Candidate => r.become_candidate(),
            StateRole::Leader => {
                r.become_candidate();
                r.become_leader();
            }
        }
        r.msgs.clear();

        let orig_term = r.term;
        let orig_vote = r.vote;
        let new_term = r.term + 1;
        let mut m = msg(2, 1, vt);
        m.term = new_term;
        m.log_term = new_term;
        m.index = 42;
        r.step(m).expect("");

        assert_eq!(r.msgs.len(), 1, "{:?}", role);
        let resp = &r.msgs[0];
        assert_eq!(resp.msg_type(), vote_resp_msg_type(vt), "{:?}", role);
        assert!(!resp.reject, "{:?}", role);

        if vt == MessageType::MsgRequestVote {
            // a real vote resets the granter to follower in the new term
            assert_eq!(r.state, StateRole::Follower, "{:?}", role);
            assert_eq!(r.term, new_term, "{:?}", role);
            assert_eq!(r.vote, 2, "{:?}", role);
        } else {
            // a pre-vote leaves everything as it was
            assert_eq!(r.state, role, "{:?}", role);
            assert_eq!(r.term, orig_term, "{:?}", role);
            assert_eq!(r.vote, orig_vote, "{:?}", role);
        }
    }
}

#[test]
fn test_log_replication() {
    let l = default_logger();
    use Member::Fresh;
    let mut tests = vec![
        (vec![prop(1, b"somedata")], 2),
        (
            // a proposal, a leader change, and a proposal forwarded to the
            // new leader by a follower
            vec![
                prop(1, b"somedata"),
                msg(2, 2, MessageType::MsgHup),
                prop(3, b"somedata"),
            ],
            4,
        ),
    ];

    for (i, (inputs, wcommitted)) in tests.drain(..).enumerate() {
        let mut c = Cluster::new(vec![Fresh, Fresh, Fresh], &l);
        c.elect(1);
        let proposals = inputs
            .iter()
            .filter(|m| m.msg_type() == MessageType::MsgPropose)
            .cloned()
            .collect::<Vec<_>>();
        for input in inputs {
            c.send(vec![input]);
        }

        for id in 1..=3u64 {
            assert_eq!(c.raft(id).raft_log.committed, wcommitted, "#{}.{}", i, id);

            let mut data_entries: Vec<Entry> = c
                .next_committed(id)
                .into_iter()
                .filter(|e| !e.data.is_empty())
                .collect();
            for (k, p) in proposals.iter().enumerate() {
                assert_eq!(
                    data_entries.remove(0).data,
                    p.entries[0].data,
                    "#{}.{}.{}",
                    i,
                    id,
                    k
                );
            }
            assert!(data_entries.is_empty(), "#{}.{}", i, id);
        }
    }
}

// The literal scenario: a no-op from the election plus two proposals makes
// committed == 3, and applied follows once the host works off the batch.
#[test]
fn test_single_node_commit() {
    let l = default_logger();
    let mut c = Cluster::new(vec![Member::Fresh], &l);
    c.elect(1);
    c.send(vec![prop(1, b"somedata")]);
    c.send(vec![prop(1, b"somedata")]);

    assert_eq!(c.raft(1).raft_log.committed, 3);
    c.next_committed(1);
    assert_eq!(c.raft(1).raft_log.applied, 3);
}

#[test]
fn test_learner_election_timeout() {
    let l = default_logger();
    let mut n2 = new_test_learner_raft(2, vec![1], vec![2], 10, 1, MemStorage::new(), &l);
    n2.become_follower(1, INVALID_ID);

    // a learner never campaigns, no matter how long it waits
    let timeout = n2.get_election_timeout();
    n2.set_randomized_election_timeout(timeout);
    for _ in 0..2 * timeout {
        n2.tick();
    }
    assert_eq!(n2.state, StateRole::Follower);
    assert!(n2.msgs.is_empty());
}

#[test]
fn test_learner_promotion() {
    let l = default_logger();
    let n1 = new_test_learner_raft(1, vec![1], vec![2], 10, 1, MemStorage::new(), &l);
    let n2 = new_test_learner_raft(2, vec![1], vec![2], 10, 1, MemStorage::new(), &l);
    let mut c = Cluster::new(
        vec![Member::Configured(n1), Member::Configured(n2)],
        &l,
    );
    assert_eq!(c.raft(1).state, StateRole::Follower);

    // node 1, the only voter, elects itself once its timer fires
    let timeout = c.raft(1).get_election_timeout();
    c.raft_mut(1).set_randomized_election_timeout(timeout);
    for _ in 0..timeout {
        c.raft_mut(1).tick();
    }
    assert_eq!(c.raft(1).state, StateRole::Leader);
    c.send(vec![msg(1, 1, MessageType::MsgBeat)]);

    // promote the learner on both nodes
    c.raft_mut(1).add_node(2).unwrap();
    c.raft_mut(2).add_node(2).unwrap();
    assert!(!c.raft(2).is_learner);
    assert!(c.raft(2).promotable());

    // now node 2 may campaign, and wins with node 1's vote
    let timeout = c.raft(2).get_election_timeout();
    c.raft_mut(2).set_randomized_election_timeout(timeout);
    for _ in 0..timeout {
        c.raft_mut(2).tick();
    }
    c.send(vec![msg(2, 2, MessageType::MsgBeat)]);

    assert_eq!(c.raft(1).state, StateRole::Follower);
    assert_eq!(c.raft(2).state, StateRole::Leader);
}

// The literal scenario: a learner receiving a valid vote request stays
// silent and remains a follower.
#[test]
fn test_learner_cannot_vote() {
    let l = default_logger();
    let mut n2 = new_test_learner_raft(2, vec![1], vec![2], 10, 1, MemStorage::new(), &l);
    n2.become_follower(1, INVALID_ID);

    let mut m = msg(1, 2, MessageType::MsgRequestVote);
    m.term = 2;
    m.log_term = 11;
    m.index = 11;
    n2.step(m).expect("");

    assert!(n2.msgs.is_empty());
    assert_eq!(n2.state, StateRole::Follower);
}

#[test]
fn test_learner_log_replication() {
    let l = default_logger();
    let n1 = new_test_learner_raft(1, vec![1], vec![2], 10, 1, MemStorage::new(), &l);
    let n2 = new_test_learner_raft(2, vec![1], vec![2], 10, 1, MemStorage::new(), &l);
    let mut c = Cluster::new(
        vec![Member::Configured(n1), Member::Configured(n2)],
        &l,
    );

    c.elect(1);
    c.send(vec![msg(1, 1, MessageType::MsgBeat)]);

    // the learner follows the leader's log and commit index
    assert!(c.raft(2).is_learner);
    assert_eq!(c.raft(1).raft_log.committed, c.raft(2).raft_log.committed);

    let before = c.raft(1).raft_log.committed;
    c.send(vec![prop(1, b"somedata")]);
    assert_eq!(c.raft(1).raft_log.committed, before + 1);
    assert_eq!(c.raft(1).raft_log.committed, c.raft(2).raft_log.committed);
}

#[test]
fn test_read_index_safe() {
    let l = default_logger();
    use Member::Fresh;
    let mut c = Cluster::new(vec![Fresh, Fresh, Fresh], &l);
    c.elect(1);

    // reads through the leader and through followers, interleaved with writes
    let tests: Vec<(u64, u64, &[u8])> =
        vec![(1, 2, b"ctx1"), (2, 3, b"ctx2"), (3, 4, b"ctx3"), (1, 5, b"ctx4")];
    for (i, (id, windex, ctx)) in tests.into_iter().enumerate() {
        c.send(vec![prop(1, b"somedata")]);
        c.send(vec![read_request(id, ctx)]);

        let states: Vec<ReadState> = c.raft_mut(id).read_states.drain(..).collect();
        assert_eq!(states.len(), 1, "#{}", i);
        assert_eq!(states[0].index, windex, "#{}", i);
        assert_eq!(states[0].request_ctx, ctx.to_vec(), "#{}", i);
    }
}

#[test]
fn test_read_index_lease_based() {
    let l = default_logger();
    use Member::Fresh;
    let mut c = Cluster::with_config(
        vec![Fresh, Fresh, Fresh],
        |cfg| {
            cfg.read_only_option = ReadOnlyOption::LeaseBased;
            cfg.check_quorum = true;
        },
        &l,
    );
    c.elect(1);

    // under the lease the leader answers without a heartbeat round
    let tests: Vec<(u64, u64, &[u8])> = vec![(1, 2, b"ctx1"), (2, 3, b"ctx2")];
    for (i, (id, windex, ctx)) in tests.into_iter().enumerate() {
        c.send(vec![prop(1, b"somedata")]);
        c.send(vec![read_request(id, ctx)]);

        let states: Vec<ReadState> = c.raft_mut(id).read_states.drain(..).collect();
        assert_eq!(states.len(), 1, "#{}", i);
        assert_eq!(states[0].index, windex, "#{}", i);
        assert_eq!(states[0].request_ctx, ctx.to_vec(), "#{}", i);
    }
}

#[test]
fn test_leader_transfer_to_up_to_date_node() {
    let l = default_logger();
    use Member::Fresh;
    let mut c = Cluster::new(vec![Fresh, Fresh, Fresh], &l);
    c.elect(1);

    // node 2 already matches the leader's log, so the handoff is immediate
    c.send(vec![msg(2, 1, MessageType::MsgTransferLeader)]);
    assert_eq!(c.raft(1).state, StateRole::Follower);
    assert_eq!(c.raft(1).leader_id, 2);
    assert_eq!(c.raft(1).lead_transferee, None);
    assert_eq!(c.raft(2).state, StateRole::Leader);

    // and back, requested through a follower
    c.send(vec![prop(1, b"somedata")]);
    c.send(vec![msg(1, 2, MessageType::MsgTransferLeader)]);
    assert_eq!(c.raft(1).state, StateRole::Leader);
    assert_eq!(c.raft(2).state, StateRole::Follower);
    assert_eq!(c.raft(2).leader_id, 1);
}

#[test]
fn test_leader_transfer_to_lagging_follower() {
    let l = default_logger();
    use Member::Fresh;
    let mut c = Cluster::new(vec![Fresh, Fresh, Fresh], &l);
    c.elect(1);

    // node 3 misses a proposal...
    c.isolate(3);
    c.send(vec![prop(1, b"somedata")]);
    c.heal();
    assert_eq!(c.raft(1).prs().get(3).unwrap().matched, 1);

    // ...so the transfer first catches it up, then hands over
    c.send(vec![msg(3, 1, MessageType::MsgTransferLeader)]);
    assert_eq!(c.raft(1).state, StateRole::Follower);
    assert_eq!(c.raft(1).leader_id, 3);
    assert_eq!(c.raft(3).state, StateRole::Leader);
    assert_eq!(c.raft(3).raft_log.last_index(), 3);
}

#[test]
fn test_leader_transfer_times_out() {
    let l = default_logger();
    use Member::Fresh;
    let mut c = Cluster::new(vec![Fresh, Fresh, Fresh], &l);
    c.elect(1);

    c.isolate(3);
    c.send(vec![msg(3, 1, MessageType::MsgTransferLeader)]);
    assert_eq!(c.raft(1).lead_transferee, Some(3));

    // proposals are refused while the transfer is in flight
    assert_eq!(
        c.raft_mut(1).step(prop(1, b"somedata")),
        Err(Error::ProposalDropped)
    );

    // an unreachable transferee cannot stall the group past one election
    // timeout
    let timeout = c.raft(1).get_election_timeout();
    for _ in 0..timeout {
        c.raft_mut(1).tick();
    }
    assert_eq!(c.raft(1).lead_transferee, None);
    assert_eq!(c.raft(1).state, StateRole::Leader);
    c.raft_mut(1).step(prop(1, b"somedata")).expect("");
}

#[test]
fn test_check_quorum_leader_keeps_lead_while_heard() {
    let l = default_logger();
    let mut cfg = new_test_config(1, 5, 1);
    cfg.peers = vec![1, 2, 3];
    cfg.check_quorum = true;
    let mut r = Raft::new(&cfg, MemStorage::new(), &l).unwrap();
    r.become_candidate();
    r.become_leader();

    for _ in 0..=r.get_election_timeout() {
        let mut m = msg(2, 1, MessageType::MsgHeartbeatResponse);
        m.term = r.term;
        r.step(m).expect("");
        r.tick();
    }
    assert_eq!(r.state, StateRole::Leader);
}

#[test]
fn test_check_quorum_leader_steps_down_when_silent() {
    let l = default_logger();
    let mut cfg = new_test_config(1, 5, 1);
    cfg.peers = vec![1, 2, 3];
    cfg.check_quorum = true;
    let mut r = Raft::new(&cfg, MemStorage::new(), &l).unwrap();
    r.become_candidate();
    r.become_leader();

    for _ in 0..=r.get_election_timeout() {
        r.tick();
    }
    assert_eq!(r.state, StateRole::Follower);
}

// A node that campaigned away in a partition must not disturb the group
// when it returns: its pre-votes never moved its term, and the rejections
// it now collects take it straight back to follower.
#[test]
fn test_prevote_rejoining_node_does_not_disrupt() {
    let l = default_logger();
    use Member::Fresh;
    let mut c = Cluster::with_config(
        vec![Fresh, Fresh, Fresh],
        |cfg| cfg.pre_vote = true,
        &l,
    );
    c.isolate(3);
    c.elect(1);

    c.send(vec![msg(3, 3, MessageType::MsgHup)]);
    c.send(vec![msg(3, 3, MessageType::MsgHup)]);
    assert_eq!(c.raft(3).state, StateRole::PreCandidate);
    assert_eq!(c.raft(3).term, 0);

    c.heal();
    c.send(vec![msg(3, 3, MessageType::MsgHup)]);

    assert_eq!(c.raft(3).state, StateRole::Follower);
    assert_eq!(c.raft(3).term, 1);
    assert_eq!(c.raft(1).state, StateRole::Leader);
    assert_eq!(c.raft(1).term, 1);
}

// Restoring from a leader's snapshot adopts its log position and
// membership; outdated snapshots and learner demotions are refused.
#[test]
fn test_snapshot_restore_on_follower() {
    let l = default_logger();
    let mut n2 = new_test_raft(2, vec![1, 2], 10, 1, MemStorage::new(), &l);

    let mut m = msg(1, 2, MessageType::MsgSnapshot);
    m.term = 2;
    m.snapshot = Some(snapshot(11, 11, vec![1, 2, 3]));
    n2.step(m).expect("");

    assert_eq!(n2.leader_id, 1);
    assert_eq!(n2.term, 2);
    assert_eq!(n2.raft_log.last_index(), 11);
    assert_eq!(n2.raft_log.committed, 11);
    assert_eq!(n2.prs().nodes(), vec![1, 2, 3]);
    let reply = n2.msgs.pop().unwrap();
    assert_eq!(reply.msg_type(), MessageType::MsgAppendResponse);
    assert_eq!(reply.index, 11);

    // an outdated snapshot is refused; the reply restates the commit index
    let mut m = msg(1, 2, MessageType::MsgSnapshot);
    m.term = 2;
    m.snapshot = Some(snapshot(5, 5, vec![1, 2, 3]));
    n2.step(m).expect("");
    let reply = n2.msgs.pop().unwrap();
    assert_eq!(reply.index, 11);

    // a voter never demotes itself to a learner via snapshot
    let mut s = snapshot(20, 2, vec![1, 3]);
    s.mut_metadata().mut_conf_state().learners = vec![2];
    assert!(!n2.restore(s));
}

// A peer probing below the leader's first index can only be helped with a
// snapshot; a failed transfer falls back to probing, a completed one makes
// the pending snapshot moot.
#[test]
fn test_snapshot_to_lagging_peer() {
    let l = default_logger();
    let mut r = new_test_raft(1, vec![1], 10, 1, MemStorage::new(), &l);
    r.restore(snapshot(11, 11, vec![1, 2]));
    r.become_candidate();
    r.become_leader();

    // the peer rejects the probe below our compacted log
    let first_index = r.raft_log.first_index();
    r.mut_prs().get_mut(2).unwrap().next_idx = first_index;
    let mut reject = msg(2, 1, MessageType::MsgAppendResponse);
    reject.index = first_index - 1;
    reject.reject = true;
    reject.reject_hint = first_index - 1;
    r.step(reject).expect("");

    let sent = r.msgs.pop().unwrap();
    assert_eq!(sent.msg_type(), MessageType::MsgSnapshot);
    assert_eq!(sent.get_snapshot().get_metadata().index, 11);
    {
        let pr = r.prs().get(2).unwrap();
        assert_eq!(pr.state, ProgressState::Snapshot);
        assert_eq!(pr.pending_snapshot, 11);
        assert!(pr.is_paused());
    }

    // the host reports the transfer failed: back to square one
    let mut status = msg(2, 1, MessageType::MsgSnapStatus);
    status.reject = true;
    r.step(status).expect("");
    {
        let pr = r.prs().get(2).unwrap();
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.pending_snapshot, 0);
        assert!(pr.paused);
    }

    // an ack at the snapshot index makes a pending transfer moot
    r.mut_prs().get_mut(2).unwrap().become_snapshot(11);
    let mut m = msg(2, 1, MessageType::MsgAppendResponse);
    m.index = 11;
    r.step(m).expect("");
    let pr = r.prs().get(2).unwrap();
    assert_eq!(pr.state, ProgressState::Probe);
    assert_eq!(pr.matched, 11);
    assert_eq!(pr.next_idx, 12);
}

// End to end: a follower that slept through a compaction is brought back
// with a snapshot and then catches up normally.
#[test]
fn test_snapshot_catchup_after_compaction() {
    let l = default_logger();
    use Member::Fresh;
    let mut c = Cluster::new(vec![Fresh, Fresh, Fresh], &l);
    c.elect(1);

    c.isolate(3);
    for _ in 0..20 {
        c.send(vec![prop(1, b"somedata")]);
    }

    // the leader applies everything, cuts a snapshot and compacts
    c.next_committed(1);
    let applied = c.raft(1).raft_log.applied;
    c.store(1)
        .wl()
        .commit_to_and_set_conf_states(applied, Some(ConfState::from((vec![1, 2, 3], vec![]))))
        .expect("");
    c.store(1).wl().compact(applied).expect("");

    c.heal();

    // heartbeats teach the leader that node 3 is reachable again
    loop {
        c.send(vec![msg(1, 1, MessageType::MsgBeat)]);
        if c.raft(1).prs().get(3).unwrap().recent_active {
            break;
        }
    }

    c.send(vec![prop(1, b"somedata")]);
    c.send(vec![prop(1, b"somedata")]);

    assert_eq!(c.raft(3).raft_log.committed, c.raft(1).raft_log.committed);
    // node 3 got there through a snapshot, not through the old entries
    assert!(c.raft(3).raft_log.first_index() > 1);
}

// Only one conf change may sit between proposal and application; later ones
// are demoted to no-ops until the first is applied.
#[test]
fn test_one_conf_change_at_a_time() {
    let l = default_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, MemStorage::new(), &l);
    r.become_candidate();
    r.become_leader();

    let mut cc_entry = Entry::default();
    cc_entry.set_entry_type(EntryType::EntryConfChange);
    let mut m = msg(1, 1, MessageType::MsgPropose);
    m.entries = vec![cc_entry.clone()];
    r.step(m.clone()).expect("");
    assert_eq!(r.pending_conf_index, 2);

    r.step(m).expect("");
    let demoted = r.raft_log.entries(3, None).expect("");
    assert_eq!(demoted.len(), 1);
    assert_eq!(demoted[0].entry_type(), EntryType::EntryNormal);
    assert_eq!(r.pending_conf_index, 2);

    // once the change is applied, the door opens again
    r.raft_log.committed = 3;
    r.raft_log.applied_to(3);
    let mut m = msg(1, 1, MessageType::MsgPropose);
    m.entries = vec![cc_entry];
    r.step(m).expect("");
    assert_eq!(r.pending_conf_index, 4);
}

// Removing a voter shrinks the quorum, which by itself can commit entries
// that were one acknowledgment short.
#[test]
fn test_commit_after_remove_node() {
    let l = default_logger();
    let s = MemStorage::new();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, s.clone(), &l);
    r.become_candidate();
    r.become_leader();

    // propose removing node 2...
    let mut cc = ConfChange::default();
    cc.set_change_type(ConfChangeType::RemoveNode);
    cc.node_id = 2;
    let mut e = Entry::default();
    e.set_entry_type(EntryType::EntryConfChange);
    e.data = cc.encode_to_vec();
    let mut m = msg(1, 1, MessageType::MsgPropose);
    m.entries = vec![e];
    r.step(m).expect("");
    let cc_index = r.raft_log.last_index();

    // ...and, while it is in flight, an ordinary command
    r.step(prop(1, b"hello")).expect("");

    // node 2 acknowledges the conf change, committing up to it
    let mut reply = msg(2, 1, MessageType::MsgAppendResponse);
    reply.index = cc_index;
    r.step(reply).expect("");
    assert_eq!(r.raft_log.committed, cc_index);
    persist(&mut r, &s);
    let committed = r.raft_log.committed;
    r.raft_log.applied_to(committed);

    // applying the removal leaves a quorum of one, which commits the
    // pending command
    r.remove_node(2).unwrap();
    assert_eq!(r.raft_log.committed, cc_index + 1);
    assert_eq!(r.prs().nodes(), vec![1]);
}

#[test]
fn test_disable_proposal_forwarding() {
    let l = default_logger();
    use Member::Fresh;
    let mut c = Cluster::with_config(
        vec![Fresh, Fresh, Fresh],
        |cfg| {
            if cfg.id == 3 {
                cfg.disable_proposal_forwarding = true;
            }
        },
        &l,
    );
    c.elect(1);

    // node 2 forwards proposals to the leader
    c.raft_mut(2).step(prop(2, b"somedata")).expect("");
    assert_eq!(c.raft(2).msgs.len(), 1);
    c.take_msgs(2);

    // node 3 refuses them outright
    assert_eq!(
        c.raft_mut(3).step(prop(3, b"somedata")),
        Err(Error::ProposalDropped)
    );
    assert!(c.raft(3).msgs.is_empty());
}
