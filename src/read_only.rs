// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

//! Bookkeeping for linearizable reads.
//!
//! A leader answers a read-index request by remembering the commit index the
//! request arrived at, broadcasting a heartbeat tagged with the request's
//! context, and releasing the request once a quorum has echoed the context
//! back. Requests are released in arrival order, so confirming one request
//! also confirms everything queued before it.

use std::collections::VecDeque;

use crate::raftpb::Message;
use crate::{HashMap, HashSet};

/// Determines how read only requests are confirmed.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ReadOnlyOption {
    /// Confirm leadership with a heartbeat quorum before serving the read.
    /// The default, and the only linearizable option.
    #[default]
    Safe,
    /// Serve the read under the leader lease. Clock drift can extend the
    /// lease past its real end and with it break linearizability.
    LeaseBased,
}

/// The answer to a read-index request: a commit watermark plus the opaque
/// context the host attached to the request.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct ReadState {
    /// Reads received before the request are safe to serve once the state
    /// machine has applied up to this index.
    pub index: u64,
    /// The request context, echoed back verbatim.
    pub request_ctx: Vec<u8>,
}

/// A read-index request waiting for its heartbeat quorum.
#[derive(Default, Debug, Clone)]
pub struct ReadIndexStatus {
    /// The original request message.
    pub req: Message,
    /// The commit index at the time the request was accepted.
    pub index: u64,
    /// The peers that have echoed the request context back.
    pub acks: HashSet<u64>,
}

/// The pending read-index requests, in arrival order.
#[derive(Default, Debug, Clone)]
pub struct ReadOnly {
    /// How reads are confirmed.
    pub option: ReadOnlyOption,
    /// Pending requests keyed by their context.
    pub pending_read_index: HashMap<Vec<u8>, ReadIndexStatus>,
    /// Request contexts in arrival order.
    pub read_index_queue: VecDeque<Vec<u8>>,
}

impl ReadOnly {
    pub(crate) fn new(option: ReadOnlyOption) -> ReadOnly {
        ReadOnly {
            option,
            ..Default::default()
        }
    }

    /// Queues a read-index request. `index` is the commit index when the
    /// request arrived and `req` the original request message. A request
    /// whose context is already pending is dropped: the earlier occurrence
    /// will answer for both.
    pub fn add_request(&mut self, index: u64, req: Message, self_id: u64) {
        let ctx = req.entries[0].data.clone();
        if self.pending_read_index.contains_key(&ctx) {
            return;
        }
        let mut status = ReadIndexStatus {
            req,
            index,
            acks: HashSet::default(),
        };
        status.acks.insert(self_id);
        self.read_index_queue.push_back(ctx.clone());
        self.pending_read_index.insert(ctx, status);
    }

    /// Records that `id` echoed the heartbeat carrying `ctx` and returns how
    /// many acknowledgments the request has collected so far. An unknown
    /// context counts for nothing.
    pub fn recv_ack(&mut self, id: u64, ctx: &[u8]) -> usize {
        match self.pending_read_index.get_mut(ctx) {
            Some(status) => {
                status.acks.insert(id);
                status.acks.len()
            }
            None => 0,
        }
    }

    /// Dequeues the request with context `ctx` together with every request
    /// that arrived before it. Returns nothing when `ctx` is not pending.
    pub fn advance(&mut self, ctx: &[u8]) -> Vec<ReadIndexStatus> {
        let mut released = vec![];
        if let Some(pos) = self.read_index_queue.iter().position(|c| c.as_slice() == ctx) {
            for c in self.read_index_queue.drain(..=pos) {
                if let Some(status) = self.pending_read_index.remove(&c) {
                    released.push(status);
                }
            }
        }
        released
    }

    /// The context of the most recently queued request, if any.
    pub fn last_pending_request_ctx(&self) -> Option<Vec<u8>> {
        self.read_index_queue.back().cloned()
    }
}
