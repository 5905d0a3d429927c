// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

/*!

The consensus core of a Raft-replicated key-value store.

Only the deterministic heart of the protocol lives here: given the same
stream of inputs, two instances produce identical outputs. The core performs
no I/O, never reads a clock and spawns no threads. The disk, the network, the
state machine and the timer all belong to the host, which drives the core
through four entry points on [`RawNode`](raw_node/struct.RawNode.html):

- `tick()` advances the logical clock; election and heartbeat timeouts are
  counted in ticks.
- `step(msg)` feeds in a message received from a peer (or, through the
  wrappers `propose`, `campaign`, `read_index` and friends, a local request).
- `ready()` hands back everything the core wants done: entries to persist,
  messages to send, committed entries to apply, state updates to record.
- `advance(ready)` reports that the batch has been persisted and applied, so
  the next batch can build on it.

Entries from a Ready must be durable before its messages are sent, and a
Ready must be fully processed before the next one is taken.

The in-memory [`MemStorage`](storage/struct.MemStorage.html) below stands in
for the host's durable log:

```rust
use kvraft::{Config, storage::MemStorage, raw_node::RawNode};
use slog::{Drain, o};

let logger = slog::Logger::root(slog_stdlog::StdLog.fuse(), o!());
let storage = MemStorage::new_with_conf_state((vec![1], vec![]));
let config = Config { id: 1, ..Default::default() };
let mut node = RawNode::new(&config, storage, &logger).unwrap();

// A group with a single voter elects itself as soon as it campaigns.
node.campaign().unwrap();
node.propose(vec![], b"put k v".to_vec()).unwrap();

let mut ready = node.ready();
// 1. Persist the new entries and the hard state.
node.mut_store().wl().append(&ready.entries).unwrap();
if let Some(hs) = ready.hs() {
    node.mut_store().wl().set_hardstate(hs.clone());
}
// 2. Send ready.messages to the peers (there are none here).
// 3. Apply what has been committed: the leader's no-op, then the proposal.
let committed = ready.committed_entries.take().unwrap_or_default();
assert_eq!(committed.last().unwrap().data, b"put k v");
// 4. Hand the batch back so the applied index moves forward.
node.advance(ready);
```

In a real cluster the host repeats that cycle forever, routing each drained
message to the peer named in its `to` field and stepping every received
message back in.

*/

#![deny(clippy::all)]
#![deny(missing_docs)]

#[macro_use]
extern crate getset;
#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate slog;

macro_rules! fatal {
    ($logger:expr, $msg:expr) => {{
        let owned_kv = ($logger).list();
        let s = crate::util::format_kv_list(&owned_kv);
        if s.is_empty() {
            panic!("{}", $msg)
        } else {
            panic!("{}, {}", $msg, s)
        }
    }};
    ($logger:expr, $fmt:expr, $($arg:tt)+) => {{
        fatal!($logger, format_args!($fmt, $($arg)+))
    }};
}

mod config;
mod errors;
mod log_unstable;
mod progress;
mod raft;
mod raft_log;
pub mod raftpb;
pub mod raw_node;
mod read_only;
pub mod storage;
pub mod util;

pub use self::config::Config;
pub use self::errors::{Error, Result, StorageError};
pub use self::log_unstable::Unstable;
pub use self::progress::{Inflights, Progress, ProgressSet, ProgressState};
pub use self::raft::{
    conf_change_from_entry, vote_resp_msg_type, Raft, SoftState, StateRole, INVALID_ID,
    INVALID_INDEX,
};
pub use self::raft_log::{RaftLog, NO_LIMIT};
pub use self::raw_node::{is_local_msg, RawNode, Ready, SnapshotStatus};
pub use self::read_only::{ReadOnlyOption, ReadState};
pub use self::storage::{MemStorage, RaftState, Storage};
pub use self::util::majority;

/// A "prelude" for crates using the `kvraft` crate.
///
/// ```
/// use kvraft::prelude::*;
/// ```
pub mod prelude {
    pub use crate::raftpb::{
        ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType,
        Snapshot, SnapshotMetadata,
    };

    pub use crate::config::Config;
    pub use crate::raft::Raft;

    pub use crate::storage::{MemStorage, RaftState, Storage};

    pub use crate::raw_node::{RawNode, Ready, SnapshotStatus};

    pub use crate::progress::Progress;

    pub use crate::read_only::{ReadOnlyOption, ReadState};
}

/// The default logger we fall back to when passed `None` in external facing constructors.
///
/// Currently, this is a `log` adaptor behind a `OnceLock` to ensure there is no clobbering.
#[cfg(any(test, feature = "default-logger"))]
pub fn default_logger() -> slog::Logger {
    use slog::Drain;
    use std::sync::{Mutex, OnceLock};

    static LOGGER: OnceLock<slog::Logger> = OnceLock::new();

    let logger = LOGGER.get_or_init(|| {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::CompactFormat::new(decorator).build();
        let drain = slog_envlogger::new(drain);
        slog::Logger::root(Mutex::new(drain).fuse(), o!())
    });
    if let Some(case) = std::thread::current()
        .name()
        .and_then(|v| v.split(':').last())
    {
        logger.new(o!("case" => case.to_string()))
    } else {
        logger.new(o!())
    }
}

type DefaultHashBuilder = std::hash::BuildHasherDefault<fxhash::FxHasher>;
type HashMap<K, V> = std::collections::HashMap<K, V, DefaultHashBuilder>;
type HashSet<K> = std::collections::HashSet<K, DefaultHashBuilder>;
