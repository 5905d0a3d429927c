// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

use std::{cmp, error, io, result};

quick_error! {
    /// The base error type for the consensus core.
    #[derive(Debug)]
    pub enum Error {
        /// An IO error occurred.
        Io(err: io::Error) {
            from()
            cause(err)
            display("io error: {}", err)
        }
        /// A storage error occurred.
        Store(err: StorageError) {
            from()
            cause(err)
            display("storage error: {}", err)
        }
        /// Raft cannot step a local message received over the network.
        StepLocalMsg {
            display("raft: cannot step raft local message")
        }
        /// The raft peer is not found and thus cannot step.
        StepPeerNotFound {
            display("raft: cannot step as peer not found")
        }
        /// The proposal was dropped; the caller may retry later.
        ProposalDropped {
            display("raft: proposal dropped")
        }
        /// The configuration is invalid.
        ConfigInvalid(desc: String) {
            display("{}", desc)
        }
        /// A message codec failed in some manner.
        CodecError(err: prost::DecodeError) {
            from()
            cause(err)
            display("codec error: {}", err)
        }
        /// The node exists, but should not.
        Exists(id: u64, set: &'static str) {
            display("The node {} already exists in the {} set.", id, set)
        }
        /// The node does not exist, but should.
        NotExists(id: u64, set: &'static str) {
            display("The node {} is not in the {} set.", id, set)
        }
    }
}

impl cmp::PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::StepPeerNotFound, Error::StepPeerNotFound) => true,
            (Error::ProposalDropped, Error::ProposalDropped) => true,
            (Error::Store(e1), Error::Store(e2)) => e1 == e2,
            (Error::Io(e1), Error::Io(e2)) => e1.kind() == e2.kind(),
            (Error::StepLocalMsg, Error::StepLocalMsg) => true,
            (Error::ConfigInvalid(e1), Error::ConfigInvalid(e2)) => e1 == e2,
            (Error::CodecError(e1), Error::CodecError(e2)) => e1 == e2,
            (Error::Exists(id1, set1), Error::Exists(id2, set2)) => id1 == id2 && set1 == set2,
            (Error::NotExists(id1, set1), Error::NotExists(id2, set2)) => {
                id1 == id2 && set1 == set2
            }
            _ => false,
        }
    }
}

quick_error! {
    /// An error with the storage.
    #[derive(Debug)]
    pub enum StorageError {
        /// The requested index precedes the last snapshot.
        Compacted {
            display("log compacted")
        }
        /// The requested index is past the last index.
        Unavailable {
            display("log unavailable")
        }
        /// The snapshot is out of date.
        SnapshotOutOfDate {
            display("snapshot out of date")
        }
        /// The snapshot is being created; retry later.
        SnapshotTemporarilyUnavailable {
            display("snapshot is temporarily unavailable")
        }
        /// Some other error occurred.
        Other(err: Box<dyn error::Error + Sync + Send>) {
            from()
            cause(err.as_ref())
            display("unknown error {:?}", err)
        }
    }
}

impl cmp::PartialEq for StorageError {
    fn eq(&self, other: &StorageError) -> bool {
        matches!(
            (self, other),
            (StorageError::Compacted, StorageError::Compacted)
                | (StorageError::Unavailable, StorageError::Unavailable)
                | (StorageError::SnapshotOutOfDate, StorageError::SnapshotOutOfDate)
                | (
                    StorageError::SnapshotTemporarilyUnavailable,
                    StorageError::SnapshotTemporarilyUnavailable,
                )
        )
    }
}

/// A result type that wraps up the raft errors.
pub type Result<T> = result::Result<T, Error>;
