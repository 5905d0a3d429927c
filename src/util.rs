// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

//! Small helpers shared across the consensus core.

use std::fmt;
use std::fmt::Write;

use crate::raftpb::Entry;
use prost::Message as PbMessage;
use slog::{OwnedKVList, Record, KV};

/// A number to represent that there is no limit.
pub const NO_LIMIT: u64 = u64::MAX;

/// Truncates the list so that the encoded sizes of its items stay within
/// `max` bytes in total. The first item survives even when it alone exceeds
/// the cap, so a non-empty list never truncates to nothing.
pub fn limit_size<T: PbMessage + Clone>(entries: &mut Vec<T>, max: Option<u64>) {
    if entries.len() <= 1 {
        return;
    }
    let max = match max {
        None | Some(NO_LIMIT) => return,
        Some(max) => max,
    };

    let mut size = 0;
    let limit = entries
        .iter()
        .take_while(|&e| {
            if size == 0 {
                size += e.encoded_len() as u64;
                true
            } else {
                size += e.encoded_len() as u64;
                size <= max
            }
        })
        .count();

    entries.truncate(limit);
}

/// The size an entry counts for in proposal admission: the bytes of its
/// payload, not of its encoded form.
#[inline]
pub fn payload_size(e: &Entry) -> u64 {
    e.data.len() as u64
}

struct FormatKeyValueList {
    pub buffer: String,
}

impl slog::Serializer for FormatKeyValueList {
    fn emit_arguments(&mut self, key: slog::Key, val: &fmt::Arguments) -> slog::Result {
        if !self.buffer.is_empty() {
            write!(&mut self.buffer, ", {}: {}", key, val).unwrap();
        } else {
            write!(&mut self.buffer, "{}: {}", key, val).unwrap();
        }
        Ok(())
    }
}

pub(crate) fn format_kv_list(kv_list: &OwnedKVList) -> String {
    let mut formatter = FormatKeyValueList {
        buffer: "".to_owned(),
    };
    let record = record_static!(slog::Level::Trace, "");
    kv_list
        .serialize(
            &Record::new(&record, &format_args!(""), b!()),
            &mut formatter,
        )
        .unwrap();
    formatter.buffer
}

/// Get the majority number of given nodes count.
#[inline]
pub fn majority(total: usize) -> usize {
    (total / 2) + 1
}
