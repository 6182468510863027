//! The global update feed consumed by long-poll clients.
//!
//! Update ids are strictly increasing over all state mutations. A bounded buffer keeps a
//! contiguous suffix of issued updates; when it overflows, the oldest half is dropped and clients
//! that fell behind get a resync signal instead of a gap.

use crate::windows::Line;

use serde_json::{json, Value};

use std::collections::VecDeque;

use tokio::sync::watch;

pub(crate) const UPDATE_BUFFER_MAX: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Update {
    Append {
        profile: String,
        party: String,
        line: Line,
    },
    MyNick {
        profile: String,
        nick: String,
    },
    Joined {
        profile: String,
        chan: String,
    },
    Parted {
        profile: String,
        chan: String,
    },
    Kicked {
        profile: String,
        chan: String,
    },
    Connected {
        profile: String,
    },
    Disconnected {
        profile: String,
    },
    OpenWin {
        profile: String,
        party: String,
    },
    CloseWin {
        profile: String,
        party: String,
    },
    MarkRead {
        profile: String,
        party: String,
        seq: u64,
    },
    ClearLines {
        profile: String,
        party: String,
        seq: u64,
    },
}

impl Update {
    /// Wire shape: a JSON array with a leading discriminator string, matching what the web UI
    /// dispatches on.
    pub(crate) fn to_json(&self) -> Value {
        match self {
            Update::Append {
                profile,
                party,
                line,
            } => {
                let mut arr = vec![
                    json!("APPEND"),
                    json!(profile),
                    json!(party),
                    json!(line.seq),
                    json!(line.flags),
                    json!(line.timestamp),
                ];
                arr.extend(line.payload.iter().map(|p| json!(p)));
                Value::Array(arr)
            }
            Update::MyNick { profile, nick } => json!(["MYNICK", profile, nick]),
            Update::Joined { profile, chan } => json!(["JOINED", profile, chan]),
            Update::Parted { profile, chan } => json!(["PARTED", profile, chan]),
            Update::Kicked { profile, chan } => json!(["KICKED", profile, chan]),
            Update::Connected { profile } => json!(["CONNECTED", profile]),
            Update::Disconnected { profile } => json!(["DISCONNECTED", profile]),
            Update::OpenWin { profile, party } => json!(["OPENWIN", profile, party]),
            Update::CloseWin { profile, party } => json!(["CLOSEWIN", profile, party]),
            Update::MarkRead {
                profile,
                party,
                seq,
            } => json!(["MARKREAD", profile, party, seq]),
            Update::ClearLines {
                profile,
                party,
                seq,
            } => json!(["CLEARLINES", profile, party, seq]),
        }
    }
}

/// Result of a `get_updates` poll.
#[derive(Debug, PartialEq)]
pub(crate) enum Poll {
    /// start id negative or past the head: the caller must resync its protocol state.
    BadRange,
    /// start id fell out of the retained buffer: the caller does a full state fetch.
    Evicted,
    /// Updates with id >= start id; empty when the caller is at the head.
    Updates(Vec<Value>),
}

pub(crate) struct UpdateFeed {
    buffer: VecDeque<(u64, Update)>,
    next_id: u64,
    snd_next_id: watch::Sender<u64>,
}

impl UpdateFeed {
    pub(crate) fn new() -> UpdateFeed {
        let (snd_next_id, _) = watch::channel(0);
        UpdateFeed {
            buffer: VecDeque::new(),
            next_id: 0,
            snd_next_id,
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id
    }

    /// A long-poll waiter subscribes and waits for `next_id` to move.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.snd_next_id.subscribe()
    }

    pub(crate) fn append(&mut self, update: Update) {
        self.buffer.push_back((self.next_id, update));
        self.next_id += 1;
        if self.buffer.len() > UPDATE_BUFFER_MAX {
            let drop_n = self.buffer.len() / 2;
            self.buffer.drain(..drop_n);
        }
        let _ = self.snd_next_id.send(self.next_id);
    }

    pub(crate) fn get_since(&self, start_id: i64) -> Poll {
        if start_id < 0 || start_id as u64 > self.next_id {
            return Poll::BadRange;
        }
        let start_id = start_id as u64;
        let oldest = self.next_id - self.buffer.len() as u64;
        if start_id < oldest {
            return Poll::Evicted;
        }
        let updates = self
            .buffer
            .iter()
            .skip((start_id - oldest) as usize)
            .map(|(_, update)| update.to_json())
            .collect();
        Poll::Updates(updates)
    }
}
