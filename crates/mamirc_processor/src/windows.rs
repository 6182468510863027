//! Per-window message logs.
//!
//! A window is keyed by `(profile, party)`: the party is a channel name, a nickname (private
//! chat), or the empty string for the server window. Party comparison is case-insensitive the IRC
//! way. Each window assigns strictly increasing line sequence numbers and keeps a bounded tail.

use mamirc_common::IrcNameRef;

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

/// Every window keeps at most this many lines; overflow trims the oldest.
pub(crate) const MAX_WINDOW_LINES: usize = 10_000;

/// Line type tags, stored in the low bits of a line's flags.
pub(crate) mod flags {
    pub(crate) const PRIVMSG: u32 = 0;
    pub(crate) const NOTICE: u32 = 1;
    pub(crate) const JOIN: u32 = 2;
    pub(crate) const PART: u32 = 3;
    pub(crate) const QUIT: u32 = 4;
    pub(crate) const KICK: u32 = 5;
    pub(crate) const NICK: u32 = 6;
    pub(crate) const MODE: u32 = 7;
    pub(crate) const TOPIC: u32 = 8;
    pub(crate) const INITTOPIC: u32 = 9;
    pub(crate) const INITNOTOPIC: u32 = 10;
    pub(crate) const NAMES: u32 = 11;
    pub(crate) const SERVERREPLY: u32 = 12;
    pub(crate) const CONNECTING: u32 = 13;
    pub(crate) const CONNECTED: u32 = 14;
    pub(crate) const DISCONNECTED: u32 = 15;

    pub(crate) const TYPE_MASK: u32 = 0xF;

    /// The line originated from our own SEND.
    pub(crate) const OUTGOING: u32 = 0x10;
    /// The message text mentions our current nick.
    pub(crate) const NICKFLAG: u32 = 0x20;

    /// The constant map shipped to the web UI in `get-state`.
    pub(crate) fn constants_map() -> serde_json::Value {
        serde_json::json!({
            "PRIVMSG": PRIVMSG,
            "NOTICE": NOTICE,
            "JOIN": JOIN,
            "PART": PART,
            "QUIT": QUIT,
            "KICK": KICK,
            "NICK": NICK,
            "MODE": MODE,
            "TOPIC": TOPIC,
            "INITTOPIC": INITTOPIC,
            "INITNOTOPIC": INITNOTOPIC,
            "NAMES": NAMES,
            "SERVERREPLY": SERVERREPLY,
            "CONNECTING": CONNECTING,
            "CONNECTED": CONNECTED,
            "DISCONNECTED": DISCONNECTED,
            "TYPE_MASK": TYPE_MASK,
            "OUTGOING": OUTGOING,
            "NICKFLAG": NICKFLAG,
        })
    }
}

/// Window key. Profiles compare exactly; parties case-insensitively.
#[derive(Debug, Clone)]
pub(crate) struct WindowKey {
    pub(crate) profile: String,
    pub(crate) party: String,
}

impl WindowKey {
    pub(crate) fn new(profile: &str, party: &str) -> WindowKey {
        WindowKey {
            profile: profile.to_owned(),
            party: party.to_owned(),
        }
    }
}

impl PartialEq for WindowKey {
    fn eq(&self, other: &Self) -> bool {
        self.profile == other.profile
            && IrcNameRef::new(&self.party) == IrcNameRef::new(&other.party)
    }
}

impl Eq for WindowKey {}

impl Hash for WindowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.profile.hash(state);
        IrcNameRef::new(&self.party).hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Line {
    pub(crate) seq: u64,
    pub(crate) flags: u32,
    /// Unix milliseconds, taken from the source event.
    pub(crate) timestamp: u64,
    pub(crate) payload: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct Window {
    pub(crate) lines: VecDeque<Line>,
    next_seq: u64,
    pub(crate) marked_read_until: u64,
    pub(crate) muted: bool,
}

impl Window {
    pub(crate) fn new() -> Window {
        Window {
            lines: VecDeque::new(),
            next_seq: 0,
            marked_read_until: 0,
            muted: false,
        }
    }

    /// Append a line, assigning the next sequence number. Returns a clone for the APPEND update.
    pub(crate) fn add_line(&mut self, flags: u32, timestamp: u64, payload: Vec<String>) -> Line {
        let line = Line {
            seq: self.next_seq,
            flags,
            timestamp,
            payload,
        };
        self.next_seq += 1;
        self.lines.push_back(line.clone());
        if self.lines.len() > MAX_WINDOW_LINES {
            self.lines.pop_front();
        }
        line
    }

    /// Drop all lines with sequence number below `seq`.
    pub(crate) fn clear_until(&mut self, seq: u64) {
        while matches!(self.lines.front(), Some(line) if line.seq < seq) {
            self.lines.pop_front();
        }
    }
}
