//! Per-connection IRC session state machine.
//!
//! All state changes are driven by journaled events (SEND and RECEIVE lines plus connection
//! lifecycle), so replaying the journal rebuilds exactly the same state the live run had. The
//! machine never performs I/O: it returns `Outcome`s, and the orchestrator forwards the
//! `Send`/`Disconnect` ones to the connector only in realtime mode.

use crate::profiles::Profile;
use crate::windows::flags;

use mamirc_common::{IrcName, IrcNameRef};
use mamirc_wire as wire;
use mamirc_wire::{Cmd, MsgTarget, Pfx};

use regex::Regex;

use std::collections::{HashMap, HashSet};

/// Registration progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegState {
    Connecting,
    Opened,
    NickSent,
    UserSent,
    Registered,
}

/// What the state machine observed, or wants done.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    /// Our nickname changed, or a new one is being tried.
    MyNick(String),
    /// Put a line into a window. Empty party is the server window.
    Line {
        party: String,
        flags: u32,
        payload: Vec<String>,
    },
    /// We joined a channel.
    Joined(String),
    /// We left a channel.
    Parted(String),
    /// We were kicked from a channel.
    Kicked(String),
    /// Realtime only: send this raw IRC line to the server.
    Send(String),
    /// Realtime only: close this connection.
    Disconnect,
}

#[derive(Debug)]
pub(crate) struct Chan {
    pub(crate) name: IrcName,
    /// Case-insensitive membership, exact-case storage.
    pub(crate) members: HashSet<IrcName>,
    pub(crate) topic: Option<String>,
    /// In the middle of a 353 burst; cleared by 366.
    processing_names: bool,
}

impl Chan {
    fn new(name: IrcName) -> Chan {
        Chan {
            name,
            members: HashSet::new(),
            topic: None,
            processing_names: false,
        }
    }

    /// Adding a case-variant replaces the prior spelling.
    fn add_member(&mut self, nick: &str) {
        self.members.remove(IrcNameRef::new(nick));
        self.members.insert(IrcName::new(nick.to_owned()));
    }

    fn remove_member(&mut self, nick: &str) -> bool {
        self.members.remove(IrcNameRef::new(nick))
    }

    /// Members sorted case-insensitively, for NAMES lines and state dumps.
    pub(crate) fn sorted_members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .members
            .iter()
            .map(|m| m.display().to_owned())
            .collect();
        members.sort_unstable_by_key(|m| m.to_lowercase());
        members
    }
}

pub(crate) struct Session {
    pub(crate) profile: Profile,
    pub(crate) state: RegState,
    pub(crate) current_nick: Option<String>,
    /// Nicks the server refused with 432/433 during this session.
    rejected_nicks: HashSet<IrcName>,
    pub(crate) chans: HashMap<IrcName, Chan>,
    /// NickServ IDENTIFY goes out at most once per session.
    sent_nickserv_password: bool,
    /// Matches our current nick as a word, for the NICKFLAG bit.
    nick_re: Option<Regex>,
}

impl Session {
    pub(crate) fn new(profile: Profile) -> Session {
        Session {
            profile,
            state: RegState::Connecting,
            current_nick: None,
            rejected_nicks: HashSet::new(),
            chans: HashMap::new(),
            sent_nickserv_password: false,
            nick_re: None,
        }
    }

    pub(crate) fn handle_opened(&mut self) -> Vec<Outcome> {
        self.state = RegState::Opened;
        self.advance()
    }

    /// What the live driver would do next, given the current registration state. Used when the
    /// state advances and at replay catch-up; all returned outcomes are realtime-only.
    pub(crate) fn advance(&self) -> Vec<Outcome> {
        let mut out = Vec::new();
        match self.state {
            RegState::Connecting | RegState::UserSent => {}
            RegState::Opened => match self.next_nickname() {
                Some(nick) => out.push(Outcome::Send(wire::nick(nick))),
                None => out.push(Outcome::Disconnect),
            },
            RegState::NickSent => {
                out.push(Outcome::Send(wire::user(
                    &self.profile.username,
                    &self.profile.realname,
                )));
            }
            RegState::Registered => {
                if !self.sent_nickserv_password {
                    if let Some(pw) = &self.profile.nickserv_password {
                        out.push(Outcome::Send(wire::privmsg(
                            "NickServ",
                            &format!("identify {}", pw),
                        )));
                    }
                }
                for chan in &self.profile.channels {
                    if !self.chans.contains_key(IrcNameRef::new(&chan.name)) {
                        out.push(Outcome::Send(wire::join(
                            IrcNameRef::new(&chan.name),
                            chan.key.as_deref(),
                        )));
                    }
                }
            }
        }
        out
    }

    /// Process one of our own journaled SEND lines.
    pub(crate) fn handle_send(&mut self, line: &str) -> Vec<Outcome> {
        let msg = match wire::parse_line(line) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("Dropping malformed SEND line: {}", err);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        match msg.cmd {
            Cmd::NICK { nick } => {
                // Optimistic before registration; after it, wait for the server's NICK echo
                if self.state != RegState::Registered {
                    if self.state == RegState::Opened {
                        self.state = RegState::NickSent;
                        self.set_nick(&nick);
                        out.push(Outcome::MyNick(nick));
                        out.extend(self.advance());
                    } else {
                        self.set_nick(&nick);
                        out.push(Outcome::MyNick(nick));
                    }
                }
            }
            Cmd::Other { ref cmd, .. } if cmd == "USER" => {
                if self.state == RegState::NickSent {
                    self.state = RegState::UserSent;
                }
            }
            Cmd::PRIVMSG {
                target,
                msg: text,
                is_notice,
            } => {
                let party = match target {
                    MsgTarget::Chan(chan) => chan.display().to_owned(),
                    MsgTarget::User(user) => user,
                };
                if !is_notice
                    && IrcNameRef::new(&party) == IrcNameRef::new("NickServ")
                    && text.to_lowercase().starts_with("identify")
                {
                    self.sent_nickserv_password = true;
                }
                let type_flag = if is_notice {
                    flags::NOTICE
                } else {
                    flags::PRIVMSG
                };
                let nick = self.current_nick.clone().unwrap_or_default();
                out.push(Outcome::Line {
                    party,
                    flags: type_flag | flags::OUTGOING,
                    payload: vec![nick, text],
                });
            }
            _ => {}
        }
        out
    }

    /// Process one journaled RECEIVE line.
    pub(crate) fn handle_receive(&mut self, line: &str) -> Vec<Outcome> {
        let msg = match wire::parse_line(line) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("Dropping malformed RECEIVE line: {}", err);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        let pfx_nick: Option<String> = msg.pfx.as_ref().and_then(|p| p.nick()).map(str::to_owned);

        match msg.cmd {
            Cmd::PING { server } => {
                out.push(Outcome::Send(wire::pong(&server)));
            }

            Cmd::PRIVMSG {
                target,
                msg: text,
                is_notice,
            } => {
                let source = match &msg.pfx {
                    Some(Pfx::User { nick, .. }) | Some(Pfx::Ambiguous(nick)) => nick.clone(),
                    Some(Pfx::Server(server)) => server.clone(),
                    None => String::new(),
                };
                let party = match &target {
                    MsgTarget::Chan(chan) => chan.display().to_owned(),
                    MsgTarget::User(user) => {
                        // To us from a user: the private window of the sender. Everything else
                        // (server notices, host masks) lands in the server window.
                        if pfx_nick.is_some() && self.is_self(user) {
                            source.clone()
                        } else {
                            String::new()
                        }
                    }
                };
                let mut line_flags = if is_notice {
                    flags::NOTICE
                } else {
                    flags::PRIVMSG
                };
                if self.mentions_us(&text) {
                    line_flags |= flags::NICKFLAG;
                }
                out.push(Outcome::Line {
                    party,
                    flags: line_flags,
                    payload: vec![source, text],
                });
            }

            Cmd::JOIN { chan } => {
                if let Some(nick) = pfx_nick {
                    if self.is_self(&nick) {
                        self.chans.remove(chan.as_ref());
                        self.chans
                            .insert(chan.clone(), Chan::new(chan.clone()));
                        out.push(Outcome::Joined(chan.display().to_owned()));
                        out.push(Outcome::Line {
                            party: chan.display().to_owned(),
                            flags: flags::JOIN,
                            payload: vec![nick],
                        });
                    } else if let Some(chan_state) = self.chans.get_mut(chan.as_ref()) {
                        chan_state.add_member(&nick);
                        out.push(Outcome::Line {
                            party: chan.display().to_owned(),
                            flags: flags::JOIN,
                            payload: vec![nick],
                        });
                    } else {
                        debug!("JOIN for unknown channel {}", chan.display());
                    }
                }
            }

            Cmd::PART { chan, .. } => {
                if let Some(nick) = pfx_nick {
                    if self.is_self(&nick) {
                        self.chans.remove(chan.as_ref());
                        out.push(Outcome::Parted(chan.display().to_owned()));
                        out.push(Outcome::Line {
                            party: chan.display().to_owned(),
                            flags: flags::PART,
                            payload: vec![nick],
                        });
                    } else if let Some(chan_state) = self.chans.get_mut(chan.as_ref()) {
                        chan_state.remove_member(&nick);
                        out.push(Outcome::Line {
                            party: chan.display().to_owned(),
                            flags: flags::PART,
                            payload: vec![nick],
                        });
                    }
                }
            }

            Cmd::KICK { chan, nick, msg } => {
                let kicker = pfx_nick.unwrap_or_default();
                let reason = msg.unwrap_or_default();
                if self.is_self(&nick) {
                    self.chans.remove(chan.as_ref());
                    out.push(Outcome::Kicked(chan.display().to_owned()));
                    out.push(Outcome::Line {
                        party: chan.display().to_owned(),
                        flags: flags::KICK,
                        payload: vec![nick, kicker, reason],
                    });
                } else if let Some(chan_state) = self.chans.get_mut(chan.as_ref()) {
                    chan_state.remove_member(&nick);
                    out.push(Outcome::Line {
                        party: chan.display().to_owned(),
                        flags: flags::KICK,
                        payload: vec![nick, kicker, reason],
                    });
                }
            }

            Cmd::QUIT { msg } => {
                if let Some(nick) = pfx_nick {
                    let reason = msg.unwrap_or_default();
                    for chan_state in self.chans.values_mut() {
                        if chan_state.remove_member(&nick) {
                            out.push(Outcome::Line {
                                party: chan_state.name.display().to_owned(),
                                flags: flags::QUIT,
                                payload: vec![nick.clone(), reason.clone()],
                            });
                        }
                    }
                }
            }

            Cmd::NICK { nick: new_nick } => {
                if let Some(old_nick) = pfx_nick {
                    if self.is_self(&old_nick) {
                        self.set_nick(&new_nick);
                        out.push(Outcome::MyNick(new_nick.clone()));
                    }
                    for chan_state in self.chans.values_mut() {
                        if chan_state.remove_member(&old_nick) {
                            chan_state.add_member(&new_nick);
                            out.push(Outcome::Line {
                                party: chan_state.name.display().to_owned(),
                                flags: flags::NICK,
                                payload: vec![old_nick.clone(), new_nick.clone()],
                            });
                        }
                    }
                }
            }

            Cmd::MODE { target, params } => {
                let source = pfx_nick.unwrap_or_default();
                // A mode on ourselves (or any non-channel target) goes to the server window
                let party = if IrcNameRef::new(&target).is_chan() {
                    target
                } else {
                    String::new()
                };
                let mut payload = vec![source];
                payload.extend(params);
                out.push(Outcome::Line {
                    party,
                    flags: flags::MODE,
                    payload,
                });
            }

            Cmd::TOPIC { chan, topic } => {
                if let Some(chan_state) = self.chans.get_mut(chan.as_ref()) {
                    chan_state.topic = Some(topic.clone());
                }
                out.push(Outcome::Line {
                    party: chan.display().to_owned(),
                    flags: flags::TOPIC,
                    payload: vec![pfx_nick.unwrap_or_default(), topic],
                });
            }

            Cmd::ERROR { msg } => {
                out.push(Outcome::Line {
                    party: String::new(),
                    flags: flags::SERVERREPLY,
                    payload: vec!["ERROR".to_owned(), msg],
                });
            }

            Cmd::Reply { num, params } => {
                self.handle_reply(num, params, &mut out);
            }

            Cmd::PONG { .. } | Cmd::Other { .. } => {}
        }
        out
    }

    fn handle_reply(&mut self, num: u16, params: Vec<String>, out: &mut Vec<Outcome>) {
        match num {
            // Any of the welcome burst replies means registration succeeded
            1..=5 => {
                let newly_registered = self.state != RegState::Registered;
                self.state = RegState::Registered;
                if newly_registered {
                    // Some servers silently truncate long nicks; adopt the truncated form when
                    // the reported nick is a proper prefix of what we asked for
                    if let (Some(reported), Some(current)) =
                        (params.first(), self.current_nick.clone())
                    {
                        if !reported.is_empty()
                            && reported.len() < current.len()
                            && current.starts_with(reported.as_str())
                        {
                            self.set_nick(reported);
                            out.push(Outcome::MyNick(reported.clone()));
                        }
                    }
                    out.extend(self.advance());
                }
                self.server_reply(num, &params, out);
            }

            // RPL_NOTOPIC
            331 => {
                if let Some(chan) = params.get(1) {
                    if let Some(chan_state) = self.chans.get_mut(IrcNameRef::new(chan)) {
                        chan_state.topic = None;
                    }
                    out.push(Outcome::Line {
                        party: chan.clone(),
                        flags: flags::INITNOTOPIC,
                        payload: vec![],
                    });
                }
            }

            // RPL_TOPIC. RFC 2812 says two arguments, but servers commonly prepend our nick.
            332 => {
                let n_params = params.len();
                if n_params >= 2 {
                    let chan = params[n_params - 2].clone();
                    let topic = params[n_params - 1].clone();
                    if let Some(chan_state) = self.chans.get_mut(IrcNameRef::new(&chan)) {
                        chan_state.topic = Some(topic.clone());
                    }
                    out.push(Outcome::Line {
                        party: chan,
                        flags: flags::INITTOPIC,
                        payload: vec![topic],
                    });
                }
            }

            // RPL_TOPICWHOTIME: consumed, nothing to show
            333 => {}

            // RPL_NAMREPLY: the first reply of a burst replaces the member set
            353 => {
                if params.len() >= 4 {
                    let chan = IrcName::new(params[2].clone());
                    let chan_state = self
                        .chans
                        .entry(chan.clone())
                        .or_insert_with(|| Chan::new(chan));
                    if !chan_state.processing_names {
                        chan_state.members.clear();
                        chan_state.processing_names = true;
                    }
                    for nick in params[3].split_whitespace() {
                        chan_state.add_member(wire::drop_nick_prefix(nick));
                    }
                }
            }

            // RPL_ENDOFNAMES: flush the burst as one NAMES line
            366 => {
                if let Some(chan) = params.get(1) {
                    if let Some(chan_state) = self.chans.get_mut(IrcNameRef::new(chan)) {
                        chan_state.processing_names = false;
                        out.push(Outcome::Line {
                            party: chan.clone(),
                            flags: flags::NAMES,
                            payload: chan_state.sorted_members(),
                        });
                    }
                }
            }

            // ERR_ERRONEUSNICKNAME / ERR_NICKNAMEINUSE: before registration, try the next
            // configured nick; suppressed from the server window while searching
            432 | 433 if self.state != RegState::Registered => {
                if let Some(current) = self.current_nick.clone() {
                    self.rejected_nicks.insert(IrcName::new(current));
                }
                match self.next_nickname() {
                    Some(next) => out.push(Outcome::Send(wire::nick(next))),
                    None => out.push(Outcome::Disconnect),
                }
            }

            _ => {
                self.server_reply(num, &params, out);
            }
        }
    }

    /// Surface a numeric reply in the server window, with parameter 0 (our own nick) stripped.
    fn server_reply(&self, num: u16, params: &[String], out: &mut Vec<Outcome>) {
        let rest: &[String] = if params.len() > 1 { &params[1..] } else { &[] };
        out.push(Outcome::Line {
            party: String::new(),
            flags: flags::SERVERREPLY,
            payload: vec![format!("{:03}", num), rest.join(" ")],
        });
    }

    pub(crate) fn is_self(&self, nick: &str) -> bool {
        match &self.current_nick {
            Some(current) => IrcNameRef::new(current) == IrcNameRef::new(nick),
            None => false,
        }
    }

    pub(crate) fn mentions_us(&self, text: &str) -> bool {
        match &self.nick_re {
            Some(re) => re.is_match(text),
            None => false,
        }
    }

    /// First configured nickname the server has not rejected this session.
    pub(crate) fn next_nickname(&self) -> Option<&str> {
        self.profile
            .nicknames
            .iter()
            .find(|nick| !nick.is_empty() && !self.rejected_nicks.contains(IrcNameRef::new(nick)))
            .map(String::as_str)
    }

    pub(crate) fn joined_chans(&self) -> Vec<String> {
        self.chans
            .values()
            .map(|chan| chan.name.display().to_owned())
            .collect()
    }

    fn set_nick(&mut self, nick: &str) {
        self.current_nick = Some(nick.to_owned());
        // The regex crate has no lookaround, so word boundaries are spelled out as classes
        self.nick_re = Regex::new(&format!(
            "(?i)(^|[^A-Za-z0-9_]){}([^A-Za-z0-9_]|$)",
            regex::escape(nick)
        ))
        .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{Channel, Server};

    fn test_profile() -> Profile {
        Profile {
            name: "testnet".to_owned(),
            connect: true,
            servers: vec![Server {
                host: "irc.example.net".to_owned(),
                port: 6667,
                ssl: false,
            }],
            nicknames: vec!["Alice".to_owned(), "Alice_".to_owned()],
            username: "alice".to_owned(),
            realname: "Alice".to_owned(),
            nickserv_password: None,
            channels: vec![Channel {
                name: "#rust".to_owned(),
                key: None,
            }],
        }
    }

    fn registered_session() -> Session {
        let mut session = Session::new(test_profile());
        session.handle_opened();
        session.handle_send("NICK Alice");
        session.handle_send("USER alice 0 * :Alice");
        session.handle_receive(":srv 001 Alice :welcome");
        session
    }

    fn sends(out: &[Outcome]) -> Vec<&str> {
        out.iter()
            .filter_map(|o| match o {
                Outcome::Send(line) => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    fn lines_with_flag(out: &[Outcome], type_flag: u32) -> Vec<&Outcome> {
        out.iter()
            .filter(|o| {
                matches!(o, Outcome::Line { flags: f, .. } if f & flags::TYPE_MASK == type_flag)
            })
            .collect()
    }

    #[test]
    fn registration_ladder() {
        let mut session = Session::new(test_profile());
        assert_eq!(session.state, RegState::Connecting);

        let out = session.handle_opened();
        assert_eq!(session.state, RegState::Opened);
        assert_eq!(sends(&out), vec!["NICK Alice"]);

        let out = session.handle_send("NICK Alice");
        assert_eq!(session.state, RegState::NickSent);
        assert_eq!(session.current_nick.as_deref(), Some("Alice"));
        assert!(out.contains(&Outcome::MyNick("Alice".to_owned())));
        assert_eq!(sends(&out), vec!["USER alice 0 * :Alice"]);

        let out = session.handle_send("USER alice 0 * :Alice");
        assert_eq!(session.state, RegState::UserSent);
        assert!(out.is_empty());

        let out = session.handle_receive(":srv 001 Alice :Welcome, Alice");
        assert_eq!(session.state, RegState::Registered);
        // Registration triggers the configured auto-join
        assert_eq!(sends(&out), vec!["JOIN #rust"]);
    }

    #[test]
    fn nick_collision_during_registration() {
        let mut session = Session::new(test_profile());
        session.handle_opened();
        session.handle_send("NICK Alice");
        session.handle_send("USER alice 0 * :Alice");
        assert_eq!(session.state, RegState::UserSent);

        let out = session.handle_receive(":srv 433 * Alice :Nickname is already in use");
        // Alice is rejected, the next configured nick is tried, nothing hits the server window
        assert_eq!(sends(&out), vec!["NICK Alice_"]);
        assert!(lines_with_flag(&out, flags::SERVERREPLY).is_empty());

        // The retry is observed as a SEND event; state stays pre-registration
        let out = session.handle_send("NICK Alice_");
        assert_eq!(session.current_nick.as_deref(), Some("Alice_"));
        assert_eq!(session.state, RegState::UserSent);
        assert!(out.contains(&Outcome::MyNick("Alice_".to_owned())));
    }

    #[test]
    fn nick_exhaustion_disconnects() {
        let mut session = Session::new(test_profile());
        session.handle_opened();
        session.handle_send("NICK Alice");
        session.handle_receive(":srv 433 * Alice :in use");
        session.handle_send("NICK Alice_");
        let out = session.handle_receive(":srv 433 * Alice_ :in use");
        assert!(out.contains(&Outcome::Disconnect));
    }

    #[test]
    fn silent_nick_truncation_adopted() {
        let mut profile = test_profile();
        profile.nicknames = vec!["Alexandra".to_owned()];
        profile.channels.clear();
        let mut session = Session::new(profile);
        session.handle_opened();
        session.handle_send("NICK Alexandra");

        let out = session.handle_receive(":srv 001 Alex :welcome");
        assert_eq!(session.state, RegState::Registered);
        assert_eq!(session.current_nick.as_deref(), Some("Alex"));
        assert!(out.contains(&Outcome::MyNick("Alex".to_owned())));
    }

    #[test]
    fn nick_in_use_after_registration_is_surfaced() {
        let mut session = registered_session();
        let out = session.handle_receive(":srv 433 Alice Bob :Nickname is already in use");
        assert!(sends(&out).is_empty());
        assert_eq!(lines_with_flag(&out, flags::SERVERREPLY).len(), 1);
    }

    #[test]
    fn join_part_membership() {
        let mut session = registered_session();

        let out = session.handle_receive(":Alice!~a@h JOIN #rust");
        assert!(out.contains(&Outcome::Joined("#rust".to_owned())));
        assert!(session.chans.contains_key(IrcNameRef::new("#rust")));

        session.handle_receive(":Bob!~b@h JOIN #rust");
        let chan = session.chans.get(IrcNameRef::new("#rust")).unwrap();
        assert!(chan.members.contains(IrcNameRef::new("bob")));

        session.handle_receive(":Bob!~b@h PART #rust");
        let chan = session.chans.get(IrcNameRef::new("#rust")).unwrap();
        assert!(!chan.members.contains(IrcNameRef::new("bob")));

        let out = session.handle_receive(":Alice!~a@h PART #rust");
        assert!(out.contains(&Outcome::Parted("#rust".to_owned())));
        assert!(session.chans.is_empty());
    }

    #[test]
    fn kick_self_removes_channel() {
        let mut session = registered_session();
        session.handle_receive(":Alice!~a@h JOIN #rust");
        let out = session.handle_receive(":op!~o@h KICK #rust Alice :flooding");
        assert!(out.contains(&Outcome::Kicked("#rust".to_owned())));
        assert!(session.chans.is_empty());
        match &lines_with_flag(&out, flags::KICK)[..] {
            [Outcome::Line { payload, .. }] => {
                assert_eq!(payload, &vec!["Alice".to_owned(), "op".to_owned(), "flooding".to_owned()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn cross_channel_quit() {
        let mut session = registered_session();
        session.handle_receive(":Alice!~a@h JOIN #a");
        session.handle_receive(":Alice!~a@h JOIN #b");
        session.handle_receive(":Bob!~b@h JOIN #a");
        session.handle_receive(":Bob!~b@h JOIN #b");

        let out = session.handle_receive(":Bob!~b@h QUIT :bye");
        let quit_lines = lines_with_flag(&out, flags::QUIT);
        assert_eq!(quit_lines.len(), 2);
        for chan in ["#a", "#b"] {
            let chan = session.chans.get(IrcNameRef::new(chan)).unwrap();
            assert!(!chan.members.contains(IrcNameRef::new("Bob")));
        }
    }

    #[test]
    fn names_burst_replaces_members() {
        let mut session = registered_session();
        session.handle_receive(":Alice!~a@h JOIN #c");
        // Stale member that the upcoming burst must replace
        session.handle_receive(":Old!~o@h JOIN #c");

        session.handle_receive(":srv 353 Alice = #c :@Bob +Carol Dan");
        session.handle_receive(":srv 353 Alice = #c :Eve");
        let out = session.handle_receive(":srv 366 Alice #c :End of /NAMES list");

        let chan = session.chans.get(IrcNameRef::new("#c")).unwrap();
        assert_eq!(chan.members.len(), 4);
        assert!(!chan.members.contains(IrcNameRef::new("Old")));

        match &lines_with_flag(&out, flags::NAMES)[..] {
            [Outcome::Line { party, payload, .. }] => {
                assert_eq!(party, "#c");
                assert_eq!(
                    payload,
                    &vec![
                        "Bob".to_owned(),
                        "Carol".to_owned(),
                        "Dan".to_owned(),
                        "Eve".to_owned()
                    ]
                );
            }
            other => panic!("unexpected: {:?}", other),
        }

        // A later burst starts collecting afresh
        session.handle_receive(":srv 353 Alice = #c :Zoe");
        session.handle_receive(":srv 366 Alice #c :End");
        let chan = session.chans.get(IrcNameRef::new("#c")).unwrap();
        assert_eq!(chan.members.len(), 1);
    }

    #[test]
    fn nick_change_renames_everywhere() {
        let mut session = registered_session();
        session.handle_receive(":Alice!~a@h JOIN #a");
        session.handle_receive(":Alice!~a@h JOIN #b");
        session.handle_receive(":Bob!~b@h JOIN #a");
        session.handle_receive(":Bob!~b@h JOIN #b");

        let out = session.handle_receive(":Bob!~b@h NICK Robert");
        assert_eq!(lines_with_flag(&out, flags::NICK).len(), 2);
        for chan in ["#a", "#b"] {
            let chan = session.chans.get(IrcNameRef::new(chan)).unwrap();
            assert!(chan.members.contains(IrcNameRef::new("Robert")));
            assert!(!chan.members.contains(IrcNameRef::new("Bob")));
        }

        // Our own nick change comes back as a server NICK from our old nick
        let out = session.handle_receive(":Alice!~a@h NICK Alicia");
        assert!(out.contains(&Outcome::MyNick("Alicia".to_owned())));
        assert_eq!(session.current_nick.as_deref(), Some("Alicia"));
    }

    #[test]
    fn privmsg_routing_and_nickflag() {
        let mut session = registered_session();
        session.handle_receive(":Alice!~a@h JOIN #rust");

        // Channel message mentioning us sets NICKFLAG
        let out = session.handle_receive(":Bob!~b@h PRIVMSG #rust :alice: ping");
        match &out[..] {
            [Outcome::Line { party, flags: f, payload }] => {
                assert_eq!(party, "#rust");
                assert_eq!(f & flags::TYPE_MASK, flags::PRIVMSG);
                assert!(f & flags::NICKFLAG != 0);
                assert_eq!(payload[0], "Bob");
            }
            other => panic!("unexpected: {:?}", other),
        }

        // "malice" does not mention "Alice"
        let out = session.handle_receive(":Bob!~b@h PRIVMSG #rust :malice is a word");
        match &out[..] {
            [Outcome::Line { flags: f, .. }] => assert_eq!(f & flags::NICKFLAG, 0),
            other => panic!("unexpected: {:?}", other),
        }

        // Direct message opens a window keyed by the sender
        let out = session.handle_receive(":Bob!~b@h PRIVMSG Alice :hi there");
        match &out[..] {
            [Outcome::Line { party, .. }] => assert_eq!(party, "Bob"),
            other => panic!("unexpected: {:?}", other),
        }

        // Server notices go to the server window
        let out = session.handle_receive(":srv.example.net NOTICE Alice :MOTD missing");
        match &out[..] {
            [Outcome::Line { party, flags: f, .. }] => {
                assert_eq!(party, "");
                assert_eq!(f & flags::TYPE_MASK, flags::NOTICE);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn mode_routing() {
        let mut session = registered_session();
        session.handle_receive(":Alice!~a@h JOIN #rust");

        let out = session.handle_receive(":op!~o@h MODE #rust +o Bob");
        match &out[..] {
            [Outcome::Line { party, flags: f, payload }] => {
                assert_eq!(party, "#rust");
                assert_eq!(f & flags::TYPE_MASK, flags::MODE);
                assert_eq!(payload, &vec!["op".to_owned(), "+o".to_owned(), "Bob".to_owned()]);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Mode on ourselves goes to the server window
        let out = session.handle_receive(":Alice!~a@h MODE Alice :+i");
        match &out[..] {
            [Outcome::Line { party, .. }] => assert_eq!(party, ""),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn topic_handling() {
        let mut session = registered_session();
        session.handle_receive(":Alice!~a@h JOIN #rust");

        let out = session.handle_receive(":Bob!~b@h TOPIC #rust :all things rust");
        assert_eq!(lines_with_flag(&out, flags::TOPIC).len(), 1);
        assert_eq!(
            session
                .chans
                .get(IrcNameRef::new("#rust"))
                .unwrap()
                .topic
                .as_deref(),
            Some("all things rust")
        );

        // 332 sets without a user-attributed TOPIC line
        let out = session.handle_receive(":srv 332 Alice #rust :new topic");
        assert!(lines_with_flag(&out, flags::TOPIC).is_empty());
        assert_eq!(lines_with_flag(&out, flags::INITTOPIC).len(), 1);

        // 331 clears
        let out = session.handle_receive(":srv 331 Alice #rust :No topic is set");
        assert_eq!(lines_with_flag(&out, flags::INITNOTOPIC).len(), 1);
        assert_eq!(
            session.chans.get(IrcNameRef::new("#rust")).unwrap().topic,
            None
        );
    }

    #[test]
    fn ping_answered_with_pong() {
        let mut session = registered_session();
        let out = session.handle_receive("PING :srv.example.net");
        assert_eq!(sends(&out), vec!["PONG srv.example.net"]);
    }

    #[test]
    fn other_numerics_become_server_replies_with_nick_stripped() {
        let mut session = registered_session();
        let out = session.handle_receive(":srv 372 Alice :- MOTD line");
        match &lines_with_flag(&out, flags::SERVERREPLY)[..] {
            [Outcome::Line { party, payload, .. }] => {
                assert_eq!(party, "");
                assert_eq!(payload, &vec!["372".to_owned(), "- MOTD line".to_owned()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn nickserv_identify_once_per_session() {
        let mut profile = test_profile();
        profile.nickserv_password = Some("hunter2".to_owned());
        profile.channels.clear();
        let mut session = Session::new(profile);
        session.handle_opened();
        session.handle_send("NICK Alice");
        session.handle_send("USER alice 0 * :Alice");

        let out = session.handle_receive(":srv 001 Alice :welcome");
        assert_eq!(sends(&out), vec!["PRIVMSG NickServ :identify hunter2"]);

        // Observing our own SEND sets the once-per-session flag
        session.handle_send("PRIVMSG NickServ :identify hunter2");
        assert!(session.sent_nickserv_password);
        assert!(sends(&session.advance()).is_empty());
    }

    #[test]
    fn catch_up_advance_per_state() {
        // A processor restart must resume the registration sequence deterministically
        let mut session = Session::new(test_profile());
        session.handle_opened();
        assert_eq!(sends(&session.advance()), vec!["NICK Alice"]);

        session.handle_send("NICK Alice");
        assert_eq!(sends(&session.advance()), vec!["USER alice 0 * :Alice"]);

        session.handle_send("USER alice 0 * :Alice");
        assert!(session.advance().is_empty());

        session.handle_receive(":srv 001 Alice :welcome");
        // Registered but #rust not joined yet: catch-up re-issues the join
        assert_eq!(sends(&session.advance()), vec!["JOIN #rust"]);
        session.handle_receive(":Alice!~a@h JOIN #rust");
        assert!(session.advance().is_empty());
    }

    #[test]
    fn outgoing_privmsg_projection() {
        let mut session = registered_session();
        let out = session.handle_send("PRIVMSG #rust :hello world");
        match &out[..] {
            [Outcome::Line { party, flags: f, payload }] => {
                assert_eq!(party, "#rust");
                assert!(f & flags::OUTGOING != 0);
                assert_eq!(f & flags::TYPE_MASK, flags::PRIVMSG);
                assert_eq!(payload, &vec!["Alice".to_owned(), "hello world".to_owned()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
