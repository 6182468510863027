//! The processor core: all mutable state behind one mutex.
//!
//! Events from the connector, HTTP handlers and timer callbacks all lock the same `Core`. Event
//! handling is identical in replay and realtime mode except that outbound control-port commands
//! (`Send`/`Disconnect` outcomes, reconnect attempts) are only issued in realtime.

use crate::profiles::{self, Profile, ProfilesFile};
use crate::reconnect::Backoff;
use crate::session::{Outcome, RegState, Session};
use crate::updates::{Update, UpdateFeed};
use crate::windows::{flags, Window, WindowKey};

use mamirc_common::{now_ms, Event, EventKind, Lifecycle};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Handle shared by the control-port client, the HTTP server and the timers.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) core: Arc<Mutex<Core>>,
    /// Wakes long-poll waiters when the update feed moves.
    pub(crate) rcv_updates: watch::Receiver<u64>,
}

/// Messages from timer tasks back into the core.
#[derive(Debug)]
pub(crate) enum CoreMsg {
    Reconnect { profile: String, server_idx: usize },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ActionError {
    #[error("still replaying the journal, try again")]
    Replaying,
    #[error("profile '{0}' is not connected")]
    NotConnected(String),
    #[error("no such window")]
    NoSuchWindow,
    #[error("malformed action")]
    Malformed,
    #[error("invalid profiles: {0}")]
    InvalidProfiles(String),
    #[error("could not save profiles: {0}")]
    SaveFailed(String),
}

struct ReconnectState {
    backoff: Backoff,
    timer: Option<JoinHandle<()>>,
}

pub(crate) struct Core {
    pub(crate) profiles: ProfilesFile,
    profiles_path: PathBuf,
    pub(crate) sessions: HashMap<u64, Session>,
    pub(crate) windows: HashMap<WindowKey, Window>,
    pub(crate) updates: UpdateFeed,
    reconnects: HashMap<String, ReconnectState>,
    /// Command lines (without terminator) to the connector's control port.
    snd_ctl: mpsc::Sender<Vec<u8>>,
    /// Timer callbacks route back through this channel.
    snd_msg: mpsc::UnboundedSender<CoreMsg>,
    /// False while replaying the journal; gates all outbound commands.
    pub(crate) realtime: bool,
    pub(crate) csrf_token: String,
    pub(crate) session_cookie: String,
}

impl Core {
    pub(crate) fn new(
        profiles: ProfilesFile,
        profiles_path: PathBuf,
        snd_ctl: mpsc::Sender<Vec<u8>>,
        snd_msg: mpsc::UnboundedSender<CoreMsg>,
    ) -> Core {
        Core {
            profiles,
            profiles_path,
            sessions: HashMap::new(),
            windows: HashMap::new(),
            updates: UpdateFeed::new(),
            reconnects: HashMap::new(),
            snd_ctl,
            snd_msg,
            realtime: false,
            csrf_token: random_token(),
            session_cookie: random_token(),
        }
    }

    //
    // Event ingestion
    //

    pub(crate) fn handle_event(&mut self, ev: Event) {
        match ev.kind {
            EventKind::Connection => self.handle_lifecycle(ev),
            EventKind::Receive => {
                let line = String::from_utf8_lossy(&ev.line).into_owned();
                let outcomes = match self.sessions.get_mut(&ev.conn_id) {
                    Some(session) => session.handle_receive(&line),
                    None => {
                        warn!("RECEIVE event for unknown connection {}", ev.conn_id);
                        return;
                    }
                };
                self.apply(ev.conn_id, ev.timestamp, outcomes);
                self.clear_backoff_if_registered(ev.conn_id);
            }
            EventKind::Send => {
                let line = String::from_utf8_lossy(&ev.line).into_owned();
                let outcomes = match self.sessions.get_mut(&ev.conn_id) {
                    Some(session) => session.handle_send(&line),
                    None => {
                        warn!("SEND event for unknown connection {}", ev.conn_id);
                        return;
                    }
                };
                self.apply(ev.conn_id, ev.timestamp, outcomes);
            }
        }
    }

    fn handle_lifecycle(&mut self, ev: Event) {
        let text = String::from_utf8_lossy(&ev.line).into_owned();
        let lifecycle = match Lifecycle::parse(&text) {
            Some(lifecycle) => lifecycle,
            None => {
                warn!("Unparseable CONNECTION event: {:?}", text);
                return;
            }
        };

        match lifecycle {
            Lifecycle::Connect {
                host,
                port,
                ssl: _,
                profile,
            } => {
                let snapshot = self.profiles.get(&profile).cloned();
                let unknown = snapshot.is_none();
                self.sessions.insert(
                    ev.conn_id,
                    Session::new(snapshot.unwrap_or_else(|| Profile::unknown(&profile))),
                );
                self.append_line(
                    &profile,
                    "",
                    flags::CONNECTING,
                    ev.timestamp,
                    vec![host, port.to_string()],
                );
                if unknown && self.realtime {
                    warn!(
                        "Connection {} is for unknown profile '{}'; disconnecting",
                        ev.conn_id, profile
                    );
                    self.ctl_disconnect(ev.conn_id);
                }
            }
            Lifecycle::Opened { ip } => {
                let (profile, outcomes) = match self.sessions.get_mut(&ev.conn_id) {
                    Some(session) => (session.profile.name.clone(), session.handle_opened()),
                    None => {
                        warn!("opened event for unknown connection {}", ev.conn_id);
                        return;
                    }
                };
                self.append_line(&profile, "", flags::CONNECTED, ev.timestamp, vec![ip]);
                self.updates.append(Update::Connected {
                    profile: profile.clone(),
                });
                self.apply(ev.conn_id, ev.timestamp, outcomes);
            }
            Lifecycle::Disconnect => {
                // Informational; the final `closed` does the teardown
            }
            Lifecycle::Closed => self.handle_closed(ev.conn_id, ev.timestamp),
        }
    }

    fn handle_closed(&mut self, conn_id: u64, timestamp: u64) {
        let session = match self.sessions.remove(&conn_id) {
            Some(session) => session,
            None => return,
        };
        let profile = session.profile.name.clone();
        for chan in session.joined_chans() {
            self.append_line(&profile, &chan, flags::DISCONNECTED, timestamp, vec![]);
        }
        self.append_line(&profile, "", flags::DISCONNECTED, timestamp, vec![]);
        self.updates.append(Update::Disconnected {
            profile: profile.clone(),
        });
        if self.realtime {
            self.maybe_schedule_reconnect(&profile);
        }
    }

    /// Replay is over: advance every live session the way the previous live driver would have,
    /// and get disconnected-but-connectable profiles reconnecting.
    pub(crate) fn handle_caught_up(&mut self) {
        info!(
            "Journal replay complete ({} live session(s)); entering realtime mode",
            self.sessions.len()
        );
        self.realtime = true;

        let conn_ids: Vec<u64> = self.sessions.keys().copied().collect();
        for conn_id in conn_ids {
            let outcomes = match self.sessions.get(&conn_id) {
                Some(session) => session.advance(),
                None => continue,
            };
            self.apply(conn_id, now_ms(), outcomes);
        }

        let names: Vec<String> = self
            .profiles
            .profiles
            .iter()
            .filter(|p| p.connect)
            .map(|p| p.name.clone())
            .collect();
        for name in names {
            if self.session_for_profile(&name).is_none() {
                self.maybe_schedule_reconnect(&name);
            }
        }
    }

    fn apply(&mut self, conn_id: u64, timestamp: u64, outcomes: Vec<Outcome>) {
        let profile = match self.sessions.get(&conn_id) {
            Some(session) => session.profile.name.clone(),
            None => return,
        };
        for outcome in outcomes {
            match outcome {
                Outcome::MyNick(nick) => {
                    self.updates.append(Update::MyNick {
                        profile: profile.clone(),
                        nick,
                    });
                }
                Outcome::Line {
                    party,
                    flags,
                    payload,
                } => {
                    self.append_line(&profile, &party, flags, timestamp, payload);
                }
                Outcome::Joined(chan) => {
                    self.updates.append(Update::Joined {
                        profile: profile.clone(),
                        chan,
                    });
                }
                Outcome::Parted(chan) => {
                    self.updates.append(Update::Parted {
                        profile: profile.clone(),
                        chan,
                    });
                }
                Outcome::Kicked(chan) => {
                    self.updates.append(Update::Kicked {
                        profile: profile.clone(),
                        chan,
                    });
                }
                Outcome::Send(line) => {
                    if self.realtime {
                        self.ctl_send_line(conn_id, line.as_bytes());
                    }
                }
                Outcome::Disconnect => {
                    if self.realtime {
                        self.ctl_disconnect(conn_id);
                    }
                }
            }
        }
    }

    fn append_line(
        &mut self,
        profile: &str,
        party: &str,
        line_flags: u32,
        timestamp: u64,
        payload: Vec<String>,
    ) {
        let key = WindowKey::new(profile, party);
        if !self.windows.contains_key(&key) {
            self.windows.insert(key.clone(), Window::new());
            self.updates.append(Update::OpenWin {
                profile: profile.to_owned(),
                party: party.to_owned(),
            });
        }
        if let Some(window) = self.windows.get_mut(&key) {
            let line = window.add_line(line_flags, timestamp, payload);
            self.updates.append(Update::Append {
                profile: profile.to_owned(),
                party: party.to_owned(),
                line,
            });
        }
    }

    //
    // Reconnect scheduling
    //

    fn clear_backoff_if_registered(&mut self, conn_id: u64) {
        if let Some(session) = self.sessions.get(&conn_id) {
            if session.state == RegState::Registered {
                if let Some(state) = self.reconnects.remove(&session.profile.name) {
                    if let Some(timer) = state.timer {
                        timer.abort();
                    }
                }
            }
        }
    }

    fn maybe_schedule_reconnect(&mut self, profile_name: &str) {
        let n_servers = match self.profiles.get(profile_name) {
            Some(profile) if profile.connect => profile.servers.len(),
            _ => return,
        };
        if n_servers == 0 || self.session_for_profile(profile_name).is_some() {
            return;
        }

        let state = self
            .reconnects
            .entry(profile_name.to_owned())
            .or_insert_with(|| ReconnectState {
                backoff: Backoff::new(),
                timer: None,
            });
        let (delay_ms, server_idx) = state.backoff.next_attempt(n_servers);
        debug!(
            "Scheduling reconnect for '{}' in {} ms (server {})",
            profile_name, delay_ms, server_idx
        );

        let snd_msg = self.snd_msg.clone();
        let profile = profile_name.to_owned();
        state.timer = Some(tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            let _ = snd_msg.send(CoreMsg::Reconnect {
                profile,
                server_idx,
            });
        }));
    }

    /// A reconnect timer fired.
    pub(crate) fn handle_msg(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Reconnect {
                profile,
                server_idx,
            } => {
                if !self.realtime || self.session_for_profile(&profile).is_some() {
                    return;
                }
                let server = match self.profiles.get(&profile) {
                    Some(p) if p.connect && !p.servers.is_empty() => {
                        p.servers[server_idx % p.servers.len()].clone()
                    }
                    _ => return,
                };
                let cmd = Lifecycle::Connect {
                    host: server.host,
                    port: server.port,
                    ssl: server.ssl,
                    profile,
                }
                .encode();
                self.ctl_command(cmd.into_bytes());
            }
        }
    }

    /// Realtime only: the daily NAMES refresh over every joined channel.
    pub(crate) fn refresh_names(&mut self) {
        if !self.realtime {
            return;
        }
        let mut cmds: Vec<(u64, String)> = Vec::new();
        for (conn_id, session) in &self.sessions {
            if session.state == RegState::Registered {
                for chan in session.chans.values() {
                    cmds.push((*conn_id, mamirc_wire::names(chan.name.as_ref())));
                }
            }
        }
        for (conn_id, cmd) in cmds {
            self.ctl_send_line(conn_id, cmd.as_bytes());
        }
    }

    pub(crate) fn session_for_profile(&self, profile_name: &str) -> Option<u64> {
        self.sessions
            .iter()
            .find(|(_, session)| session.profile.name == profile_name)
            .map(|(conn_id, _)| *conn_id)
    }

    //
    // Control-port commands
    //

    fn ctl_command(&self, cmd: Vec<u8>) {
        if self.snd_ctl.try_send(cmd).is_err() {
            error!("Control-port command queue is closed or full");
        }
    }

    fn ctl_send_line(&self, conn_id: u64, line: &[u8]) {
        let mut cmd = format!("send {} ", conn_id).into_bytes();
        cmd.extend_from_slice(line);
        self.ctl_command(cmd);
    }

    fn ctl_disconnect(&self, conn_id: u64) {
        self.ctl_command(format!("disconnect {}", conn_id).into_bytes());
    }

    //
    // Actions (from the HTTP API)
    //

    pub(crate) fn act_send_line(&mut self, profile: &str, line: &str) -> Result<(), ActionError> {
        if !self.realtime {
            return Err(ActionError::Replaying);
        }
        let conn_id = self
            .session_for_profile(profile)
            .ok_or_else(|| ActionError::NotConnected(profile.to_owned()))?;
        // The session observes the line when the connector journals the SEND event
        self.ctl_send_line(conn_id, line.as_bytes());
        Ok(())
    }

    pub(crate) fn act_mark_read(
        &mut self,
        profile: &str,
        party: &str,
        seq: u64,
    ) -> Result<(), ActionError> {
        let key = WindowKey::new(profile, party);
        let window = self
            .windows
            .get_mut(&key)
            .ok_or(ActionError::NoSuchWindow)?;
        window.marked_read_until = seq;
        self.updates.append(Update::MarkRead {
            profile: profile.to_owned(),
            party: party.to_owned(),
            seq,
        });
        Ok(())
    }

    pub(crate) fn act_clear_lines(
        &mut self,
        profile: &str,
        party: &str,
        seq: u64,
    ) -> Result<(), ActionError> {
        let key = WindowKey::new(profile, party);
        let window = self
            .windows
            .get_mut(&key)
            .ok_or(ActionError::NoSuchWindow)?;
        window.clear_until(seq);
        self.updates.append(Update::ClearLines {
            profile: profile.to_owned(),
            party: party.to_owned(),
            seq,
        });
        Ok(())
    }

    pub(crate) fn act_open_window(&mut self, profile: &str, party: &str) -> Result<(), ActionError> {
        let key = WindowKey::new(profile, party);
        if !self.windows.contains_key(&key) {
            self.windows.insert(key, Window::new());
            self.updates.append(Update::OpenWin {
                profile: profile.to_owned(),
                party: party.to_owned(),
            });
        }
        Ok(())
    }

    pub(crate) fn act_close_window(
        &mut self,
        profile: &str,
        party: &str,
    ) -> Result<(), ActionError> {
        let key = WindowKey::new(profile, party);
        if self.windows.remove(&key).is_some() {
            self.updates.append(Update::CloseWin {
                profile: profile.to_owned(),
                party: party.to_owned(),
            });
        }
        Ok(())
    }

    pub(crate) fn act_set_initial_window(
        &mut self,
        profile: &str,
        party: &str,
    ) -> Result<(), ActionError> {
        self.profiles.initial_window = Some((profile.to_owned(), party.to_owned()));
        self.save_profiles()
    }

    pub(crate) fn act_set_profiles(&mut self, new: Vec<Profile>) -> Result<(), ActionError> {
        let candidate = ProfilesFile {
            profiles: new,
            initial_window: self.profiles.initial_window.clone(),
        };
        let errors = candidate.validate();
        if !errors.is_empty() {
            return Err(ActionError::InvalidProfiles(errors.join("; ")));
        }
        self.profiles = candidate;
        self.save_profiles()?;

        // Reconcile live state with the new configuration
        if self.realtime {
            let disconnect: Vec<u64> = self
                .sessions
                .iter()
                .filter(|(_, session)| {
                    !matches!(self.profiles.get(&session.profile.name), Some(p) if p.connect)
                })
                .map(|(conn_id, _)| *conn_id)
                .collect();
            for conn_id in disconnect {
                self.ctl_disconnect(conn_id);
            }

            let connectable: Vec<String> = self
                .profiles
                .profiles
                .iter()
                .filter(|p| p.connect)
                .map(|p| p.name.clone())
                .collect();
            for name in connectable {
                if self.session_for_profile(&name).is_none() {
                    // A fresh config change gets a fresh (immediate) attempt
                    if let Some(state) = self.reconnects.remove(&name) {
                        if let Some(timer) = state.timer {
                            timer.abort();
                        }
                    }
                    self.maybe_schedule_reconnect(&name);
                }
            }
        }
        Ok(())
    }

    fn save_profiles(&self) -> Result<(), ActionError> {
        profiles::save_atomic(&self.profiles_path, &self.profiles)
            .map_err(|err| ActionError::SaveFailed(err.to_string()))
    }
}

fn random_token() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
