//! Shared connector state: the journal, the live connection table, and the attached processor.
//!
//! Everything runs on one thread (a tokio `LocalSet`), so the state lives in a `Rc<RefCell<..>>`
//! and borrows are short and never held across an await point.

use crate::conn::{ConnCmd, ConnHandle};
use crate::journal::Journal;

use mamirc_common::{Event, EventKind, Lifecycle};

use std::cell::RefCell;
use std::rc::Rc;
use std::collections::HashMap;

use tokio::sync::mpsc;

#[derive(Clone)]
pub(crate) struct Connector {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    journal: Journal,
    /// Live outbound connections.
    conns: HashMap<u64, ConnHandle>,
    /// Event-line sink of the attached processor, if any.
    attached: Option<mpsc::Sender<Vec<u8>>>,
}

impl Connector {
    pub(crate) fn new(journal: Journal) -> Connector {
        Connector {
            inner: Rc::new(RefCell::new(Inner {
                journal,
                conns: HashMap::new(),
                attached: None,
            })),
        }
    }

    pub(crate) fn alloc_conn_id(&self) -> u64 {
        self.inner.borrow_mut().journal.alloc_conn_id()
    }

    pub(crate) fn register_conn(&self, conn_id: u64, handle: ConnHandle) {
        self.inner.borrow_mut().conns.insert(conn_id, handle);
    }

    pub(crate) fn remove_conn(&self, conn_id: u64) {
        self.inner.borrow_mut().conns.remove(&conn_id);
    }

    pub(crate) fn cmd_sender(&self, conn_id: u64) -> Option<mpsc::Sender<ConnCmd>> {
        self.inner
            .borrow()
            .conns
            .get(&conn_id)
            .map(|handle| handle.snd_cmd.clone())
    }

    pub(crate) fn list_connections(&self) -> Vec<(u64, String)> {
        let inner = self.inner.borrow();
        let mut conns: Vec<(u64, String)> = inner
            .conns
            .iter()
            .map(|(id, handle)| (*id, handle.profile.clone()))
            .collect();
        conns.sort_unstable_by_key(|(id, _)| *id);
        conns
    }

    /// Journal an event, then forward it to the attached processor. The journal write happens
    /// first so that a subscriber never sees an event that would be lost by a crash.
    ///
    /// Returns false when the journal write failed; the caller must tear the connection down.
    pub(crate) fn emit(&self, conn_id: u64, kind: EventKind, line: &[u8]) -> bool {
        let mut inner = self.inner.borrow_mut();
        let ev = match inner.journal.append(conn_id, kind, line) {
            Ok(ev) => ev,
            Err(err) => {
                error!("Journal write failed for connection {}: {}", conn_id, err);
                return false;
            }
        };
        if let Some(snd) = &inner.attached {
            if snd.try_send(ev.encode_line()).is_err() {
                warn!("Event stream to processor backlogged or closed; detaching");
                inner.attached = None;
            }
        }
        true
    }

    /// Install `snd` as the attached processor and return the full journal replay, atomically:
    /// there is no await between the snapshot and the install, so every event is either in the
    /// returned replay or will be forwarded, never both, never neither.
    ///
    /// Returns `None` when a processor is already attached.
    pub(crate) fn attach(&self, snd: mpsc::Sender<Vec<u8>>) -> Option<Vec<Event>> {
        let mut inner = self.inner.borrow_mut();
        if inner.attached.is_some() {
            return None;
        }
        let replay = match inner.journal.replay() {
            Ok(replay) => replay,
            Err(err) => {
                error!("Journal replay failed: {}", err);
                return None;
            }
        };
        inner.attached = Some(snd);
        Some(replay)
    }

    /// Drop the attachment, but only if it still belongs to `snd` (a later attach may have
    /// replaced a broken one).
    pub(crate) fn detach(&self, snd: &mpsc::Sender<Vec<u8>>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(attached) = &inner.attached {
            if attached.same_channel(snd) {
                inner.attached = None;
            }
        }
    }

    /// Clean shutdown: journal a `closed` event for every live connection, fsync, exit.
    pub(crate) fn terminate(&self) -> ! {
        info!("Terminating");
        let conn_ids: Vec<u64> = self.inner.borrow().conns.keys().copied().collect();
        for conn_id in conn_ids {
            self.emit(
                conn_id,
                EventKind::Connection,
                Lifecycle::Closed.encode().as_bytes(),
            );
        }
        self.inner.borrow_mut().journal.sync();
        std::process::exit(0);
    }
}
