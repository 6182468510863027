//! Per-profile reconnect backoff.
//!
//! The first attempt fires immediately; afterwards the delay doubles per attempt up to a cap. The
//! server index rotates through the profile's server list, so a network with several servers gets
//! each of them tried in turn. Successful registration clears the state entirely.

pub(crate) const INITIAL_DELAY_MS: u64 = 1000;
pub(crate) const MAX_DELAY_MS: u64 = 200_000;

#[derive(Debug)]
pub(crate) struct Backoff {
    server_idx: usize,
    delay_ms: u64,
    first: bool,
}

impl Backoff {
    pub(crate) fn new() -> Backoff {
        Backoff {
            server_idx: 0,
            delay_ms: INITIAL_DELAY_MS,
            first: true,
        }
    }

    /// Returns `(delay before this attempt in ms, server index to use)` and advances the state.
    pub(crate) fn next_attempt(&mut self, n_servers: usize) -> (u64, usize) {
        let delay = if self.first {
            self.first = false;
            0
        } else {
            self.delay_ms = (self.delay_ms * 2).min(MAX_DELAY_MS);
            self.delay_ms
        };
        let idx = if n_servers == 0 {
            0
        } else {
            self.server_idx % n_servers
        };
        self.server_idx = self.server_idx.wrapping_add(1);
        (delay, idx)
    }
}
