//! Outbound send throttle.
//!
//! Keeps a virtual next-send-time that advances by a fixed step per message. A message may go out
//! while the virtual time is within `burst` of now, which allows short bursts; past that point the
//! writer sleeps until the virtual clock catches up. Steady state matches common server flood
//! limits (one message per `step`).

use std::time::{Duration, Instant};

/// One message per two seconds in steady state.
pub(crate) const STEP: Duration = Duration::from_millis(2000);

/// How far the virtual clock may run ahead of real time.
pub(crate) const BURST: Duration = Duration::from_millis(10_000);

pub(crate) struct Throttle {
    next_send: Instant,
    step: Duration,
    burst: Duration,
}

impl Throttle {
    pub(crate) fn new(step: Duration, burst: Duration) -> Throttle {
        Throttle {
            next_send: Instant::now(),
            step,
            burst,
        }
    }

    /// How long to wait before the next message may be written. Advances the virtual clock, so
    /// call this exactly once per message, immediately before sending it.
    pub(crate) fn next_delay(&mut self, now: Instant) -> Duration {
        if self.next_send < now {
            self.next_send = now;
        }
        let ahead = self.next_send - now;
        let delay = if ahead > self.burst {
            ahead - self.burst
        } else {
            Duration::ZERO
        };
        self.next_send += self.step;
        delay
    }
}
