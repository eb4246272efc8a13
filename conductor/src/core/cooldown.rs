//! Per-agent rate limiting for wake signals.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::types::Role;

/// Tracks the last wake signal sent to each agent.
#[derive(Debug, Clone)]
pub struct Cooldown {
    interval: Duration,
    last_sent: HashMap<Role, Instant>,
}

impl Cooldown {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: HashMap::new(),
        }
    }

    /// Time left before `agent` may be signalled again, or `None` if it may be
    /// signalled now.
    pub fn remaining(&self, agent: Role, now: Instant) -> Option<Duration> {
        let last = self.last_sent.get(&agent)?;
        let elapsed = now.saturating_duration_since(*last);
        (elapsed < self.interval).then(|| self.interval - elapsed)
    }

    /// Record a successful signal.
    pub fn record(&mut self, agent: Role, now: Instant) {
        self.last_sent.insert(agent, now);
    }

    /// Forget the last signal so the next one goes out immediately.
    pub fn reset(&mut self, agent: Role) {
        self.last_sent.remove(&agent);
    }
}
