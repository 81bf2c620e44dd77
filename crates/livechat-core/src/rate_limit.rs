// Per-identity slow-mode cooldown tracking.

use std::collections::HashMap;
use std::time::Instant;

use crate::settings::Settings;

/// Outcome of a slow-mode check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Rejected; `remaining_seconds` is rounded up and at least 1.
    Limited { remaining_seconds: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    last_sent: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the cooldown for `identity` and, when allowed, record `now` as
    /// its last send time. Check and record happen in one `&mut self` call,
    /// so two submissions can never both pass.
    ///
    /// Slow mode off, admin senders and unknown identities are always allowed.
    pub fn check_and_record(
        &mut self,
        identity: Option<&str>,
        is_admin: bool,
        settings: &Settings,
        now: Instant,
    ) -> RateDecision {
        let Some(cooldown) = settings.slow_mode_cooldown() else {
            return RateDecision::Allowed;
        };
        if is_admin {
            return RateDecision::Allowed;
        }
        let Some(identity) = identity else {
            return RateDecision::Allowed;
        };

        if let Some(last) = self.last_sent.get(identity) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < cooldown {
                let remaining = cooldown - elapsed;
                let mut secs = remaining.as_secs();
                if remaining.subsec_nanos() > 0 {
                    secs += 1;
                }
                return RateDecision::Limited {
                    remaining_seconds: secs.max(1),
                };
            }
        }

        self.last_sent.insert(identity.to_string(), now);
        RateDecision::Allowed
    }
}
