// Feedback cycles: one accepted submission per identity per cycle.
//
// Unlike the rest of the core, submissions arrive on the HTTP path while the
// gateway loop toggles cycles, so all cycle state sits behind one mutex and
// the "already submitted" check and the "mark submitted" update happen under
// the same guard.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::audit::{AuditLog, LogEvent};
use crate::identity;
use crate::text::{truncate_to_max_words, MAX_COMMENT_WORDS};

pub use crate::audit::ResetReason as CycleResetReason;

pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 5;

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FeedbackRejection {
    #[error("feedback is not enabled")]
    Disabled,
    #[error("client address could not be determined")]
    IpUnknown,
    #[error("feedback already submitted this cycle")]
    AlreadySubmitted,
    #[error("rating must be an integer from 1 to 5")]
    InvalidRating,
}

impl FeedbackRejection {
    /// Stable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            FeedbackRejection::Disabled => "feedback_disabled",
            FeedbackRejection::IpUnknown => "ip_unknown",
            FeedbackRejection::AlreadySubmitted => "already_submitted",
            FeedbackRejection::InvalidRating => "invalid_rating",
        }
    }
}

/// An accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackSubmission {
    pub rating: u8,
    pub comment: String,
    pub identity: String,
    pub cycle_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CycleState {
    enabled: bool,
    cycle_id: u64,
    submitted: HashSet<String>,
}

pub struct FeedbackCollector {
    state: Mutex<CycleState>,
    audit: Arc<AuditLog>,
}

impl FeedbackCollector {
    /// Starts disabled at cycle 0.
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            state: Mutex::new(CycleState::default()),
            audit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn current_cycle(&self) -> u64 {
        self.lock().cycle_id
    }

    pub fn submitted_count(&self) -> usize {
        self.lock().submitted.len()
    }

    /// Begin a new cycle and accept submissions for it. Returns the new id.
    pub fn start_cycle(&self) -> u64 {
        let mut state = self.lock();
        if state.enabled {
            self.finish_segment(&state, CycleResetReason::NewCycle);
        }
        let previous_cycle_id = state.cycle_id;
        state.cycle_id += 1;
        state.submitted.clear();
        state.enabled = true;

        self.audit.open_feedback_segment(state.cycle_id);
        self.audit.record_feedback(&LogEvent::FeedbackCycleStart {
            cycle_id: state.cycle_id,
            previous_cycle_id,
        });
        info!(cycle_id = state.cycle_id, "feedback cycle started");
        state.cycle_id
    }

    /// Stop accepting submissions and close the cycle's journal segment.
    /// No-op when no cycle is open.
    pub fn close_cycle(&self, reason: CycleResetReason) {
        let mut state = self.lock();
        if !state.enabled {
            return;
        }
        state.enabled = false;
        self.finish_segment(&state, reason);
        info!(cycle_id = state.cycle_id, ?reason, "feedback cycle closed");
    }

    fn finish_segment(&self, state: &CycleState, reason: CycleResetReason) {
        self.audit.record_feedback(&LogEvent::FeedbackCycleReset {
            cycle_id: state.cycle_id,
            reason,
        });
        self.audit.record_feedback(&LogEvent::FeedbackCycleEnd {
            cycle_id: state.cycle_id,
            submissions: state.submitted.len(),
        });
        self.audit.close_feedback_segment();
    }

    /// Validate and record one submission.
    ///
    /// Checks run in a fixed order: enabled, identity, duplicate, rating.
    pub fn submit(
        &self,
        raw_identity: Option<&str>,
        rating: Option<i64>,
        raw_comment: Option<&str>,
    ) -> Result<FeedbackSubmission, FeedbackRejection> {
        let mut state = self.lock();

        if !state.enabled {
            return Err(FeedbackRejection::Disabled);
        }
        let identity = raw_identity
            .and_then(identity::normalize)
            .ok_or(FeedbackRejection::IpUnknown)?;
        if state.submitted.contains(&identity) {
            debug!(%identity, cycle_id = state.cycle_id, "duplicate feedback refused");
            return Err(FeedbackRejection::AlreadySubmitted);
        }
        let rating = match rating {
            Some(r) if (MIN_RATING..=MAX_RATING).contains(&r) => r as u8,
            _ => return Err(FeedbackRejection::InvalidRating),
        };

        let comment = truncate_to_max_words(raw_comment.unwrap_or_default(), MAX_COMMENT_WORDS);
        state.submitted.insert(identity.clone());

        let submission = FeedbackSubmission {
            rating,
            comment,
            identity,
            cycle_id: state.cycle_id,
            created_at: Utc::now(),
        };
        self.audit.record_feedback(&LogEvent::Feedback {
            cycle_id: submission.cycle_id,
            rating: submission.rating,
            comment: submission.comment.clone(),
            ip: submission.identity.clone(),
            submitted_at: submission.created_at,
        });
        Ok(submission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> FeedbackCollector {
        FeedbackCollector::new(Arc::new(AuditLog::disabled()))
    }

    #[test]
    fn disabled_collector_rejects_everything() {
        let c = collector();
        assert_eq!(c.submit(Some("1.1.1.1"), Some(5), None), Err(FeedbackRejection::Disabled));
    }

    #[test]
    fn one_submission_per_identity_per_cycle() {
        let c = collector();
        c.start_cycle();
        assert!(c.submit(Some("1.1.1.1"), Some(4), Some("nice")).is_ok());
        assert_eq!(
            c.submit(Some("1.1.1.1"), Some(2), None),
            Err(FeedbackRejection::AlreadySubmitted)
        );
        assert_eq!(
            c.submit(Some("::ffff:1.1.1.1"), Some(2), None),
            Err(FeedbackRejection::AlreadySubmitted),
            "mapped address is the same identity"
        );
        assert!(c.submit(Some("2.2.2.2"), Some(1), None).is_ok());
    }

    #[test]
    fn new_cycle_clears_submissions() {
        let c = collector();
        let first = c.start_cycle();
        c.submit(Some("1.1.1.1"), Some(3), None).unwrap();
        c.close_cycle(CycleResetReason::FeedbackDisabled);
        let second = c.start_cycle();
        assert_eq!(second, first + 1);
        let accepted = c.submit(Some("1.1.1.1"), Some(3), None).unwrap();
        assert_eq!(accepted.cycle_id, second);
    }

    #[test]
    fn rating_must_be_in_range() {
        let c = collector();
        c.start_cycle();
        for bad in [Some(0), Some(6), Some(-1), None] {
            assert_eq!(
                c.submit(Some("1.1.1.1"), bad, None),
                Err(FeedbackRejection::InvalidRating)
            );
        }
        assert_eq!(c.submitted_count(), 0, "invalid ratings do not mark the identity");
        assert!(c.submit(Some("1.1.1.1"), Some(1), None).is_ok());
    }

    #[test]
    fn unknown_identity_is_rejected() {
        let c = collector();
        c.start_cycle();
        assert_eq!(c.submit(None, Some(3), None), Err(FeedbackRejection::IpUnknown));
        assert_eq!(c.submit(Some("  "), Some(3), None), Err(FeedbackRejection::IpUnknown));
    }

    #[test]
    fn comment_is_truncated_to_150_words() {
        let c = collector();
        c.start_cycle();
        let long = "word ".repeat(200);
        let s = c.submit(Some("1.1.1.1"), Some(5), Some(&long)).unwrap();
        assert_eq!(s.comment.split(' ').count(), 150);
    }

    #[test]
    fn concurrent_duplicates_accept_exactly_one() {
        let c = Arc::new(collector());
        c.start_cycle();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || c.submit(Some("9.9.9.9"), Some(5), None).is_ok())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn cycle_journal_records_markers() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path()));
        let c = FeedbackCollector::new(Arc::clone(&audit));
        c.start_cycle();
        let path = audit.feedback_path().unwrap();
        c.submit(Some("1.1.1.1"), Some(5), Some("great  talk")).unwrap();
        c.close_cycle(CycleResetReason::FeedbackDisabled);
        assert!(audit.feedback_path().is_none());

        let types: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            types,
            vec!["feedback-cycle-start", "feedback", "feedback-cycle-reset", "feedback-cycle-end"]
        );
    }
}
