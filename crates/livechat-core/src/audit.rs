// Append-only JSON-lines journals.
//
// Two independent streams: the chat journal (one file per process run) and
// the feedback journal (one file per feedback cycle). Writes are best-effort:
// a failure is reported through `tracing` and never reaches the caller.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ledger::Message;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("failed to open journal {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write journal {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize journal event: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why a feedback cycle was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetReason {
    FeedbackDisabled,
    NewCycle,
    Shutdown,
}

/// One journal record. Serialized with a kebab-case `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum LogEvent {
    SessionStart {
        session_code: String,
    },
    SessionEnd {
        total_messages: usize,
    },
    Message {
        id: u64,
        user: String,
        text: String,
        ip: Option<String>,
    },
    MessageRejected {
        reason: String,
        user: String,
        text: String,
        ip: Option<String>,
    },
    MessageDeleted {
        msg_id: u64,
        deleted_by: Option<String>,
        original: Option<Message>,
    },
    IpBlocked {
        ip: String,
        reason: Option<String>,
        blocked_by: Option<String>,
        msg_id: Option<u64>,
    },
    IpUnblocked {
        ip: String,
        unblocked_by: Option<String>,
    },
    FeedbackCycleStart {
        cycle_id: u64,
        previous_cycle_id: u64,
    },
    FeedbackCycleEnd {
        cycle_id: u64,
        submissions: usize,
    },
    FeedbackCycleReset {
        cycle_id: u64,
        reason: ResetReason,
    },
    Feedback {
        cycle_id: u64,
        rating: u8,
        comment: String,
        ip: String,
        submitted_at: DateTime<Utc>,
    },
}

#[derive(Serialize)]
struct JournalLine<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a LogEvent,
}

// ---------------------------------------------------------------------------
// Journal (one open file)
// ---------------------------------------------------------------------------

struct Journal {
    path: PathBuf,
    out: BufWriter<File>,
}

impl Journal {
    fn open(path: PathBuf) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| JournalError::Open {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    fn append(&mut self, event: &LogEvent) -> Result<(), JournalError> {
        let line = serde_json::to_string(&JournalLine {
            ts: Utc::now(),
            event,
        })?;
        writeln!(self.out, "{line}")
            .and_then(|_| self.out.flush())
            .map_err(|source| JournalError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// The audit sink shared by every component.
pub struct AuditLog {
    /// `None` disables journaling entirely.
    root: Option<PathBuf>,
    chat: Mutex<Option<Journal>>,
    feedback: Mutex<Option<Journal>>,
}

impl AuditLog {
    /// Journals will be created under `root/chat` and `root/feedback`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            chat: Mutex::new(None),
            feedback: Mutex::new(None),
        }
    }

    /// An audit log that drops every event.
    pub fn disabled() -> Self {
        Self {
            root: None,
            chat: Mutex::new(None),
            feedback: Mutex::new(None),
        }
    }

    /// Open the chat journal for this run and write `session-start`.
    pub fn start_session(&self, session_code: &str) {
        let Some(root) = &self.root else { return };
        let path = root
            .join("chat")
            .join(format!("chat-{}.jsonl", file_stamp()));
        let mut slot = lock(&self.chat);
        match Journal::open(path) {
            Ok(journal) => {
                info!(path = %journal.path.display(), "chat journal opened");
                *slot = Some(journal);
            }
            Err(e) => {
                warn!(error = %e, "chat journal unavailable; chat events will not be recorded");
                return;
            }
        }
        drop(slot);
        self.record_chat(&LogEvent::SessionStart {
            session_code: session_code.to_string(),
        });
    }

    /// Write `session-end` and close the chat journal.
    pub fn end_session(&self, total_messages: usize) {
        self.record_chat(&LogEvent::SessionEnd { total_messages });
        lock(&self.chat).take();
    }

    pub fn record_chat(&self, event: &LogEvent) {
        write_best_effort(&self.chat, event, "chat");
    }

    /// Open a new feedback segment for `cycle_id`, closing any open one.
    pub fn open_feedback_segment(&self, cycle_id: u64) {
        let Some(root) = &self.root else { return };
        let path = root
            .join("feedback")
            .join(format!("feedback-{}-cycle-{cycle_id}.jsonl", file_stamp()));
        let mut slot = lock(&self.feedback);
        match Journal::open(path) {
            Ok(journal) => {
                info!(cycle_id, path = %journal.path.display(), "feedback journal opened");
                *slot = Some(journal);
            }
            Err(e) => {
                warn!(cycle_id, error = %e, "feedback journal unavailable");
                *slot = None;
            }
        }
    }

    pub fn record_feedback(&self, event: &LogEvent) {
        write_best_effort(&self.feedback, event, "feedback");
    }

    pub fn close_feedback_segment(&self) {
        lock(&self.feedback).take();
    }

    pub fn chat_path(&self) -> Option<PathBuf> {
        lock(&self.chat).as_ref().map(|j| j.path.clone())
    }

    pub fn feedback_path(&self) -> Option<PathBuf> {
        lock(&self.feedback).as_ref().map(|j| j.path.clone())
    }
}

/// A poisoned journal lock only means a writer panicked mid-line; the file
/// handle itself is still usable.
fn lock(m: &Mutex<Option<Journal>>) -> MutexGuard<'_, Option<Journal>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_best_effort(slot: &Mutex<Option<Journal>>, event: &LogEvent, stream: &str) {
    let mut guard = lock(slot);
    let Some(journal) = guard.as_mut() else {
        debug!(stream, "journal closed, event not recorded");
        return;
    };
    if let Err(e) = journal.append(event) {
        warn!(stream, error = %e, "journal write failed");
    }
}

fn file_stamp() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn chat_journal_is_bracketed_by_session_markers() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.start_session("ABC234");
        let path = audit.chat_path().unwrap();
        audit.record_chat(&LogEvent::Message {
            id: 1,
            user: "ann".into(),
            text: "hi".into(),
            ip: Some("1.2.3.4".into()),
        });
        audit.end_session(1);
        assert!(audit.chat_path().is_none());

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "session-start");
        assert_eq!(lines[0]["sessionCode"], "ABC234");
        assert_eq!(lines[1]["type"], "message");
        assert_eq!(lines[1]["ip"], "1.2.3.4");
        assert_eq!(lines[2]["type"], "session-end");
        assert!(lines[0]["ts"].is_string());
    }

    #[test]
    fn deleted_unknown_message_records_null_original() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.start_session("ABC234");
        audit.record_chat(&LogEvent::MessageDeleted {
            msg_id: 77,
            deleted_by: None,
            original: None,
        });
        let lines = read_lines(&audit.chat_path().unwrap());
        assert_eq!(lines[1]["type"], "message-deleted");
        assert_eq!(lines[1]["msgId"], 77);
        assert!(lines[1]["original"].is_null());
    }

    #[test]
    fn feedback_segments_are_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.open_feedback_segment(1);
        let first = audit.feedback_path().unwrap();
        audit.record_feedback(&LogEvent::FeedbackCycleStart {
            cycle_id: 1,
            previous_cycle_id: 0,
        });
        audit.close_feedback_segment();
        audit.open_feedback_segment(2);
        let second = audit.feedback_path().unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().contains("cycle-2"));
        assert_eq!(read_lines(&first)[0]["type"], "feedback-cycle-start");
    }

    #[test]
    fn writes_without_open_journal_are_dropped() {
        let audit = AuditLog::disabled();
        audit.start_session("ABC234");
        audit.record_chat(&LogEvent::SessionEnd { total_messages: 0 });
        audit.record_feedback(&LogEvent::FeedbackCycleEnd {
            cycle_id: 0,
            submissions: 0,
        });
        assert!(audit.chat_path().is_none());
    }

    #[test]
    fn unwritable_directory_degrades_silently() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let audit = AuditLog::new(&blocker);
        audit.start_session("ABC234");
        audit.record_chat(&LogEvent::SessionEnd { total_messages: 0 });
        assert!(audit.chat_path().is_none());
    }

    #[test]
    fn reset_reason_serializes_kebab_case() {
        let json = serde_json::to_value(LogEvent::FeedbackCycleReset {
            cycle_id: 3,
            reason: ResetReason::FeedbackDisabled,
        })
        .unwrap();
        assert_eq!(json["type"], "feedback-cycle-reset");
        assert_eq!(json["reason"], "feedback-disabled");
        assert_eq!(json["cycleId"], 3);
    }
}
