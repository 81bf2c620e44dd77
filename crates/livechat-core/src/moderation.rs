// IP blocklist with automatic escalation after repeated deletions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::{AuditLog, LogEvent};
use crate::identity;
use crate::ledger::{Message, MessageLedger};

/// Deletions attributed to one identity before it is blocked automatically.
pub const AUTO_BLOCK_THRESHOLD: u32 = 2;

/// Reason recorded for automatic blocks.
pub const AUTO_BLOCK_REASON: &str = "auto-two-deletions";

/// Who asked for a block or unblock and why.
#[derive(Debug, Clone, Default)]
pub struct BlockMeta {
    pub reason: Option<String>,
    pub by: Option<String>,
    pub msg_id: Option<u64>,
}

/// Result of an admin deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct Deletion {
    /// The message before deletion, or `None` for an unknown id.
    pub original: Option<Message>,
    /// Whether this deletion pushed the sender over the auto-block threshold.
    pub auto_blocked: bool,
}

pub struct ModerationEngine {
    blocked: BTreeSet<String>,
    deletion_counts: HashMap<String, u32>,
    audit: Arc<AuditLog>,
}

impl ModerationEngine {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            blocked: BTreeSet::new(),
            deletion_counts: HashMap::new(),
            audit,
        }
    }

    pub fn is_blocked(&self, identity: &str) -> bool {
        identity::normalize(identity).is_some_and(|id| self.blocked.contains(&id))
    }

    /// Blocked identities in sorted order.
    pub fn blocked_list(&self) -> Vec<String> {
        self.blocked.iter().cloned().collect()
    }

    pub fn deletion_count(&self, identity: &str) -> u32 {
        identity::normalize(identity)
            .and_then(|id| self.deletion_counts.get(&id).copied())
            .unwrap_or(0)
    }

    /// Block `raw`. Returns false when it is already blocked or is not a
    /// usable identity.
    pub fn block(&mut self, raw: &str, meta: BlockMeta) -> bool {
        let Some(id) = identity::normalize(raw) else {
            warn!(raw, "refusing to block empty identity");
            return false;
        };
        if !self.blocked.insert(id.clone()) {
            return false;
        }
        info!(ip = %id, reason = ?meta.reason, "identity blocked");
        self.audit.record_chat(&LogEvent::IpBlocked {
            ip: id,
            reason: meta.reason,
            blocked_by: meta.by,
            msg_id: meta.msg_id,
        });
        true
    }

    /// Unblock `raw` and reset its deletion counter. Returns false when it
    /// was not blocked.
    pub fn unblock(&mut self, raw: &str, by: Option<String>) -> bool {
        let Some(id) = identity::normalize(raw) else {
            return false;
        };
        if !self.blocked.remove(&id) {
            return false;
        }
        self.deletion_counts.remove(&id);
        info!(ip = %id, "identity unblocked");
        self.audit.record_chat(&LogEvent::IpUnblocked {
            ip: id,
            unblocked_by: by,
        });
        true
    }

    /// Count a deletion against `identity` and block it when the count
    /// reaches the threshold. Returns whether a block was applied.
    ///
    /// The counter only resets on manual unblock, so deletions past the
    /// threshold change nothing further.
    pub fn record_deletion_and_maybe_auto_block(
        &mut self,
        identity: &str,
        msg_id: u64,
        admin_identity: Option<&str>,
    ) -> bool {
        let Some(id) = identity::normalize(identity) else {
            return false;
        };
        let count = self.deletion_counts.entry(id.clone()).or_insert(0);
        *count += 1;
        if *count != AUTO_BLOCK_THRESHOLD {
            return false;
        }
        self.block(
            &id,
            BlockMeta {
                reason: Some(AUTO_BLOCK_REASON.to_string()),
                by: admin_identity.map(str::to_string),
                msg_id: Some(msg_id),
            },
        )
    }

    /// Soft-delete `msg_id`, journal the deletion and charge it to the sender.
    ///
    /// Deleting an unknown id still journals a `message-deleted` event with a
    /// null original. Re-deleting an already-deleted message is not counted.
    pub fn delete_message(
        &mut self,
        ledger: &mut MessageLedger,
        msg_id: u64,
        admin_identity: Option<&str>,
    ) -> Deletion {
        let original = ledger.soft_delete(msg_id);
        self.audit.record_chat(&LogEvent::MessageDeleted {
            msg_id,
            deleted_by: admin_identity.map(str::to_string),
            original: original.clone(),
        });

        let auto_blocked = match &original {
            Some(m) if !m.deleted => m
                .sender_identity
                .as_deref()
                .is_some_and(|sender| self.record_deletion_and_maybe_auto_block(sender, msg_id, admin_identity)),
            _ => false,
        };

        Deletion {
            original,
            auto_blocked,
        }
    }
}
