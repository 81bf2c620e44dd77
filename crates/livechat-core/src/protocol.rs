// WebSocket wire frames.
//
// Every frame is a JSON object discriminated by `type` (kebab-case); field
// names are camelCase.

use serde::{Deserialize, Serialize};

use crate::settings::{Settings, SettingsUpdate};

pub const FRAME_JOIN: &str = "join";
pub const FRAME_ADMIN_AUTH: &str = "admin-auth";

/// `error` payload for frames sent before join/admin-auth.
pub const ERR_SESSION_NOT_VALIDATED: &str = "session_not_validated";
/// `join-result` error for a wrong session code.
pub const ERR_INVALID_CODE: &str = "invalid_code";
/// `blocked` reason.
pub const BLOCKED_REASON_IP: &str = "ip-blocked";

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Join {
        #[serde(default)]
        session_code: String,
    },
    AdminAuth {
        #[serde(default)]
        password: String,
    },
    Message {
        #[serde(default)]
        user: String,
        #[serde(default)]
        text: String,
    },
    AdminDeleteMsg {
        msg_id: u64,
    },
    AdminSettings(SettingsUpdate),
    AdminBlockIp {
        ip: String,
        #[serde(default)]
        reason: Option<String>,
    },
    AdminUnblockIp {
        ip: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Read the `type` discriminator without decoding the rest of the frame.
pub fn frame_type(value: &serde_json::Value) -> Option<&str> {
    value.get("type").and_then(serde_json::Value::as_str)
}

/// True for the frame types an unvalidated connection may send.
pub fn is_validation_frame(frame_type: &str) -> bool {
    frame_type == FRAME_JOIN || frame_type == FRAME_ADMIN_AUTH
}

/// True for frame types only an admin connection may send.
pub fn is_admin_frame(frame_type: &str) -> bool {
    frame_type.starts_with("admin-") && frame_type != FRAME_ADMIN_AUTH
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    JoinResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AdminAuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        settings: Option<Settings>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blocked_ips: Option<Vec<String>>,
    },
    Message {
        id: u64,
        user: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
    },
    MessageDeleted {
        msg_id: u64,
    },
    SettingsSync {
        settings: Settings,
        mobile_url: String,
        ws_url: String,
    },
    AdminBlockIpResult {
        success: bool,
        ip: String,
    },
    AdminUnblockIpResult {
        success: bool,
        ip: String,
    },
    BlockedIpsUpdate {
        blocked_ips: Vec<String>,
    },
    Blocked {
        reason: String,
    },
    SlowMode {
        remaining_seconds: u64,
        cooldown_seconds: u64,
    },
    Error {
        error: String,
    },
}

impl ServerFrame {
    pub fn not_validated() -> Self {
        ServerFrame::Error {
            error: ERR_SESSION_NOT_VALIDATED.to_string(),
        }
    }

    pub fn blocked() -> Self {
        ServerFrame::Blocked {
            reason: BLOCKED_REASON_IP.to_string(),
        }
    }
}
