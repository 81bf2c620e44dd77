// Gateway event loop: owns the connection table and every piece of chat
// state, applies inbound frames one at a time and fans out the results.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use livechat_core::audit::{AuditLog, LogEvent};
use livechat_core::feedback::{CycleResetReason, FeedbackCollector};
use livechat_core::identity;
use livechat_core::ledger::{Message, MessageLedger};
use livechat_core::moderation::{BlockMeta, ModerationEngine};
use livechat_core::protocol::{self, ClientFrame, ServerFrame, BLOCKED_REASON_IP, ERR_INVALID_CODE};
use livechat_core::rate_limit::{RateDecision, RateLimiter};
use livechat_core::session::SessionRegistry;
use livechat_core::settings::{Settings, SettingsStore, SettingsUpdate};
use livechat_core::text::{self, MAX_MESSAGE_WORDS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastRouter;
use crate::config::PublicUrls;
use crate::connection::{ConnId, Connection, Outbound, Role};
use crate::ws_server::WsEvent;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long a connection may stay open without a successful join or admin-auth.
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between a failed join/admin-auth reply and the close frame.
pub const AUTH_FAILURE_CLOSE_DELAY: Duration = Duration::from_millis(100);

pub const CLOSE_REASON_VALIDATION_TIMEOUT: &str = "validation timeout";
pub const CLOSE_REASON_AUTH_FAILED: &str = "authentication failed";
pub const CLOSE_REASON_SHUTDOWN: &str = "server shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayCommand {
    Shutdown,
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// What to do with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// join / admin-auth: always evaluated.
    Validate,
    /// Sender has not joined yet: reply with a not-validated error.
    RejectUnvalidated,
    /// Admin frame from a viewer: dropped without a reply.
    IgnoreNotAdmin,
    Handle,
}

/// Decide a frame's fate from the sender's role and the frame type alone.
pub fn route(role: Role, frame_type: &str) -> Route {
    if protocol::is_validation_frame(frame_type) {
        return Route::Validate;
    }
    match role {
        Role::Unvalidated => Route::RejectUnvalidated,
        Role::Viewer if protocol::is_admin_frame(frame_type) => Route::IgnoreNotAdmin,
        Role::Viewer | Role::Admin => Route::Handle,
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct GatewayState {
    session: SessionRegistry,
    settings: SettingsStore,
    ledger: MessageLedger,
    limiter: RateLimiter,
    moderation: ModerationEngine,
    feedback: Arc<FeedbackCollector>,
    audit: Arc<AuditLog>,
    urls: PublicUrls,
    connections: BTreeMap<ConnId, Connection>,
    expired_tx: mpsc::UnboundedSender<ConnId>,
    expired_rx: Option<mpsc::UnboundedReceiver<ConnId>>,
}

impl GatewayState {
    pub fn new(
        session: SessionRegistry,
        feedback: Arc<FeedbackCollector>,
        audit: Arc<AuditLog>,
        urls: PublicUrls,
    ) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            session,
            settings: SettingsStore::new(Arc::clone(&feedback)),
            ledger: MessageLedger::new(),
            limiter: RateLimiter::new(),
            moderation: ModerationEngine::new(Arc::clone(&audit)),
            feedback,
            audit,
            urls,
            connections: BTreeMap::new(),
            expired_tx,
            expired_rx: Some(expired_rx),
        }
    }

    pub fn session(&self) -> &SessionRegistry {
        &self.session
    }

    pub fn settings(&self) -> &Settings {
        self.settings.current()
    }

    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    pub fn blocked_ips(&self) -> Vec<String> {
        self.moderation.blocked_list()
    }

    pub fn connection(&self, conn_id: ConnId) -> Option<&Connection> {
        self.connections.get(&conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn handle_ws_event(&mut self, event: WsEvent) {
        match event {
            WsEvent::Connected {
                conn_id,
                identity,
                outbound,
            } => self.on_connected(conn_id, identity, outbound),
            WsEvent::Message { conn_id, text } => self.on_frame(conn_id, &text),
            WsEvent::Disconnected { conn_id } => self.on_disconnected(conn_id),
        }
    }

    /// The validation timer for `conn_id` fired.
    pub fn handle_validation_expired(&mut self, conn_id: ConnId) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        if conn.is_validated() {
            return;
        }
        conn.cancel_validation_timer();
        info!(conn_id, "closing connection: {CLOSE_REASON_VALIDATION_TIMEOUT}");
        if conn.close(CLOSE_REASON_VALIDATION_TIMEOUT).is_err() {
            debug!(conn_id, "connection already gone");
        }
    }

    /// Close the feedback segment, close every connection and end the chat journal.
    pub fn shutdown(&mut self) {
        info!(connections = self.connections.len(), "gateway shutting down");
        self.feedback.close_cycle(CycleResetReason::Shutdown);
        for conn in self.connections.values() {
            if conn.close(CLOSE_REASON_SHUTDOWN).is_err() {
                debug!(conn_id = conn.id, "connection already gone");
            }
        }
        self.audit.end_session(self.ledger.len());
    }

    // --- connection lifecycle ---

    fn on_connected(&mut self, conn_id: ConnId, identity: Option<String>, outbound: mpsc::UnboundedSender<Outbound>) {
        let mut conn = Connection::new(conn_id, identity, outbound);
        let expired = self.expired_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(VALIDATION_TIMEOUT).await;
            let _ = expired.send(conn_id);
        });
        conn.arm_validation_timer(timer.abort_handle());
        info!(conn_id, identity = ?conn.identity, "client connected");
        self.connections.insert(conn_id, conn);
    }

    fn on_disconnected(&mut self, conn_id: ConnId) {
        if let Some(conn) = self.connections.remove(&conn_id) {
            info!(conn_id, role = ?conn.role, "client disconnected");
        }
    }

    fn on_frame(&mut self, conn_id: ConnId, raw: &str) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(conn_id, raw)));
        if outcome.is_err() {
            error!(conn_id, "frame handler panicked; frame discarded");
        }
    }

    fn dispatch(&mut self, conn_id: ConnId, raw: &str) {
        let Some(role) = self.connections.get(&conn_id).map(|c| c.role) else {
            debug!(conn_id, "frame from unknown connection");
            return;
        };
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(conn_id, "dropping malformed frame: {e}");
                return;
            }
        };
        // Untyped frames still go through `route`.
        let frame_type = protocol::frame_type(&value).unwrap_or_default().to_string();
        if frame_type.is_empty() {
            debug!(conn_id, "frame without a type");
        }

        match route(role, &frame_type) {
            Route::RejectUnvalidated => {
                debug!(conn_id, %frame_type, "frame before validation");
                self.send_to(conn_id, &ServerFrame::not_validated());
                return;
            }
            Route::IgnoreNotAdmin => {
                warn!(conn_id, %frame_type, "viewer sent an admin frame; ignored");
                return;
            }
            Route::Validate | Route::Handle => {}
        }

        let frame: ClientFrame = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(e) => {
                debug!(conn_id, %frame_type, "unsupported or invalid frame: {e}");
                return;
            }
        };

        match frame {
            ClientFrame::Join { session_code } => self.on_join(conn_id, &session_code),
            ClientFrame::AdminAuth { password } => self.on_admin_auth(conn_id, &password),
            ClientFrame::Message { user, text } => self.on_message(conn_id, &user, &text),
            ClientFrame::AdminDeleteMsg { msg_id } => self.on_delete(conn_id, msg_id),
            ClientFrame::AdminSettings(update) => self.on_settings(conn_id, &update),
            ClientFrame::AdminBlockIp { ip, reason } => self.on_block(conn_id, &ip, reason),
            ClientFrame::AdminUnblockIp { ip, .. } => self.on_unblock(conn_id, &ip),
        }
    }

    // --- validation ---

    fn on_join(&mut self, conn_id: ConnId, code: &str) {
        if !self.session.validate_join(code) {
            info!(conn_id, "join rejected: invalid session code");
            self.send_to(
                conn_id,
                &ServerFrame::JoinResult {
                    success: false,
                    code: None,
                    error: Some(ERR_INVALID_CODE.to_string()),
                },
            );
            self.close_after_failed_auth(conn_id);
            return;
        }

        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.cancel_validation_timer();
            if conn.role == Role::Unvalidated {
                conn.role = Role::Viewer;
            }
            info!(conn_id, role = ?conn.role, "client joined");
        }
        self.send_to(
            conn_id,
            &ServerFrame::JoinResult {
                success: true,
                code: Some(self.session.code().to_string()),
                error: None,
            },
        );
        self.send_to(conn_id, &self.settings_sync());
        self.send_history(conn_id);
    }

    fn on_admin_auth(&mut self, conn_id: ConnId, password: &str) {
        if !self.session.validate_admin(password) {
            warn!(conn_id, "admin authentication failed");
            self.send_to(
                conn_id,
                &ServerFrame::AdminAuthResult {
                    success: false,
                    settings: None,
                    blocked_ips: None,
                },
            );
            self.close_after_failed_auth(conn_id);
            return;
        }

        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.cancel_validation_timer();
            conn.role = Role::Admin;
            info!(conn_id, identity = ?conn.identity, "admin authenticated");
        }
        self.send_to(
            conn_id,
            &ServerFrame::AdminAuthResult {
                success: true,
                settings: Some(self.settings.current().clone()),
                blocked_ips: Some(self.moderation.blocked_list()),
            },
        );
        self.send_to(conn_id, &self.settings_sync());
        self.send_history(conn_id);
    }

    /// Close a still-unvalidated connection once the failure reply has had
    /// time to reach the client. Validated connections stay open.
    fn close_after_failed_auth(&self, conn_id: ConnId) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        if conn.is_validated() {
            return;
        }
        let outbound = conn.outbound();
        tokio::spawn(async move {
            tokio::time::sleep(AUTH_FAILURE_CLOSE_DELAY).await;
            let _ = outbound.send(Outbound::Close {
                reason: CLOSE_REASON_AUTH_FAILED.to_string(),
            });
        });
    }

    // --- chat ---

    fn on_message(&mut self, conn_id: ConnId, user: &str, raw_text: &str) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let sender = conn.identity.clone();
        let is_admin = conn.is_admin();

        if sender.as_deref().is_some_and(|ip| self.moderation.is_blocked(ip)) {
            info!(conn_id, "message from blocked sender rejected");
            self.audit.record_chat(&LogEvent::MessageRejected {
                reason: BLOCKED_REASON_IP.to_string(),
                user: user.trim().to_string(),
                text: text::truncate_to_max_words(raw_text, MAX_MESSAGE_WORDS),
                ip: sender,
            });
            self.send_to(conn_id, &ServerFrame::blocked());
            return;
        }

        if text::is_blank(raw_text) {
            debug!(conn_id, "blank message dropped");
            return;
        }

        let now = tokio::time::Instant::now().into_std();
        let decision = self
            .limiter
            .check_and_record(sender.as_deref(), is_admin, self.settings.current(), now);
        if let RateDecision::Limited { remaining_seconds } = decision {
            debug!(conn_id, remaining_seconds, "slow mode");
            let cooldown_seconds = u64::from(self.settings.current().slow_mode_seconds);
            self.send_to(
                conn_id,
                &ServerFrame::SlowMode {
                    remaining_seconds,
                    cooldown_seconds,
                },
            );
            return;
        }

        let Some(message) = self.ledger.append(user, raw_text, sender) else {
            return;
        };
        self.audit.record_chat(&LogEvent::Message {
            id: message.id,
            user: message.user.clone(),
            text: message.text.clone(),
            ip: message.sender_identity.clone(),
        });
        debug!(conn_id, msg_id = message.id, "message accepted");
        self.broadcast_message(&message);
    }

    fn broadcast_message(&self, message: &Message) {
        let router = BroadcastRouter::new(&self.connections);
        let show_ip = !self.settings.current().hide_ip && message.sender_identity.is_some();
        if show_ip {
            router.to_viewers(&message_frame(message, false));
            router.to_admins(&message_frame(message, true));
        } else {
            router.to_all_validated(&message_frame(message, false));
        }
    }

    fn send_history(&self, conn_id: ConnId) {
        let settings = self.settings.current();
        if settings.disable_chat_history {
            return;
        }
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let with_ip = conn.is_admin() && !settings.hide_ip;
        for message in self.ledger.recent(settings.max_messages as usize) {
            send_frame(conn, &message_frame(message, with_ip));
        }
    }

    // --- admin ---

    fn on_delete(&mut self, conn_id: ConnId, msg_id: u64) {
        let admin = self.identity_of(conn_id);
        let deletion = self
            .moderation
            .delete_message(&mut self.ledger, msg_id, admin.as_deref());
        info!(conn_id, msg_id, found = deletion.original.is_some(), "message deleted");

        BroadcastRouter::new(&self.connections).to_all(&ServerFrame::MessageDeleted { msg_id });
        if deletion.auto_blocked {
            info!(msg_id, "sender auto-blocked after repeated deletions");
            self.broadcast_blocklist();
        }
    }

    fn on_settings(&mut self, conn_id: ConnId, update: &SettingsUpdate) {
        let snapshot = self.settings.apply(update);
        info!(
            conn_id,
            slow_mode = snapshot.slow_mode_enabled,
            feedback = snapshot.enable_feedback_form,
            "settings updated"
        );
        BroadcastRouter::new(&self.connections).to_all_validated(&self.settings_sync());
    }

    fn on_block(&mut self, conn_id: ConnId, raw_ip: &str, reason: Option<String>) {
        let admin = self.identity_of(conn_id);
        let meta = BlockMeta {
            reason,
            by: admin,
            msg_id: None,
        };
        let applied = self.moderation.block(raw_ip, meta);
        info!(conn_id, ip = raw_ip, applied, "block requested");
        self.send_to(
            conn_id,
            &ServerFrame::AdminBlockIpResult {
                success: applied,
                ip: display_ip(raw_ip),
            },
        );
        if applied {
            self.broadcast_blocklist();
        }
    }

    fn on_unblock(&mut self, conn_id: ConnId, raw_ip: &str) {
        let admin = self.identity_of(conn_id);
        let applied = self.moderation.unblock(raw_ip, admin);
        info!(conn_id, ip = raw_ip, applied, "unblock requested");
        self.send_to(
            conn_id,
            &ServerFrame::AdminUnblockIpResult {
                success: applied,
                ip: display_ip(raw_ip),
            },
        );
        if applied {
            self.broadcast_blocklist();
        }
    }

    fn broadcast_blocklist(&self) {
        let frame = ServerFrame::BlockedIpsUpdate {
            blocked_ips: self.moderation.blocked_list(),
        };
        BroadcastRouter::new(&self.connections).to_admins(&frame);
    }

    // --- helpers ---

    fn settings_sync(&self) -> ServerFrame {
        ServerFrame::SettingsSync {
            settings: self.settings.current().clone(),
            mobile_url: self.urls.mobile_url.clone(),
            ws_url: self.urls.ws_url.clone(),
        }
    }

    fn identity_of(&self, conn_id: ConnId) -> Option<String> {
        self.connections.get(&conn_id).and_then(|c| c.identity.clone())
    }

    fn send_to(&self, conn_id: ConnId, frame: &ServerFrame) {
        if let Some(conn) = self.connections.get(&conn_id) {
            send_frame(conn, frame);
        }
    }
}

fn message_frame(message: &Message, with_ip: bool) -> ServerFrame {
    ServerFrame::Message {
        id: message.id,
        user: message.user.clone(),
        text: message.text.clone(),
        ip: if with_ip {
            message.sender_identity.clone()
        } else {
            None
        },
    }
}

fn display_ip(raw: &str) -> String {
    identity::normalize(raw).unwrap_or_else(|| raw.trim().to_string())
}

fn send_frame(conn: &Connection, frame: &ServerFrame) {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(conn_id = conn.id, "failed to serialize frame: {e}");
            return;
        }
    };
    if conn.send(json.into()).is_err() {
        warn!(conn_id = conn.id, "failed to send frame; connection closed");
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Run the gateway loop until a shutdown command arrives or the WebSocket
/// listener goes away, then shut the state down.
pub async fn run(
    mut ws_rx: mpsc::Receiver<WsEvent>,
    mut cmd_rx: mpsc::Receiver<GatewayCommand>,
    mut state: GatewayState,
) -> anyhow::Result<()> {
    let Some(mut expired_rx) = state.expired_rx.take() else {
        anyhow::bail!("gateway loop already running for this state");
    };
    info!("gateway loop started");

    loop {
        tokio::select! {
            event = ws_rx.recv() => match event {
                Some(event) => state.handle_ws_event(event),
                None => {
                    info!("WebSocket channel closed");
                    break;
                }
            },
            Some(conn_id) = expired_rx.recv() => state.handle_validation_expired(conn_id),
            cmd = cmd_rx.recv() => match cmd {
                Some(GatewayCommand::Shutdown) | None => {
                    info!("shutdown requested");
                    break;
                }
            },
        }
    }

    state.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
