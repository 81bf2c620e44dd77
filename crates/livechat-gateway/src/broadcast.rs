// Fan-out of server frames to live connections.

use std::collections::BTreeMap;
use std::sync::Arc;

use livechat_core::protocol::ServerFrame;
use tracing::{debug, warn};

use crate::connection::{ConnId, Connection, Role};

/// Per-broadcast delivery counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

/// A borrowed view over the live connection table.
pub struct BroadcastRouter<'a> {
    connections: &'a BTreeMap<ConnId, Connection>,
}

impl<'a> BroadcastRouter<'a> {
    pub fn new(connections: &'a BTreeMap<ConnId, Connection>) -> Self {
        Self { connections }
    }

    /// Every open connection, validated or not.
    pub fn to_all(&self, frame: &ServerFrame) -> FanOut {
        self.fan_out(frame, |_| true, "all")
    }

    pub fn to_admins(&self, frame: &ServerFrame) -> FanOut {
        self.fan_out(frame, Connection::is_admin, "admins")
    }

    /// Viewers and admins; never connections that have not joined yet.
    pub fn to_all_validated(&self, frame: &ServerFrame) -> FanOut {
        self.fan_out(frame, Connection::is_validated, "validated")
    }

    pub fn to_viewers(&self, frame: &ServerFrame) -> FanOut {
        self.fan_out(frame, |c| c.role == Role::Viewer, "viewers")
    }

    /// Serialize once and send to every open connection matching `filter`.
    /// A failed send is logged and skipped; the rest of the batch still goes out.
    fn fan_out(&self, frame: &ServerFrame, filter: impl Fn(&Connection) -> bool, label: &str) -> FanOut {
        let json: Arc<str> = match serde_json::to_string(frame) {
            Ok(j) => j.into(),
            Err(e) => {
                warn!(label, error = %e, "failed to serialize broadcast frame");
                return FanOut::default();
            }
        };

        let mut out = FanOut::default();
        for conn in self.connections.values().filter(|c| c.is_open() && filter(c)) {
            match conn.send(Arc::clone(&json)) {
                Ok(()) => out.delivered += 1,
                Err(_) => {
                    out.failed += 1;
                    warn!(conn_id = conn.id, label, "failed to deliver broadcast frame");
                }
            }
        }
        debug!(label, delivered = out.delivered, failed = out.failed, "broadcast");
        out
    }
}
