// A live WebSocket connection as seen by the gateway loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type ConnId = u64;

/// Connection privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unvalidated,
    Viewer,
    Admin,
}

/// Work queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A serialized frame, shared between every recipient of a broadcast.
    Frame(Arc<str>),
    /// Send a policy close frame with this reason and stop writing.
    Close { reason: String },
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    /// Normalized remote address; `None` when it could not be determined.
    pub identity: Option<String>,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Outbound>,
    validation_timer: Option<AbortHandle>,
}

impl Connection {
    pub fn new(id: ConnId, identity: Option<String>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            identity,
            role: Role::Unvalidated,
            joined_at: Utc::now(),
            outbound,
            validation_timer: None,
        }
    }

    pub fn is_validated(&self) -> bool {
        self.role != Role::Unvalidated
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The writer task is still draining this connection's queue.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn send(&self, frame: Arc<str>) -> Result<(), mpsc::error::SendError<Outbound>> {
        self.outbound.send(Outbound::Frame(frame))
    }

    pub fn close(&self, reason: &str) -> Result<(), mpsc::error::SendError<Outbound>> {
        self.outbound.send(Outbound::Close {
            reason: reason.to_string(),
        })
    }

    /// A clone of the outbound queue, for tasks that close the connection later.
    pub fn outbound(&self) -> mpsc::UnboundedSender<Outbound> {
        self.outbound.clone()
    }

    pub fn arm_validation_timer(&mut self, handle: AbortHandle) {
        if let Some(previous) = self.validation_timer.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the validation timer. Returns whether one was armed.
    pub fn cancel_validation_timer(&mut self) -> bool {
        match self.validation_timer.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel_validation_timer();
    }
}
