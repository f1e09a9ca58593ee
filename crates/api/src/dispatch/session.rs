use std::collections::HashSet;

use dispatch_core::protocol::ServerMessage;
use dispatch_core::roles::Role;
use dispatch_core::types::{ConnectionId, JobId};
use dispatch_events::{Outbound, OutboundSender};

/// Protocol state for one transport.
///
/// Lives on the socket task, so nothing here needs a lock.
pub struct Session {
    conn_id: ConnectionId,
    sender: OutboundSender,
    /// `None` until a `register` succeeds.
    pub(crate) role: Option<Role>,
    pub(crate) malformed_streak: u32,
    /// Jobs this connection accepted and has not completed.
    pub(crate) active_jobs: HashSet<JobId>,
}

impl Session {
    pub fn new(conn_id: ConnectionId, sender: OutboundSender) -> Self {
        Self {
            conn_id,
            sender,
            role: None,
            malformed_streak: 0,
            active_jobs: HashSet::new(),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_registered(&self) -> bool {
        self.role.is_some()
    }

    pub fn active_jobs(&self) -> impl Iterator<Item = &JobId> {
        self.active_jobs.iter()
    }

    pub(crate) fn sender(&self) -> &OutboundSender {
        &self.sender
    }

    /// Queue a direct reply. Returns `false` once the writer is gone.
    pub fn push(&self, message: ServerMessage) -> bool {
        self.sender.send(Outbound::Message(message)).is_ok()
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close_transport(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}
