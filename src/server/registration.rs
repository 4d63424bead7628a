//! The single data-plane destination the server streams to.
//!
//! Written by control connections, read by the send loop. The value lives in
//! a `watch` cell: writers replace it whole, readers clone a snapshot, so a
//! reader never sees the host of one registration with the port of another.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

/// Identifies the control connection that installed a registration.
pub type ConnectionId = u64;

/// Where the current viewer wants its frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEndpoint {
    /// Host as registered (or inferred from the peer address)
    pub host: String,
    pub port: u16,
    /// Resolved once, at registration time
    pub addr: SocketAddr,
    pub owner: ConnectionId,
}

impl fmt::Display for RegisteredEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.addr)
    }
}

/// Shared owner of the zero-or-one registered endpoint.
#[derive(Clone)]
pub struct EndpointSlot {
    cell: Arc<watch::Sender<Option<RegisteredEndpoint>>>,
}

impl Default for EndpointSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSlot {
    pub fn new() -> Self {
        let (cell, _) = watch::channel(None);
        Self {
            cell: Arc::new(cell),
        }
    }

    /// Install `endpoint`, unconditionally replacing any previous one.
    /// Returns the replaced value.
    pub fn register(&self, endpoint: RegisteredEndpoint) -> Option<RegisteredEndpoint> {
        self.cell.send_replace(Some(endpoint))
    }

    /// Snapshot of the current endpoint.
    pub fn current(&self) -> Option<RegisteredEndpoint> {
        self.cell.borrow().clone()
    }

    /// Clear the endpoint if, and only if, `owner` installed it.
    pub fn release(&self, owner: ConnectionId) -> bool {
        self.cell.send_if_modified(|current| {
            if current.as_ref().is_some_and(|ep| ep.owner == owner) {
                *current = None;
                true
            } else {
                false
            }
        })
    }
}
