//! Control-plane connection handling.
//!
//! Each WebSocket connection runs a small state machine:
//! `AwaitingRegistration -> Active`. Registrations overwrite the server's
//! single endpoint; commands go to the [`CommandHandler`] in any state.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registration::{ConnectionId, EndpointSlot, RegisteredEndpoint};
use crate::error::ControlError;
use crate::protocol::{Command, ControlMessage, Registration};

/// Applies relayed commands on the source machine.
pub trait CommandHandler: Send + Sync + 'static {
    fn apply(&self, command: Command);
}

/// Default handler: input injection is not wired up, commands are logged.
pub struct LogCommands;

impl CommandHandler for LogCommands {
    fn apply(&self, command: Command) {
        info!(raw = %command.raw, extra = command.extra.len(), "command received");
    }
}

/// Forward commands to another task (used by embedders and tests).
impl CommandHandler for mpsc::UnboundedSender<Command> {
    fn apply(&self, command: Command) {
        let _ = self.send(command);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingRegistration,
    Active,
}

/// Per-connection state. Discarded when the connection closes.
pub struct ControlSession<H> {
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnectionState,
    endpoint: EndpointSlot,
    handler: Arc<H>,
    /// Family of the server's data socket, preferred when resolving hosts
    data_is_ipv4: bool,
}

impl<H: CommandHandler> ControlSession<H> {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        endpoint: EndpointSlot,
        handler: Arc<H>,
        data_is_ipv4: bool,
    ) -> Self {
        Self {
            id,
            peer,
            state: ConnectionState::AwaitingRegistration,
            endpoint,
            handler,
            data_is_ipv4,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle one raw message. Malformed input is logged and ignored.
    pub async fn on_message(&mut self, parsed: Result<ControlMessage, ControlError>) {
        match parsed {
            Ok(message) => self.handle(message).await,
            Err(e) => warn!("[conn {}] {} ignored: {e}", self.id, self.peer),
        }
    }

    pub async fn handle(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Register(registration) => match self.resolve(registration).await {
                Ok(endpoint) => self.install(endpoint),
                Err(e) => warn!("[conn {}] {} registration ignored: {e}", self.id, self.peer),
            },
            ControlMessage::Command(command) => {
                debug!("[conn {}] command {:?}", self.id, command.raw);
                self.handler.apply(command);
            }
        }
    }

    fn install(&mut self, endpoint: RegisteredEndpoint) {
        match self.state {
            ConnectionState::AwaitingRegistration => {
                info!("[conn {}] registered viewer endpoint {endpoint}", self.id)
            }
            ConnectionState::Active => {
                info!("[conn {}] re-registered viewer endpoint {endpoint}", self.id)
            }
        }
        if let Some(previous) = self.endpoint.register(endpoint) {
            if previous.owner != self.id {
                info!(
                    "[conn {}] replaced endpoint {previous} from conn {}",
                    self.id, previous.owner
                );
            }
        }
        self.state = ConnectionState::Active;
    }

    async fn resolve(&self, registration: Registration) -> Result<RegisteredEndpoint, ControlError> {
        let port = registration.port;
        let (host, addr) = match registration.host {
            None => {
                let ip = self.peer.ip().to_canonical();
                (ip.to_string(), SocketAddr::new(ip, port))
            }
            Some(host) => {
                let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
                    .await
                    .map_err(|e| ControlError::Malformed(format!("cannot resolve {host}: {e}")))?
                    .collect();
                let addr = candidates
                    .iter()
                    .find(|a| a.is_ipv4() == self.data_is_ipv4)
                    .or_else(|| candidates.first())
                    .copied()
                    .ok_or_else(|| ControlError::Malformed(format!("{host} has no addresses")))?;
                (host, addr)
            }
        };
        Ok(RegisteredEndpoint {
            host,
            port,
            addr,
            owner: self.id,
        })
    }

    /// Connection closed. Optionally clear the endpoint this connection installed.
    pub fn finish(self, clear_on_disconnect: bool) {
        if self.state != ConnectionState::Active || !clear_on_disconnect {
            return;
        }
        if self.endpoint.release(self.id) {
            info!("[conn {}] viewer disconnected, streaming paused", self.id);
        } else {
            debug!("[conn {}] disconnected; endpoint owned by another connection", self.id);
        }
    }
}

/// Serve one control connection until the peer closes, the transport fails
/// or `shutdown` fires.
pub async fn serve_connection<H: CommandHandler>(
    stream: TcpStream,
    mut session: ControlSession<H>,
    clear_on_disconnect: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut ws = accept_async(stream).await?;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            msg = ws.next() => Some(msg),
        };
        let Some(msg) = next else {
            let _ = ws.close(None).await;
            break;
        };
        match msg {
            Some(Ok(WsMessage::Text(text))) => session.on_message(ControlMessage::parse(&text)).await,
            Some(Ok(WsMessage::Binary(data))) => {
                session.on_message(ControlMessage::parse_bytes(&data)).await
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("[conn {}] transport error: {e}", session.id);
                break;
            }
        }
    }

    session.finish(clear_on_disconnect);
    Ok(())
}
