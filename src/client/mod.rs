pub mod input;

use std::net::SocketAddr;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ViewerConfig;
use crate::error::StartupError;
use crate::protocol::framing::DatagramFramer;
use crate::protocol::ControlMessage;
use crate::screen::viewer::{self, DecodedFrame, FramePresenter};

/// Receive buffer; larger than any legal datagram
const RECV_BUFFER: usize = 1 << 16;

/// Counters from one viewing session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub datagrams: u64,
    pub frames: u64,
    pub dropped: u64,
}

/// Viewing client: one data socket, one control connection.
pub struct Viewer {
    socket: UdpSocket,
    control_url: String,
    framer: DatagramFramer,
}

impl Viewer {
    /// Bind the data socket. Failure here is fatal.
    pub async fn bind(config: &ViewerConfig) -> Result<Self, StartupError> {
        let socket = UdpSocket::bind(&config.listen_addr)
            .await
            .map_err(|source| StartupError::Bind {
                what: "data",
                addr: config.listen_addr.clone(),
                source,
            })?;
        Ok(Self {
            socket,
            control_url: config.control_url(),
            framer: DatagramFramer::default(),
        })
    }

    pub fn data_addr(&self) -> Result<SocketAddr, StartupError> {
        Ok(self.socket.local_addr()?)
    }

    /// Register with the server, then receive frames and forward commands
    /// until shutdown or until the server closes the control connection.
    ///
    /// `commands` closing only ends command forwarding; frames keep coming.
    pub async fn run<P>(
        self,
        mut commands: mpsc::Receiver<String>,
        presenter: P,
        shutdown: CancellationToken,
    ) -> Result<ReceiveStats>
    where
        P: FramePresenter + 'static,
    {
        let port = self.data_addr()?.port();
        let (ws, _) = connect_async(self.control_url.as_str())
            .await
            .map_err(|source| StartupError::Connect {
                url: self.control_url.clone(),
                source,
            })?;
        let (mut sink, mut stream) = ws.split();

        // Exactly one registration; the server infers our host.
        sink.send(WsMessage::Text(ControlMessage::register(port).to_json()?))
            .await?;
        info!("registered UDP port {port} with {}", self.control_url);

        let session = shutdown.child_token();
        let receiver = tokio::spawn(receive_loop(
            self.socket,
            self.framer,
            presenter,
            session.clone(),
        ));

        let mut commands_open = true;
        loop {
            tokio::select! {
                _ = session.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
                command = commands.recv(), if commands_open => match command {
                    Some(raw) => {
                        let text = ControlMessage::command(raw).to_json()?;
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            warn!("control channel send failed: {e}");
                            break;
                        }
                    }
                    None => {
                        commands_open = false;
                        debug!("command source closed; viewing only");
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("server closed the control connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("control connection lost: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        session.cancel();
        let stats = receiver.await?;
        info!(
            "viewer stopped: {} frames, {} dropped",
            stats.frames, stats.dropped
        );
        Ok(stats)
    }
}

/// Receive, parse and decode datagrams until `shutdown`. Bad datagrams are
/// dropped; the loop never ends because of one.
pub async fn receive_loop<P: FramePresenter>(
    socket: UdpSocket,
    framer: DatagramFramer,
    mut presenter: P,
    shutdown: CancellationToken,
) -> ReceiveStats {
    let mut stats = ReceiveStats::default();
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(pair) => pair,
            Err(e) => {
                debug!("datagram receive error: {e}");
                continue;
            }
        };
        stats.datagrams += 1;
        trace!("{len} bytes from {from}");

        match reconstruct(&framer, &buf[..len]) {
            Some(frame) => {
                stats.frames += 1;
                presenter.present(frame);
            }
            None => stats.dropped += 1,
        }
    }

    stats
}

fn reconstruct(framer: &DatagramFramer, datagram: &[u8]) -> Option<DecodedFrame> {
    let packet = match framer.decode(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("dropped datagram: {e}");
            return None;
        }
    };
    let frame = viewer::decode(packet.payload);
    if frame.is_none() {
        debug!("dropped corrupt frame ({} bytes)", packet.length);
    }
    frame
}
