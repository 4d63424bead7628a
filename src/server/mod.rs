pub mod control;
pub mod registration;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::StartupError;
use crate::protocol::framing::DatagramFramer;
use crate::screen::FrameSource;
use control::{serve_connection, CommandHandler, ControlSession};
use registration::{ConnectionId, EndpointSlot};

/// What one tick of the send loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No viewer registered; nothing captured
    Idle,
    /// Capture, encode or framing failed for this tick only
    Skipped,
    /// One datagram handed to the socket. Delivery is never confirmed.
    Sent { to: SocketAddr, bytes: usize },
}

/// The data-plane half: capture, frame and send one datagram per tick.
pub struct FrameSender<S> {
    socket: UdpSocket,
    source: S,
    framer: DatagramFramer,
    endpoint: EndpointSlot,
    /// Consecutive failed ticks, to keep a dead display from flooding the log
    failures: AtomicU64,
}

impl<S: FrameSource> FrameSender<S> {
    pub fn new(socket: UdpSocket, source: S, framer: DatagramFramer, endpoint: EndpointSlot) -> Self {
        Self {
            socket,
            source,
            framer,
            endpoint,
            failures: AtomicU64::new(0),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn tick(&self) -> TickOutcome {
        let Some(target) = self.endpoint.current() else {
            return TickOutcome::Idle;
        };

        let frame = match self.source.capture_and_encode().await {
            Ok(frame) => frame,
            Err(e) => {
                self.record_failure(&e);
                return TickOutcome::Skipped;
            }
        };
        let datagram = match self.framer.encode(&frame) {
            Ok(datagram) => datagram,
            Err(e) => {
                self.record_failure(&e);
                return TickOutcome::Skipped;
            }
        };
        if self.failures.swap(0, Ordering::Relaxed) > 0 {
            info!("frame capture recovered");
        }

        // Fire-and-forget: a full buffer or unreachable viewer looks like success.
        if let Err(e) = self.socket.send_to(&datagram, target.addr).await {
            trace!("send to {} failed: {e}", target.addr);
        }
        TickOutcome::Sent {
            to: target.addr,
            bytes: datagram.len(),
        }
    }

    fn record_failure(&self, e: &dyn std::error::Error) {
        if self.failures.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!("frame skipped: {e}");
        } else {
            debug!("frame skipped: {e}");
        }
    }

    /// Tick at a fixed period until `shutdown`. Overrunning ticks delay the
    /// next one; there is no catch-up burst.
    pub async fn run(&self, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.tick() => outcome,
            };
            if let TickOutcome::Sent { .. } = outcome {
                sent += 1;
            }
        }
        info!("send loop stopped after {sent} frames");
    }
}

/// Capture server: control listener plus fixed-cadence frame sender.
pub struct StreamServer<S, H> {
    listener: TcpListener,
    sender: FrameSender<S>,
    handler: Arc<H>,
    endpoint: EndpointSlot,
    frame_interval: Duration,
    clear_on_disconnect: bool,
}

impl<S, H> StreamServer<S, H>
where
    S: FrameSource,
    H: CommandHandler,
{
    /// Bind both sockets. Failure here is fatal.
    pub async fn bind(config: &ServerConfig, source: S, handler: H) -> Result<Self, StartupError> {
        let listener = TcpListener::bind(&config.control_addr)
            .await
            .map_err(|source| StartupError::Bind {
                what: "control",
                addr: config.control_addr.clone(),
                source,
            })?;
        let socket = UdpSocket::bind(&config.data_addr)
            .await
            .map_err(|source| StartupError::Bind {
                what: "data",
                addr: config.data_addr.clone(),
                source,
            })?;

        let endpoint = EndpointSlot::new();
        let framer = DatagramFramer::new(config.max_payload);
        Ok(Self {
            listener,
            sender: FrameSender::new(socket, source, framer, endpoint.clone()),
            handler: Arc::new(handler),
            endpoint,
            frame_interval: config.frame_interval(),
            clear_on_disconnect: config.clear_on_disconnect,
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr, StartupError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn data_addr(&self) -> Result<SocketAddr, StartupError> {
        Ok(self.sender.local_addr()?)
    }

    /// Handle on the registered endpoint, shared with the running server.
    #[cfg(test)]
    pub fn endpoint(&self) -> EndpointSlot {
        self.endpoint.clone()
    }

    /// Serve until `shutdown` fires. Both sockets are closed on return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let data_is_ipv4 = self.data_addr()?.is_ipv4();
        let Self {
            listener,
            sender,
            handler,
            endpoint,
            frame_interval,
            clear_on_disconnect,
        } = self;

        let accept = tokio::spawn(accept_loop(
            listener,
            endpoint,
            handler,
            AcceptOptions {
                clear_on_disconnect,
                data_is_ipv4,
            },
            shutdown.clone(),
        ));

        sender.run(frame_interval, shutdown).await;
        accept.await?;
        Ok(())
    }
}

struct AcceptOptions {
    clear_on_disconnect: bool,
    data_is_ipv4: bool,
}

async fn accept_loop<H: CommandHandler>(
    listener: TcpListener,
    endpoint: EndpointSlot,
    handler: Arc<H>,
    options: AcceptOptions,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    let mut next_id: ConnectionId = 0;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };

        next_id += 1;
        let id = next_id;
        info!("[conn {id}] control client connected: {peer}");

        let session = ControlSession::new(
            id,
            peer,
            endpoint.clone(),
            handler.clone(),
            options.data_is_ipv4,
        );
        let clear = options.clear_on_disconnect;
        let token = shutdown.clone();
        connections.spawn(async move {
            // Non-WebSocket clients (scanners, health checks) fail the handshake.
            if let Err(e) = serve_connection(stream, session, clear, token).await {
                debug!("[conn {id}] handshake failed: {e}");
            }
            info!("[conn {id}] control client disconnected");
        });

        while connections.try_join_next().is_some() {}
    }

    while connections.join_next().await.is_some() {}
    debug!("control listener closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use crate::protocol::{Command, ControlMessage};
    use async_trait::async_trait;
    use futures_util::SinkExt;
    use super::registration::RegisteredEndpoint;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    /// Returns the same payload every tick; optionally fails the first `fail_first` calls.
    struct StaticFrames {
        payload: Vec<u8>,
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl StaticFrames {
        fn new(payload: Vec<u8>) -> Self {
            Self {
                payload,
                fail_first: 0,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FrameSource for Arc<StaticFrames> {
        async fn capture_and_encode(&self) -> Result<Vec<u8>, CodecError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(CodecError::Capture("display asleep".into()));
            }
            Ok(self.payload.clone())
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            control_addr: "127.0.0.1:0".into(),
            data_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        }
    }

    async fn bind_server(
        frames: Arc<StaticFrames>,
    ) -> (
        StreamServer<Arc<StaticFrames>, mpsc::UnboundedSender<Command>>,
        mpsc::UnboundedReceiver<Command>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = StreamServer::bind(&test_config(), frames, tx).await.unwrap();
        (server, rx)
    }

    fn endpoint_for(socket: &UdpSocket, owner: ConnectionId) -> RegisteredEndpoint {
        let addr = socket.local_addr().unwrap();
        RegisteredEndpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            addr,
            owner,
        }
    }

    #[tokio::test]
    async fn test_tick_without_endpoint_does_nothing() {
        let frames = Arc::new(StaticFrames::new(vec![1, 2, 3]));
        let (server, _rx) = bind_server(frames.clone()).await;

        assert_eq!(server.sender.tick().await, TickOutcome::Idle);
        assert_eq!(frames.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registration_overwrite_targets_latest() {
        let frames = Arc::new(StaticFrames::new(b"frame".to_vec()));
        let (server, _rx) = bind_server(frames).await;
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        server.endpoint().register(endpoint_for(&first, 1));
        server.endpoint().register(endpoint_for(&second, 2));

        let outcome = server.sender.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Sent {
                to: second.local_addr().unwrap(),
                bytes: 4 + 5
            }
        );

        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(2), second.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"\0\0\0\x05frame");
        assert!(timeout(Duration::from_millis(200), first.recv_from(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_send_is_fire_and_forget() {
        let frames = Arc::new(StaticFrames::new(vec![0xAB; 100]));
        let (server, _rx) = bind_server(frames).await;

        // Nobody listens on this port once the socket is dropped.
        let gone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server.endpoint().register(endpoint_for(&gone, 1));
        let addr = gone.local_addr().unwrap();
        drop(gone);

        for _ in 0..2 {
            assert_eq!(
                server.sender.tick().await,
                TickOutcome::Sent { to: addr, bytes: 104 }
            );
        }
    }

    #[tokio::test]
    async fn test_capture_failure_is_tick_local() {
        let frames = Arc::new(StaticFrames {
            payload: b"ok".to_vec(),
            fail_first: 2,
            calls: AtomicUsize::new(0),
        });
        let (server, _rx) = bind_server(frames).await;
        let viewer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server.endpoint().register(endpoint_for(&viewer, 1));

        assert_eq!(server.sender.tick().await, TickOutcome::Skipped);
        assert_eq!(server.sender.tick().await, TickOutcome::Skipped);
        assert!(matches!(server.sender.tick().await, TickOutcome::Sent { .. }));
    }

    #[tokio::test]
    async fn test_oversized_frame_skipped() {
        let frames = Arc::new(StaticFrames::new(vec![0u8; 70_000]));
        let (server, _rx) = bind_server(frames).await;
        let viewer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server.endpoint().register(endpoint_for(&viewer, 1));

        assert_eq!(server.sender.tick().await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_command_relay_over_websocket() {
        let frames = Arc::new(StaticFrames::new(b"frame".to_vec()));
        let (server, mut commands) = bind_server(frames).await;
        let control = server.control_addr().unwrap();
        let slot = server.endpoint();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(server.run(shutdown.clone()));

        let (mut ws, _) = connect_async(format!("ws://{control}")).await.unwrap();
        let register = ControlMessage::register(10000).to_json().unwrap();
        ws.send(WsMessage::Text(register)).await.unwrap();
        let command = ControlMessage::command("click:100,200").to_json().unwrap();
        ws.send(WsMessage::Text(command)).await.unwrap();

        let received = timeout(Duration::from_secs(2), commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.raw, "click:100,200");

        // Registration arrived first on the ordered channel and is untouched.
        let ep = slot.current().unwrap();
        assert_eq!(ep.addr, SocketAddr::from(([127, 0, 0, 1], 10000)));
        assert!(timeout(Duration::from_millis(100), commands.recv()).await.is_err());

        shutdown.cancel();
        timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let frames = Arc::new(StaticFrames::new(b"frame".to_vec()));
        let (server, mut commands) = bind_server(frames).await;
        let control = server.control_addr().unwrap();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(server.run(shutdown.clone()));

        let (mut ws, _) = connect_async(format!("ws://{control}")).await.unwrap();
        ws.send(WsMessage::Text("{\"type\":\"nope\"}".into())).await.unwrap();
        ws.send(WsMessage::Binary(vec![0xff, 0x00])).await.unwrap();
        let command = ControlMessage::command("still here").to_json().unwrap();
        ws.send(WsMessage::Text(command)).await.unwrap();

        let received = timeout(Duration::from_secs(2), commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.raw, "still here");

        shutdown.cancel();
        timeout(Duration::from_secs(2), running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_clears_endpoint() {
        let frames = Arc::new(StaticFrames::new(b"frame".to_vec()));
        let (server, _rx) = bind_server(frames).await;
        let control = server.control_addr().unwrap();
        let slot = server.endpoint();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(server.run(shutdown.clone()));

        let (mut ws, _) = connect_async(format!("ws://{control}")).await.unwrap();
        let register = ControlMessage::register(10000).to_json().unwrap();
        ws.send(WsMessage::Text(register)).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while slot.current().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        ws.close(None).await.unwrap();
        drop(ws);

        timeout(Duration::from_secs(2), async {
            while slot.current().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        timeout(Duration::from_secs(2), running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_startup_error() {
        let frames = Arc::new(StaticFrames::new(vec![]));
        let (server, _rx) = bind_server(frames.clone()).await;
        let taken = server.control_addr().unwrap();

        let config = ServerConfig {
            control_addr: taken.to_string(),
            ..test_config()
        };
        let (tx, _rx2) = mpsc::unbounded_channel::<Command>();
        let err = match StreamServer::bind(&config, frames, tx).await {
            Ok(_) => panic!("second bind on {taken} succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, StartupError::Bind { what: "control", .. }));
    }
}
