//! One client transport session.
//!
//! A connection runs an inbound read loop and an outbound write loop
//! concurrently. The write loop drains a bounded queue of encoded frames and
//! emits keepalive pings; the read loop hands each inbound frame to the
//! dispatcher on its own task and extends the idle deadline on every pong.
//! Whichever loop stops first moves the connection to `Closing`, which
//! unregisters it exactly once before the transport is closed.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::registry::ClientRegistry;

/// Opaque 128-bit identifier assigned at accept time. Never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId([u8; 16]);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", hex::encode(self.0))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("send queue full for {0:?}")]
    Timeout(Duration),

    #[error("send queue full")]
    Full,
}

/// Non-owning handle to a connection's outbound queue.
///
/// Holds a weak reference to the queue, so it never keeps a connection alive.
/// A frame that cannot be queued closes the connection: a reader that falls
/// this far behind is dropped rather than shown a gap in its stream.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    id: ConnectionId,
    tx: mpsc::WeakSender<Vec<u8>>,
    close: Arc<watch::Sender<bool>>,
    send_timeout: Duration,
}

impl ConnectionSender {
    pub fn new(id: ConnectionId, tx: &mpsc::Sender<Vec<u8>>, send_timeout: Duration) -> Self {
        let (close, _) = watch::channel(false);
        Self {
            id,
            tx: tx.downgrade(),
            close: Arc::new(close),
            send_timeout,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue an encoded frame, waiting up to `send_timeout` for room.
    /// Frames are written in enqueue order.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), SendError> {
        let tx = self.tx.upgrade().ok_or(SendError::Closed)?;
        match tx.send_timeout(frame, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.close_slow_reader();
                Err(SendError::Timeout(self.send_timeout))
            }
            Err(SendTimeoutError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Enqueue an encoded frame without waiting.
    pub fn try_send(&self, frame: Vec<u8>) -> Result<(), SendError> {
        let tx = self.tx.upgrade().ok_or(SendError::Closed)?;
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.close_slow_reader();
                Err(SendError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Ask the connection to close.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    /// Receiver that observes [`close`](Self::close).
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }

    fn close_slow_reader(&self) {
        warn!(conn = %self.id, "outbound queue full, closing connection");
        self.close();
    }
}

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound frame queue.
    pub send_buffer: usize,
    /// Largest inbound frame accepted before the session is dropped.
    pub max_message_bytes: usize,
    /// Deadline for a single transport write, and the producer backpressure bound.
    pub write_wait: Duration,
    /// Idle-read deadline, extended by every pong.
    pub pong_wait: Duration,
}

impl ConnectionConfig {
    /// Keepalive ping period: 9/10 of the pong deadline.
    pub fn ping_period(&self) -> Duration {
        (self.pong_wait * 9) / 10
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_buffer: 128,
            max_message_bytes: 4096,
            write_wait: Duration::from_secs(5),
            pong_wait: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Serving,
    Closing,
    Closed,
}

impl ConnectionState {
    fn advance(&mut self, id: ConnectionId, next: ConnectionState) {
        debug!(conn = %id, from = ?*self, to = ?next, "connection state");
        *self = next;
    }
}

/// A single accepted WebSocket session.
pub struct Connection<S> {
    id: ConnectionId,
    ws: WebSocketStream<S>,
    remote_addr: SocketAddr,
    config: ConnectionConfig,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        ws: WebSocketStream<S>,
        remote_addr: SocketAddr,
        config: ConnectionConfig,
        registry: Arc<ClientRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            ws,
            remote_addr,
            config,
            registry,
            dispatcher,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run the session to completion.
    ///
    /// Returns once both loops have exited and the transport is closed.
    pub async fn serve(self, shutdown: broadcast::Receiver<()>) {
        let Connection {
            id,
            ws,
            remote_addr,
            config,
            registry,
            dispatcher,
        } = self;
        let mut state = ConnectionState::Accepted;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(config.send_buffer);
        let sender = ConnectionSender::new(id, &tx, config.write_wait);
        let close_rx = sender.close_signal();

        if let Err(e) = registry.register(id, sender.clone()).await {
            warn!(conn = %id, error = %e, "failed to register connection");
            return;
        }
        state.advance(id, ConnectionState::Serving);
        info!(conn = %id, remote = %remote_addr, "connection serving");

        let (sink, stream) = ws.split();

        let mut reader = tokio::spawn(read_loop(
            id,
            stream,
            sender.clone(),
            dispatcher,
            config.clone(),
            close_rx.clone(),
        ));
        let mut writer = tokio::spawn(write_loop(id, sink, rx, config.clone(), close_rx));

        tokio::select! {
            _ = &mut reader => {}
            _ = &mut writer => {}
            _ = shutdown_requested(shutdown) => {
                debug!(conn = %id, "server shutdown, closing connection");
            }
        }

        state.advance(id, ConnectionState::Closing);
        if let Err(e) = registry.unregister(id).await {
            warn!(conn = %id, error = %e, "failed to unregister connection");
        }
        sender.close();

        let _ = reader.await;
        if let Ok(mut sink) = writer.await {
            let _ = tokio::time::timeout(config.write_wait, sink.send(Message::Close(None))).await;
            let _ = sink.close().await;
        }
        drop(tx);

        state.advance(id, ConnectionState::Closed);
        info!(conn = %id, remote = %remote_addr, "connection closed");
    }
}

/// Resolves when a shutdown is broadcast. A dropped sender never resolves.
async fn shutdown_requested(mut shutdown: broadcast::Receiver<()>) {
    loop {
        match shutdown.recv().await {
            Ok(()) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn read_loop<S>(
    id: ConnectionId,
    mut stream: SplitStream<WebSocketStream<S>>,
    sender: ConnectionSender,
    dispatcher: Arc<Dispatcher>,
    config: ConnectionConfig,
    mut close_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let next = tokio::select! {
            _ = close_rx.changed() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                debug!(conn = %id, "read deadline expired");
                break;
            }
            Ok(None) => {
                debug!(conn = %id, "peer closed transport");
                break;
            }
            Ok(Some(Err(e))) => {
                debug!(conn = %id, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Binary(data) => {
                if data.len() > config.max_message_bytes {
                    warn!(
                        conn = %id,
                        size = data.len(),
                        max = config.max_message_bytes,
                        "inbound frame too large"
                    );
                    break;
                }
                let dispatcher = dispatcher.clone();
                let sender = sender.clone();
                tokio::spawn(async move {
                    match dispatcher.dispatch(id, &data).await {
                        Ok(frame) => {
                            if let Err(e) = sender.send(frame).await {
                                debug!(conn = %id, error = %e, "response not delivered");
                            }
                        }
                        Err(e) => warn!(conn = %id, error = %e, "failed to encode response"),
                    }
                });
            }
            Message::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
            }
            Message::Close(_) => {
                debug!(conn = %id, "close frame received");
                break;
            }
            // Pings are answered by tungstenite; text frames are not part of the protocol.
            _ => {}
        }
    }
}

async fn write_loop<S>(
    id: ConnectionId,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    config: ConnectionConfig,
    mut close_rx: watch::Receiver<bool>,
) -> SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let period = config.ping_period();
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        let msg = tokio::select! {
            _ = close_rx.changed() => break,
            frame = rx.recv() => match frame {
                Some(frame) => Message::Binary(frame.into()),
                None => break,
            },
            _ = keepalive.tick() => Message::Ping(Vec::new().into()),
        };

        match tokio::time::timeout(config.write_wait, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn = %id, error = %e, "write failed");
                break;
            }
            Err(_) => {
                warn!(conn = %id, "write deadline exceeded");
                break;
            }
        }
    }

    sink
}
