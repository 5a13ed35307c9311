//! WebSocket listener using tokio-tungstenite.
//!
//! Upgrades plain TCP connections on the configured path and hands the
//! resulting streams to the server. Requests for any other path are refused
//! with 404 during the handshake. Inbound frames and messages are capped while
//! they are read, before they are buffered.

use std::net::SocketAddr;

use dvid_core::{DvidError, DvidResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections. The accept loop stops once the receiver is dropped.
pub async fn start_listener(
    bind_addr: &str,
    ws_path: String,
    max_message_bytes: usize,
) -> DvidResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| DvidError::Transport(format!("WS bind failed on {bind_addr}: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %ws_path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);
    let ws_config = read_limits(max_message_bytes);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let ws_path = ws_path.clone();
                    let ws_config = ws_config.clone();
                    tokio::spawn(async move {
                        let check_path = |req: &Request, resp: Response| {
                            if req.uri().path() == ws_path {
                                Ok(resp)
                            } else {
                                Err(not_found())
                            }
                        };
                        let accepted = tokio_tungstenite::accept_hdr_async_with_config(
                            stream,
                            check_path,
                            Some(ws_config),
                        )
                        .await;
                        match accepted {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!(remote = %addr, "listener closed, dropping connection");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        info!(addr = %local_addr, "WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

fn read_limits(max_message_bytes: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_bytes);
    config.max_frame_size = Some(max_message_bytes);
    config
}

fn not_found() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("not found".to_string()));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}
