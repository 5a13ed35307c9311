//! Gateway server: accepts WebSocket connections and runs a session per client.
//!
//! Owns the connection registry, the dispatcher with its route table, and the
//! shutdown broadcast that stops the accept loop and every live connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dvid_core::DvidResult;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{memory, Services};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::handler;
use crate::notifier::Notifier;
use crate::registry::ClientRegistry;
use crate::route::RouteTable;
use crate::transport::websocket::{self, WebSocketConnection};

/// The gateway server instance.
pub struct GatewayServer {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    /// Create a server backed by the in-memory backend.
    ///
    /// Must be called from within a Tokio runtime: the notifier loop is
    /// spawned here.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let (events, _notifier) = Notifier::new(registry.clone()).start();
        let services = memory::services(
            config.secret.clone(),
            config.token_ttl_secs,
            Arc::new(events),
        );
        Self::with_services(config, registry, services)
    }

    /// Create a server against externally provided backend services.
    ///
    /// Events raised by `services` should be fed to a [`Notifier`] built on
    /// the same `registry`.
    pub fn with_services(
        config: ServerConfig,
        registry: Arc<ClientRegistry>,
        services: Services,
    ) -> Self {
        let mut routes = RouteTable::new();
        handler::register_routes(&mut routes, registry.clone(), &services);
        debug!(routes = routes.len(), "route table built");
        let dispatcher = Arc::new(Dispatcher::new(routes, config.request_timeout));

        Self {
            config,
            registry,
            dispatcher,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Returns the bound address (useful with port 0) and the accept loop task.
    pub async fn start(self: Arc<Self>) -> DvidResult<(SocketAddr, JoinHandle<()>)> {
        let (addr, incoming) = websocket::start_listener(
            &self.config.listen_addr(),
            self.config.ws_path.clone(),
            self.config.connection.max_message_bytes,
        )
        .await?;
        info!(
            addr = %addr,
            path = %self.config.ws_path,
            request_timeout_ms = self.config.request_timeout.as_millis() as u64,
            "dvid-gateway ready"
        );
        let task = tokio::spawn(self.serve(incoming));
        Ok((addr, task))
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self: Arc<Self>) -> DvidResult<()> {
        let (_addr, task) = self.start().await?;
        let _ = task.await;
        Ok(())
    }

    async fn serve(self: Arc<Self>, mut incoming: mpsc::Receiver<WebSocketConnection>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                conn = incoming.recv() => match conn {
                    Some(conn) => self.spawn_connection(conn),
                    None => {
                        info!("listener closed");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }
    }

    fn spawn_connection(&self, conn: WebSocketConnection) {
        let connection = Connection::new(
            conn.ws_stream,
            conn.remote_addr,
            self.config.connection.clone(),
            self.registry.clone(),
            self.dispatcher.clone(),
        );
        debug!(conn = %connection.id(), remote = %conn.remote_addr, "spawning connection");
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(connection.serve(shutdown));
    }

    /// Stop accepting and signal every live connection to close.
    pub fn shutdown(&self) {
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for live connections to finish closing. Returns false if some
    /// were still registered when `grace` ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.registry.len().await;
            if remaining == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                info!(remaining, "connections still open after shutdown grace period");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
