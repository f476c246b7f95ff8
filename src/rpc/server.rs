//! The acceptor: listen on TCP, build a peer per inbound stream, share the
//! handler tables, and fan out broadcasts.
//!
//! Every accepted stream gets a [`Peer`] whose inherited handler tables are
//! the server's own, shared by reference — a handler registered after a
//! client connected still applies to it. The server runs its connect hooks
//! (by default: start the encryption handshake) once the peer's engine is
//! live, awaits the engine, then runs disconnect hooks and drops the peer
//! from the set.

use super::codec::Params;
use super::handler::{request_handler, BoxFuture, HandlerTable, NotifHandler, Outcome, RequestHandler};
use super::handshake;
use super::peer::{outward_addr, Completion, Disconnect, Peer, PeerOptions};
use super::types::{
    Role, DEFAULT_HELPERS, DEFAULT_REQUEST_TIMEOUT_SECS, METHOD_CENSUS, METHOD_SESSION_INIT,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,
}

/// Hook run around a peer's lifetime, receiving the peer per call.
pub type PeerHook = Arc<dyn Fn(Arc<Peer>) -> BoxFuture<()> + Send + Sync>;

/// Configuration surface for the acceptor.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address. Ignored when `autopublish` discovers the outward IP.
    pub address: String,
    pub port: u16,
    /// Discover the machine's outward-facing address instead of binding the
    /// configured one.
    pub autopublish: bool,
    /// Worker tasks per peer.
    pub helpers: usize,
    /// Default per-request timeout in seconds; zero waits forever.
    pub timeout: f64,
    /// Whether peers of this server may negotiate encryption.
    pub encryption: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9002,
            autopublish: false,
            helpers: DEFAULT_HELPERS,
            timeout: DEFAULT_REQUEST_TIMEOUT_SECS as f64,
            encryption: true,
        }
    }
}

pub struct Server {
    config: ServerConfig,
    startup: DateTime<Utc>,
    peers: Arc<Mutex<HashMap<String, Arc<Peer>>>>,
    hooks_notif: Arc<HandlerTable<NotifHandler>>,
    hooks_request: Arc<HandlerTable<RequestHandler>>,
    on_connect: std::sync::Mutex<Vec<PeerHook>>,
    on_disconnect: std::sync::Mutex<Vec<PeerHook>>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let startup = Utc::now();

        let server = Arc::new(Self {
            config,
            startup,
            peers: Arc::new(Mutex::new(HashMap::new())),
            hooks_notif: Arc::new(HandlerTable::new()),
            hooks_request: Arc::new(HandlerTable::new()),
            on_connect: std::sync::Mutex::new(Vec::new()),
            on_disconnect: std::sync::Mutex::new(Vec::new()),
            shutdown,
        });

        // Session bootstrap: the dialing side learns the alias this server
        // assigned to it, plus the server's startup time.
        server.hooks_request.insert(
            METHOD_SESSION_INIT,
            request_handler(move |_params, peer| async move {
                let startup = peer.startup();
                let ts = startup.timestamp_micros() as f64 / 1e6;
                Ok(Outcome::Data(json!({"id": peer.alias(), "startup": ts})))
            }),
        );

        // Default connect hook: offer encryption to every new client.
        server.add_connect_hook(Arc::new(|peer| {
            Box::pin(async move {
                handshake::enable_encryption(&peer).await;
            })
        }));

        server
    }

    pub fn startup(&self) -> DateTime<Utc> {
        self.startup
    }

    /// Default per-request timeout from the configuration surface.
    pub fn default_timeout(&self) -> f64 {
        self.config.timeout
    }

    /// Register a notification handler for current and future peers.
    pub fn register_notif(&self, method: impl Into<String>, handler: NotifHandler) {
        self.hooks_notif.insert(method, handler);
    }

    /// Register a request handler for current and future peers.
    pub fn register_request(&self, method: impl Into<String>, handler: RequestHandler) {
        self.hooks_request.insert(method, handler);
    }

    pub fn add_connect_hook(&self, hook: PeerHook) {
        self.on_connect
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(hook);
    }

    pub fn add_disconnect_hook(&self, hook: PeerHook) {
        self.on_disconnect
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(hook);
    }

    fn connect_hooks(&self) -> Vec<PeerHook> {
        self.on_connect
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn disconnect_hooks(&self) -> Vec<PeerHook> {
        self.on_disconnect
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The address this server will bind: the configured one, or the
    /// discovered outward-facing address under `autopublish`.
    pub fn listen_address(&self) -> String {
        if self.config.autopublish {
            outward_addr().to_string()
        } else if self.config.address.is_empty() {
            "127.0.0.1".to_string()
        } else {
            self.config.address.clone()
        }
    }

    /// Accept loop. Runs until [`Server::kill`]. Callers keep their own
    /// `Arc` and hand a clone to the loop.
    pub async fn listen(self: Arc<Self>) -> Result<(), NetError> {
        let address = self.listen_address();
        let listener = TcpListener::bind((address.as_str(), self.config.port)).await?;
        let local = listener.local_addr()?;
        info!("serving on {}", local);

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            info!("incoming connection from {}", remote);

            let peer = Peer::new(
                stream,
                Role::Client,
                PeerOptions {
                    helpers: self.config.helpers,
                    encryption: self.config.encryption,
                    startup: self.startup,
                    inherited_notif: Some(self.hooks_notif.clone()),
                    inherited_request: Some(self.hooks_request.clone()),
                },
            );

            let count = {
                let mut peers = self.peers.lock().await;
                peers.insert(peer.alias().to_string(), peer.clone());
                peers.len()
            };
            info!("client at {} assigned alias {}", remote, peer.alias());
            self.broadcast_notif(
                METHOD_CENSUS,
                Params::from_value(json!({"client_count": count})),
            )
            .await;

            tokio::spawn(self.clone().handle_peer(peer));
        }
        Ok(())
    }

    /// One accepted peer: spawn the engine, run connect hooks, await the
    /// engine, run disconnect hooks, drop the peer.
    async fn handle_peer(self: Arc<Self>, peer: Arc<Peer>) {
        let engine = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.run().await })
        };

        for hook in self.connect_hooks() {
            hook(peer.clone()).await;
        }

        let disconnect = match engine.await {
            Ok(disconnect) => disconnect,
            Err(e) => Disconnect::Failed(format!("engine died: {e}")),
        };
        info!("client {} disconnected: {}", peer.alias(), disconnect);

        for hook in self.disconnect_hooks() {
            hook(peer.clone()).await;
        }
        self.peers.lock().await.remove(peer.alias());
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().await.values().cloned().collect()
    }

    /// Fan a Notification out to every connected peer, concurrently and
    /// best-effort.
    pub async fn broadcast_notif(&self, method: &str, params: Option<Params>) {
        let peers = self.peers().await;
        futures::future::join_all(
            peers
                .iter()
                .map(|peer| peer.notify(method.to_string(), params.clone())),
        )
        .await;
    }

    /// Fan a Request out to every connected peer. Returns each peer's
    /// completion keyed by alias; callers pick their own timeouts.
    pub async fn broadcast_request(
        &self,
        method: &str,
        params: Option<Params>,
    ) -> HashMap<String, Completion> {
        let peers = self.peers().await;
        let completions = futures::future::join_all(
            peers
                .iter()
                .map(|peer| peer.request(method.to_string(), params.clone())),
        )
        .await;
        peers
            .iter()
            .map(|peer| peer.alias().to_string())
            .zip(completions)
            .collect()
    }

    /// Terminate every peer and stop the accept loop.
    pub async fn kill(&self) {
        for peer in self.peers().await {
            peer.terminate(Some("Server closing.")).await;
        }
        let _ = self.shutdown.send(true);
        info!("server closed");
    }
}
