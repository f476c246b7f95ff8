//! The initiator: dial a server, bootstrap the session, negotiate
//! encryption, and drive the caller's workload to a graceful end.

use super::handler::{HandlerTable, NotifHandler, RequestHandler};
use super::handshake;
use super::peer::{Disconnect, Peer, PeerOptions};
use super::server::NetError;
use super::types::{
    Role, CONNECT_TIMEOUT_SECS, DEFAULT_HELPERS, DEFAULT_REQUEST_TIMEOUT_SECS,
    METHOD_SESSION_INIT,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Configuration surface for the initiator.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    pub port: u16,
    /// Worker tasks for the dialed peer.
    pub helpers: usize,
    /// Default per-request timeout in seconds; zero waits forever.
    pub timeout: f64,
    /// Whether to offer encryption after connecting.
    pub encryption: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9002,
            helpers: DEFAULT_HELPERS,
            timeout: DEFAULT_REQUEST_TIMEOUT_SECS as f64,
            encryption: true,
        }
    }
}

/// What the session bootstrap reported about the server.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Alias the server assigned to this client.
    pub id: String,
    pub startup: DateTime<Utc>,
}

pub struct Client {
    config: ClientConfig,
    hooks_notif: Arc<HandlerTable<NotifHandler>>,
    hooks_request: Arc<HandlerTable<RequestHandler>>,
    peer: Mutex<Option<Arc<Peer>>>,
    engine: Mutex<Option<JoinHandle<Disconnect>>>,
    session: std::sync::Mutex<Option<SessionInfo>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            hooks_notif: Arc::new(HandlerTable::new()),
            hooks_request: Arc::new(HandlerTable::new()),
            peer: Mutex::new(None),
            engine: Mutex::new(None),
            session: std::sync::Mutex::new(None),
        }
    }

    /// Register a notification handler, visible to the current connection
    /// and any later one.
    pub fn register_notif(&self, method: impl Into<String>, handler: NotifHandler) {
        self.hooks_notif.insert(method, handler);
    }

    /// Register a request handler, visible to the current connection and
    /// any later one.
    pub fn register_request(&self, method: impl Into<String>, handler: RequestHandler) {
        self.hooks_request.insert(method, handler);
    }

    pub fn default_timeout(&self) -> f64 {
        self.config.timeout
    }

    /// What the server reported at session bootstrap, when it did.
    pub fn session(&self) -> Option<SessionInfo> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub async fn peer(&self) -> Option<Arc<Peer>> {
        self.peer.lock().await.clone()
    }

    pub async fn alive(&self) -> bool {
        match self.peer().await {
            Some(peer) => !peer.is_closed(),
            None => false,
        }
    }

    /// Dial the server. On success the peer engine is running, the session
    /// is bootstrapped, and encryption has been offered.
    pub async fn connect(&self) -> Result<Arc<Peer>, NetError> {
        let target = (self.config.address.as_str(), self.config.port);
        let stream = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(target),
        )
        .await
        .map_err(|_| NetError::ConnectTimeout)??;

        let peer = Peer::new(
            stream,
            Role::Server,
            PeerOptions {
                helpers: self.config.helpers,
                encryption: self.config.encryption,
                startup: Utc::now(),
                inherited_notif: Some(self.hooks_notif.clone()),
                inherited_request: Some(self.hooks_request.clone()),
            },
        );
        info!(
            "connected to {}:{}; server given alias '{}'",
            self.config.address,
            self.config.port,
            peer.alias()
        );

        let engine = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.run().await })
        };
        *self.peer.lock().await = Some(peer.clone());
        *self.engine.lock().await = Some(engine);

        self.bootstrap_session(&peer).await;
        handshake::enable_encryption(&peer).await;

        Ok(peer)
    }

    /// Ask the server for our assigned id and its startup time.
    async fn bootstrap_session(&self, peer: &Arc<Peer>) {
        let reply = peer
            .request_wait(METHOD_SESSION_INIT, None, CONNECT_TIMEOUT_SECS as f64)
            .await;
        match reply {
            Ok(value) => {
                let id = value
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let ts = value.get("startup").and_then(Value::as_f64).unwrap_or(0.0);
                let startup = DateTime::from_timestamp(
                    ts as i64,
                    ((ts.fract() * 1e9).max(0.0)) as u32,
                )
                .unwrap_or_else(Utc::now);
                info!("server uptime: {}", Utc::now() - startup);
                *self
                    .session
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) =
                    Some(SessionInfo { id, startup });
            }
            Err(e) => warn!("failed to bootstrap session: {}", e),
        }
    }

    /// Send the termination notice and close.
    pub async fn terminate(&self, reason: Option<&str>) {
        if let Some(peer) = self.peer().await {
            peer.terminate(reason).await;
            info!("connection terminated");
        }
    }

    /// Drop the connection and reap the engine task.
    pub async fn disconnect(&self) {
        if let Some(peer) = self.peer.lock().await.take() {
            peer.close().await;
        }
        if let Some(engine) = self.engine.lock().await.take() {
            let _ = engine.await;
        }
    }

    /// Connect, hand the peer to the caller's workload, then wind down
    /// gracefully and report the traffic totals.
    pub async fn run<F, Fut>(&self, body: F) -> Result<(), NetError>
    where
        F: FnOnce(Arc<Peer>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let peer = self.connect().await?;
        body(peer.clone()).await;

        self.terminate(Some("Program Completed")).await;
        info!("sent: {}", peer.traffic_sent());
        info!("received: {}", peer.traffic_recv());
        self.disconnect().await;
        Ok(())
    }
}
