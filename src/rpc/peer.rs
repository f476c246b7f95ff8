//! The per-connection protocol engine.
//!
//! One reader task pulls frames off the connection and feeds a bounded line
//! queue; a fixed pool of worker tasks decodes each line, dispatches the
//! messages it contains, and answers with a single batched frame. Inbound
//! Responses are correlated to outstanding local requests by id.
//!
//! A worker that dies by panic is replaced by the supervisor; the pool winds
//! down when the reader exits and the queue drains.

use super::codec::{self, Inbound, Message, Params, ResponseBody, RpcError};
use super::frame::{CloseReason, FrameRead, FrameReader, FrameWriter, Framed, Transport};
use super::handler::{
    failure_response, map_outcome, request_handler, BoxFuture, HandlerTable, NotifHandler,
    Outcome, RequestHandler,
};
use super::handshake;
use super::types::{Role, DEFAULT_HELPERS, LINE_QUEUE_BOUND, METHOD_PING, METHOD_TERM};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Grace period for workers to drain the queue after the reader exits.
const DRAIN_GRACE_SECS: u64 = 2;

// =============================================================================
// ERRORS
// =============================================================================

/// An error Response from the remote, correlated back to the request id.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Error {code}: {message}")]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
    pub id: String,
}

/// How a request completion can fail.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request cancelled")]
    Cancelled,
}

/// Why the engine stopped.
#[derive(Debug, Clone)]
pub enum Disconnect {
    /// The remote sent a termination notice.
    Reset(String),
    /// The remote closed the stream at a frame boundary.
    Eof,
    /// Transport failure, EOF mid-frame included.
    Failed(String),
    /// The local side closed.
    Local,
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disconnect::Reset(reason) => write!(f, "reset by peer: {reason}"),
            Disconnect::Eof => write!(f, "stream ended"),
            Disconnect::Failed(e) => write!(f, "transport failed: {e}"),
            Disconnect::Local => write!(f, "closed locally"),
        }
    }
}

// =============================================================================
// COMPLETIONS
// =============================================================================

type Slot = oneshot::Sender<Result<Value, RequestError>>;
type Outstanding = Arc<Mutex<HashMap<String, Slot>>>;

/// One-shot handle for the Response to an outstanding Request.
///
/// The outstanding-table entry lives exactly as long as the completion is
/// pending: it is removed on response, timeout, cancellation, or close, and
/// an id is never reused.
pub struct Completion {
    id: String,
    rx: oneshot::Receiver<Result<Value, RequestError>>,
    outstanding: Outstanding,
}

impl Completion {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait forever for the Response.
    pub async fn wait(self) -> Result<Value, RequestError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::ConnectionClosed),
        }
    }

    /// Wait with a deadline. `secs <= 0` waits forever. On expiry the
    /// outstanding entry is removed so a late Response is dropped.
    pub async fn wait_timeout(self, secs: f64) -> Result<Value, RequestError> {
        if secs <= 0.0 {
            return self.wait().await;
        }
        let Completion {
            id,
            rx,
            outstanding,
        } = self;
        match tokio::time::timeout(Duration::from_secs_f64(secs), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionClosed),
            Err(_) => {
                outstanding.lock().await.remove(&id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Withdraw the request. A Response that arrives later is logged as
    /// unsolicited and dropped.
    pub async fn cancel(self) {
        self.outstanding.lock().await.remove(&self.id);
    }
}

// =============================================================================
// COUNTERS
// =============================================================================

/// Message-kind counters; bytes are tracked by the transport.
#[derive(Default)]
struct KindCounters {
    notif: AtomicU64,
    request: AtomicU64,
    response: AtomicU64,
}

impl KindCounters {
    fn bump(&self, kind: &str) {
        match kind {
            "notif" => self.notif.fetch_add(1, Ordering::Relaxed),
            "request" => self.request.fetch_add(1, Ordering::Relaxed),
            _ => self.response.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// A point-in-time view of one direction's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Traffic {
    pub bytes: u64,
    pub notifs: u64,
    pub requests: u64,
    pub responses: u64,
}

impl std::fmt::Display for Traffic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bytes, {} notifs, {} requests, {} responses",
            self.bytes, self.notifs, self.requests, self.responses
        )
    }
}

// =============================================================================
// PEER
// =============================================================================

/// Construction knobs supplied by the acceptor or initiator wrapper.
pub struct PeerOptions {
    /// Worker task count; bounded handler concurrency per connection.
    pub helpers: usize,
    /// Whether this side may negotiate encryption.
    pub encryption: bool,
    /// Process startup time, echoed by the session bootstrap method.
    pub startup: DateTime<Utc>,
    /// Handler tables consulted after the peer's own.
    pub inherited_notif: Option<Arc<HandlerTable<NotifHandler>>>,
    pub inherited_request: Option<Arc<HandlerTable<RequestHandler>>>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            helpers: DEFAULT_HELPERS,
            encryption: true,
            startup: Utc::now(),
            inherited_notif: None,
            inherited_request: None,
        }
    }
}

/// The local end of one duplex JSON-RPC connection.
pub struct Peer {
    alias: String,
    role: Role,
    addr: SocketAddr,
    helpers: usize,

    writer: FrameWriter,
    transport: Arc<Transport>,
    reader: Mutex<Option<FrameReader>>,

    hooks_notif: HandlerTable<NotifHandler>,
    hooks_request: HandlerTable<RequestHandler>,
    inherited_notif: Option<Arc<HandlerTable<NotifHandler>>>,
    inherited_request: Option<Arc<HandlerTable<RequestHandler>>>,

    outstanding: Outstanding,
    sent: KindCounters,
    recv: KindCounters,

    opened: DateTime<Utc>,
    startup: DateTime<Utc>,

    term_reason: std::sync::Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Peer {
    pub fn new(stream: TcpStream, role: Role, opts: PeerOptions) -> Arc<Self> {
        let addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let (reader, writer) = Framed::new(stream, opts.encryption).split();
        let transport = reader.transport().clone();
        let (shutdown, _) = watch::channel(false);

        let peer = Arc::new(Self {
            alias: codec::new_alias(),
            role,
            addr,
            helpers: opts.helpers.max(1),
            writer,
            transport,
            reader: Mutex::new(Some(reader)),
            hooks_notif: HandlerTable::new(),
            hooks_request: HandlerTable::new(),
            inherited_notif: opts.inherited_notif,
            inherited_request: opts.inherited_request,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
            sent: KindCounters::default(),
            recv: KindCounters::default(),
            opened: Utc::now(),
            startup: opts.startup,
            term_reason: std::sync::Mutex::new(None),
            shutdown,
            closed: AtomicBool::new(false),
        });

        peer.install_default_handlers();
        peer
    }

    fn install_default_handlers(&self) {
        // Echo: result mirrors the params, `[null]` when absent or empty.
        self.register_request(
            METHOD_PING,
            request_handler(|params, _peer| async move {
                let echo = match params {
                    Some(ref p) if !p.is_empty() => p.to_value(),
                    _ => json!([null]),
                };
                Ok(Outcome::Data(echo))
            }),
        );
        handshake::install(self);
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Short hex alias used in log lines and request-id prefixes.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn opened(&self) -> DateTime<Utc> {
        self.opened
    }

    pub fn startup(&self) -> DateTime<Utc> {
        self.startup
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Whether the cipher has gone active on this connection.
    pub async fn is_secure(&self) -> bool {
        self.transport.cipher().lock().await.is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn traffic_sent(&self) -> Traffic {
        Traffic {
            bytes: self.transport.total_sent(),
            notifs: self.sent.notif.load(Ordering::Relaxed),
            requests: self.sent.request.load(Ordering::Relaxed),
            responses: self.sent.response.load(Ordering::Relaxed),
        }
    }

    pub fn traffic_recv(&self) -> Traffic {
        Traffic {
            bytes: self.transport.total_recv(),
            notifs: self.recv.notif.load(Ordering::Relaxed),
            requests: self.recv.request.load(Ordering::Relaxed),
            responses: self.recv.response.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Install a notification handler; replaces any prior entry.
    pub fn register_notif(&self, method: impl Into<String>, handler: NotifHandler) {
        self.hooks_notif.insert(method, handler);
    }

    /// Install a request handler; replaces any prior entry.
    pub fn register_request(&self, method: impl Into<String>, handler: RequestHandler) {
        self.hooks_request.insert(method, handler);
    }

    fn lookup_request(&self, method: &str) -> Option<RequestHandler> {
        self.hooks_request.get(method).or_else(|| {
            self.inherited_request
                .as_ref()
                .and_then(|table| table.get(method))
        })
    }

    fn lookup_notif(&self, method: &str) -> Option<NotifHandler> {
        self.hooks_notif.get(method).or_else(|| {
            self.inherited_notif
                .as_ref()
                .and_then(|table| table.get(method))
        })
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    async fn send_message(&self, msg: &Message) {
        self.sent.bump(msg.kind());
        if let Err(e) = self.writer.send(codec::encode(msg).as_bytes()).await {
            error!("peer {}: failed to send {}: {}", self.alias, msg.kind(), e);
        }
    }

    /// Send a Notification. Fire and forget; send failures are logged.
    pub async fn notify(&self, method: impl Into<String>, params: Option<Params>) {
        let method = method.into();
        debug!("peer {}: sending '{}' notification", self.alias, method);
        self.send_message(&Message::notification(method, params)).await;
    }

    /// Send a Request and hand back the completion for its Response.
    pub async fn request(&self, method: impl Into<String>, params: Option<Params>) -> Completion {
        let method = method.into();
        let id = codec::new_id(&self.alias);
        debug!("peer {}: sending '{}' request {}", self.alias, method, id);

        let (tx, rx) = oneshot::channel();
        self.outstanding.lock().await.insert(id.clone(), tx);
        self.send_message(&Message::request(method, params, id.clone())).await;

        Completion {
            id,
            rx,
            outstanding: self.outstanding.clone(),
        }
    }

    /// Request and wait. `timeout_secs <= 0` waits forever.
    pub async fn request_wait(
        &self,
        method: impl Into<String>,
        params: Option<Params>,
        timeout_secs: f64,
    ) -> Result<Value, RequestError> {
        self.request(method, params).await.wait_timeout(timeout_secs).await
    }

    /// Send a Response by hand. Rare; handlers normally answer through
    /// their return value.
    pub async fn respond(&self, id: Value, body: ResponseBody) {
        self.send_message(&Message::Response { id, body }).await;
    }

    async fn send_batch(&self, batch: &[Message]) {
        for msg in batch {
            self.sent.bump(msg.kind());
        }
        if let Err(e) = self.writer.send(codec::encode_batch(batch).as_bytes()).await {
            error!("peer {}: failed to send batch: {}", self.alias, e);
        }
    }

    /// Send the termination notice, then drop the connection.
    pub async fn terminate(&self, reason: Option<&str>) {
        let mut params = Map::new();
        params.insert("reason".into(), reason.map(Value::from).unwrap_or(Value::Null));
        self.notify(METHOD_TERM, Some(Params::Named(params))).await;
        self.close().await;
    }

    /// Drop the connection immediately. Outstanding completions fail with
    /// `connection-closed`. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        self.writer.close().await;
        self.fail_outstanding().await;
        info!("peer {} closed", self.alias);
    }

    async fn fail_outstanding(&self) {
        let slots: Vec<(String, Slot)> = self.outstanding.lock().await.drain().collect();
        for (id, slot) in slots {
            debug!("peer {}: failing outstanding request {}", self.alias, id);
            let _ = slot.send(Err(RequestError::ConnectionClosed));
        }
    }

    // -------------------------------------------------------------------------
    // Engine
    // -------------------------------------------------------------------------

    /// Drive the connection until it ends. Spawns the reader and the worker
    /// pool, then reports why the engine stopped. Callers keep their own
    /// `Arc` and hand a clone to the engine.
    pub async fn run(self: Arc<Self>) -> Disconnect {
        let reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => {
                warn!("peer {}: engine started twice", self.alias);
                return Disconnect::Local;
            }
        };

        let (line_tx, line_rx) = mpsc::channel::<Vec<u8>>(LINE_QUEUE_BOUND);
        let line_rx = Arc::new(Mutex::new(line_rx));

        let reader_task = tokio::spawn(Self::reader_loop(
            self.clone(),
            reader,
            line_tx,
            self.shutdown.subscribe(),
        ));
        let mut pool_task = tokio::spawn(Self::supervise_workers(self.clone(), line_rx));

        let disconnect = match reader_task.await {
            Ok(disconnect) => disconnect,
            Err(e) => Disconnect::Failed(format!("reader task died: {e}")),
        };

        // Let the workers drain what was already queued, then cut them off.
        if tokio::time::timeout(Duration::from_secs(DRAIN_GRACE_SECS), &mut pool_task)
            .await
            .is_err()
        {
            warn!("peer {}: worker pool did not drain in time", self.alias);
            pool_task.abort();
        }

        self.close().await;
        // A termination notice processed while the reader was already going
        // down still wins over the reader's own verdict.
        self.reset_or(disconnect)
    }

    /// The single reader task: frames in, bounded queue out. Crypto errors
    /// are logged and skipped; transport failures end the loop.
    async fn reader_loop(
        peer: Arc<Peer>,
        mut reader: FrameReader,
        line_tx: mpsc::Sender<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Disconnect {
        loop {
            if *shutdown.borrow() {
                break peer.reset_or(Disconnect::Local);
            }
            let frame = tokio::select! {
                _ = shutdown.changed() => break peer.reset_or(Disconnect::Local),
                frame = reader.next() => frame,
            };
            match frame {
                FrameRead::Line(line) => {
                    // A full queue blocks here, pushing backpressure onto
                    // the socket.
                    if line_tx.send(line).await.is_err() {
                        break Disconnect::Local;
                    }
                }
                FrameRead::Crypto(e) => {
                    warn!("peer {}: dropping unreadable frame: {}", peer.alias, e);
                }
                FrameRead::Closed(CloseReason::Eof) => {
                    info!("peer {}: stream ended", peer.alias);
                    break Disconnect::Eof;
                }
                FrameRead::Closed(CloseReason::Local) => {
                    break peer.reset_or(Disconnect::Local);
                }
                FrameRead::Closed(CloseReason::Failed(e)) => {
                    error!("peer {}: connection cut off: {}", peer.alias, e);
                    break Disconnect::Failed(e.to_string());
                }
            }
        }
    }

    fn reset_or(&self, fallback: Disconnect) -> Disconnect {
        let reason = self
            .term_reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        match reason {
            Some(reason) => Disconnect::Reset(reason),
            None => fallback,
        }
    }

    /// Run `helpers` workers and replace any that die by panic. Ends when
    /// the line queue closes and drains.
    async fn supervise_workers(self: Arc<Self>, line_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>) {
        let mut pool = JoinSet::new();
        for _ in 0..self.helpers {
            pool.spawn(Self::worker_loop(self.clone(), line_rx.clone()));
        }
        while let Some(result) = pool.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("peer {}: worker died, spawning replacement: {}", self.alias, e);
                    pool.spawn(Self::worker_loop(self.clone(), line_rx.clone()));
                }
            }
        }
    }

    async fn worker_loop(peer: Arc<Peer>, line_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>) {
        loop {
            let line = { line_rx.lock().await.recv().await };
            match line {
                Some(line) => Self::process_line(&peer, line).await,
                None => break,
            }
        }
    }

    /// Decode one line, dispatch every message in it, answer with a single
    /// batched frame, then run any deferred cleanups.
    async fn process_line(peer: &Arc<Peer>, line: Vec<u8>) {
        let text = match String::from_utf8(line) {
            Ok(text) => text,
            Err(_) => {
                warn!("peer {}: corrupt data received, dropped", peer.alias);
                return;
            }
        };

        let items = match codec::decode(&text) {
            Ok(items) => items,
            Err(e) => {
                warn!("peer {}: invalid JSON received", peer.alias);
                peer.respond(
                    Value::Null,
                    ResponseBody::Error(RpcError::parse_error(Some(json!(e.to_string())))),
                )
                .await;
                return;
            }
        };

        let mut batch: Vec<Message> = Vec::new();
        let mut deferred: Vec<BoxFuture<(Option<Message>, Option<BoxFuture<()>>)>> = Vec::new();

        for item in items {
            match Self::dispatch(peer, item).await {
                Dispatched::Reply(msg) => batch.push(msg),
                Dispatched::Task(fut) => deferred.push(fut),
                Dispatched::Nothing => {}
                Dispatched::Reset(reason) => {
                    // Termination notice: stop the engine; anything else in
                    // this batch is abandoned.
                    peer.begin_reset(reason);
                    return;
                }
            }
        }

        let mut cleanups: Vec<BoxFuture<()>> = Vec::new();
        for (msg, cleanup) in futures::future::join_all(deferred).await {
            if let Some(msg) = msg {
                batch.push(msg);
            }
            if let Some(cleanup) = cleanup {
                cleanups.push(cleanup);
            }
        }

        if !batch.is_empty() {
            peer.send_batch(&batch).await;
        }
        for cleanup in cleanups {
            cleanup.await;
        }
    }

    fn begin_reset(&self, reason: String) {
        *self
            .term_reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(reason);
        let _ = self.shutdown.send(true);
    }

    async fn dispatch(peer: &Arc<Peer>, item: Inbound) -> Dispatched {
        match item {
            Inbound::Invalid { id: Some(id), keys } => {
                debug!("peer {}: invalid message with id, answering", peer.alias);
                Dispatched::Reply(Message::response_error(
                    id,
                    RpcError::invalid_request(Some(json!(keys))),
                ))
            }
            Inbound::Invalid { id: None, .. } => {
                debug!("peer {}: invalid message without id, dropped", peer.alias);
                Dispatched::Nothing
            }
            Inbound::Msg(Message::Response { id, body }) => {
                peer.recv.bump("response");
                peer.complete_request(id, body).await;
                Dispatched::Nothing
            }
            Inbound::Msg(Message::Request { method, params, id }) => {
                peer.recv.bump("request");
                debug!("peer {}: receiving '{}' request", peer.alias, method);
                match peer.lookup_request(&method) {
                    Some(handler) => {
                        let peer = peer.clone();
                        Dispatched::Task(Box::pin(async move {
                            match handler(params, peer).await {
                                Ok(outcome) => map_outcome(&id, outcome),
                                Err(failure) => {
                                    error!("request handler for '{}' failed: {}", method, failure);
                                    (Some(failure_response(&id, &failure)), None)
                                }
                            }
                        }))
                    }
                    None => Dispatched::Reply(Message::response_error(
                        Value::from(id),
                        RpcError::method_not_found(Some(json!(method))),
                    )),
                }
            }
            Inbound::Msg(Message::Notification { method, params }) => {
                peer.recv.bump("notif");
                if method == METHOD_TERM {
                    let reason = params
                        .as_ref()
                        .and_then(|p| p.get_key("reason"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| "Connection terminated by peer.".to_string());
                    return Dispatched::Reset(reason);
                }
                debug!("peer {}: receiving '{}' notification", peer.alias, method);
                match peer.lookup_notif(&method) {
                    Some(handler) => {
                        let peer = peer.clone();
                        Dispatched::Task(Box::pin(async move {
                            handler(params, peer).await;
                            (None, None)
                        }))
                    }
                    // Answering would violate the protocol; drop silently.
                    None => Dispatched::Nothing,
                }
            }
        }
    }

    /// Correlate an inbound Response to its outstanding completion.
    async fn complete_request(&self, id: Value, body: ResponseBody) {
        let key = match id.as_str() {
            Some(key) => key.to_string(),
            None => {
                warn!("peer {}: response with non-string id, dropped", self.alias);
                return;
            }
        };
        let slot = self.outstanding.lock().await.remove(&key);
        match slot {
            None => {
                warn!(
                    "peer {}: response for an unsolicited or cancelled request {}",
                    self.alias, key
                );
            }
            Some(slot) => {
                let result = match body {
                    ResponseBody::Result(value) => Ok(value),
                    ResponseBody::Error(e) => Err(RequestError::Remote(RemoteError {
                        code: e.code,
                        message: e.message,
                        data: e.data,
                        id: key.clone(),
                    })),
                };
                if slot.send(result).is_err() {
                    warn!("peer {}: response for a closed completion {}", self.alias, key);
                }
            }
        }
    }
}

enum Dispatched {
    /// Answer synchronously; joins the outgoing batch.
    Reply(Message),
    /// Handler invocation; resolves to an optional reply and cleanup.
    Task(BoxFuture<(Option<Message>, Option<BoxFuture<()>>)>),
    /// Nothing to send.
    Nothing,
    /// Termination notice; the engine stops.
    Reset(String),
}

/// Discover the address this host is reachable at, by "connecting" a UDP
/// socket toward a non-routable sentinel and reading the chosen source
/// address. Nothing is transmitted. Falls back to loopback.
pub fn outward_addr() -> IpAddr {
    fn probe() -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(("10.255.255.255", 1))?;
        Ok(socket.local_addr()?.ip())
    }
    probe().unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::LOCALHOST))
}
