// Quintet Wire Protocol — Constants and Types
// Copyright (c) 2024-2026 Quintet Contributors
// Distributed under the MIT software license.

//! Protocol constants shared across the RPC layer.
//!
//! # Design Goals
//!
//! 1. **Symmetric peers** — once a stream is up, both ends speak the same
//!    protocol; the only asymmetry is who dialed whom.
//!
//! 2. **Bounded queues** — the inbound line queue has an explicit bound so a
//!    fast sender cannot exhaust memory; the reader blocks on a full queue,
//!    which surfaces as TCP backpressure to the remote.
//!
//! 3. **Non-fatal crypto** — a frame that fails to open or verify is dropped
//!    with a warning; only transport errors tear the connection down.

use serde::{Deserialize, Serialize};

// =============================================================================
// FRAMING
// =============================================================================

/// Frame terminator: five newline bytes after each armored payload.
/// The Base85 alphabet contains no control characters, so the terminator
/// can never appear inside a payload.
pub const FRAME_TERMINATOR: &[u8] = b"\n\n\n\n\n";

/// Upper bound on a single armored frame. Frames beyond this are a transport
/// error and close the connection. Generous: a batch of responses stays far
/// below this in practice.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

// =============================================================================
// ENGINE SIZING
// =============================================================================

/// Default worker tasks per peer. Bounds handler concurrency per connection.
pub const DEFAULT_HELPERS: usize = 5;

/// Inbound line queue bound. The reader blocks on `send` when the queue is
/// full, so backpressure propagates to the socket instead of growing memory.
pub const LINE_QUEUE_BOUND: usize = 1024;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Default TCP connect timeout in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout for each step of the encryption negotiation, in seconds.
/// A step that times out abandons the attempt; the connection stays
/// plaintext and the handshake is not retried.
pub const NEGOTIATE_TIMEOUT_SECS: u64 = 10;

/// Default per-request timeout in seconds. Zero means wait forever.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 0;

// =============================================================================
// RESERVED METHODS
// =============================================================================

/// Echo. Result mirrors the request params.
pub const METHOD_PING: &str = "PING";

/// Graceful termination Notification, params `{"reason": string?}`.
pub const METHOD_TERM: &str = "TERM";

/// Key exchange Request, params `[pub_hex, ver_hex]`.
pub const METHOD_KEY_EXCHANGE: &str = "RSA.EXCH";

/// Key confirmation Request, params `[true]`. The responder replies and then
/// activates its staged cipher.
pub const METHOD_KEY_CONFIRM: &str = "RSA.CONF";

/// Session bootstrap Request sent by the dialing side after connect.
/// Result: `{"id": <alias assigned by the acceptor>, "startup": <unix ts>}`.
pub const METHOD_SESSION_INIT: &str = "ETC.INIT";

/// Client-count announcement broadcast by the acceptor on new connections.
pub const METHOD_CENSUS: &str = "CENSUS";

// =============================================================================
// APPLICATION ERROR CODES
// =============================================================================

/// Key confirmation arrived before a successful exchange.
pub const ERR_CANNOT_ACTIVATE: i64 = 1;

/// A request handler failed; the failure is wrapped into an error Response.
pub const ERR_HANDLER_FAILED: i64 = 5;

/// The responder cannot encrypt; the initiator continues in plaintext.
pub const ERR_ENCRYPTION_UNAVAILABLE: i64 = 92;

// =============================================================================
// ROLES
// =============================================================================

/// What the remote end of a connection is, from the local point of view.
/// An acceptor's peers are `Client`; a dialer's single peer is `Server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}
