//! Encryption negotiation.
//!
//! Three-way handshake over two reserved request methods. The initiator
//! offers its public and verification keys; a capable responder stores the
//! pair, stages its box, and answers with its own keys; the initiator
//! stages and sends the confirmation; the responder replies `[true]` and
//! activates as soon as that reply is on the wire; the initiator activates
//! on receipt. Every step runs in plaintext; the first sealed frame follows
//! the confirmation reply.
//!
//! Any failure — missing capability, malformed keys, a step timing out —
//! leaves the connection in plaintext, and the handshake is not retried.

use super::codec::{Params, RpcError};
use super::handler::{request_handler, HandlerResult, Outcome};
use super::peer::Peer;
use super::types::{
    ERR_CANNOT_ACTIVATE, ERR_ENCRYPTION_UNAVAILABLE, METHOD_KEY_CONFIRM, METHOD_KEY_EXCHANGE,
    NEGOTIATE_TIMEOUT_SECS,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Install the responder-side handlers on a fresh peer.
pub fn install(peer: &Peer) {
    peer.register_request(METHOD_KEY_EXCHANGE, request_handler(on_exchange));
    peer.register_request(METHOD_KEY_CONFIRM, request_handler(on_confirm));
}

fn key_pair_from(params: &Option<Params>) -> Option<(String, String)> {
    let params = params.as_ref()?;
    let public = params.get_index(0)?.as_str()?.to_string();
    let verify = params.get_index(1)?.as_str()?.to_string();
    Some((public, verify))
}

async fn on_exchange(params: Option<Params>, peer: Arc<Peer>) -> HandlerResult {
    let transport = peer.transport();
    if !transport.can_encrypt() {
        warn!("peer {}: cannot establish a secure connection", peer.alias());
        return Ok(Outcome::Fail(RpcError::new(
            ERR_ENCRYPTION_UNAVAILABLE,
            "Encryption Unavailable",
            None,
        )));
    }

    let (remote_pub, remote_ver) = match key_pair_from(&params) {
        Some(pair) => pair,
        None => {
            return Ok(Outcome::Fail(RpcError::invalid_params(Some(json!(
                "expected [public_hex, verify_hex]"
            )))))
        }
    };

    let mut cipher = transport.cipher().lock().await;
    if cipher.is_active() {
        return Ok(Outcome::Fail(RpcError::new(
            ERR_CANNOT_ACTIVATE,
            "Cannot Activate",
            None,
        )));
    }
    if let Err(e) = cipher.stage(&remote_pub, &remote_ver) {
        return Ok(Outcome::Fail(RpcError::invalid_params(Some(json!(
            e.to_string()
        )))));
    }

    info!(
        "peer {}: receiving a request for a secure connection; sending keys (still plaintext)",
        peer.alias()
    );
    Ok(Outcome::Data(json!([
        cipher.public_hex(),
        cipher.verify_hex()
    ])))
}

async fn on_confirm(_params: Option<Params>, peer: Arc<Peer>) -> HandlerResult {
    let transport = peer.transport().clone();
    let ready = transport.can_encrypt() && transport.cipher().lock().await.ready();
    if !ready {
        return Ok(Outcome::Fail(RpcError::new(
            ERR_CANNOT_ACTIVATE,
            "Cannot Activate",
            None,
        )));
    }

    // The confirmation reply must leave in plaintext; activation waits
    // until the outgoing batch is on the wire.
    let alias = peer.alias().to_string();
    Ok(Outcome::Deferred {
        reply: Box::new(Outcome::Data(json!([true]))),
        cleanup: Box::pin(async move {
            if transport.cipher().lock().await.activate() {
                info!("peer {}: connection secured by key exchange", alias);
            }
        }),
    })
}

/// Initiator side: run the full negotiation. Returns whether encryption
/// went active; on any failure the connection simply stays plaintext.
pub async fn enable_encryption(peer: &Peer) -> bool {
    let transport = peer.transport().clone();
    if !transport.can_encrypt() {
        return false;
    }

    let offer = {
        let cipher = transport.cipher().lock().await;
        // Already active, or the remote side's own exchange got here first.
        if cipher.is_active() || cipher.ready() {
            return false;
        }
        json!([cipher.public_hex(), cipher.verify_hex()])
    };

    let pair = match peer
        .request_wait(
            METHOD_KEY_EXCHANGE,
            Params::from_value(offer),
            NEGOTIATE_TIMEOUT_SECS as f64,
        )
        .await
    {
        Ok(value) => value,
        Err(e) => {
            warn!("peer {}: key exchange declined: {}", peer.alias(), e);
            return false;
        }
    };

    let (remote_pub, remote_ver) = match (
        pair.get(0).and_then(Value::as_str),
        pair.get(1).and_then(Value::as_str),
    ) {
        (Some(public), Some(verify)) => (public.to_string(), verify.to_string()),
        _ => {
            warn!("peer {}: malformed key exchange reply", peer.alias());
            return false;
        }
    };

    if let Err(e) = transport
        .cipher()
        .lock()
        .await
        .stage(&remote_pub, &remote_ver)
    {
        warn!("peer {}: rejected remote keys: {}", peer.alias(), e);
        return false;
    }

    match peer
        .request_wait(
            METHOD_KEY_CONFIRM,
            Params::from_value(json!([true])),
            NEGOTIATE_TIMEOUT_SECS as f64,
        )
        .await
    {
        Ok(value) if value.get(0).and_then(Value::as_bool) == Some(true) => {
            let activated = transport.cipher().lock().await.activate();
            if activated {
                info!("peer {}: connection secured by key exchange", peer.alias());
            }
            activated
        }
        Ok(_) => {
            warn!("peer {}: key confirmation rejected", peer.alias());
            false
        }
        Err(e) => {
            warn!("peer {}: key confirmation failed: {}", peer.alias(), e);
            false
        }
    }
}
