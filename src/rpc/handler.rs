//! Handler callbacks, handler tables, and the request return mapping.
//!
//! Handlers are plain async closures receiving the decoded params and the
//! peer that dispatched them. Request handlers hand back an [`Outcome`]; the
//! engine turns that into the wire Response so most handlers never touch
//! `respond` directly.

use super::codec::{Message, Params, RpcError};
use super::peer::Peer;
use super::types::ERR_HANDLER_FAILED;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A failed handler: the concrete error's type tag plus its rendering.
///
/// The wire shape is `code` [`ERR_HANDLER_FAILED`], `message`
/// `"<Type>: <text>"`, `data` `[<text>]`. The tag has to be captured when
/// the failure is built — a type-erased error cannot recover its name — so
/// the `From` impls record it at the `Err(...)` construction site.
#[derive(Debug)]
pub struct HandlerFailure {
    kind: &'static str,
    text: String,
}

impl HandlerFailure {
    pub fn new(kind: &'static str, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// The failing error's type name, without its module path.
    pub fn kind(&self) -> &str {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.text)
    }
}

fn type_tag<E>() -> &'static str {
    let name = std::any::type_name::<E>();
    name.rsplit("::").next().unwrap_or(name)
}

impl<E: std::error::Error> From<E> for HandlerFailure {
    fn from(error: E) -> Self {
        Self {
            kind: type_tag::<E>(),
            text: error.to_string(),
        }
    }
}

impl From<String> for HandlerFailure {
    fn from(text: String) -> Self {
        Self { kind: "Error", text }
    }
}

impl From<&str> for HandlerFailure {
    fn from(text: &str) -> Self {
        Self {
            kind: "Error",
            text: text.to_string(),
        }
    }
}

pub type HandlerResult = Result<Outcome, HandlerFailure>;

/// Request handler: params and peer in, outcome out.
pub type RequestHandler = Arc<dyn Fn(Option<Params>, Arc<Peer>) -> BoxFuture<HandlerResult> + Send + Sync>;

/// Notification handler. Whatever it produces is dropped; a notification
/// never gets a Response.
pub type NotifHandler = Arc<dyn Fn(Option<Params>, Arc<Peer>) -> BoxFuture<()> + Send + Sync>;

/// Wrap an async closure as a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(Option<Params>, Arc<Peer>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |params, peer| Box::pin(f(params, peer)))
}

/// Wrap an async closure as a [`NotifHandler`].
pub fn notif_handler<F, Fut>(f: F) -> NotifHandler
where
    F: Fn(Option<Params>, Arc<Peer>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |params, peer| Box::pin(f(params, peer)))
}

// =============================================================================
// HANDLER TABLES
// =============================================================================

/// Method-name-keyed handler registry. Registration replaces any prior
/// entry. Tables are shared by `Arc` so an acceptor's late registrations
/// are visible to peers that inherited the table at construction.
///
/// The lock is held only across the map operation itself, never across an
/// await; handlers are cloned out before they run.
pub struct HandlerTable<H> {
    entries: RwLock<HashMap<String, H>>,
}

impl<H: Clone> HandlerTable<H> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, method: impl Into<String>, handler: H) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(method.into(), handler);
    }

    pub fn get(&self, method: &str) -> Option<H> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(method)
            .cloned()
    }
}

impl<H: Clone> Default for HandlerTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// What a request handler hands back. The engine maps each shape onto a
/// Response carrying the request's id.
pub enum Outcome {
    /// No payload: result `[]`.
    Done,
    /// Bare status. Zero is success with `[]`; anything else becomes an
    /// error whose message comes from the OS error table.
    Status(i64),
    /// Success payload.
    Data(Value),
    /// Status plus payload: `result` on success, error `data` otherwise.
    StatusData(i64, Value),
    /// Status plus explicit message.
    StatusMsg(i64, String),
    /// Full error shape: code, message, data.
    Full(i64, String, Value),
    /// A preassembled wire error.
    Fail(RpcError),
    /// Two-phase: the reply joins the outgoing batch, the cleanup runs
    /// after that batch is on the wire.
    Deferred {
        reply: Box<Outcome>,
        cleanup: BoxFuture<()>,
    },
}

fn strerror(code: i64) -> String {
    std::io::Error::from_raw_os_error(code as i32).to_string()
}

/// Map a handler outcome for request `id`. Returns the Response (if any)
/// and the deferred cleanup (if any).
pub fn map_outcome(id: &str, outcome: Outcome) -> (Option<Message>, Option<BoxFuture<()>>) {
    let id_value = Value::from(id);
    match outcome {
        Outcome::Done => (Some(Message::response_result(id_value, json!([]))), None),
        Outcome::Status(0) => (Some(Message::response_result(id_value, json!([]))), None),
        Outcome::Status(code) => (
            Some(Message::response_error(
                id_value,
                RpcError::new(code, strerror(code), None),
            )),
            None,
        ),
        Outcome::Data(value) => (Some(Message::response_result(id_value, value)), None),
        Outcome::StatusData(0, value) => (Some(Message::response_result(id_value, value)), None),
        Outcome::StatusData(code, value) => (
            Some(Message::response_error(
                id_value,
                RpcError::new(code, strerror(code), Some(value)),
            )),
            None,
        ),
        Outcome::StatusMsg(0, message) => {
            (Some(Message::response_result(id_value, json!(message))), None)
        }
        Outcome::StatusMsg(code, message) => (
            Some(Message::response_error(
                id_value,
                RpcError::new(code, message, None),
            )),
            None,
        ),
        Outcome::Full(0, message, _data) => {
            (Some(Message::response_result(id_value, json!(message))), None)
        }
        Outcome::Full(code, message, data) => (
            Some(Message::response_error(
                id_value,
                RpcError::new(code, message, Some(data)),
            )),
            None,
        ),
        Outcome::Fail(err) => (Some(Message::response_error(id_value, err)), None),
        Outcome::Deferred { reply, cleanup } => {
            let (msg, inner_cleanup) = map_outcome(id, *reply);
            // A nested Deferred would lose its inner cleanup; one level is
            // all the reply-then-cleanup shape needs.
            debug_assert!(inner_cleanup.is_none());
            (msg, Some(cleanup))
        }
    }
}

/// Wrap a handler failure into the generic error Response:
/// `message` is `"<Type>: <text>"`, `data` carries the failure text.
pub fn failure_response(id: &str, failure: &HandlerFailure) -> Message {
    Message::response_error(
        Value::from(id),
        RpcError::new(
            ERR_HANDLER_FAILED,
            failure.to_string(),
            Some(json!([failure.text()])),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::ResponseBody;

    fn response_of(outcome: Outcome) -> Message {
        map_outcome("t1", outcome).0.expect("expected a response")
    }

    fn body_of(msg: Message) -> ResponseBody {
        match msg {
            Message::Response { id, body } => {
                assert_eq!(id, Value::from("t1"));
                body
            }
            other => panic!("not a response: {other:?}"),
        }
    }

    #[test]
    fn done_is_empty_result() {
        assert_eq!(
            body_of(response_of(Outcome::Done)),
            ResponseBody::Result(json!([]))
        );
    }

    #[test]
    fn zero_status_is_empty_result() {
        assert_eq!(
            body_of(response_of(Outcome::Status(0))),
            ResponseBody::Result(json!([]))
        );
    }

    #[test]
    fn nonzero_status_is_os_error() {
        match body_of(response_of(Outcome::Status(2))) {
            ResponseBody::Error(e) => {
                assert_eq!(e.code, 2);
                assert!(!e.message.is_empty());
                assert!(e.data.is_none());
            }
            other => panic!("expected error: {other:?}"),
        }
    }

    #[test]
    fn data_is_result() {
        assert_eq!(
            body_of(response_of(Outcome::Data(json!({"k": 1})))),
            ResponseBody::Result(json!({"k": 1}))
        );
    }

    #[test]
    fn status_data_attaches_data_on_error() {
        match body_of(response_of(Outcome::StatusData(7, json!(["why"])))) {
            ResponseBody::Error(e) => {
                assert_eq!(e.code, 7);
                assert_eq!(e.data, Some(json!(["why"])));
            }
            other => panic!("expected error: {other:?}"),
        }
    }

    #[test]
    fn full_error_shape() {
        match body_of(response_of(Outcome::Full(9, "nope".into(), json!(null)))) {
            ResponseBody::Error(e) => {
                assert_eq!((e.code, e.message.as_str()), (9, "nope"));
                assert_eq!(e.data, Some(json!(null)));
            }
            other => panic!("expected error: {other:?}"),
        }
    }

    #[test]
    fn deferred_surfaces_reply_and_cleanup() {
        let outcome = Outcome::Deferred {
            reply: Box::new(Outcome::Data(json!([true]))),
            cleanup: Box::pin(async {}),
        };
        let (msg, cleanup) = map_outcome("t1", outcome);
        assert_eq!(
            body_of(msg.unwrap()),
            ResponseBody::Result(json!([true]))
        );
        assert!(cleanup.is_some());
    }

    #[test]
    fn failure_wraps_into_code_five() {
        let failure: HandlerFailure = "handler exploded".into();
        match body_of(failure_response("t1", &failure)) {
            ResponseBody::Error(e) => {
                assert_eq!(e.code, ERR_HANDLER_FAILED);
                assert_eq!(e.message, "Error: handler exploded");
                assert_eq!(e.data, Some(json!(["handler exploded"])));
            }
            other => panic!("expected error: {other:?}"),
        }
    }

    #[test]
    fn failure_keeps_the_error_type_name() {
        #[derive(Debug)]
        struct Meltdown;
        impl std::fmt::Display for Meltdown {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "core overheated")
            }
        }
        impl std::error::Error for Meltdown {}

        let failure: HandlerFailure = Meltdown.into();
        assert_eq!(failure.kind(), "Meltdown");
        match body_of(failure_response("t1", &failure)) {
            ResponseBody::Error(e) => {
                assert_eq!(e.code, ERR_HANDLER_FAILED);
                assert_eq!(e.message, "Meltdown: core overheated");
                assert_eq!(e.data, Some(json!(["core overheated"])));
            }
            other => panic!("expected error: {other:?}"),
        }
    }
}
