//! Symmetric JSON-RPC 2.0 peering over line-framed TCP.

pub mod client;
pub mod codec;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod peer;
pub mod server;
pub mod types;

// Re-exports
pub use client::{Client, ClientConfig, SessionInfo};
pub use codec::{
    decode, encode, encode_batch, new_alias, new_id, Inbound, Message, Params, ResponseBody,
    RpcError, JSONRPC_VERSION,
};
pub use frame::{CloseReason, FrameError, FrameRead, FrameReader, FrameWriter, Framed, Transport};
pub use handler::{
    notif_handler, request_handler, HandlerFailure, HandlerResult, HandlerTable, NotifHandler,
    Outcome, RequestHandler,
};
pub use handshake::enable_encryption;
pub use peer::{
    outward_addr, Completion, Disconnect, Peer, PeerOptions, RemoteError, RequestError, Traffic,
};
pub use server::{NetError, PeerHook, Server, ServerConfig};
pub use types::*;
