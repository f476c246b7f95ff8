pub mod crypto;
pub mod rpc;

pub use crypto::{Cipher, ConnectionKeys, CryptoError};
pub use rpc::{
    enable_encryption, Client, ClientConfig, Completion, Disconnect, Message, NetError, Outcome,
    Params, Peer, PeerOptions, RemoteError, RequestError, Role, RpcError, Server, ServerConfig,
};
