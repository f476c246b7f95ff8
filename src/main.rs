//! Quintet demo node.
//!
//! `serve` runs an acceptor with the default handler set; `ping` dials it
//! and exercises the echo method. Both sides negotiate encryption unless
//! `--plaintext` is passed.

mod crypto;
mod rpc;

use crate::rpc::{
    notif_handler, Client, ClientConfig, Params, Server, ServerConfig, DEFAULT_HELPERS,
    METHOD_CENSUS, METHOD_PING,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "quintet", version, about = "Symmetric JSON-RPC 2.0 peering over TCP")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Address to bind or dial
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// TCP port
    #[arg(short, long, default_value = "9002")]
    port: u16,

    /// Worker tasks per peer
    #[arg(long, default_value_t = DEFAULT_HELPERS)]
    helpers: usize,

    /// Skip the encryption handshake
    #[arg(long)]
    plaintext: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and answer pings
    Serve {
        /// Publish the machine's outward-facing address instead of binding
        /// the configured one
        #[arg(long)]
        autopublish: bool,
    },
    /// Dial a server and send echo requests
    Ping {
        /// Text to echo
        #[arg(default_value = "hello")]
        text: String,

        /// How many requests to send
        #[arg(long, default_value = "4")]
        count: u32,
    },
}

async fn serve(config: ServerConfig) {
    let server = Server::new(config);

    let listener = {
        let server = server.clone();
        tokio::spawn(async move { server.listen().await })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    server.kill().await;
    match listener.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("listener failed: {}", e),
        Err(e) => error!("listener task died: {}", e),
    }
}

async fn ping(config: ClientConfig, text: String, count: u32) {
    let client = Client::new(config);

    client.register_notif(
        METHOD_CENSUS,
        notif_handler(|params, _peer| async move {
            let count = params
                .as_ref()
                .and_then(|p| p.get_key("client_count"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            info!("currently {} client(s) connected", count);
        }),
    );

    let timeout = client.default_timeout();
    let outcome = client
        .run(|peer| async move {
            for i in 0..count {
                let payload = format!("{text} #{i}");
                match peer
                    .request_wait(METHOD_PING, Params::from_value(json!([payload])), timeout)
                    .await
                {
                    Ok(result) => info!("pong from {}: {}", peer.alias(), result),
                    Err(e) => warn!("ping failed: {}", e),
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

    if let Err(e) = outcome {
        error!("connection failed: {}", e);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quintet=info".parse().unwrap()),
        )
        .init();

    let Args {
        command,
        address,
        port,
        helpers,
        plaintext,
    } = Args::parse();
    info!("quintet v{}", VERSION);

    match command {
        Command::Serve { autopublish } => {
            serve(ServerConfig {
                address,
                port,
                autopublish,
                helpers,
                timeout: 0.0,
                encryption: !plaintext,
            })
            .await;
        }
        Command::Ping { text, count } => {
            ping(
                ClientConfig {
                    address,
                    port,
                    helpers,
                    timeout: 10.0,
                    encryption: !plaintext,
                },
                text,
                count,
            )
            .await;
        }
    }
}
