//! Tether demo binary.
//!
//! Runs two accounts against an in-process relay: Alice publishes a
//! discovery request out of band, Bob scans it and answers, then Alice sends
//! a chat message over the new channel and waits for its acknowledgement.
//!
//! # Usage
//!
//! ```bash
//! tether-demo --message "Hello!"
//!
//! # Keep Alice's keys in a redb file
//! tether-demo --storage alice.redb --storage-key <64 hex chars>
//! ```

use std::time::Duration;

use clap::Parser;
use tether_client::{Account, AccountConfig, AccountEvent, LogLevel, MemoryRelay, StorageConfig, SystemEnv, Target};
use tether_core::Environment;
use tether_proto::{Chat, DiscoveryRequest, TypedContent};
use tokio::{sync::mpsc, time::timeout};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tether account demo
#[derive(Parser, Debug)]
#[command(name = "tether-demo")]
#[command(about = "Discover a peer and exchange an acknowledged message")]
#[command(version)]
struct Args {
    /// Deployment (sandbox, production)
    #[arg(short, long, default_value = "sandbox")]
    target: String,

    /// Chat message Alice sends once connected
    #[arg(short, long, default_value = "Hello!")]
    message: String,

    /// Seconds until the discovery request expires
    #[arg(long, default_value = "300")]
    expires_in: u64,

    /// Seconds to wait for each network step
    #[arg(long, default_value = "10")]
    wait: u64,

    /// redb file for Alice's key material
    #[arg(long)]
    storage: Option<String>,

    /// Hex-encoded 32-byte key sealing `--storage`
    #[arg(long)]
    storage_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value_t = LogLevel::default().to_string())]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let log_level: LogLevel = args.log_level.parse()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let target: Target = args.target.parse()?;
    let wait = Duration::from_secs(args.wait);

    let mut bob_config = AccountConfig::new(target);
    bob_config.log_level = log_level;
    let alice_config = match (&args.storage, &args.storage_key) {
        (Some(path), Some(key)) => bob_config.clone().with_storage_path(path, hex::decode(key)?),
        (None, None) => bob_config.clone(),
        _ => return Err("--storage and --storage-key must be given together".into()),
    };
    bob_config.storage = StorageConfig::Memory;

    let relay = MemoryRelay::new();
    let (transport, inbound) = relay.connect();
    let (alice, _alice_events) = Account::configure(alice_config, transport, inbound)?;
    let (transport, inbound) = relay.connect();
    let (bob, mut bob_events) = Account::configure(bob_config, transport, inbound)?;

    let alice_inbox = alice.inbox_open(0).await?;
    let bob_inbox = bob.inbox_open(0).await?;
    tracing::info!(%alice_inbox, %bob_inbox, ?target, "inboxes open");

    let expires = SystemEnv::new().wall_clock_secs() + args.expires_in;
    let key_package = alice.connection_negotiate_out_of_band(alice_inbox, expires)?;
    let (request, pending) = alice.discovery_request(key_package, expires)?;

    let payload = request.encode_out_of_band()?;
    tracing::info!(request_id = %request.id, payload = %hex::encode(&payload), "discovery request published");

    let scanned = DiscoveryRequest::decode_out_of_band(&payload)?;
    let group = bob.discovery_respond(bob_inbox, &scanned).await?;
    tracing::info!(%group, "bob answered discovery request");

    let responder = timeout(wait, pending.response()).await??;
    tracing::info!(%responder, "alice resolved discovery request");

    let id = alice.message_send(responder, Chat::new(args.message)).await?;
    let received = timeout(wait, next_chat(&mut bob_events)).await?;
    if let Some(chat) = received {
        tracing::info!(message = %id, text = %chat.message, "bob received chat message");
    }

    let status = timeout(wait, alice.message_acknowledged(id)).await?;
    tracing::info!(message = %id, %status, "delivery settled");

    alice.shutdown();
    bob.shutdown();
    Ok(())
}

async fn next_chat(events: &mut mpsc::UnboundedReceiver<AccountEvent>) -> Option<Chat> {
    while let Some(event) = events.recv().await {
        if let AccountEvent::MessageReceived(message) = event
            && let TypedContent::Chat(chat) = message.content
        {
            return Some(chat);
        }
    }
    None
}
