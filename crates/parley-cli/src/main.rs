//! Parley CLI - OpenPGP envelopes between peers
//!
//! Usage:
//!   parley init       - Create the home directory and a key pair
//!   parley keys       - Manage the primary keyring
//!   parley request    - Build a contact request for a peer key
//!   parley respond    - Approve an inbound contact request
//!   parley send       - Build a message for a contact
//!   parley receive    - Validate a frame read from a file
//!   parley listen     - Accept frames over TCP and acknowledge them
//!
//! Frames are written to a file (`--out`) or pushed to a peer
//! (`--connect host:port`), in which case the peer's ACK is awaited.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use parley_core::inbox;
use parley_core::stream::{read_any_frame, read_frame_async, write_frame_async};
use parley_core::{
    packet, AckPayload, CommandTag, ContactRequestFactory, ContactResponseFactory, EnvelopeEvent,
    EnvelopeStore, Frame, MessageFactory, ParleyConfig, PeerAddress,
};
use parley_crypto::{CryptoAgent, GpgAgent, SessionPassphrase};
use parley_memory::SqliteStore;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "parley")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Signed and encrypted envelopes between peers", long_about = None)]
struct Cli {
    /// Config file (default: ~/.parley/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root every path under this directory instead
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the home directory, config and a key pair
    Init {
        /// Real name on the generated key
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// Address advertised to peers (host:port)
        #[arg(long)]
        address: Option<PeerAddress>,
    },

    /// Manage the primary keyring
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Build a contact request for the key in PUB_KEY_FILE
    Request {
        pub_key_file: PathBuf,
        #[command(flatten)]
        out: Output,
    },

    /// List inbound contact requests
    Requests,

    /// Approve an inbound contact request and build the response
    Respond {
        nonce: String,
        #[command(flatten)]
        out: Output,
    },

    /// Drop an inbound contact request
    Reject { nonce: String },

    /// Build a message for a contact
    Send {
        fingerprint: String,
        message: String,
        #[command(flatten)]
        out: Output,
    },

    /// Validate one frame read from a file
    Receive { frame_file: PathBuf },

    /// Accept frames over TCP and acknowledge each one
    Listen {
        /// Bind address (default: 0.0.0.0 on the configured port)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// List trusted contacts
    Contacts,

    /// Show received messages
    Messages {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// List what we sent instead
        #[arg(long)]
        sent: bool,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// List keys in the primary keyring
    List {
        #[arg(long)]
        secret: bool,
    },

    /// Import armored keys from a file
    Import { file: PathBuf },

    /// Print the armored public key (default: our own)
    Export { fingerprint: Option<String> },
}

#[derive(clap::Args)]
struct Output {
    /// Write the frame to this file
    #[arg(long)]
    out: Option<PathBuf>,

    /// Send the frame to a peer and wait for its ACK
    #[arg(long)]
    connect: Option<PeerAddress>,
}

struct Session {
    config: ParleyConfig,
    agent: GpgAgent,
    store: Arc<SqliteStore>,
}

impl Session {
    fn open(config: ParleyConfig) -> anyhow::Result<Self> {
        let agent = config.agent();
        agent.prepare_home().context("preparing keyring")?;
        let store = SqliteStore::open(&config.database)
            .with_context(|| format!("opening {}", config.database.display()))?;
        Ok(Self {
            config,
            agent,
            store: Arc::new(store),
        })
    }

    fn passphrase(&self) -> anyhow::Result<SessionPassphrase> {
        SessionPassphrase::from_env(&self.config.passphrase_env)?
            .ok_or_else(|| anyhow!("set {} to the key passphrase", self.config.passphrase_env))
    }

    /// Fingerprint of our own secret key.
    fn local_fingerprint(&self) -> anyhow::Result<String> {
        self.agent
            .list_keys(true)?
            .into_iter()
            .next()
            .map(|key| key.fingerprint)
            .ok_or_else(|| {
                anyhow!(
                    "no secret key in {}; run `parley init`",
                    self.agent.keyring_dir().display()
                )
            })
    }
}

fn config_path(cli: &Cli) -> anyhow::Result<PathBuf> {
    Ok(match (&cli.config, &cli.home) {
        (Some(path), _) => path.clone(),
        (None, Some(home)) => home.join("config.json"),
        (None, None) => ParleyConfig::default_path()?,
    })
}

fn load_config(cli: &Cli, path: &Path) -> anyhow::Result<ParleyConfig> {
    if path.exists() {
        return Ok(ParleyConfig::load(path)?);
    }
    Ok(match &cli.home {
        Some(home) => ParleyConfig::rooted_at(home),
        None => ParleyConfig::default(),
    })
}

/// Deliver a frame as the user asked; returns the peer's ACK when sent.
async fn deliver(
    session: &Session,
    frame: &[u8],
    out: &Output,
) -> anyhow::Result<Option<AckPayload>> {
    if let Some(path) = &out.out {
        std::fs::write(path, frame).with_context(|| format!("writing {}", path.display()))?;
        println!("Frame written to {}", path.display());
    }
    let Some(peer) = &out.connect else {
        if out.out.is_none() {
            bail!("nowhere to deliver the frame: pass --out or --connect");
        }
        return Ok(None);
    };

    let mut stream = TcpStream::connect((peer.host.as_str(), peer.port))
        .await
        .with_context(|| format!("connecting to {}", peer))?;
    write_frame_async(&mut stream, frame).await?;
    let reply = read_frame_async(&mut stream, Some(CommandTag::Ack), session.config.read_timeout())
        .await?;
    let ack: AckPayload = reply.decode()?;
    println!(
        "{} {} (nonce {})",
        peer,
        if ack.accepted { "accepted" } else { "rejected" },
        ack.nonce
    );
    Ok(Some(ack))
}

/// Inbox bookkeeping for one pipeline result. Returns the ACK to send.
fn settle(session: &Session, event: EnvelopeEvent) -> anyhow::Result<Option<AckPayload>> {
    let store: &dyn EnvelopeStore = &*session.store;
    let ack = event.ack();
    match event {
        EnvelopeEvent::ContactRequest(valid) => {
            let record = inbox::record_contact_request(store, &valid)?;
            println!(
                "Contact request from {} ({}), nonce {}",
                record.username.as_deref().unwrap_or("unknown"),
                record.fingerprint,
                record.nonce
            );
        }
        EnvelopeEvent::ContactResponse(valid) => {
            let contact = inbox::accept_contact_response(store, &session.agent, &valid)?;
            println!("Contact added: {}", contact.fingerprint);
        }
        EnvelopeEvent::Message(valid) => {
            inbox::record_message(store, &session.agent, &valid)?;
            println!(
                "Message from {}:\n{}",
                valid.sender().unwrap_or("unknown"),
                valid.data.message
            );
        }
        EnvelopeEvent::Ack(ack) => {
            println!("ACK {} accepted={}", ack.nonce, ack.accepted);
            return Ok(None);
        }
        EnvelopeEvent::Built { tag, .. } => {
            tracing::debug!(tag = %tag, "ignoring built frame on the receive path");
            return Ok(None);
        }
        EnvelopeEvent::Rejected { tag, error } => {
            tracing::warn!(tag = %tag, kind = error.kind(), "envelope rejected: {}", error);
            println!("Rejected {}: {}", tag, error);
        }
        EnvelopeEvent::Failed(reason) => bail!("pipeline failed: {}", reason),
    }
    Ok(ack)
}

/// Validate `frame` on the blocking pool.
async fn validate_frame(
    session: &Session,
    passphrase: &Arc<SessionPassphrase>,
    frame: Frame,
) -> anyhow::Result<EnvelopeEvent> {
    let (tx, mut rx) = mpsc::channel(1);
    let agent = session.agent.clone();
    let store = Arc::clone(&session.store);
    let passphrase = Arc::clone(passphrase);
    parley_core::spawn_pipeline(tx, move || {
        parley_core::process_frame(&agent, &*store, &passphrase, &frame)
    });
    rx.recv()
        .await
        .ok_or_else(|| anyhow!("pipeline ended without a result"))
}

fn rejection(frame: &Frame) -> AckPayload {
    // Echo whatever nonce the payload carries so the sender can correlate.
    let nonce = serde_json::from_slice::<serde_json::Value>(&frame.payload)
        .ok()
        .and_then(|v| {
            ["nonce", "response_nonce"]
                .iter()
                .find_map(|key| v.get(key).and_then(|n| n.as_str()).map(str::to_string))
        })
        .unwrap_or_default();
    AckPayload {
        nonce,
        accepted: false,
    }
}

async fn serve_peer(
    session: Arc<Session>,
    passphrase: Arc<SessionPassphrase>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let frame = read_frame_async(&mut stream, None, session.config.read_timeout()).await?;
    if frame.tag() == CommandTag::Ack {
        bail!("unsolicited ACK from {}", peer);
    }
    let fallback = rejection(&frame);
    let event = validate_frame(&session, &passphrase, frame).await?;
    let ack = match settle(&session, event) {
        Ok(ack) => ack.unwrap_or(fallback),
        Err(e) => {
            tracing::warn!(%peer, error = %e, "bookkeeping failed");
            fallback
        }
    };
    let reply = packet::encode(&ack, CommandTag::Ack)?;
    write_frame_async(&mut stream, &reply).await?;
    stream.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = config_path(&cli)?;
    let mut config = load_config(&cli, &config_path)?;

    match cli.command {
        Commands::Init {
            name,
            email,
            address,
        } => {
            if let Some(address) = address {
                config.local_address = address;
            }
            config.save(&config_path)?;

            let session = Session::open(config)?;
            if let Ok(fingerprint) = session.local_fingerprint() {
                println!("Key already present: {}", fingerprint);
                return Ok(());
            }
            let passphrase = session.passphrase()?;
            let fingerprint = session
                .agent
                .gen_key(&name, &email, Some(&passphrase))?;
            println!("Config written to {}", config_path.display());
            println!("Generated key {}", fingerprint);
        }

        Commands::Keys { action } => {
            let session = Session::open(config)?;
            match action {
                KeysAction::List { secret } => {
                    for key in session.agent.list_keys(secret)? {
                        println!(
                            "{}  {}  {}",
                            key.fingerprint,
                            key.created,
                            key.username().unwrap_or("")
                        );
                    }
                }
                KeysAction::Import { file } => {
                    let armored = std::fs::read_to_string(&file)
                        .with_context(|| format!("reading {}", file.display()))?;
                    let result = session.agent.import_keys(&armored)?;
                    for fingerprint in &result.fingerprints {
                        println!("Imported {}", fingerprint);
                    }
                    println!("{} key(s) imported", result.count());
                }
                KeysAction::Export { fingerprint } => {
                    let fingerprint = match fingerprint {
                        Some(f) => f,
                        None => session.local_fingerprint()?,
                    };
                    print!("{}", session.agent.export_keys(&[&fingerprint], false, None)?);
                }
            }
        }

        Commands::Request { pub_key_file, out } => {
            let session = Session::open(config)?;
            let passphrase = session.passphrase()?;
            let local = session.local_fingerprint()?;
            let peer_pub_key = std::fs::read_to_string(&pub_key_file)
                .with_context(|| format!("reading {}", pub_key_file.display()))?;

            let mut factory = ContactRequestFactory::new(
                &session.config.local_address,
                &session.agent,
                &local,
                &peer_pub_key,
                &passphrase,
            );
            if let Some(peer) = &out.connect {
                factory = factory.peer_address(peer);
            }
            if !factory.build() {
                bail!("building request: {}", describe(factory.error()));
            }
            let built = factory
                .into_envelope()
                .ok_or_else(|| anyhow!("request built without an envelope"))?;

            // Register before sending: the response can arrive before the ACK.
            session.store.insert_pending_response(&built.pending)?;
            match deliver(&session, &built.frame, &out).await {
                Ok(_) => println!("Request nonce {}", built.nonce()),
                Err(e) => {
                    inbox::abandon_contact_request(&*session.store, built.nonce())?;
                    return Err(e);
                }
            }
        }

        Commands::Requests => {
            let session = Session::open(config)?;
            for request in session.store.list_contact_requests()? {
                println!(
                    "{}  {}  {}  {}",
                    request.nonce,
                    request.fingerprint,
                    request.username.as_deref().unwrap_or(""),
                    request.received_at.to_rfc3339()
                );
            }
        }

        Commands::Respond { nonce, out } => {
            let session = Session::open(config)?;
            let passphrase = session.passphrase()?;
            let local = session.local_fingerprint()?;
            let store: &dyn EnvelopeStore = &*session.store;
            let request = store
                .fetch_contact_request(&nonce)?
                .ok_or_else(|| anyhow!("no contact request with nonce {}", nonce))?;

            let mut factory = ContactResponseFactory::new(
                &session.config.local_address,
                &session.agent,
                &request,
                &passphrase,
            )
            .signing_key(&local);
            if !factory.build() {
                bail!("building response: {}", describe(factory.error()));
            }
            let built = factory
                .into_envelope()
                .ok_or_else(|| anyhow!("response built without an envelope"))?;

            // Reply to the address the requester advertised unless told otherwise.
            let advertised = request.address_host.clone().zip(request.address_port);
            let connect = match (out.connect, &out.out) {
                (Some(peer), _) => Some(peer),
                (None, None) => advertised.map(|(host, port)| PeerAddress::new(host, port)),
                (None, Some(_)) => None,
            };
            let out = Output {
                connect,
                out: out.out,
            };
            deliver(&session, &built.frame, &out).await?;

            let contact = inbox::approve_contact_request(store, &session.agent, &request)?;
            inbox::take_contact_request(store, &nonce)?;
            println!("Contact added: {}", contact.fingerprint);
        }

        Commands::Reject { nonce } => {
            let session = Session::open(config)?;
            match inbox::take_contact_request(&*session.store, &nonce)? {
                Some(request) => println!("Dropped request from {}", request.fingerprint),
                None => bail!("no contact request with nonce {}", nonce),
            }
        }

        Commands::Send {
            fingerprint,
            message,
            out,
        } => {
            let session = Session::open(config)?;
            let passphrase = session.passphrase()?;
            let local = session.local_fingerprint()?;
            let contact = session
                .store
                .fetch_peer_contact_by_fingerprint(&fingerprint)?
                .ok_or_else(|| anyhow!("{} is not a contact", fingerprint))?;

            let mut factory = MessageFactory::new(
                &session.config.local_address,
                &session.agent,
                &contact.gpg_pub_key,
                &local,
                &message,
                &passphrase,
            );
            if !factory.build() {
                bail!("building message: {}", describe(factory.error()));
            }
            let built = factory
                .into_envelope()
                .ok_or_else(|| anyhow!("message built without an envelope"))?;

            let contact_address = contact.address_host.clone().zip(contact.address_port);
            let to = out
                .connect
                .clone()
                .or_else(|| contact_address.map(|(host, port)| PeerAddress::new(host, port)))
                .unwrap_or_default();
            // Without --out the message goes straight to the contact.
            let connect = match (out.connect, &out.out) {
                (Some(peer), _) => Some(peer),
                (None, None) => Some(to.clone()),
                (None, Some(_)) => None,
            };
            let out = Output {
                connect,
                out: out.out,
            };
            deliver(&session, &built.frame, &out).await?;
            inbox::record_sent_message(&*session.store, &built, &to)?;
            println!("Message nonce {}", built.nonce());
        }

        Commands::Receive { frame_file } => {
            let session = Session::open(config)?;
            let passphrase = Arc::new(session.passphrase()?);
            let frame = read_frame_file(&frame_file)?;
            let event = validate_frame(&session, &passphrase, frame).await?;
            if let Some(ack) = settle(&session, event)? {
                println!("{}", serde_json::to_string(&ack)?);
            }
        }

        Commands::Listen { bind } => {
            let bind = bind
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.local_address.port)));
            let session = Arc::new(Session::open(config)?);
            let passphrase = Arc::new(session.passphrase()?);
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("binding {}", bind))?;
            println!("Listening on {}", bind);

            loop {
                let (stream, peer) = listener.accept().await?;
                tracing::info!(%peer, "connection");
                let session = Arc::clone(&session);
                let passphrase = Arc::clone(&passphrase);
                tokio::spawn(async move {
                    if let Err(e) = serve_peer(session, passphrase, stream, peer).await {
                        tracing::warn!(%peer, error = %e, "connection failed");
                    }
                });
            }
        }

        Commands::Contacts => {
            let session = Session::open(config)?;
            for contact in session.store.list_peer_contacts()? {
                let address = contact
                    .address_host
                    .as_deref()
                    .zip(contact.address_port)
                    .map(|(host, port)| format!("{}:{}", host, port))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {}  {}",
                    contact.fingerprint,
                    contact.username.as_deref().unwrap_or(""),
                    address
                );
            }
        }

        Commands::Messages { limit, sent: true } => {
            let session = Session::open(config)?;
            for archived in session.store.list_sent_messages(limit)? {
                println!(
                    "[{}] {} -> {} ({}:{})",
                    archived.sent_at.to_rfc3339(),
                    archived.nonce,
                    archived.sent_to,
                    archived.address_host,
                    archived.address_port
                );
            }
        }

        Commands::Messages { limit, sent: false } => {
            let session = Session::open(config)?;
            let passphrase = session.passphrase()?;
            for archived in session.store.list_received_messages(limit)? {
                let decrypted = session.agent.decrypt(&archived.ciphertext, &passphrase)?;
                let text = if decrypted.ok {
                    parley_crypto::SigDict::parse(&decrypted.plaintext)
                        .ok()
                        .and_then(|sig_dict| {
                            serde_json::from_str::<parley_core::MessageData>(&sig_dict.data).ok()
                        })
                        .map(|data| data.message)
                        .unwrap_or_else(|| "<unreadable>".to_string())
                } else {
                    format!("<{}>", decrypted.status)
                };
                println!(
                    "[{}] {}: {}",
                    archived.received_at.to_rfc3339(),
                    archived.sent_from,
                    text
                );
            }
        }
    }

    Ok(())
}

fn read_frame_file(path: &Path) -> anyhow::Result<Frame> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(read_any_frame(&mut file)?)
}

fn describe(error: Option<&parley_core::EnvelopeError>) -> String {
    error.map_or_else(|| "unknown error".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_flag_roots_config() {
        let cli = Cli::try_parse_from(["parley", "--home", "/tmp/p", "contacts"]).unwrap();
        assert_eq!(config_path(&cli).unwrap(), PathBuf::from("/tmp/p/config.json"));
        let config = load_config(&cli, Path::new("/tmp/p/missing.json")).unwrap();
        assert_eq!(config.database, PathBuf::from("/tmp/p/parley.db"));
    }

    #[test]
    fn test_connect_parses_peer_address() {
        let cli = Cli::try_parse_from([
            "parley", "send", "ABCD", "hello", "--connect", "bob.onion:7002",
        ])
        .unwrap();
        match cli.command {
            Commands::Send { out, .. } => {
                assert_eq!(out.connect, Some(PeerAddress::new("bob.onion", 7002)));
                assert!(out.out.is_none());
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_rejection_echoes_nonce() {
        let frame = Frame {
            header: parley_core::PacketHeader {
                length: 0,
                tag: CommandTag::Res,
            },
            payload: br#"{"ciphertext":"c","response_nonce":"r1","request_nonce":"q1"}"#.to_vec(),
        };
        let ack = rejection(&frame);
        assert_eq!(ack.nonce, "r1");
        assert!(!ack.accepted);

        let garbage = Frame {
            payload: b"not json".to_vec(),
            ..frame
        };
        assert_eq!(rejection(&garbage).nonce, "");
    }
}
