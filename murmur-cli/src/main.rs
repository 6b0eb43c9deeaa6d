use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use murmur_core::config::Config;
use murmur_core::core_api::{build_client, HttpMessageApi};
use murmur_core::core_channel::{VerificationChannel, WsTransport};
use murmur_core::core_crypto::{DecryptionGateway, HttpDecryptionCapability};
use murmur_core::core_delivery::{
    ConversationView, CoordinatorDeps, CoordinatorSettings, DeliveryCoordinator, ViewState,
};
use murmur_core::core_keys::{FileKeySlot, KeyStore, PrivateKey};
use murmur_core::core_model::{ConversationId, DeliveryState, LocalId, Message, ServerId, UserId};
use murmur_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use murmur_core::metrics::init_metrics;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const PASSPHRASE_ENV: &str = "MURMUR_KEYS_PASSPHRASE";

#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); environment variables are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a conversation and chat from the terminal
    Chat {
        /// Local user id
        #[arg(long)]
        user: String,

        /// User id of the contact
        #[arg(long)]
        contact: String,

        /// Temporary private key issued at login, imported if no key is stored
        #[arg(long)]
        temp_key_file: Option<PathBuf>,
    },

    /// Store a private key for a user in the local key slot
    ImportKey {
        #[arg(long)]
        user: String,

        /// File holding the PEM-encoded private key
        #[arg(long)]
        key_file: PathBuf,
    },

    /// Report whether a usable private key is stored for a user
    CheckKey {
        #[arg(long)]
        user: String,
    },

    /// Show the security code shared with a contact
    Verify {
        #[arg(long)]
        contact: String,

        /// Mark the contact as verified once the code is shown
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env().context("reading configuration from environment")?,
    };
    if let Some(level) = args.log_level {
        config.logging.level = level.to_string();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    init_logging_with_config(LogConfig::try_from(&config.logging)?)?;
    if config.metrics.enabled {
        init_metrics();
    }

    match args.command {
        Command::Chat {
            user,
            contact,
            temp_key_file,
        } => chat(&config, UserId::new(user), ConversationId::new(contact), temp_key_file).await,
        Command::ImportKey { user, key_file } => import_key(&config, UserId::new(user), &key_file),
        Command::CheckKey { user } => check_key(&config, UserId::new(user)),
        Command::Verify { contact, confirm } => verify(&config, ConversationId::new(contact), confirm).await,
    }
}

fn open_key_store(config: &Config) -> Result<KeyStore> {
    let passphrase = std::env::var(PASSPHRASE_ENV).ok();
    if config.keys.encrypt_at_rest && passphrase.is_none() {
        bail!("{} must be set when encrypt_at_rest is enabled", PASSPHRASE_ENV);
    }
    let passphrase = passphrase.filter(|_| config.keys.encrypt_at_rest);
    let slot = FileKeySlot::new(&config.keys.dir, passphrase.as_deref())
        .with_context(|| format!("opening key slot in {}", config.keys.dir.display()))?;
    Ok(KeyStore::new(Arc::new(slot)))
}

fn read_key_file(path: &Path) -> Result<PrivateKey> {
    let material = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(PrivateKey::new(material.trim()))
}

fn push_transport(config: &Config) -> WsTransport {
    match &config.server.session_cookie {
        Some(cookie) => WsTransport::new().with_header("Cookie", format!("sessionid={}", cookie)),
        None => WsTransport::new(),
    }
}

fn import_key(config: &Config, user: UserId, key_file: &Path) -> Result<()> {
    let keys = open_key_store(config)?;
    keys.store_private_key(read_key_file(key_file)?, &user)?;
    println!("Private key stored for user {}", user);
    Ok(())
}

fn check_key(config: &Config, user: UserId) -> Result<()> {
    let keys = open_key_store(config)?;
    if keys.has_private_key(&user) {
        println!("Private key present for user {}", user);
        Ok(())
    } else {
        bail!("no private key for user {}; log out and back in to regenerate keys", user)
    }
}

async fn chat(
    config: &Config,
    user: UserId,
    contact: ConversationId,
    temp_key_file: Option<PathBuf>,
) -> Result<()> {
    let keys = open_key_store(config)?;
    let temporary_key = temp_key_file.as_deref().map(read_key_file).transpose()?;

    let client = build_client(&config.server)?;
    let deps = CoordinatorDeps {
        local_user: user.clone(),
        transport: Arc::new(push_transport(config)),
        api: Arc::new(HttpMessageApi::new(client.clone(), config.server.clone())),
        gateway: DecryptionGateway::new(Arc::new(HttpDecryptionCapability::new(
            client,
            config.server.decrypt_url(),
        ))),
        keys,
        temporary_key,
    };
    let (handle, task) = DeliveryCoordinator::spawn(deps, CoordinatorSettings::from_config(config));

    if let Err(e) = handle.check_key().await {
        warn!(error = %e, "Encrypted messages will show as placeholders");
    }
    handle.select_conversation(contact.clone()).await?;
    info!(%user, %contact, "Conversation open");
    println!("Chatting with {}. Type a message, /read <id> to acknowledge, /quit to leave.", contact);

    let mut view = handle.view();
    let mut printer = ViewPrinter::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                for line in printer.render(&view.borrow_and_update()) {
                    println!("{}", line);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if let Some(id) = line.strip_prefix("/read ") {
                    match id.trim().parse::<u64>() {
                        Ok(id) => {
                            handle.acknowledge_read(ServerId(id)).await?;
                        }
                        Err(_) => println!("usage: /read <message id>"),
                    }
                    continue;
                }
                if !line.is_empty() {
                    handle.send_message(line).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await?;
    task.await?;
    Ok(())
}

/// Tracks what has been shown so each message prints once, wherever
/// it lands in the ordered view
#[derive(Default)]
struct ViewPrinter {
    printed_server: HashSet<ServerId>,
    printed_local: HashSet<LocalId>,
    connection: Option<String>,
    state: Option<ViewState>,
}

impl ViewPrinter {
    /// Lines describing what changed since the previous view
    fn render(&mut self, view: &ConversationView) -> Vec<String> {
        let mut lines = Vec::new();
        let connection = format!("{}{}", view.connection, if view.fallback_active { " (polling)" } else { "" });
        if self.connection.as_deref() != Some(connection.as_str()) {
            lines.push(format!("-- connection: {}", connection));
            self.connection = Some(connection);
        }
        if self.state != Some(view.state) {
            if view.state == ViewState::Empty {
                lines.push("-- no messages yet".to_string());
            }
            self.state = Some(view.state);
        }

        for message in &view.messages {
            if self.mark_printed(message) {
                continue;
            }
            let who = if message.is_self { "me" } else { message.sender_id.as_str() };
            let id = message.server_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
            let marker = match message.delivery_state {
                DeliveryState::Pending => " …",
                DeliveryState::Sent => "",
                DeliveryState::Read => " ✓",
            };
            lines.push(format!("[{}] {}: {}{}", id, who, message.text(), marker));
        }
        lines
    }

    /// Records `message` as printed; true if it had been printed before.
    /// A promoted echo is recognised by the local id of its pending record.
    fn mark_printed(&mut self, message: &Message) -> bool {
        let seen = message.server_id.is_some_and(|id| self.printed_server.contains(&id))
            || message.local_id.as_ref().is_some_and(|id| self.printed_local.contains(id));
        if let Some(id) = message.server_id {
            self.printed_server.insert(id);
        }
        if let Some(id) = &message.local_id {
            self.printed_local.insert(id.clone());
        }
        seen
    }
}

async fn verify(config: &Config, contact: ConversationId, confirm: bool) -> Result<()> {
    let channel = VerificationChannel::start(
        Arc::new(push_transport(config)),
        config.server.security_endpoint(&contact),
        config.channel.security_retry,
    );
    let mut status = channel.status();
    let mut requested = false;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if let Some(code) = &current.security_code {
                    println!("Security code with {}: {}", contact, code);
                }
                if current.verified {
                    println!("Contact {} is verified", contact);
                    break;
                }
                if confirm && !requested && current.security_code.is_some() {
                    let outcome = channel.request_verification().await;
                    info!(?outcome, "Verification requested");
                    requested = true;
                }
                if !confirm && current.security_code.is_some() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    channel.shutdown().await;
    Ok(())
}
