#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

mod utils;

use chatdesk::backend::Backend;
use chatdesk::settings::{self, Settings};
use chatdesk::{ConversationSync, ConversationView, MediaKind, MessageContent, MessageStatus};

/// Command line arguments for chatdesk
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatdesk: follow and answer WhatsApp conversations from the terminal."
)]
struct Args {
    /// Settings file to use instead of the default one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save the project URL and keys for later runs
    Login {
        url: String,
        anon_key: String,
        #[arg(long)]
        access_token: Option<String>,
        #[arg(long)]
        actor_id: Option<String>,
    },
    /// Print a conversation and follow it live until Ctrl-C
    Watch { conversation_id: String },
    /// Send a message and wait for its outcome
    Send {
        conversation_id: String,
        /// Message text, or the caption when --media-url is given
        text: Option<String>,
        #[arg(long)]
        media_url: Option<String>,
        #[arg(long, default_value = "image")]
        media_kind: MediaKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    utils::setup_logging(args.log_file.as_deref(), level)?;

    if let Some(path) = &args.config {
        settings::set_settings_path_override(path.clone());
        info!("Settings file overridden to: {}", path.display());
    }

    match args.command {
        Command::Login {
            url,
            anon_key,
            access_token,
            actor_id,
        } => {
            let mut new_settings = Settings::new(&url, &anon_key);
            if let Some(token) = access_token {
                new_settings = new_settings.with_access_token(&token);
            }
            if let Some(actor) = actor_id {
                new_settings = new_settings.with_actor_id(&actor);
            }
            settings::save_settings(&new_settings)?;
            println!("Saved settings for {}", new_settings.project_url);
            Ok(())
        }
        Command::Watch { conversation_id } => {
            let sync = connect()?;
            let result = watch_conversation(&sync, &conversation_id).await;
            sync.shutdown().await;
            result
        }
        Command::Send {
            conversation_id,
            text,
            media_url,
            media_kind,
        } => {
            let content = match media_url {
                Some(url) => MessageContent::media(media_kind, url, text),
                None => MessageContent::text(text.ok_or_else(|| anyhow!("Nothing to send"))?),
            };
            let sync = connect()?;
            let result = send_message(&sync, &conversation_id, content).await;
            sync.shutdown().await;
            result
        }
    }
}

fn connect() -> Result<ConversationSync> {
    let settings = settings::resolve_settings()?;
    info!("Connecting to {}", settings.project_url);
    let backend = Backend::connect(&settings)?;
    Ok(ConversationSync::spawn(backend, settings.sync_config()))
}

async fn wait_until_loaded(view: &mut watch::Receiver<ConversationView>, conversation_id: &str) -> Result<()> {
    let loaded = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            {
                let current = view.borrow_and_update();
                if current.conversation_id.as_deref() == Some(conversation_id) && !current.loading {
                    return match &current.error {
                        Some(e) => Err(anyhow!("Could not load conversation: {}", e)),
                        None => Ok(()),
                    };
                }
            }
            if view.changed().await.is_err() {
                return Err(anyhow!("Sync worker stopped"));
            }
        }
    })
    .await;
    loaded.map_err(|_| anyhow!("Timed out loading conversation {}", conversation_id))?
}

async fn watch_conversation(sync: &ConversationSync, conversation_id: &str) -> Result<()> {
    let mut view = sync.watch();
    sync.select(conversation_id).await?;
    wait_until_loaded(&mut view, conversation_id).await?;

    let mut shown: HashMap<String, MessageStatus> = HashMap::new();
    {
        let current = view.borrow_and_update();
        if let Some(contact) = &current.contact {
            println!("Conversation with {} ({})", contact.display_name(), contact.phone_number);
        }
        for message in &current.messages {
            println!("{}", utils::format_message(message));
            shown.insert(message.id.clone(), message.status);
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving conversation {}", conversation_id);
                sync.deselect().await?;
                return Ok(());
            }
            changed = view.changed() => {
                if changed.is_err() {
                    error!("Sync worker stopped unexpectedly");
                    return Err(anyhow!("Sync worker stopped"));
                }
                let current = view.borrow_and_update();
                for message in &current.messages {
                    if shown.get(&message.id) != Some(&message.status) {
                        println!("{}", utils::format_message(message));
                        shown.insert(message.id.clone(), message.status);
                    }
                }
            }
        }
    }
}

async fn send_message(sync: &ConversationSync, conversation_id: &str, content: MessageContent) -> Result<()> {
    let mut view = sync.watch();
    sync.select(conversation_id).await?;
    wait_until_loaded(&mut view, conversation_id).await?;

    let provisional_id = sync.send(content).await?;
    info!("Queued message {}", provisional_id);

    loop {
        {
            let current = view.borrow_and_update();
            if let Some(message) = current.message(&provisional_id) {
                if message.status.is_terminal() {
                    println!("{}", utils::format_message(message));
                    return match message.status {
                        MessageStatus::Failed => Err(anyhow!(
                            "Message failed: {}",
                            message.error.clone().unwrap_or_default()
                        )),
                        _ => Ok(()),
                    };
                }
            }
        }
        if view.changed().await.is_err() {
            return Err(anyhow!("Sync worker stopped"));
        }
    }
}
