use std::path::PathBuf;
use std::sync::Arc;

use agentless::api;
use agentless::inbound::DECRYPTION_ERROR_FIELD;
use agentless::keyring::DerivedKeyProvider;
use agentless::markup::BasicMarkupRenderer;
use agentless::model::Pagination;
use agentless::proxy::InterceptedRequest;
use agentless::{
    AgentlessConfig, AgentlessError, DecryptedRecord, FilteredTransport, InterceptingProxyFilter,
    MessageGateway, SessionAuthenticator, SessionContext, TokenPair,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const SESSION_TOKEN_ENV: &str = "AGENTLESS_SESSION_TOKEN";
const KM_TOKEN_ENV: &str = "AGENTLESS_KM_TOKEN";
const MASTER_KEY_ENV: &str = "AGENTLESS_MASTER_KEY";

#[derive(Parser)]
#[command(name = "agentless")]
#[command(about = "Send and read end-to-end encrypted messages without an agent", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt and send a messageML message
    Send {
        #[arg(long)]
        stream: String,
        message: String,
    },

    /// List and decrypt a stream's recent messages
    List {
        #[arg(long)]
        stream: String,
        /// How far back to list
        #[arg(long, default_value = "1")]
        since_days: i64,
        #[arg(long)]
        skip: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Fetch and decrypt one message
    Get { message_id: String },

    /// Download and decrypt an attachment
    Attachment {
        #[arg(long)]
        stream: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        attachment: String,
        /// Write the clear bytes here instead of printing them as base64
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delivery status of a message
    Status { message_id: String },

    /// Suppress a message
    Suppress { message_id: String },

    /// Read a datafeed once through the intercepting transport
    ReadDatafeed {
        #[arg(long)]
        datafeed: String,
    },
}

/// Reads the token pair from the environment on every authentication, so a
/// refresh picks up tokens rotated by whatever issues them.
struct EnvAuthenticator;

#[async_trait]
impl SessionAuthenticator for EnvAuthenticator {
    async fn authenticate(&self) -> agentless::Result<TokenPair> {
        let read = |name: &str| {
            std::env::var(name)
                .map_err(|_| AgentlessError::Authentication(format!("{name} is not set")))
        };
        Ok(TokenPair::new(read(SESSION_TOKEN_ENV)?, read(KM_TOKEN_ENV)?))
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AgentlessConfig> {
    let mut config = match path {
        Some(path) => AgentlessConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => AgentlessConfig::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn key_provider() -> Result<Arc<DerivedKeyProvider>> {
    let encoded = Zeroizing::new(
        std::env::var(MASTER_KEY_ENV).with_context(|| format!("{MASTER_KEY_ENV} is not set"))?,
    );
    Ok(Arc::new(DerivedKeyProvider::from_base64(&encoded)?))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agentless=info,agentless_cli=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let provider = key_provider()?;
    let session = Arc::new(SessionContext::authenticate(Arc::new(EnvAuthenticator)).await?);

    let gateway = MessageGateway::new(config, session, provider)?;
    match cli.command {
        Commands::Send { stream, message } => {
            let echo = gateway.send(&stream, &message).await?;
            print_json(&echo)?;
        }
        Commands::List {
            stream,
            since_days,
            skip,
            limit,
        } => {
            let since = chrono::Utc::now() - chrono::Duration::days(since_days);
            let pagination = (skip.is_some() || limit.is_some())
                .then_some(Pagination { skip, limit });
            for outcome in gateway.list_messages(&stream, since, pagination).await? {
                match outcome {
                    DecryptedRecord::Clear(record) => print_json(&record)?,
                    DecryptedRecord::Failed { record, error } => {
                        eprintln!(
                            "{}: {error}",
                            record.message_id.as_deref().unwrap_or("<unknown>")
                        );
                    }
                }
            }
        }
        Commands::Get { message_id } => {
            print_json(&gateway.get_message(&message_id).await?)?;
        }
        Commands::Attachment {
            stream,
            message,
            attachment,
            out,
        } => {
            let bytes = gateway.get_attachment(&stream, &message, &attachment).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), bytes = bytes.len(), "attachment saved");
                }
                None => println!("{}", STANDARD.encode(&bytes)),
            }
        }
        Commands::Status { message_id } => {
            print_json(&gateway.get_message_status(&message_id).await?)?;
        }
        Commands::Suppress { message_id } => {
            print_json(&gateway.suppress_message(&message_id).await?)?;
        }
        Commands::ReadDatafeed { datafeed } => read_datafeed(&gateway, &datafeed).await?,
    }
    Ok(())
}

/// One datafeed read through the intercepting transport. The filter shares
/// the gateway's crypto session cache and takes its tokens from the request
/// headers.
async fn read_datafeed(gateway: &MessageGateway, datafeed_id: &str) -> Result<()> {
    let config = gateway.config();
    let filter =
        InterceptingProxyFilter::new(Arc::clone(gateway.cache()), Arc::new(BasicMarkupRenderer));
    let transport = FilteredTransport::with_timeout(config.request_timeout(), filter)?;

    let url = url::Url::parse(&api::join(
        &config.relay_base_url,
        &api::datafeed_read_path(datafeed_id),
    ))?;
    let request = InterceptedRequest::new(reqwest::Method::GET, url)
        .with_tokens(&gateway.session().tokens())?;
    let response = transport.execute(request).await?;
    if !response.status.is_success() {
        return Err(anyhow!("datafeed read failed: {}", response.status));
    }

    let feed: serde_json::Value = response.json()?;
    let events = feed["events"].as_array().cloned().unwrap_or_default();
    for event in &events {
        let record = &event["payload"]["messageSent"]["message"];
        if let Some(error) = record[DECRYPTION_ERROR_FIELD].as_str() {
            eprintln!("{}: {error}", record["messageId"].as_str().unwrap_or("<unknown>"));
        } else if let Some(message) = record["message"].as_str() {
            println!("{message}");
        }
    }
    info!(datafeed = %datafeed_id, events = events.len(), "datafeed read");
    Ok(())
}
