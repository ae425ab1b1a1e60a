//! Stylestream CLI - streams a directory of frames through the stylization
//! service and writes the stylized output.
//!
//! See the `stylestream` library for the session engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stylestream::constants::STYLE_EXTRACTION_TIMEOUT;
use stylestream::frame::{DirectoryFrameSink, DirectoryFrameSource};
use stylestream::{
    transport, Config, FrameSource, Preferences, Session, SessionEvent, SessionMode, TransportKind,
    UsageNotice,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "stylestream")]
#[command(version)]
#[command(about = "Stream frames through a live AI stylization service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a directory of JPEG frames and write stylized output
    Stream {
        /// Directory of pre-encoded .jpg frames, replayed in name order
        #[arg(long)]
        frames: PathBuf,
        /// Directory the stylized frames are written to
        #[arg(long)]
        output: PathBuf,
        /// Style prompt (defaults to the configured prompt)
        #[arg(long)]
        prompt: Option<String>,
        /// Reference image to derive the style from
        #[arg(long)]
        style_image: Option<PathBuf>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Keep every received frame, not just the latest
        #[arg(long)]
        keep_all: bool,
        /// Override the configured transport (websocket or webrtc)
        #[arg(long)]
        transport: Option<TransportKind>,
    },
    /// Resolve a style prompt from a reference image
    Extract {
        /// Reference image (JPEG)
        #[arg(long)]
        image: PathBuf,
        /// Initial prompt sent with authentication
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Store an API key in the credential store
    Login {
        /// API key issued by the service
        #[arg(long)]
        api_key: String,
    },
    /// Remove the stored API key
    Logout,
    /// Show, accept or revoke consent to stream camera frames
    Consent {
        /// Accept the streaming terms
        #[arg(long, conflicts_with = "revoke")]
        accept: bool,
        /// Revoke a previous acceptance
        #[arg(long)]
        revoke: bool,
    },
    /// Print the resolved configuration
    Config,
}

/// Placeholder capture for extraction-only sessions, which never send frames.
struct NoCapture;

impl FrameSource for NoCapture {
    fn next_frame(&mut self) -> Result<bytes::Bytes> {
        anyhow::bail!("extraction-only session has no frame source")
    }
}

fn init_logging() {
    let environment = stylestream::env::Environment::current();
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(environment.default_log_filter()));
    builder.format_timestamp_millis();
    if let Ok(path) = std::env::var("STYLESTREAM_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}; logging to stderr"),
        }
    }
    builder.init();
}

fn build_session(config: &Config, source: Box<dyn FrameSource>) -> Arc<Session> {
    let transport = transport::for_kind(config.transport, config.ice_servers.clone());
    Arc::new(Session::new(config.session_config(), transport, source))
}

/// Print user-facing notifications until the bus closes.
fn spawn_event_printer(session: &Session) -> tokio::task::JoinHandle<()> {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Usage(UsageNotice::LimitReached(info))) => {
                    eprintln!(
                        "Usage limit reached ({:.0}s of {:.0}s)",
                        info.seconds_used, info.seconds_limit
                    );
                }
                Ok(SessionEvent::Usage(UsageNotice::Warning { usage, message })) => match (message, usage) {
                    (Some(text), _) => eprintln!("Warning: {text}"),
                    (None, Some(info)) => eprintln!(
                        "Warning: {:.0}% of quota used, {:.0}s remaining",
                        info.usage_percent(),
                        info.seconds_remaining
                    ),
                    (None, None) => {}
                },
                Ok(SessionEvent::StyleChanged {
                    prompt,
                    from_image: true,
                }) => println!("Style: {prompt}"),
                Ok(SessionEvent::PromptAck {
                    success: false,
                    error,
                }) => eprintln!("Prompt rejected: {}", error.unwrap_or_default()),
                Ok(SessionEvent::ServerError(message)) => eprintln!("Server error: {message}"),
                Ok(SessionEvent::Disconnected { reason }) => eprintln!("Disconnected: {reason}"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn require_consent() -> Result<Preferences> {
    let prefs = Preferences::load()?;
    if !prefs.consent_accepted {
        anyhow::bail!("Streaming requires consent. Run `stylestream consent --accept` first.");
    }
    Ok(prefs)
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))
}

struct StreamArgs {
    frames: PathBuf,
    output: PathBuf,
    prompt: Option<String>,
    style_image: Option<PathBuf>,
    duration: Option<u64>,
    keep_all: bool,
    transport: Option<TransportKind>,
}

async fn run_stream(args: StreamArgs) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(kind) = args.transport {
        config.transport = kind;
    }
    let mut prefs = require_consent()?;

    let source = DirectoryFrameSource::open(&args.frames)?;
    let mut sink = DirectoryFrameSink::create(&args.output, args.keep_all)?;
    let session = build_session(&config, Box::new(source));
    let printer = spawn_event_printer(&session);

    let result = async {
        session.connect(&config.endpoint(), SessionMode::Full).await?;
        let prompt = args.prompt.clone().unwrap_or_else(|| config.default_prompt.clone());
        session.authenticate(config.api_key(), &prompt).await?;
        session
            .wait_ready(Duration::from_secs(config.connect_timeout_secs))
            .await?;
        println!(
            "Streaming via {} (session {})",
            config.transport,
            session.session_id().unwrap_or_default()
        );

        if let Some(path) = &args.style_image {
            session
                .request_style_from_image(&read_image(path)?, config.enhance_prompt)
                .await?;
        }

        let mut ticker = tokio::time::interval(config.frame_rate.interval());
        let deadline = args
            .duration
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("Interrupted, stopping...");
                    break;
                }
                _ = ticker.tick() => {
                    session.tick(&mut sink).await;
                    if !session.is_connected() {
                        anyhow::bail!("session ended: {}", session.state());
                    }
                    if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                        break;
                    }
                }
            }
        }
        anyhow::Ok(())
    }
    .await;

    if let Some(usage) = session.usage() {
        prefs.record_usage(usage);
        if let Err(e) = prefs.save() {
            log::warn!("Failed to persist usage: {e:#}");
        }
    }
    let stats = session.status().pipeline;
    session.stop().await;
    printer.abort();

    println!(
        "Sent {} frames ({} failed), displayed {} ({} dropped), wrote {} to {}",
        stats.frames_sent,
        stats.frames_failed,
        stats.frames_displayed,
        stats.frames_dropped,
        sink.written(),
        args.output.display()
    );
    result
}

async fn run_extract(image: &Path, prompt: Option<String>) -> Result<()> {
    let config = Config::load()?;
    require_consent()?;
    let bytes = read_image(image)?;

    let session = build_session(&config, Box::new(NoCapture));
    let result = async {
        session
            .connect(&config.endpoint(), SessionMode::ExtractionOnly)
            .await?;
        session
            .authenticate(config.api_key(), prompt.as_deref().unwrap_or(""))
            .await?;
        session
            .wait_ready(Duration::from_secs(config.connect_timeout_secs))
            .await?;

        let mut events = session.subscribe();
        session
            .request_style_from_image(&bytes, config.enhance_prompt)
            .await?;

        let resolved = tokio::time::timeout(STYLE_EXTRACTION_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::StyleChanged {
                        prompt,
                        from_image: true,
                    }) => return Ok(prompt),
                    Ok(SessionEvent::StyleExtractionFailed(message)) => {
                        anyhow::bail!("style extraction failed: {message}")
                    }
                    Ok(SessionEvent::Disconnected { reason }) => anyhow::bail!("disconnected: {reason}"),
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("session closed")
                    }
                }
            }
        })
        .await
        .context("timed out waiting for style extraction")??;

        println!("{resolved}");
        anyhow::Ok(())
    }
    .await;

    session.stop().await;
    result
}

fn run_consent(accept: bool, revoke: bool) -> Result<()> {
    let mut prefs = Preferences::load()?;
    if accept {
        prefs.accept_consent();
        prefs.save()?;
        println!("Consent accepted.");
    } else if revoke {
        prefs.revoke_consent();
        prefs.save()?;
        println!("Consent revoked.");
    } else {
        match prefs.consent_accepted_at {
            Some(at) if prefs.consent_accepted => println!("Consent accepted at {at}"),
            _ => println!("Consent not given."),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Stream {
            frames,
            output,
            prompt,
            style_image,
            duration,
            keep_all,
            transport,
        } => {
            run_stream(StreamArgs {
                frames,
                output,
                prompt,
                style_image,
                duration,
                keep_all,
                transport,
            })
            .await?;
        }
        Commands::Extract { image, prompt } => run_extract(&image, prompt).await?,
        Commands::Login { api_key } => {
            let mut config = Config::load()?;
            config.save_api_key(api_key.trim())?;
            println!("API key saved.");
        }
        Commands::Logout => {
            let mut config = Config::load()?;
            config.clear_api_key()?;
            println!("API key removed.");
        }
        Commands::Consent { accept, revoke } => run_consent(accept, revoke)?,
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!(
                "api_key: {}",
                if config.has_api_key() { "configured" } else { "not configured" }
            );
        }
    }

    Ok(())
}
