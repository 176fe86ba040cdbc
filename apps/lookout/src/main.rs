use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser};
use lookout_client_core::config::{ClientConfig, CodecPreference, NegotiationRole};
use lookout_client_core::negotiation::ConnectivityState;
use lookout_client_core::peer::{RtcPeerFactory, SampleTrackCapture};
use lookout_client_core::session::{self, SessionHandle, UiEvent};
use lookout_client_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use lookout_client_core::transport::WsConnector;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "lookout",
    about = "Watch a remote camera over WebRTC through a signaling relay",
    version
)]
struct Cli {
    #[command(flatten)]
    relay: RelayArgs,

    #[arg(long, help = "Send the first offer instead of waiting for one")]
    offer: bool,

    #[arg(long, value_name = "PATH", help = "Upload a clip over the reliable channel")]
    send_clip: Option<PathBuf>,

    #[arg(long, help = "Ask the device to start recording once connected")]
    record: bool,

    #[arg(long, help = "Publish a local audio track once connected")]
    talk: bool,

    #[arg(long, value_enum, env = "LOOKOUT_CODEC", help = "Preferred video codec")]
    codec: Option<CodecPreference>,

    #[arg(long, value_name = "MS", help = "Emit a status snapshot every MS milliseconds")]
    status_interval_ms: Option<u64>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct RelayArgs {
    #[arg(long, help = "Relay scheme (ws or wss)")]
    scheme: Option<String>,

    #[arg(long, help = "Relay host")]
    host: Option<String>,

    #[arg(long, help = "Relay port")]
    port: Option<u16>,

    #[arg(long, help = "Relay path")]
    path: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "LOOKOUT_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "LOOKOUT_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(scheme) = &self.relay.scheme {
            config.endpoint.scheme = scheme.clone();
        }
        if let Some(host) = &self.relay.host {
            config.endpoint.host = host.clone();
        }
        if self.relay.port.is_some() {
            config.endpoint.port = self.relay.port;
        }
        if let Some(path) = &self.relay.path {
            config.endpoint.path = path.clone();
        }
        if self.offer {
            config.role = NegotiationRole::Offer;
        }
        if self.codec.is_some() {
            config.codec_preference = self.codec;
        }
        if let Some(ms) = self.status_interval_ms.filter(|ms| *ms > 0) {
            config.status_interval = Some(Duration::from_millis(ms));
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config)?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = ClientConfig::from_env()?;
    cli.apply(&mut config);
    info!(url = %config.relay_url()?, role = ?config.role, "starting lookout");

    let clip = match &cli.send_clip {
        Some(path) => Some(read_clip(path).await?),
        None => None,
    };

    let (handle, mut events, task) = session::start(
        config,
        Arc::new(WsConnector),
        Arc::new(RtcPeerFactory::new()),
        Arc::new(SampleTrackCapture::new()),
    )?;

    if let Some((name, mime, data)) = clip {
        handle.send_clip(name, mime, data)?;
    }

    let mut pending = PendingActions {
        record: cli.record,
        talk: cli.talk,
    };
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    pending.on_event(&event, &handle)?;
                    report(&event);
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "ctrl-c handler failed");
                }
                info!("stopping");
                handle.stop()?;
                handle.shutdown()?;
                break;
            }
        }
    }

    task.await.context("session loop panicked")?;
    Ok(())
}

/// Actions requested on the command line that wait for a connected session.
struct PendingActions {
    record: bool,
    talk: bool,
}

impl PendingActions {
    fn on_event(&mut self, event: &UiEvent, handle: &SessionHandle) -> anyhow::Result<()> {
        if let UiEvent::Connectivity {
            state: ConnectivityState::Connected,
            ..
        } = event
        {
            if std::mem::take(&mut self.record) {
                handle.record(true)?;
            }
            if std::mem::take(&mut self.talk) {
                handle.talk(true)?;
            }
        }
        Ok(())
    }
}

fn report(event: &UiEvent) {
    match event {
        UiEvent::Notice(message) => println!("{message}"),
        UiEvent::Connectivity { session, state } => {
            println!("session {session}: {state:?}");
        }
        UiEvent::Roster(users) => {
            for user in users {
                println!("viewer {} since {}", user.name, user.indate);
            }
        }
        UiEvent::Transfer(progress) => println!(
            "{}: {}/{} bytes {:?}",
            progress.name, progress.bytes_queued, progress.total_size, progress.state
        ),
        other => debug!(event = ?other, "ui event"),
    }
}

async fn read_clip(path: &Path) -> anyhow::Result<(String, String, Vec<u8>)> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip".to_owned());
    Ok((name, mime_for(path).to_owned(), data))
}

fn mime_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match extension.as_deref() {
        Some("ogg" | "opus") => "audio/ogg",
        Some("webm") => "video/webm",
        Some("mp4") => "video/mp4",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
