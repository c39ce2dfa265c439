//! ezviz-relay - Stream live video from EZVIZ cameras through the vendor cloud
//!
//! Video goes to stdout or to per-session files. Logs always go to stderr so
//! stdout can be piped straight into a transcoder.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ezviz_auth::{AuthClient, Credentials, Region};
use ezviz_client::{
    spawn_pipe_writer, spawn_segment_writer, ChannelSink, Orchestrator, RunSummary,
    SessionConfig,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stream live video from EZVIZ cameras through the vendor cloud relay
#[derive(Parser, Debug)]
#[command(name = "ezviz-relay")]
#[command(about = "Stream live video from EZVIZ cameras through the vendor cloud relay", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Account email
    #[arg(long, env = "EZVIZ_EMAIL", global = true)]
    email: Option<String>,

    /// Account password
    #[arg(long, env = "EZVIZ_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Camera serial number
    #[arg(long, env = "EZVIZ_SERIAL", global = true)]
    serial: Option<String>,

    /// Account region (Europe, Africa, Asia, NorthAmerica, Oceania, SouthAmerica)
    #[arg(long, env = "EZVIZ_REGION", default_value = "Europe", global = true)]
    region: Region,

    /// YAML file overriding timeouts and backoff settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the raw video stream to stdout
    #[command(long_about = r#"
Write the raw video elementary stream to stdout, reconnecting whenever the
relay drops the connection. Session boundaries are not marked.

EXAMPLES:
  ezviz-relay stream --serial BD1234567 | ffmpeg -i - -c copy out.mp4
"#)]
    Stream,

    /// Write each streaming session to its own file
    Record {
        /// Output directory
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// File extension for segment files
        #[arg(long, default_value = "h264")]
        extension: String,
    },

    /// List cameras registered on the account
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::Stream => {
            let credentials = credentials(&cli, true)?;
            let (sink, events) = ChannelSink::new();
            let writer = spawn_pipe_writer(events, tokio::io::stdout());

            let summary = run_orchestrator(credentials, config, sink).await?;

            let written = writer
                .await
                .context("stdout writer task failed")?
                .context("Failed to write to stdout")?;
            info!(
                "Wrote {} bytes from {} sessions",
                written, summary.sessions
            );
            Ok(())
        }
        Commands::Record { dir, extension } => {
            let credentials = credentials(&cli, true)?;
            let (sink, events) = ChannelSink::new();
            let writer = spawn_segment_writer(events, dir.clone(), extension.clone());

            run_orchestrator(credentials, config, sink).await?;

            let segments = writer
                .await
                .context("segment writer task failed")?
                .with_context(|| format!("Failed to write segments to {}", dir.display()))?;
            info!("Recorded {} segments in {}", segments.len(), dir.display());
            Ok(())
        }
        Commands::Devices => {
            let credentials = credentials(&cli, false)?;
            list_devices(&credentials, &config).await
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SessionConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Invalid config file {}", path.display()))?;

    Ok(config)
}

fn credentials(cli: &Cli, needs_serial: bool) -> Result<Credentials> {
    let email = cli
        .email
        .clone()
        .context("Account email is required (--email or EZVIZ_EMAIL)")?;
    let password = cli
        .password
        .clone()
        .context("Account password is required (--password or EZVIZ_PASSWORD)")?;
    let serial = match &cli.serial {
        Some(serial) => serial.clone(),
        None if needs_serial => {
            anyhow::bail!("Camera serial is required (--serial or EZVIZ_SERIAL)")
        }
        None => String::new(),
    };

    Ok(Credentials::new(email, password, serial, cli.region))
}

async fn run_orchestrator(
    credentials: Credentials,
    config: SessionConfig,
    sink: ChannelSink,
) -> Result<RunSummary> {
    let api = AuthClient::new(config.request_timeout, config.connect_timeout)
        .context("Failed to create HTTP client")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        shutdown.cancel();
    });

    let result = Orchestrator::new(api, credentials, config, sink)
        .run(cancel)
        .await;

    match result {
        Ok(summary) => Ok(summary),
        Err(e) => {
            error!("Streaming stopped: {}", e);
            Err(e).context("Streaming failed")
        }
    }
}

async fn list_devices(credentials: &Credentials, config: &SessionConfig) -> Result<()> {
    let client = AuthClient::new(config.request_timeout, config.connect_timeout)
        .context("Failed to create HTTP client")?;
    let session = client.login(credentials).await.context("Login failed")?;
    let devices = client
        .list_devices(&session)
        .await
        .context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No cameras on this account");
        return Ok(());
    }

    println!("{:<16} {:<24} {:<16} {:<8} VERSION", "SERIAL", "NAME", "MODEL", "STATUS");
    for device in devices {
        let status = match device.status {
            Some(1) => "online",
            Some(_) => "offline",
            None => "unknown",
        };
        println!(
            "{:<16} {:<24} {:<16} {:<8} {}",
            device.serial,
            device.name.as_deref().unwrap_or("-"),
            device.model.as_deref().unwrap_or("-"),
            status,
            device.version.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
