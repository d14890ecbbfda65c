use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use hushdrop_transfer::TransferCoordinator;
use hushdrop_transfer::transport::lan::LanTransport;
use hushdrop_types::{SessionEvent, SessionHandle, SessionState};

mod config;

use config::Settings;

#[derive(Parser)]
#[command(name = "hushdrop")]
#[command(about = "Password-protected file drop between nearby devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print session events as JSON lines on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Advertise and send a file to the first receiver that connects
    Send {
        /// File to send
        file: PathBuf,
        /// Name to advertise (defaults to HUSHDROP_DEVICE_NAME)
        #[arg(short, long)]
        name: Option<String>,
        /// Shared password (prompted if omitted)
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Find a sender and receive its file
    Receive {
        /// Sender to connect to (defaults to the first one found)
        #[arg(short, long)]
        from: Option<String>,
        /// Shared password (prompted if omitted)
        #[arg(short, long)]
        password: Option<String>,
        /// Directory for the received file (defaults to HUSHDROP_DOWNLOAD_DIR)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "hushdrop=debug,hushdrop_transfer=debug"
    } else {
        "hushdrop=info,hushdrop_transfer=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(io::stderr)
        .init();

    let mut settings = Settings::from_env()?;
    if let Commands::Receive { out: Some(dir), .. } = &cli.command {
        settings.download_dir = dir.clone();
    }

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport = LanTransport::bind(settings.lan_config(), transport_tx)
        .await
        .context("failed to start the network transport")?;
    let coordinator = TransferCoordinator::new(Arc::new(transport), settings.coordinator_config())?;
    let mut events = coordinator.subscribe();
    tokio::spawn(coordinator.clone().run(transport_rx));

    let final_state = match cli.command {
        Commands::Send {
            file,
            name,
            password,
        } => {
            let password = password_or_prompt(password).await?;
            let name = name.unwrap_or_else(|| settings.device_name.clone());
            let handle = coordinator.start_send(&file, &name, &password).await?;
            info!(advertised = %name, file = %file.display(), "Waiting for a receiver");
            watch(&coordinator, &mut events, handle, cli.json).await?
        }
        Commands::Receive { from, password, .. } => {
            let password = password_or_prompt(password).await?;
            let sender = find_sender(&coordinator, &mut events, from.as_deref()).await?;
            info!(sender = %sender, "Connecting");
            let handle = coordinator.start_receive(&sender, &password).await?;
            watch(&coordinator, &mut events, handle, cli.json).await?
        }
    };

    if let SessionState::Failed(reason) = final_state {
        bail!("transfer failed: {}", reason);
    }
    Ok(())
}

async fn password_or_prompt(password: Option<String>) -> anyhow::Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    tokio::task::spawn_blocking(|| -> anyhow::Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "Password: ")?;
        stderr.flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    })
    .await?
}

/// Discover until a sender matching `wanted` (or any sender) shows up.
async fn find_sender(
    coordinator: &TransferCoordinator,
    events: &mut broadcast::Receiver<SessionEvent>,
    wanted: Option<&str>,
) -> anyhow::Result<String> {
    coordinator.start_discovery().await?;
    info!("Looking for senders");
    loop {
        if let Some(name) = choose_sender(&coordinator.endpoints().await, wanted) {
            return Ok(name);
        }
        tokio::select! {
            event = events.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = event {
                    bail!("coordinator stopped");
                }
            }
            _ = tokio::signal::ctrl_c() => bail!("interrupted"),
        }
    }
}

fn choose_sender(endpoints: &[String], wanted: Option<&str>) -> Option<String> {
    match wanted {
        Some(name) => endpoints.iter().find(|e| *e == name).cloned(),
        None => endpoints.first().cloned(),
    }
}

/// Report events for `handle` until it ends. Ctrl-C cancels it.
async fn watch(
    coordinator: &TransferCoordinator,
    events: &mut broadcast::Receiver<SessionEvent>,
    handle: SessionHandle,
    json: bool,
) -> anyhow::Result<SessionState> {
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event output fell behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => bail!("coordinator stopped"),
                };
                if event.session() != Some(handle) {
                    continue;
                }
                report(&event, json)?;
                if let SessionEvent::StateChanged { state, .. } = event {
                    if state.is_terminal() {
                        return Ok(state);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(session = %handle.id, "Interrupted, cancelling");
                coordinator.cancel(handle).await;
            }
        }
    }
}

fn report(event: &SessionEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        SessionEvent::StateChanged { state, .. } => eprintln!("{}", state),
        SessionEvent::Progress {
            bytes_transferred,
            total_bytes: Some(total),
            ..
        } if *total > 0 => {
            eprintln!(
                "{} / {} bytes ({:.0}%)",
                bytes_transferred,
                total,
                *bytes_transferred as f64 * 100.0 / *total as f64
            );
        }
        SessionEvent::Progress {
            bytes_transferred, ..
        } => eprintln!("{} bytes", bytes_transferred),
        SessionEvent::FileReceived { file, .. } => {
            println!(
                "Saved {} ({} bytes, {})",
                file.path.display(),
                file.size,
                file.mime_type
            );
        }
        SessionEvent::Error { reason, .. } => eprintln!("error: {}", reason),
        SessionEvent::EndpointsChanged { .. } => {}
    }
    Ok(())
}
