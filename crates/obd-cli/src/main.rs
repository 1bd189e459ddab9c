//! OBD Monitor - command-line front end for the connection manager

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use obd_connection::{AdapterDiscovery, ConnectionManager, SerialDiscovery, Settings, SimulatorDiscovery};
use obd_protocol::mock::MockEcu;
use obd_protocol::{DtcKind, PidRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use storage::{FileStorage, Storage};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "obd-monitor")]
#[command(author, version, about = "ELM327 OBD-II monitor")]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, env = "OBD_CONFIG")]
    config: Option<PathBuf>,

    /// Vehicle profile id
    #[arg(short, long, env = "OBD_PROFILE")]
    profile: Option<String>,

    /// Talk to a simulated CAN vehicle instead of a serial adapter
    #[arg(long)]
    simulate: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List visible adapters
    Adapters,

    /// Connect and stream live data
    Monitor {
        /// Record the session
        #[arg(long)]
        record: bool,

        /// Note stored with the recording
        #[arg(long, requires = "record")]
        note: Option<String>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Read or clear trouble codes
    Codes {
        #[arg(long, value_enum, default_value = "stored")]
        kind: CodeKind,

        /// Clear stored and pending codes
        #[arg(long)]
        clear: bool,
    },

    /// Manage vehicle profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Manage stored recordings
    Recordings {
        #[command(subcommand)]
        action: RecordingAction,
    },

    /// Play a stored recording back
    Replay {
        /// Recording id
        id: String,

        /// Playback speed multiplier
        #[arg(long, default_value = "1.0")]
        speed: f64,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Print a stored profile
    Show { id: String },

    /// Create or replace a profile
    Create {
        id: String,
        #[arg(long)]
        make: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        year: Option<u16>,
        /// Known VIN; locks the profile to that vehicle
        #[arg(long)]
        vin: Option<String>,
        /// Allow connecting to a different vehicle
        #[arg(long)]
        no_strict_lock: bool,
    },
}

#[derive(Subcommand)]
enum RecordingAction {
    /// List recordings, newest first
    List,

    /// Delete a recording
    Delete { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum CodeKind {
    Stored,
    Pending,
    Permanent,
}

impl From<CodeKind> for DtcKind {
    fn from(kind: CodeKind) -> Self {
        match kind {
            CodeKind::Stored => DtcKind::Stored,
            CodeKind::Pending => DtcKind::Pending,
            CodeKind::Permanent => DtcKind::Permanent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if cli.profile.is_some() {
        settings.profile = cli.profile.clone();
    }
    info!(storage = %settings.storage_dir.display(), "=== OBD Monitor v{} ===", env!("CARGO_PKG_VERSION"));

    let storage: Arc<dyn Storage> = Arc::new(
        FileStorage::open(&settings.storage_dir)
            .await
            .context("Failed to open storage")?,
    );
    let discovery: Arc<dyn AdapterDiscovery> = if cli.simulate {
        Arc::new(SimulatorDiscovery::new(MockEcu::can()))
    } else {
        Arc::new(SerialDiscovery::new(settings.baud_rate))
    };

    match cli.command {
        Commands::Adapters => {
            commands::adapters(discovery.as_ref(), &settings).await?;
        }

        Commands::Profile { action } => match action {
            ProfileAction::Show { id } => commands::show_profile(storage.as_ref(), &id).await?,
            ProfileAction::Create {
                id,
                make,
                model,
                year,
                vin,
                no_strict_lock,
            } => {
                let profile = commands::NewProfile {
                    id,
                    make,
                    model,
                    year,
                    vin,
                    strict_lock: !no_strict_lock,
                };
                commands::create_profile(storage.as_ref(), profile).await?;
            }
        },

        Commands::Recordings { action } => {
            let library = recording::RecordingLibrary::new(Arc::clone(&storage));
            match action {
                RecordingAction::List => commands::list_recordings(&library).await?,
                RecordingAction::Delete { id } => commands::delete_recording(&library, &id).await?,
            }
        }

        Commands::Replay { id, speed } => {
            let library = recording::RecordingLibrary::new(Arc::clone(&storage));
            commands::replay(&library, &id, speed).await?;
        }

        Commands::Monitor {
            record,
            note,
            duration,
        } => {
            let manager = manager(settings, discovery, storage).await?;
            commands::monitor(&manager, record, note, duration).await?;
        }

        Commands::Codes { kind, clear } => {
            let manager = manager(settings, discovery, storage).await?;
            commands::codes(&manager, kind.into(), clear).await?;
        }
    }

    Ok(())
}

async fn manager(
    settings: Settings,
    discovery: Arc<dyn AdapterDiscovery>,
    storage: Arc<dyn Storage>,
) -> Result<ConnectionManager> {
    let profile = settings.profile.clone();
    let manager = ConnectionManager::new(
        settings,
        discovery,
        storage,
        PidRegistry::with_standard_pids(),
    );
    if let Some(id) = profile {
        manager
            .load_profile(&id)
            .await
            .with_context(|| format!("Failed to load profile {id}"))?;
    }
    Ok(manager)
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}
