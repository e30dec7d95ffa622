use anyhow::Result;
use clap::{Parser, Subcommand};
use reforge::config::Config;
use reforge::core::Core;
use reforge::intake::FileRecord;
use reforge::store::ServiceType;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the processing pipelines (default)
    Run,
    /// Ingest a JSON file of service records into the store
    Sync {
        /// Which service produced the records
        #[arg(value_enum)]
        service: Service,
        /// JSON array of file records
        file: PathBuf,
    },
    /// Register a library prefix
    AddLibrary { path: String },
    /// Move every failed video back to needs_analysis
    ResetFailed,
    /// Reset videos whose stored parameters would zero out audio
    ResetInvalidAudio,
    /// Reset videos whose analysis produced unusable audio metadata
    ResetInvalidAudioMetadata,
    /// Force one video back through analysis
    Reanalyze { id: i64 },
    /// Delete rows whose files no longer exist on disk
    DeleteMissing,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum Service {
    Sonarr,
    Radarr,
}

impl From<Service> for ServiceType {
    fn from(service: Service) -> Self {
        match service {
            Service::Sonarr => ServiceType::Sonarr,
            Service::Radarr => ServiceType::Radarr,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    info!("reforge {}", env!("CARGO_PKG_VERSION"));
    info!(
        "  OS: {} ({}), CPUs: {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        num_cpus::get()
    );

    let config = Config::load(&args.config)?;
    let core = Core::new(config).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let handles = core.start();
            tokio::signal::ctrl_c().await?;
            info!("Interrupt received, stopping pipelines");
            core.shutdown();
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Pipeline task panicked: {}", e);
                }
            }
        }
        Command::Sync { service, file } => {
            let raw = std::fs::read_to_string(&file)?;
            let records: Vec<FileRecord> = serde_json::from_str(&raw)?;
            let count = core.ingest(service.into(), &records).await?;
            info!("Ingested {} records from {:?}", count, file);
        }
        Command::AddLibrary { path } => {
            let library = core.store.insert_library(&path).await?;
            info!("Library {} registered at {}", library.id, library.path);
        }
        Command::ResetFailed => {
            let count = core.store.reset_all_failed().await?;
            info!("Reset {} failed videos", count);
        }
        Command::ResetInvalidAudio => {
            let count = core.store.reset_invalid_audio().await?;
            info!("Reset {} videos", count);
        }
        Command::ResetInvalidAudioMetadata => {
            let count = core.store.reset_invalid_audio_metadata().await?;
            info!("Reset {} videos", count);
        }
        Command::Reanalyze { id } => {
            core.store.reset_for_reanalysis(id).await?;
            info!("Video {} queued for reanalysis", id);
        }
        Command::DeleteMissing => {
            let count = core.store.delete_missing_paths().await?;
            info!("Deleted {} videos with missing files", count);
        }
    }

    Ok(())
}
