use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Args, Parser, Subcommand};
use dicom_slicer::{
    association::StorageEvent,
    config::{Config, PeerConfig, ScpConfig},
    enums::Orientation,
    progress::LoadProgress,
    scu::{self, StudyQuery},
    storage_server::StorageServer,
    volume_loader::VolumeLoader,
};
use futures::{StreamExt, channel::mpsc};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(
    name = "dicom-slicer",
    version = env!("CARGO_PKG_VERSION"),
    about = "Loads DICOM series into resliceable volumes and runs a DICOM storage service"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the metadata of a file or directory
    Info { path: PathBuf },

    /// Render one slice of a volume to an 8-bit image
    Export(ExportArgs),

    /// Run the C-STORE / C-ECHO service
    StoreScp(ScpArgs),

    /// Send a C-ECHO
    Echo(PeerArgs),

    /// Send files with C-STORE
    Send {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        peer: PeerArgs,
    },

    /// Query studies with a study-root C-FIND
    Find {
        #[arg(long)]
        patient_id: Option<String>,

        #[arg(long)]
        patient_name: Option<String>,

        #[arg(long)]
        study_uid: Option<String>,

        #[command(flatten)]
        peer: PeerArgs,
    },

    /// Ask a peer to C-MOVE a study to another AE
    Move {
        study_uid: String,

        /// Destination AE title
        #[arg(long)]
        destination: String,

        #[command(flatten)]
        peer: PeerArgs,
    },
}

#[derive(Args)]
struct ExportArgs {
    path: PathBuf,

    #[arg(long, default_value = "axial")]
    orientation: Orientation,

    /// Slice index in the chosen orientation, the middle slice by default
    #[arg(long)]
    index: Option<usize>,

    #[arg(long, default_value = "slice.png")]
    out: PathBuf,

    /// Defaults to the average window of the view
    #[arg(long, allow_hyphen_values = true)]
    window_width: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    window_level: Option<f64>,
}

#[derive(Args)]
struct ScpArgs {
    #[arg(long)]
    ae_title: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    storage_root: Option<PathBuf>,

    #[arg(long)]
    max_pdu_length: Option<u32>,

    /// Reject PDUs above the maximum length
    #[arg(long)]
    strict: bool,
}

impl ScpArgs {
    fn apply(self, mut scp: ScpConfig) -> ScpConfig {
        scp.ae_title = self.ae_title.unwrap_or(scp.ae_title);
        scp.port = self.port.unwrap_or(scp.port);
        scp.storage_root = self.storage_root.unwrap_or(scp.storage_root);
        scp.max_pdu_length = self.max_pdu_length.unwrap_or(scp.max_pdu_length);
        scp.strict |= self.strict;
        scp
    }
}

#[derive(Args)]
struct PeerArgs {
    #[arg(long)]
    host: Option<String>,

    #[arg(long = "peer-port")]
    port: Option<u16>,

    /// Called AE title
    #[arg(long)]
    called_ae: Option<String>,

    /// Calling AE title
    #[arg(long)]
    calling_ae: Option<String>,
}

impl PeerArgs {
    fn apply(self, mut peer: PeerConfig) -> PeerConfig {
        peer.host = self.host.unwrap_or(peer.host);
        peer.port = self.port.unwrap_or(peer.port);
        peer.ae_title = self.called_ae.unwrap_or(peer.ae_title);
        peer.calling_ae_title = self.calling_ae.unwrap_or(peer.calling_ae_title);
        peer
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Info { path } => tokio::task::spawn_blocking(move || info(path)).await?,
        Commands::Export(args) => tokio::task::spawn_blocking(move || export(args)).await?,
        Commands::StoreScp(args) => store_scp(args.apply(config.scp)).await,
        Commands::Echo(peer) => {
            let peer = peer.apply(config.peer);
            let status = tokio::task::spawn_blocking(move || scu::echo(&peer)).await??;
            println!("C-ECHO status: 0x{status:04X}");
            Ok(())
        }
        Commands::Send { files, peer } => {
            let peer = peer.apply(config.peer);
            tokio::task::spawn_blocking(move || -> CliResult {
                for file in files {
                    let status = scu::store_file(&peer, &file)?;
                    println!("{}: status 0x{status:04X}", file.display());
                }
                Ok(())
            })
            .await?
        }
        Commands::Find {
            patient_id,
            patient_name,
            study_uid,
            peer,
        } => {
            let peer = peer.apply(config.peer);
            let query = StudyQuery {
                patient_id,
                patient_name,
                study_instance_uid: study_uid,
            };
            let status = tokio::task::spawn_blocking(move || {
                scu::find_studies(&peer, &query, |study| println!("{study}\n"))
            })
            .await??;
            println!("C-FIND status: 0x{status:04X}");
            Ok(())
        }
        Commands::Move {
            study_uid,
            destination,
            peer,
        } => {
            let peer = peer.apply(config.peer);
            let outcome = tokio::task::spawn_blocking(move || {
                scu::move_study(&peer, &study_uid, &destination)
            })
            .await??;
            println!(
                "C-MOVE status: 0x{:04X} ({} completed, {} failed, {} warnings)",
                outcome.status, outcome.completed, outcome.failed, outcome.warning
            );
            Ok(())
        }
    }
}

fn log_progress(progress: LoadProgress) {
    debug!("{} ({}%)", progress.label(), progress.percent());
}

fn info(path: PathBuf) -> CliResult {
    let collection = VolumeLoader::load_location(&path, &log_progress)?;
    if let Some(tags) = collection.tag_record() {
        println!("{tags}");
        println!("{}", tags.image_details);
    }
    let (window_width, window_level) = collection.calculate_average_window_values();
    println!("Slices: {}", collection.raw().len());
    println!("Orientation: {}", collection.orientation());
    println!("Window: {window_width}/{window_level}");
    for structure_set in collection.structure_sets() {
        println!(
            "Structure set {} ({} ROIs) on frame of reference {}",
            structure_set.source_path.display(),
            structure_set.rois.len(),
            structure_set.frame_of_reference_uid
        );
    }
    Ok(())
}

fn export(args: ExportArgs) -> CliResult {
    let mut collection = VolumeLoader::load_location(&args.path, &log_progress)?;
    collection.change_orientation(args.orientation)?;

    let index = args.index.unwrap_or(collection.len() / 2);
    let slice = collection
        .slice(index)
        .ok_or_else(|| format!("slice {index} out of range (0..{})", collection.len()))?;
    let (average_width, average_level) = collection.calculate_average_window_values();
    let image = slice
        .to_windowed_image(
            args.window_width.unwrap_or(average_width),
            args.window_level.unwrap_or(average_level),
        )
        .ok_or("slice buffer does not match its dimensions")?;
    image.save(&args.out)?;
    info!(
        "Wrote {} slice {index} ({}x{}) to {}",
        args.orientation,
        slice.width,
        slice.height,
        args.out.display()
    );
    Ok(())
}

async fn store_scp(scp: ScpConfig) -> CliResult {
    let (sender, mut events) = mpsc::unbounded::<StorageEvent>();
    let server = StorageServer::bind(scp, Arc::new(sender)).await?;

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                StorageEvent::Stored(object) => debug!("Stored {}", object.path.display()),
                StorageEvent::Released(summary) => info!(
                    "{} sent {} objects, study list is stale",
                    summary.calling_ae_title, summary.objects_received
                ),
                StorageEvent::Aborted(summary) => {
                    info!("Association with {} aborted", summary.calling_ae_title)
                }
            }
        }
    });

    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
