use cardlane_pcsc::{ConnectStrategy, PcscDeviceManager};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

mod commands;

use commands::{list_command, transmit_command, watch_command};

#[derive(Parser)]
#[command(version, about = "Watch PC/SC readers and exchange APDUs with cards")]
struct Cli {
    /// Debug level output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    List,

    /// Report card insertions and removals until Enter is pressed
    Watch {
        /// Reader to watch (first reader if not specified)
        #[arg(short, long)]
        reader: Option<String>,

        /// Select this application on every inserted card; may be repeated
        #[arg(long)]
        aid: Vec<String>,

        /// Only report cards on which an application was selected
        #[arg(long, requires = "aid")]
        matched_only: bool,

        /// Stop after the first card
        #[arg(long)]
        single_shot: bool,
    },

    /// Send APDUs to the card in one request
    Transmit {
        /// Reader holding the card (first reader with a card if not specified)
        #[arg(short, long)]
        reader: Option<String>,

        /// Select this application before sending the APDUs
        #[arg(long)]
        aid: Option<String>,

        /// Stop at the first status word other than 9000
        #[arg(long)]
        strict: bool,

        /// APDUs as hex strings
        #[arg(required = true)]
        apdus: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let manager = PcscDeviceManager::new()?;

    match cli.command {
        Commands::List => list_command(&manager)?,
        Commands::Watch {
            reader,
            aid,
            matched_only,
            single_shot,
        } => {
            let strategy = reader.map_or(ConnectStrategy::FirstAvailable, ConnectStrategy::Reader);
            let name = manager.find_reader(&strategy)?;
            info!("Using reader: {name}");
            watch_command(&manager, &name, &aid, matched_only, single_shot)?;
        }
        Commands::Transmit {
            reader,
            aid,
            strict,
            apdus,
        } => {
            let strategy = reader.map_or(ConnectStrategy::AnyCard, ConnectStrategy::Reader);
            let name = manager.find_reader(&strategy)?;
            info!("Using reader: {name}");
            transmit_command(&manager, &name, aid.as_deref(), strict, &apdus)?;
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // RUST_LOG directives win over the default level
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();
}
