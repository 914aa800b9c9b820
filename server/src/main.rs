use clap::{Parser, Subcommand};
use log::{error, info, warn};
use server::config::ServerConfig;
use server::error::ServerError;
use server::jobs;
use server::server::{Exit, Server};
use server::store::Collaborators;
use std::io;
use std::path::PathBuf;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about, args_override_self = true)]
struct Args {
    /// Address to listen on
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Port to listen on
    #[clap(short, long)]
    port: Option<u16>,
    /// TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Directory holding the world, players and runtime state
    #[clap(long)]
    data_dir: Option<PathBuf>,
    /// Milliseconds per tick
    #[clap(long)]
    tick_ms: Option<u64>,
    /// Resume sessions handed over by a previous image of this program
    #[clap(short, long)]
    reboot: bool,
    #[clap(subcommand)]
    worker: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs one helper job and exits
    #[clap(hide = true)]
    Worker {
        #[clap(subcommand)]
        job: Job,
    },
}

#[derive(Subcommand, Debug)]
enum Job {
    /// Reverse-resolves an address
    Resolve { address: String },
    /// Lists stored records by name prefix
    List {
        dir: PathBuf,
        #[clap(default_value = "")]
        prefix: String,
    },
    /// Checks every stored record decodes
    Audit { data_dir: PathBuf },
}

fn run_job(job: Job) -> Result<(), ServerError> {
    let mut out = io::stdout().lock();
    match job {
        Job::Resolve { address } => jobs::resolve(&address, &mut out),
        Job::List { dir, prefix } => jobs::list(&dir, &prefix, &mut out),
        Job::Audit { data_dir } => jobs::audit(&data_dir, &mut out),
    }
}

fn build_config(args: &Args) -> Result<ServerConfig, ServerError> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_length_ms = tick_ms;
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let mut args = Args::parse();

    if let Some(Command::Worker { job }) = args.worker.take() {
        return Ok(run_job(job)?);
    }

    let config = build_config(&args)?;
    let collaborators = Collaborators::file_backed(&config.data_dir, config.start_room.clone());

    let mut server = if args.reboot && config.reboot_file().exists() {
        info!("Resuming from {}", config.reboot_file().display());
        Server::resume(config, collaborators)?
    } else {
        if args.reboot {
            warn!("Restart requested but no reboot record found, starting fresh");
        }
        let address = config.address();
        let server = match Server::bind(config, collaborators) {
            Ok(server) => server,
            Err(e @ ServerError::Bind { .. }) => {
                error!("{}", e);
                std::process::abort();
            }
            Err(e) => return Err(e.into()),
        };
        info!("Listening on {}", address);
        server
    };

    match server.run().await? {
        Exit::Shutdown => {
            info!("Shutdown complete");
            Ok(())
        }
        Exit::Reboot(handoff) => Err(handoff.exec().into()),
    }
}
