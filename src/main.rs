//! Molecular simulation worker.
//!
//! Serves a host application over two channels: a request/reply control
//! channel and a broadcast channel that streams positions of running
//! simulations.
//!
//! ## Module Organization
//!
//! - `payload`: binary record codec
//! - `topology`: atoms, bonds, passivation, fragments and the wire↔engine map
//! - `virtual_objects`: anchors, springs, motors and emitters parsed from JSON
//! - `motor`: motor kinematics and velocity output
//! - `emitter`: timed injection of parked molecules
//! - `engine`: physics engine contract and the reference backend
//! - `simulation`: registry, startup, step loop and reporter
//! - `transport`: control and broadcast channels
//! - `structure`: structure file import and export
//! - `dispatcher`: command routing and error replies
//! - `config`: TOML configuration

mod config;
mod dispatcher;
mod emitter;
mod engine;
mod motor;
mod payload;
mod simulation;
mod structure;
mod topology;
mod transport;
mod virtual_objects;

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use env_logger::{Builder, Target};
use log::LevelFilter;

use crate::config::WorkerConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::ElementForceField;
use crate::simulation::{Collaborators, Orchestrator, SimulationRegistry};
use crate::structure::PdbStructureIo;
use crate::topology::FormalChargeModel;
use crate::transport::{TcpControlChannel, TcpPublisher};

const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(version, about = "Molecular simulation worker")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control channel address; the broadcast channel uses the next port
    #[arg(long)]
    ipc_socket: Option<SocketAddr>,

    /// Exit when this process is gone
    #[arg(long)]
    parent_pid: Option<u32>,

    /// Debug logging for the worker
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let mut builder = Builder::new();
    builder
        .filter_level(LevelFilter::Info)
        .filter(Some("molsim_worker"), if verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        });
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }
    builder.try_init().context("Failed to initialise logging")
}

fn watch_parent(pid: u32) -> std::io::Result<()> {
    let proc_entry = PathBuf::from(format!("/proc/{pid}"));
    std::thread::Builder::new().name("parent-watchdog".to_string()).spawn(move || {
        loop {
            std::thread::sleep(PARENT_POLL_INTERVAL);
            if !proc_entry.exists() {
                log::warn!("Parent process {pid} is gone, exiting");
                std::process::exit(0);
            }
        }
    })?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(address) = args.ipc_socket {
        config.control_address = address;
    }

    init_logging(args.verbose, config.log_file.as_ref())?;
    log::info!("Starting up");

    if let Some(pid) = args.parent_pid {
        if cfg!(unix) {
            watch_parent(pid).context("Failed to start parent watchdog")?;
        } else {
            log::warn!("Parent process watchdog is only available on Unix");
        }
    }

    let collaborators = Collaborators {
        charges: Arc::new(FormalChargeModel),
        force_field: Arc::new(ElementForceField::new(&config.forcefield_dir, &config.forcefield_extension_dir)),
        backends: engine::backends_from_names(&config.backends, config.emitter_seed),
        lock_stiffness: config.lock_stiffness,
        relax_max_iterations: config.relax_max_iterations,
        emitter_seed: config.emitter_seed,
    };
    if collaborators.backends.is_empty() {
        anyhow::bail!("No known backend in {:?}", config.backends);
    }

    let publisher = TcpPublisher::bind(config.publish_address()).context("Failed to bind publish socket")?;
    let channel = TcpControlChannel::bind(config.control_address).context("Failed to bind control socket")?;
    log::info!(
        "Listening for requests on {} and publishing on {}",
        channel.local_addr()?,
        publisher.local_addr()
    );

    let orchestrator = Orchestrator::new(Arc::new(SimulationRegistry::new()), Arc::new(publisher), collaborators, config.max_workers)
        .context("Failed to build simulation worker pool")?;
    let mut dispatcher = Dispatcher::new(channel, orchestrator, Arc::new(PdbStructureIo));
    dispatcher.serve()?;
    Ok(())
}
