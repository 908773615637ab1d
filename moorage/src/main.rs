use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{bail, Result};
use clap::Parser;
use moorage_core::{agent::registry, config::Config, AgentLauncher};
use moorage_services::Mooring;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let mooring = Arc::new(Mooring::prepare(&config)?);
    info!(
        ports = mooring.port_count(),
        workers = config.runtime.worker_threads,
        "configuration loaded from {}",
        args.config.display()
    );

    let launcher = AgentLauncher::new(config.runtime.clone(), config.agent.clone());
    let setup = mooring.clone();
    let handles = launcher.launch(move |agent| setup.anchor(agent))?;
    info!("{} agents started", handles.len());

    // first interrupt drains, the second drops everything
    let interrupts = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if interrupts.fetch_add(1, Ordering::SeqCst) == 0 {
            let reached = registry::shutdown_all();
            info!(agents = reached, "interrupted, shutting down");
        } else {
            let reached = registry::abort_all();
            warn!(agents = reached, "interrupted again, aborting");
        }
    })?;

    let mut failed = 0;
    for handle in handles {
        if handle.join().is_err() {
            failed += 1;
        }
    }
    if failed > 0 {
        error!("{failed} agents panicked");
        bail!("{failed} agents panicked");
    }
    info!("all agents stopped");
    Ok(())
}
