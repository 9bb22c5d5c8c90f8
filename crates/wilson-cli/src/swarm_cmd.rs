//! Swarm subcommands: the commander plus the worker/validator roles the
//! commander re-invokes as child processes.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use wilson_core::swarm::{SwarmOrchestrator, SwarmStore, Validator, Worker};
use wilson_core::tools::NonInteractive;
use wilson_core::{HttpBackend, WilsonConfig};

use crate::chat::build_services;

pub(crate) async fn run(
    goal: String,
    workers: Option<usize>,
    dir: Option<PathBuf>,
    swarm_dir: Option<String>,
) -> Result<()> {
    let working_dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config = WilsonConfig::load(&working_dir)?;

    let mut swarm_config = config.swarm_config();
    if let Some(workers) = workers {
        swarm_config.workers = workers;
    }
    if let Some(name) = swarm_dir {
        swarm_config.dir_name = name;
    }

    let backend = Arc::new(HttpBackend::new(
        &config.backend_url,
        &config.model,
        config.api_key(),
    ));

    let orchestrator = SwarmOrchestrator::new(working_dir, swarm_config, backend);
    let state = orchestrator.run(&goal).await?;

    println!(
        "swarm {:?}: {} completed, {} failed ({}%)",
        state.status,
        state.completed_tasks.len(),
        state.failed_tasks.len(),
        state.progress
    );
    Ok(())
}

pub(crate) async fn worker(id: String, dir: PathBuf, swarm_dir: String) -> Result<()> {
    let config = WilsonConfig::load(&dir)?;
    let store = SwarmStore::new(dir.join(&swarm_dir));

    // Nobody is at the keyboard in a worker process.
    let services = build_services(&config, Arc::new(NonInteractive::approve_all())).await?;
    let loop_config = config.loop_config(dir);

    let worker = Worker::new(id, store, services.clone(), loop_config);
    let result = worker.run().await;
    services.process_registry.kill_all().await;
    result
}

pub(crate) async fn validator(dir: PathBuf, swarm_dir: String) -> Result<()> {
    let store = SwarmStore::new(dir.join(&swarm_dir));
    Validator::new(store, dir).run().await
}
