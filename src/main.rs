use std::process::ExitCode;
use std::sync::Arc;

use config::{ConfigError, OrchestroConfig, ProjectRegistry};
use pipeline::{Pipeline, source::GitSource};
use runtime::{ContainerRuntime, RuntimeError, docker::DockerRuntime};
use server::AppState;
use store::{DeploymentStore, InMemoryDeploymentStore};

mod cli;
mod config;
mod deployment;
mod hub;
mod pipeline;
mod project;
mod runtime;
mod server;
mod signals;
mod store;
mod vars;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("Unable to load config: {0}")]
    Config(#[from] ConfigError),
    #[error("Unable to reach the container daemon: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

async fn run(config: OrchestroConfig) -> Result<(), StartupError> {
    let args = cli::get_cli_args();

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let store: Arc<dyn DeploymentStore> = Arc::new(InMemoryDeploymentStore::new());
    let hub = hub::spawn();
    let registry = ProjectRegistry::new(config.projects.clone());

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&runtime),
        Arc::new(GitSource),
        Arc::clone(&store),
        hub.clone(),
        config.pipeline_settings(),
    ));

    signals::handle_reload(
        args.config.clone(),
        registry.clone(),
        tokio::runtime::Handle::current(),
    )?;
    let shutdown = signals::handle_shutdown()?;

    let state = AppState {
        pipeline,
        runtime,
        store,
        hub,
        registry,
    };
    let listen = args.listen.unwrap_or(config.listen);
    server::serve(listen, state, shutdown).await?;

    log::info!("Stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();
    log::info!("Loading config from {:?}", args.config);

    let result = match OrchestroConfig::load(&args.config).await {
        Ok(config) => {
            log::info!("{} projects configured", config.projects.len());
            run(config).await
        }
        Err(err) => Err(err.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
