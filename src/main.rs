use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use config::{AgentConfig, ConfigError};
use health::{HealthProber, HttpProbe};
use intake::{DeploymentQueue, Intake};
use proxy::{ProxyError, ProxyManager};
use reconciler::{Reconciler, ReconcilerSettings};
use runtime::{ContainerRuntime, RuntimeError, docker::DockerRuntime};
use store::{StateStore, StoreError};
use tokio::net::TcpListener;
use tokio::sync::Notify;

mod api;
mod cli;
mod config;
mod health;
mod image;
mod intake;
mod login;
mod model;
mod proxy;
mod reconciler;
mod runtime;
mod signals;
mod store;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("State store error: {0}")]
    Store(#[from] StoreError),
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();
    if let Some(cli::Command::Signal { signal }) = args.command {
        return signals::send_signal(signal);
    }

    let config = match AgentConfig::try_init() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Unable to load {}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    if args.test {
        println!(
            "Config {} is valid ({} service(s))",
            args.config.display(),
            config.services.len()
        );
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Unable to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    };
    signals::remove_pid_file();
    code
}

async fn run(config: AgentConfig) -> Result<(), AgentError> {
    signals::write_pid_file()?;

    let catalog = config.catalog()?;
    let store = Arc::new(StateStore::open(&config.agent.state_dir)?);
    let docker: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(&config).await?);
    let proxy = Arc::new(ProxyManager::open(
        config.proxy.clone(),
        &config.agent.state_dir,
        Duration::from_secs(config.timeouts.proxy_command),
    )?);
    let probe = HttpProbe::new(Duration::from_secs(config.timeouts.probe_request))?;
    let queue = Arc::new(DeploymentQueue::new(config.agent.queue_capacity));
    let intake = Arc::new(Intake::new(queue.clone(), docker.clone(), catalog));

    let reconciler = Reconciler::new(
        store.clone(),
        docker,
        proxy,
        HealthProber::new(Arc::new(probe)),
        queue.clone(),
        ReconcilerSettings::from_config(&config),
    );
    reconciler.recover().await?;

    signals::handle_signals(queue.clone(), intake.clone())?;

    let listener = TcpListener::bind(config.agent.listen).await?;
    let state = api::ApiState {
        intake,
        queue,
        store,
        token: config.agent.token.as_deref().map(Arc::from),
    };
    let shutdown = Arc::new(Notify::new());
    let api = tokio::spawn(api::serve(listener, state, {
        let shutdown = shutdown.clone();
        async move { shutdown.notified().await }
    }));

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    let result = reconciler.run().await;

    shutdown.notify_one();
    match api.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("API server failed: {err}"),
        Err(err) => log::error!("API server task failed: {err}"),
    }

    result?;
    log::info!("Stopped");
    Ok(())
}
