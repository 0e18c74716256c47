//! Pool Coordinator - Main Application
//!
//! Runs either the master or a block handler, depending on `--role`.

use pool_coordinator::{
    blk_handler::BlkHandler,
    client::PoolClient,
    config::{Config, Role},
    content::ContentStore,
    longpoll::LongPollStore,
    master::Master,
    rpc::{ChainRpc, JsonRpcClient},
    utils::init_logging,
    Error, Result, APP_NAME, APP_VERSION,
};

use axum::Router;
use futures::future::try_join3;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let _log_guard = init_logging(
        &config.log_level,
        config.log_format,
        config.log_file.as_deref(),
    )?;

    info!("Starting {} v{} as {}", APP_NAME, APP_VERSION, config.role);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Listening for ctrl-c failed: {}", e),
        }
        shutdown.cancel();
    });

    let result = match config.role {
        Role::Master => run_master(&config, cancel.clone()).await,
        Role::BlkHandler => run_blk_handler(&config, cancel.clone()).await,
    };
    cancel.cancel();

    if let Err(e) = &result {
        error!("{} stopped: {}", config.role, e);
    }
    result
}

fn chain_rpc(config: &Config) -> Result<Arc<dyn ChainRpc>> {
    let url = config
        .rpc_url
        .clone()
        .ok_or_else(|| Error::config("rpc_url is not set"))?;
    let rpc = JsonRpcClient::new(url, config.rpc_user.clone(), config.rpc_password.clone())?;
    Ok(Arc::new(rpc))
}

/// Follow the chain tip, persist work and serve it
async fn run_master(config: &Config, cancel: CancellationToken) -> Result<()> {
    let store = LongPollStore::open(&config.workdir).await?;
    let watcher = store.spawn_watcher(cancel.clone());

    let master = Arc::new(Master::new(
        chain_rpc(config)?,
        store,
        config.master_options()?,
    ));
    let follower: JoinHandle<Result<()>> = tokio::spawn(master.clone().run(cancel.clone()));
    let server = serve(config, master.router(), cancel.clone());

    try_join3(server, join(follower, &cancel), join(watcher, &cancel)).await?;
    Ok(())
}

/// Track the master and redeem block shares for one shard
async fn run_blk_handler(config: &Config, cancel: CancellationToken) -> Result<()> {
    let client = PoolClient::new(config.client_options()?)?;
    let client_task = client.start(cancel.clone());

    let opts = config.blk_handler_options();
    info!("Serving shard {} of {}", opts.hash_num, opts.hash_mod);
    let handler = Arc::new(BlkHandler::new(
        client,
        chain_rpc(config)?,
        ContentStore::new(&config.content_dir),
        opts,
    )?);

    let served = serve(config, handler.router(), cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = client_task.await {
        warn!("Pool client task ended abnormally: {}", e);
    }
    served
}

async fn serve(config: &Config, router: Router, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.bind).await?;
    info!("Listening on {}", listener.local_addr()?);

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;
    result.map_err(Error::from)
}

/// Wait for a background task; its end brings the whole service down
async fn join(handle: JoinHandle<Result<()>>, cancel: &CancellationToken) -> Result<()> {
    let result = handle
        .await
        .map_err(|e| Error::fatal(format!("task failed: {}", e)));
    cancel.cancel();
    result?
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(&config.redacted())?;
    println!("{}", config_yaml);
    Ok(())
}
