//! Bridge Orchestrator node
//!
//! Runs the job scheduler against the configured chains and, in standalone
//! mode, a local block timer that feeds queued transactions to the
//! coordinator.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use bridge_orchestrator::api::{self, AppState};
use bridge_orchestrator::chain::{BitcoinRpcDriver, BtcChainDriver, EthChainDriver, EthereumChainDriver};
use bridge_orchestrator::config::Settings;
use bridge_orchestrator::coordination::{BridgeEnv, Coordinator};
use bridge_orchestrator::jobs::{JobScheduler, JobsContext};
use bridge_orchestrator::metrics::{self, MetricsServer};
use bridge_orchestrator::state::StateManager;
use bridge_orchestrator::tx::{HttpBroadcaster, InternalBroadcaster, LoopbackBroadcaster, TxPool};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Bridge Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let validators = settings.validator_set()?;
    let node_key = settings.node_key()?;
    let node_address = settings.node_address()?;
    info!(
        "Loaded configuration: {} validators, quorum {:?}",
        validators.len(),
        settings.finality.quorum
    );

    // Open state
    let state_manager = Arc::new(match &settings.node.data_dir {
        Some(dir) => StateManager::open(dir)?,
        None => {
            warn!("No data_dir configured - state is kept in memory");
            StateManager::in_memory()
        }
    });

    if let Some(script) = settings.bitcoin.redeem_script()? {
        state_manager.seed_btc_trackers(&settings.bitcoin.trackers, &script)?;
    }

    // Chain drivers
    let btc: Option<Arc<dyn BtcChainDriver>> = if settings.bitcoin.enabled {
        Some(Arc::new(BitcoinRpcDriver::new(&settings.bitcoin)?))
    } else {
        None
    };
    let eth: Option<Arc<dyn EthChainDriver>> = if settings.ethereum.enabled {
        Some(Arc::new(EthereumChainDriver::new(&settings.ethereum)?))
    } else {
        None
    };
    info!(
        "Chain drivers initialized (bitcoin: {}, ethereum: {})",
        btc.is_some(),
        eth.is_some()
    );

    let pool = Arc::new(TxPool::new(settings.node.pool_capacity));
    let broadcaster: Arc<dyn InternalBroadcaster> = match &settings.internal.broadcast_url {
        Some(url) => Arc::new(HttpBroadcaster::new(url)?),
        None => Arc::new(LoopbackBroadcaster::new(pool.clone())),
    };

    let env = BridgeEnv {
        node_address: node_address.clone(),
        validators,
        quorum: settings.finality.quorum,
        jobs: settings.jobs.clone(),
    };
    if !env.is_validator() {
        warn!("Node {} is not in the validator set - no jobs will run", node_address);
    }
    let coordinator = Arc::new(Coordinator::new(state_manager.clone(), env)?);

    let shutdown = Arc::new(RwLock::new(false));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            state_manager: state_manager.clone(),
            coordinator: coordinator.clone(),
            pool: pool.clone(),
            btc: btc.clone(),
            eth: eth.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start job scheduler; only validators hold a key to report with
    let scheduler_handle = node_key.map(|node_key| {
        let scheduler = JobScheduler::new(
            Arc::new(JobsContext {
                state: state_manager.clone(),
                btc: btc.clone(),
                eth: eth.clone(),
                broadcaster,
                node_key,
                config: settings.jobs.clone(),
            }),
            shutdown.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                error!("Job scheduler error: {}", e);
            }
        })
    });

    // Start block timer
    let block_handle = if settings.node.standalone {
        let coordinator = coordinator.clone();
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        let interval_ms = settings.node.block_interval_ms;
        Some(tokio::spawn(async move {
            if let Err(e) = coordinator.run(pool, interval_ms, shutdown).await {
                error!("Coordinator error: {}", e);
            }
        }))
    } else {
        info!("Standalone block timer disabled - blocks are driven by the host");
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let btc = btc.clone();
        let eth = eth.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;

                if let Some(btc) = &btc {
                    let healthy = btc.health_check().await;
                    if !healthy {
                        warn!("Bitcoin health check failed");
                    }
                    metrics::record_chain_health("bitcoin", healthy);
                }
                if let Some(eth) = &eth {
                    let healthy = eth.health_check().await;
                    if !healthy {
                        warn!("Ethereum health check failed");
                    }
                    metrics::record_chain_health("ethereum", healthy);
                }
            }
        }
    });

    info!("Bridge Orchestrator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    *shutdown.write().await = true;
    if let Err(e) = state_manager.flush() {
        error!("Failed to flush state: {}", e);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = scheduler_handle {
        h.abort();
    }
    if let Some(h) = block_handle {
        h.abort();
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Bridge Orchestrator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_orchestrator=debug,sled=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
