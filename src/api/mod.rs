//! HTTP API for health checks, tracker inspection and transaction intake

use crate::chain::bitcoin::{encode_tx, prepare_tracker_lock};
use crate::chain::{BtcChainDriver, EthChainDriver};
use crate::config::ApiConfig;
use crate::coordination::{BlockSummary, Coordinator, EngineInfo};
use crate::error::{BridgeError, BridgeResult};
use crate::jobs::Job;
use crate::metrics;
use crate::state::{StateManager, StoreStats};
use crate::tracker::{BtcTracker, EthTracker};
use crate::tx::{BroadcastReply, InternalBroadcastRequest, TxPool};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ::bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub state_manager: Arc<StateManager>,
    pub coordinator: Arc<Coordinator>,
    pub pool: Arc<TxPool>,
    pub btc: Option<Arc<dyn BtcChainDriver>>,
    pub eth: Option<Arc<dyn EthChainDriver>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/engines", get(get_engines))
        .route("/trackers/btc", get(list_btc_trackers))
        .route("/trackers/btc/:name", get(get_btc_tracker))
        .route("/trackers/eth", get(list_eth_trackers))
        .route("/trackers/eth/:name", get(get_eth_tracker))
        .route("/jobs", get(list_jobs))
        .route("/tx", post(submit_tx))
        .route("/btc/prepare_lock", post(prepare_btc_lock))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> BridgeResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Internal(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| BridgeError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

/// Maps store errors onto HTTP statuses
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every configured chain driver answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut chains = Vec::new();
    if let Some(btc) = &state.btc {
        chains.push(ChainHealth {
            chain: "bitcoin",
            healthy: btc.health_check().await,
        });
    }
    if let Some(eth) = &state.eth {
        chains.push(ChainHealth {
            chain: "ethereum",
            healthy: eth.health_check().await,
        });
    }
    for c in &chains {
        metrics::record_chain_health(c.chain, c.healthy);
    }

    let ready = chains.iter().all(|c| c.healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, chains }))
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let env = state.coordinator.env();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        height: state.coordinator.height(),
        node_address: env.node_address.to_string(),
        is_validator: env.is_validator(),
        validators: env.validators.len(),
        pool_size: state.pool.len(),
        last_block: state.coordinator.last_block(),
    })
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<StoreStats> {
    Ok(Json(state.state_manager.get_stats()?))
}

async fn get_engines(State(state): State<AppState>) -> Json<Vec<EngineInfo>> {
    Json(state.coordinator.engines())
}

async fn list_btc_trackers(State(state): State<AppState>) -> ApiResult<Vec<BtcTracker>> {
    Ok(Json(state.state_manager.btc_trackers.list()?))
}

async fn get_btc_tracker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<BtcTracker> {
    Ok(Json(state.state_manager.btc_trackers.get(&name)?))
}

async fn list_eth_trackers(State(state): State<AppState>) -> ApiResult<Vec<EthTracker>> {
    Ok(Json(state.state_manager.eth_trackers.list()?))
}

async fn get_eth_tracker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<EthTracker> {
    Ok(Json(state.state_manager.eth_trackers.get(&name)?))
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<Vec<Job>> {
    Ok(Json(state.state_manager.jobs.list()?))
}

/// Queue a transaction for the next block
async fn submit_tx(
    State(state): State<AppState>,
    Json(request): Json<InternalBroadcastRequest>,
) -> impl IntoResponse {
    let reply = state.pool.submit(request.raw_tx);
    let status = if reply.ok {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json::<BroadcastReply>(reply))
}

/// Build the unsigned transaction a user signs to lock BTC into the next
/// free tracker
async fn prepare_btc_lock(
    State(state): State<AppState>,
    Json(request): Json<PrepareLockRequest>,
) -> ApiResult<PrepareLockResponse> {
    let txid: Txid = request
        .txid
        .parse()
        .map_err(|e| BridgeError::Validation(format!("invalid txid {}: {}", request.txid, e)))?;

    let tracker = state.state_manager.btc_trackers.tracker_for_lock()?;
    let script = state
        .state_manager
        .lock_scripts
        .get_lock_script(&tracker.process_lock_script_address)?;
    let tx = prepare_tracker_lock(
        &tracker,
        &script,
        OutPoint {
            txid,
            vout: request.vout,
        },
        request.input_amount,
        request.fee,
    )?;

    Ok(Json(PrepareLockResponse {
        tracker_name: tracker.name,
        txn: hex::encode(encode_tx(&tx)),
    }))
}

// Request and response types

#[derive(Deserialize)]
struct PrepareLockRequest {
    txid: String,
    vout: u32,
    input_amount: u64,
    fee: u64,
}

#[derive(Serialize)]
struct PrepareLockResponse {
    tracker_name: String,
    txn: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: &'static str,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    height: u64,
    node_address: String,
    is_validator: bool,
    validators: usize,
    pool_size: usize,
    last_block: Option<BlockSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::coordination::BridgeEnv;
    use crate::keys::{Address, ValidatorSet};
    use crate::tracker::Quorum;
    use crate::tx::{EthLock, RawTx, TxType};
    use ethers::types::U256;

    fn app_state() -> AppState {
        let state_manager = Arc::new(StateManager::in_memory());
        let env = BridgeEnv {
            node_address: Address::new(vec![1]),
            validators: ValidatorSet::new(vec![Address::new(vec![1])]),
            quorum: Quorum::TwoThirds,
            jobs: JobsConfig::default(),
        };
        AppState {
            coordinator: Arc::new(Coordinator::new(state_manager.clone(), env).unwrap()),
            state_manager,
            pool: Arc::new(TxPool::new(16)),
            btc: None,
            eth: None,
        }
    }

    #[tokio::test]
    async fn test_submitted_tx_reaches_a_tracker() {
        let state = app_state();
        let lock = EthLock {
            locker: Address::new(vec![9]),
            eth_tx: vec![0xf8, 0x01],
            lock_amount: U256::from(7u64),
        };
        let raw_tx = RawTx::new(TxType::EthLock, &lock, "").unwrap();

        let response = submit_tx(
            State(state.clone()),
            Json(InternalBroadcastRequest::new(raw_tx)),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.pool.len(), 1);

        state
            .coordinator
            .process_block(1, &state.pool.drain())
            .unwrap();

        let Json(trackers) = list_eth_trackers(State(state.clone())).await.ok().unwrap();
        assert_eq!(trackers.len(), 1);
        let Json(tracker) = get_eth_tracker(State(state.clone()), Path(trackers[0].name.clone()))
            .await
            .ok()
            .unwrap();
        assert_eq!(tracker.lock_amount, U256::from(7u64));

        let Json(jobs) = list_jobs(State(state)).await.ok().unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tracker_is_not_found() {
        let state = app_state();
        let response = get_btc_tracker(State(state), Path("tracker_9".to_string()))
            .await
            .err()
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_prepare_lock_targets_a_free_tracker() {
        let state = app_state();
        let request = || PrepareLockRequest {
            txid: "11".repeat(32),
            vout: 1,
            input_amount: 10_000,
            fee: 500,
        };

        let response = prepare_btc_lock(State(state.clone()), Json(request()))
            .await
            .err()
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        state
            .state_manager
            .seed_btc_trackers(&["tracker_1".to_string()], &[0x51, 0xae])
            .unwrap();
        let Json(prepared) = prepare_btc_lock(State(state.clone()), Json(request()))
            .await
            .ok()
            .unwrap();
        assert_eq!(prepared.tracker_name, "tracker_1");
        assert!(!prepared.txn.is_empty());

        let bad_fee = PrepareLockRequest {
            fee: 20_000,
            ..request()
        };
        let response = prepare_btc_lock(State(state), Json(bad_fee))
            .await
            .err()
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_tx_is_rejected() {
        let state = app_state();
        let raw_tx = RawTx {
            tx_type: TxType::BtcLock,
            data: b"not json".to_vec(),
            memo: String::new(),
            auth: Vec::new(),
        };
        let response = submit_tx(State(state.clone()), Json(InternalBroadcastRequest::new(raw_tx)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.pool.is_empty());
    }
}
