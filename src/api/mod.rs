//! HTTP API for health, node status, and the ledger query surface
//!
//! When the ledger runs in-process its transaction path (`POST /submit`) and
//! queries are served here, which is what `HttpLedgerClient` talks to on the
//! other nodes.

use crate::config::ApiConfig;
use crate::error::{NodeError, NodeResult};
use crate::ledger::{LedgerClient, LocalLedger};
use crate::messages::SignedMessage;
use crate::observer::ObservationQueue;
use crate::state::LocalStore;
use crate::types::{Chain, TxId, TxKey};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LocalStore>,
    pub queue: Arc<ObservationQueue>,
    /// Names of the scanners whose positions are reported
    pub scanners: Vec<String>,
    /// Present only when this process hosts the ledger
    pub ledger: Option<Arc<LocalLedger>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/height", get(get_height))
        .route("/vaults", get(get_vaults))
        .route("/txout/:height", get(get_tx_out))
        .route("/voters/:chain/:tx_id", get(get_voter))
        .route("/submit", post(submit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn run_server(
    config: ApiConfig,
    state: AppState,
    cancel: CancellationToken,
) -> NodeResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| NodeError::Config(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| NodeError::Internal(e.to_string()))?;
    Ok(())
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn ledger(state: &AppState) -> Result<&Arc<LocalLedger>, Response> {
    state
        .ledger
        .as_ref()
        .ok_or_else(|| error_response(StatusCode::SERVICE_UNAVAILABLE, "ledger is not hosted here"))
}

/// Health check endpoint - liveness plus store reachability
async fn health_check(State(state): State<AppState>) -> Response {
    let database = state.store.health_check().await.is_ok();
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if database { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database,
        }),
    )
        .into_response()
}

async fn get_status(State(state): State<AppState>) -> Response {
    let mut scanners = Vec::with_capacity(state.scanners.len());
    for name in &state.scanners {
        match state.store.get_scan_position(name).await {
            Ok(position) => scanners.push(ScannerStatus {
                name: name.clone(),
                position,
            }),
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
    let queue_depth = match state.queue.depth().await {
        Ok(depth) => depth,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let ledger_height = match &state.ledger {
        Some(ledger) => Some(ledger.status().await.height),
        None => None,
    };
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        scanners,
        queue_depth,
        ledger_height,
    })
    .into_response()
}

async fn get_height(State(state): State<AppState>) -> Response {
    match ledger(&state) {
        Ok(ledger) => Json(ledger.status().await).into_response(),
        Err(response) => response,
    }
}

async fn get_vaults(State(state): State<AppState>) -> Response {
    match ledger(&state) {
        Ok(ledger) => match ledger.vaults().await {
            Ok(vaults) => Json(vaults).into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(response) => response,
    }
}

async fn get_tx_out(State(state): State<AppState>, Path(height): Path<u64>) -> Response {
    match ledger(&state) {
        Ok(ledger) => match ledger.tx_out(height).await {
            Ok(block) => Json(block).into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(response) => response,
    }
}

async fn get_voter(
    State(state): State<AppState>,
    Path((chain, tx_id)): Path<(String, String)>,
) -> Response {
    let ledger = match ledger(&state) {
        Ok(ledger) => ledger,
        Err(response) => return response,
    };
    let key = match (Chain::new(&chain), TxId::new(&tx_id)) {
        (Ok(chain), Ok(tx_id)) => TxKey::new(chain, tx_id),
        (Err(e), _) | (_, Err(e)) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match ledger.voter(&key).await {
        Some(voter) => Json(voter).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no voter for {}", key)),
    }
}

/// Transaction path: 422 carries the rule violation, 400 an unreadable body
async fn submit(State(state): State<AppState>, body: Bytes) -> Response {
    let ledger = match ledger(&state) {
        Ok(ledger) => ledger,
        Err(response) => return response,
    };
    let signed: SignedMessage = match serde_json::from_slice(&body) {
        Ok(signed) => signed,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match ledger.deliver(&signed).await {
        Ok((response, outcome)) => {
            debug!("Applied message from {}: {:?}", signed.signer, outcome);
            Json(response).into_response()
        }
        Err(rejection) => {
            warn!("Rejected message from {}: {}", signed.signer, rejection);
            (StatusCode::UNPROCESSABLE_ENTITY, Json(rejection)).into_response()
        }
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: bool,
}

#[derive(Serialize)]
struct ScannerStatus {
    name: String,
    position: Option<u64>,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    scanners: Vec<ScannerStatus>,
    queue_depth: u64,
    ledger_height: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::tests::ledger_with;
    use crate::ledger::{ObservedTxVoter, TxOutBlock};
    use crate::messages::{LedgerMsg, SubmitResponse};
    use crate::observer::signer::tests::signer;
    use crate::observer::MessageSigner;
    use crate::state::memory_store;
    use crate::types::fixtures::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    async fn state(hosted: bool) -> AppState {
        let store = Arc::new(memory_store().await);
        store.advance_scan_position("ETH", 42).await.unwrap();
        let ledger = hosted.then(|| {
            let nodes = [signer(0).node_id()].into_iter().collect();
            Arc::new(LocalLedger::new(ledger_with(nodes, 0)))
        });
        AppState {
            queue: Arc::new(ObservationQueue::new(store.clone())),
            store,
            scanners: vec!["ETH".to_string()],
            ledger,
        }
    }

    async fn call(state: AppState, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn json<T: DeserializeOwned>(body: &Bytes) -> T {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (status, _) = call(state(false).await, get("/health")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(state(false).await, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = json(&body);
        assert_eq!(value["scanners"][0]["position"], 42);
        assert_eq!(value["queue_depth"], 0);
        assert!(value["ledger_height"].is_null());
    }

    #[tokio::test]
    async fn test_ledger_routes_require_hosted_ledger() {
        let (status, _) = call(state(false).await, get("/height")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_submit_then_query_voter_and_txout() {
        let state = state(true).await;
        let msg = LedgerMsg::Observation(transfer("0x0a", 2, "SWAP:ETH.USDT"));
        let signed = signer(0).sign(&msg).await.unwrap();

        let (status, body) = call(
            state.clone(),
            post("/submit", serde_json::to_vec(&signed).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: SubmitResponse = json(&body);
        assert_eq!(response.height, 1);

        let (status, body) = call(state.clone(), get("/voters/ETH/0x0a")).await;
        assert_eq!(status, StatusCode::OK);
        let voter: ObservedTxVoter = json(&body);
        assert!(voter.is_finalized());

        let (status, body) = call(state.clone(), get("/txout/1")).await;
        assert_eq!(status, StatusCode::OK);
        let block: TxOutBlock = json(&body);
        assert_eq!(block.items.len(), 1);
        assert_eq!(block.items[0].coin, coin("ETH.USDT", 6_000));

        let (status, _) = call(state, get("/voters/ETH/0x0b")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejection_is_typed() {
        let state = state(true).await;
        let msg = LedgerMsg::Observation(transfer("0x0a", 2, "GAS"));
        let signed = signer(1).sign(&msg).await.unwrap();

        let (status, body) = call(state, post("/submit", serde_json::to_vec(&signed).unwrap())).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let rejection: LedgerError = json(&body);
        assert!(matches!(rejection, LedgerError::UnauthorizedSigner(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (status, _) = call(state(true).await, post("/submit", b"{not json".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
