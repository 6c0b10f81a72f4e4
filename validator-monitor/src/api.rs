use crate::config::parse_address_list;
use crate::status::StatusBoard;
use crate::store::{ReconciliationStore, StorageError, ValidatorRecord};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use snapshot_lib::group::GroupSnapshot;
use snapshot_lib::proposal::ProposalSnapshot;
use snapshot_lib::{Address, BalanceTotals, BlockHeight, ProposalId};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    store: ReconciliationStore,
    status: Arc<StatusBoard>,
    groups: Arc<[Address]>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub height: Option<BlockHeight>,
    pub failures: usize,
}

/// `true` while every monitored signer signed the last observed block.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MonitoredHealth {
    Healthy(bool),
    Missed(Vec<Address>),
}

#[derive(Debug, Deserialize)]
struct AddressQuery {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: Option<String>,
}

pub fn router(
    store: ReconciliationStore,
    status: Arc<StatusBoard>,
    groups: Vec<Address>,
) -> Router {
    let state = AppState {
        store,
        status,
        groups: groups.into(),
    };
    Router::new()
        .route("/health", get(health))
        .route("/monitored-health", get(monitored_health))
        .route("/unsigned-all", get(unsigned_all))
        .route("/unsigned/:height", get(unsigned_at))
        .route("/groups", get(groups_info))
        .route("/validators", get(validators_info))
        .route("/proposals", get(proposals_info))
        .route("/balances", get(balances))
        .with_state(state)
}

pub async fn serve(
    router: Router,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cycle = state.status.cycle();
    Json(HealthResponse {
        status: "ok".to_string(),
        height: cycle.as_ref().and_then(|cycle| cycle.height),
        failures: cycle.map(|cycle| cycle.failures.len()).unwrap_or_default(),
    })
}

async fn monitored_health(State(state): State<AppState>) -> ApiResult<MonitoredHealth> {
    let report = state.status.liveness().ok_or_else(not_ready)?;
    if report.missed_monitored.is_empty() {
        Ok(Json(MonitoredHealth::Healthy(true)))
    } else {
        Ok(Json(MonitoredHealth::Missed(report.missed_monitored.clone())))
    }
}

async fn unsigned_all(State(state): State<AppState>) -> ApiResult<Vec<Address>> {
    let report = state.status.liveness().ok_or_else(not_ready)?;
    Ok(Json(report.missed_all.clone()))
}

async fn unsigned_at(
    State(state): State<AppState>,
    Path(height): Path<BlockHeight>,
) -> ApiResult<Vec<Address>> {
    state
        .store
        .get_unsigned_validators(height)
        .await
        .map(Json)
        .map_err(storage_error)
}

async fn groups_info(
    State(state): State<AppState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<Vec<GroupSnapshot>> {
    let addresses = match query.address {
        Some(list) => addresses(&list)?,
        None => state.groups.to_vec(),
    };
    state
        .store
        .get_group_info(&addresses)
        .await
        .map(Json)
        .map_err(storage_error)
}

async fn validators_info(
    State(state): State<AppState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<Vec<ValidatorRecord>> {
    let addresses = addresses(required(query.address.as_deref(), "address")?)?;
    state
        .store
        .get_validator_info(&addresses)
        .await
        .map(Json)
        .map_err(storage_error)
}

async fn proposals_info(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> ApiResult<Vec<ProposalSnapshot>> {
    let ids = required(query.id.as_deref(), "id")?
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            id.parse::<ProposalId>()
                .map_err(|_| bad_request(format!("invalid proposal id {id:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    state
        .store
        .get_proposal_info(&ids)
        .await
        .map(Json)
        .map_err(storage_error)
}

async fn balances(State(state): State<AppState>) -> ApiResult<BalanceTotals> {
    let totals = state.status.balances().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "no balances read yet".to_string(),
            }),
        )
    })?;
    Ok(Json(totals.as_ref().clone()))
}

/// An absent list parameter is rejected; an empty one selects nothing.
fn required<'a>(
    value: Option<&'a str>,
    name: &str,
) -> Result<&'a str, (StatusCode, Json<ErrorResponse>)> {
    value.ok_or_else(|| bad_request(format!("missing `{name}` parameter")))
}

fn addresses(list: &str) -> Result<Vec<Address>, (StatusCode, Json<ErrorResponse>)> {
    parse_address_list(list).map_err(|err| bad_request(err.to_string()))
}

fn bad_request(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error }))
}

fn not_ready() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "no block observed yet".to_string(),
        }),
    )
}

fn storage_error(err: StorageError) -> (StatusCode, Json<ErrorResponse>) {
    error!(error = %err, "storage query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
