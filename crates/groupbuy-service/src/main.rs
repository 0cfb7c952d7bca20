use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use groupbuy_api::{
    AddOutcome, ApplyEditsResult, DeletePersonResult, DynStore, GroupBuyApi, LedgerConfig,
    API_CONTRACT_VERSION,
};
use groupbuy_core::{Item, ItemTotal, Matrix, NewOrder, Order, PersonId, ReceivedPolicy};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

type SharedApi = Arc<Mutex<GroupBuyApi<DynStore>>>;

/// One store handle for the whole process; operations are serialized on it.
#[derive(Clone)]
struct ServiceState {
    api: SharedApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    received_policy: ReceivedPolicy,
}

#[derive(Debug, Clone, Deserialize)]
struct AddItemRequest {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OrdersQuery {
    item: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeletePersonRequest {
    person_id: PersonId,
}

#[derive(Debug, Clone, Serialize)]
struct ItemsResponse {
    items: Vec<Item>,
}

#[derive(Debug, Clone, Serialize)]
struct OrdersResponse {
    orders: Vec<Order>,
}

#[derive(Debug, Clone, Serialize)]
struct TotalsResponse {
    totals: Vec<ItemTotal>,
}

#[derive(Debug, Parser)]
#[command(name = "groupbuy-service")]
#[command(about = "Local HTTP service for the group-buy ledger")]
struct Args {
    #[arg(long, conflicts_with = "data_dir")]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    per_item: bool,
    #[arg(long)]
    retention_days: Option<i64>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn new(api: GroupBuyApi<DynStore>) -> Self {
        Self { api: Arc::new(Mutex::new(api)) }
    }

    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    /// Run one ledger operation on the blocking pool; store backends do file
    /// and network I/O synchronously.
    async fn run<T, F>(&self, op: F) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&mut GroupBuyApi<DynStore>) -> Result<T> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = api.lock().map_err(|_| anyhow!("ledger lock poisoned"))?;
            op(&mut *guard)
        })
        .await;

        match joined {
            Ok(Ok(data)) => Ok(Json(envelope(data))),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "ledger operation failed");
                Err(Self::error(format!("{err:#}")))
            }
            Err(err) => Err(Self::error(format!("ledger task failed: {err}"))),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/items", get(items_list).post(items_add))
        .route("/v1/items/totals", get(items_totals))
        .route("/v1/orders", get(orders_list).post(orders_add))
        .route("/v1/orders/delete", post(orders_delete))
        .route("/v1/matrix", get(matrix_show))
        .route("/v1/matrix/apply", post(matrix_apply))
        .with_state(state)
}

fn load_config(args: &Args) -> Result<LedgerConfig> {
    LedgerConfig::resolve(args.config.as_deref(), args.data_dir.as_deref())?
        .with_overrides(args.per_item, args.retention_days)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let api = GroupBuyApi::new(config.open_store()?, config.received_policy, config.retention());
    let state = ServiceState::new(api);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        backend = config.backend.kind(),
        received_policy = config.received_policy.as_str(),
        "groupbuy service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<HealthResponse>>, ServiceError> {
    state
        .run(|api| {
            Ok(HealthResponse {
                status: "ok",
                backend: api.backend(),
                received_policy: api.policy(),
            })
        })
        .await
}

async fn items_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ItemsResponse>>, ServiceError> {
    state.run(|api| Ok(ItemsResponse { items: api.list_items()? })).await
}

async fn items_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddItemRequest>,
) -> Result<Json<ServiceEnvelope<AddOutcome<Item>>>, ServiceError> {
    state.run(move |api| api.add_item(&request.name)).await
}

async fn items_totals(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<TotalsResponse>>, ServiceError> {
    state.run(|api| Ok(TotalsResponse { totals: api.item_totals()? })).await
}

async fn orders_list(
    State(state): State<ServiceState>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<ServiceEnvelope<OrdersResponse>>, ServiceError> {
    state
        .run(move |api| Ok(OrdersResponse { orders: api.list_orders(query.item.as_deref())? }))
        .await
}

async fn orders_add(
    State(state): State<ServiceState>,
    Json(request): Json<NewOrder>,
) -> Result<Json<ServiceEnvelope<AddOutcome<Order>>>, ServiceError> {
    state.run(move |api| api.add_order(&request)).await
}

async fn orders_delete(
    State(state): State<ServiceState>,
    Json(request): Json<DeletePersonRequest>,
) -> Result<Json<ServiceEnvelope<DeletePersonResult>>, ServiceError> {
    state.run(move |api| api.delete_person(&request.person_id)).await
}

async fn matrix_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Matrix>>, ServiceError> {
    state.run(|api| api.matrix()).await
}

async fn matrix_apply(
    State(state): State<ServiceState>,
    Json(matrix): Json<Matrix>,
) -> Result<Json<ServiceEnvelope<ApplyEditsResult>>, ServiceError> {
    state.run(move |api| api.apply_edits(&matrix)).await
}
