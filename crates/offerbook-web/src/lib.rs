//! Axum JSON API for the offerbook catalog.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use offerbook_core::{DateRange, NewProduct, Offer, PriceHistory, Product, ProductPatch, ValidationError};
use offerbook_storage::{Catalog, OfferFilter, StorageError};
use offerbook_sync::PriceHistoryAggregator;
use offerbook_upstream::{OfferFeed, CREDENTIAL_HEADER};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "offerbook-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub api_token: String,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("OFFERBOOK_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            api_token: std::env::var("OFFERBOOK_API_TOKEN")
                .unwrap_or_else(|_| "very_secret_key".to_string()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub history: PriceHistoryAggregator,
    pub api_token: String,
    /// Upstream catalog notified of newly created products, when configured.
    pub registrar: Option<Arc<dyn OfferFeed>>,
}

impl AppState {
    pub fn new(catalog: Catalog, api_token: impl Into<String>) -> Self {
        Self {
            history: PriceHistoryAggregator::new(catalog.clone()),
            catalog,
            api_token: api_token.into(),
            registrar: None,
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn OfferFeed>) -> Self {
        self.registrar = Some(registrar);
        self
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("Unauthorized request")]
    Unauthorized,
    #[error("Forbidden access")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    #[error("internal consistency violation: {0}")]
    Consistency(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Consistency(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, err = %self, "request failed");
        }
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate => Self::Validation("Product already exists".to_string()),
            StorageError::Integrity => Self::Validation(err.to_string()),
            StorageError::Consistency { .. } => Self::Consistency(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let protected = Router::new()
        .route("/products", get(list_products).post(create_product))
        .route(
            "/product/{id}",
            get(get_product).patch(patch_product).delete(delete_product),
        )
        .route("/offers", get(list_all_offers))
        .route("/offers/active", get(list_active_offers))
        .route("/offers/product/{id}", get(list_product_offers))
        .route("/offers/vendor/{id}", get(list_vendor_offers))
        .route(
            "/offers/product/{prod_id}/vendor/{vendor_id}",
            post(price_history),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_credential,
        ));

    Router::new()
        .route("/auth", post(issue_credential))
        .merge(protected)
        .with_state(state)
}

/// Serves until `cancel` fires, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "http api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("http api stopped");
    Ok(())
}

enum PresentedCredential<'a> {
    Missing,
    Token(&'a str),
    /// A credential header that is not a readable bearer token.
    Malformed,
}

/// Reads the credential from a `Bearer` header or a standard `Authorization: Bearer` header.
fn presented_credential(headers: &HeaderMap) -> PresentedCredential<'_> {
    if let Some(value) = headers.get(CREDENTIAL_HEADER) {
        return match value.to_str() {
            Ok(token) => PresentedCredential::Token(token.trim()),
            Err(_) => PresentedCredential::Malformed,
        };
    }
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return PresentedCredential::Missing;
    };
    match value.to_str().ok().and_then(|v| v.split_once(' ')) {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            PresentedCredential::Token(token.trim())
        }
        _ => PresentedCredential::Malformed,
    }
}

async fn require_credential(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let rejection = match presented_credential(req.headers()) {
        PresentedCredential::Missing => Some(ApiError::Unauthorized),
        PresentedCredential::Token(token) if token == state.api_token => None,
        PresentedCredential::Token(_) | PresentedCredential::Malformed => Some(ApiError::Forbidden),
    };
    match rejection {
        Some(err) => {
            warn!(path = %req.uri().path(), %err, "request rejected");
            err.into_response()
        }
        None => next.run(req).await,
    }
}

#[derive(Debug, Serialize)]
struct AccessToken {
    access_token: String,
}

async fn issue_credential(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(AccessToken {
            access_token: state.api_token.clone(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct CreateProduct {
    name: String,
    description: String,
}

async fn list_products(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Product>>> {
    Ok(Json(state.catalog.list_products().await?))
}

async fn create_product(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateProduct>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Product>)> {
    let Json(body) = payload?;
    let product = NewProduct::new(&body.name, &body.description)?;
    let created = state.catalog.insert_product(&product).await?;

    if let Some(registrar) = &state.registrar {
        if let Err(err) = registrar.register_product(&created).await {
            warn!(prod_id = created.prod_id, %err, "upstream registration failed");
        }
    }
    Ok((StatusCode::CREATED, Json(created)))
}

fn product_not_found() -> ApiError {
    ApiError::NotFound("Product not found".to_string())
}

async fn get_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Product>> {
    let Path(prod_id) = path?;
    state
        .catalog
        .find_product(prod_id)
        .await?
        .map(Json)
        .ok_or_else(product_not_found)
}

async fn patch_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<Product>> {
    let Path(prod_id) = path?;
    let Json(body) = payload?;
    let JsonValue::Object(fields) = body else {
        return Err(ApiError::Validation(
            "Request body must be a JSON object.".to_string(),
        ));
    };
    let patch = ProductPatch::from_json(&fields)?;
    state
        .catalog
        .update_product(prod_id, &patch)
        .await?
        .map(Json)
        .ok_or_else(product_not_found)
}

async fn delete_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let Path(prod_id) = path?;
    if state.catalog.delete_product(prod_id).await? {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let message = format!(
        "Could not delete a product with ID = {prod_id} as it is not present in the database."
    );
    Ok((StatusCode::OK, Json(json!({ "message": message }))).into_response())
}

async fn list_offers(state: &AppState, filter: OfferFilter) -> ApiResult<Json<Vec<Offer>>> {
    Ok(Json(state.catalog.list_offers(filter).await?))
}

async fn list_all_offers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Offer>>> {
    list_offers(&state, OfferFilter::All).await
}

async fn list_active_offers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Offer>>> {
    list_offers(&state, OfferFilter::Active).await
}

async fn list_product_offers(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Vec<Offer>>> {
    let Path(prod_id) = path?;
    list_offers(&state, OfferFilter::Product(prod_id)).await
}

async fn list_vendor_offers(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Vec<Offer>>> {
    let Path(vendor_id) = path?;
    list_offers(&state, OfferFilter::Vendor(vendor_id)).await
}

#[derive(Debug, Deserialize)]
struct HistoryRequest {
    date_start: Option<String>,
    date_end: Option<String>,
}

async fn price_history(
    State(state): State<Arc<AppState>>,
    path: Result<Path<(i64, i64)>, PathRejection>,
    payload: Result<Json<HistoryRequest>, JsonRejection>,
) -> ApiResult<Json<PriceHistory>> {
    let Path((prod_id, vendor_id)) = path?;
    let Json(body) = payload?;
    let (Some(start), Some(end)) = (body.date_start, body.date_end) else {
        return Err(ApiError::Validation(
            "Both date_start and date_end are required.".to_string(),
        ));
    };
    let range = DateRange::parse(&start, &end)?;
    Ok(Json(state.history.history(prod_id, vendor_id, &range).await?))
}
