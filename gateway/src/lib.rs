//! HTTP gateway for the credit ledger
//!
//! Exposes the request handlers as JSON endpoints. Caller identity comes
//! from the `x-user-id` header set by the upstream auth proxy.
//!
//! Two routers: [`build_app`] serves callers, [`build_internal_app`] serves
//! catalog sync from the product service and is bound to a separate,
//! non-public listener.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use credit_ledger::{
    handlers::{
        AccessRequest, AccessResponse, AccountSummary, OpenAccountResponse, PurchaseRequest,
        PurchaseResponse, ReferralRequest, ReferralResponse, TransferRequest, TransferResponse,
    },
    storage::StorageStats,
    Error, ErrorKind, Product, ProductId, ProductStatus, Purchase, ReferralRecord,
    RequestHandlers, TransactionRecord, UserId,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Header carrying the authenticated caller
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared router state
#[derive(Clone, Debug)]
pub struct AppState {
    pub handlers: RequestHandlers,
}

/// Ledger error rendered as `{error, message}`
#[derive(Debug)]
pub struct GatewayError(Error);

impl From<Error> for GatewayError {
    fn from(err: Error) -> Self {
        GatewayError(err)
    }
}

/// HTTP status for each error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidState | ErrorKind::AlreadyReferred => StatusCode::CONFLICT,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let message = match kind {
            ErrorKind::Internal => {
                tracing::error!(error = %self.0, "Request failed");
                "Internal server error".to_string()
            }
            _ => self.0.to_string(),
        };

        let body = ErrorBody {
            error: kind.code().to_string(),
            message,
        };
        (status_for(kind), Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<StorageStats>,
}

/// Body of `PUT /v1/products/:id`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpsert {
    pub creator_id: String,
    #[serde(default)]
    pub creator_name: String,
    pub title: String,
    pub price: u64,
    pub status: ProductStatus,
    #[serde(default)]
    pub product_files: Vec<String>,
}

fn caller(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(UserId::new)
}

/// Request body, or a 400 once the caller is known
///
/// Without a caller the body is ignored so the handler reports the missing
/// identity first.
fn payload<T: Default>(
    caller: Option<&UserId>,
    body: Result<Json<T>, JsonRejection>,
) -> Result<T, GatewayError> {
    match (caller, body) {
        (_, Ok(Json(request))) => Ok(request),
        (None, Err(_)) => Ok(T::default()),
        (Some(_), Err(rejection)) => Err(Error::InvalidArgument(rejection.body_text()).into()),
    }
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ledger = state.handlers.ledger();
    let storage = match ledger.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "Storage stats unavailable");
            None
        }
    };

    Json(HealthResponse {
        status: if storage.is_some() { "healthy" } else { "degraded" },
        service: ledger.config().service_name.clone(),
        version: ledger.config().service_version.clone(),
        storage,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, GatewayError> {
    state
        .handlers
        .ledger()
        .metrics()
        .export()
        .map_err(|e| Error::Config(format!("Failed to export metrics: {}", e)).into())
}

async fn open_account(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<OpenAccountResponse>, GatewayError> {
    let caller = caller(&headers);
    Ok(Json(state.handlers.open_account(caller.as_ref()).await?))
}

async fn account_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AccountSummary>, GatewayError> {
    let caller = caller(&headers);
    Ok(Json(state.handlers.account_summary(caller.as_ref()).await?))
}

async fn transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<TransactionRecord>>, GatewayError> {
    let caller = caller(&headers);
    Ok(Json(state.handlers.transactions(caller.as_ref()).await?))
}

async fn purchases(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Purchase>>, GatewayError> {
    let caller = caller(&headers);
    Ok(Json(state.handlers.purchases(caller.as_ref()).await?))
}

async fn referrals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ReferralRecord>>, GatewayError> {
    let caller = caller(&headers);
    Ok(Json(state.handlers.referrals(caller.as_ref()).await?))
}

async fn transfer_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Json<TransferResponse>, GatewayError> {
    let caller = caller(&headers);
    let request = payload(caller.as_ref(), body)?;
    Ok(Json(
        state
            .handlers
            .transfer_credits(caller.as_ref(), request)
            .await?,
    ))
}

async fn purchase_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PurchaseRequest>, JsonRejection>,
) -> Result<Json<PurchaseResponse>, GatewayError> {
    let caller = caller(&headers);
    let request = payload(caller.as_ref(), body)?;
    Ok(Json(
        state
            .handlers
            .purchase_product(caller.as_ref(), request)
            .await?,
    ))
}

async fn process_referral(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ReferralRequest>, JsonRejection>,
) -> Result<Json<ReferralResponse>, GatewayError> {
    let caller = caller(&headers);
    let request = payload(caller.as_ref(), body)?;
    Ok(Json(
        state
            .handlers
            .process_referral(caller.as_ref(), request)
            .await?,
    ))
}

async fn validate_purchase_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AccessRequest>, JsonRejection>,
) -> Result<Json<AccessResponse>, GatewayError> {
    let caller = caller(&headers);
    let request = payload(caller.as_ref(), body)?;
    Ok(Json(
        state
            .handlers
            .validate_purchase_access(caller.as_ref(), request)
            .await?,
    ))
}

// Catalog sync from the product service; not caller-facing
async fn put_product(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    Json(body): Json<ProductUpsert>,
) -> Result<Json<Product>, GatewayError> {
    let product = Product {
        id: ProductId::new(product_id),
        creator_id: UserId::new(body.creator_id),
        creator_name: body.creator_name,
        title: body.title,
        price: body.price,
        status: body.status,
        purchase_count: 0,
        product_files: body.product_files,
    };
    let stored = state.handlers.ledger().put_product(product).await?;
    tracing::info!(product = %stored.id, status = %stored.status, "Product registered");
    Ok(Json(stored))
}

/// Build the router with CORS and request tracing
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/accounts", post(open_account))
        .route("/v1/accounts/me", get(account_summary))
        .route("/v1/accounts/me/transactions", get(transactions))
        .route("/v1/accounts/me/purchases", get(purchases))
        .route("/v1/accounts/me/referrals", get(referrals))
        .route("/v1/credits/transfer", post(transfer_credits))
        .route("/v1/products/purchase", post(purchase_product))
        .route("/v1/products/access", post(validate_purchase_access))
        .route("/v1/referrals", post(process_referral))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build the catalog sync router
///
/// Requests here carry no caller identity, so this router is only ever
/// bound to `internal_listen_addr`.
pub fn build_internal_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/products/:id", put(put_product))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use credit_ledger::{Config, Ledger};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state(temp_dir: &tempfile::TempDir) -> AppState {
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let ledger = Arc::new(Ledger::open(config).await.unwrap());
        AppState {
            handlers: RequestHandlers::new(ledger),
        }
    }

    async fn test_app(temp_dir: &tempfile::TempDir) -> Router {
        build_app(test_state(temp_dir).await)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::AlreadyReferred), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::InvalidState), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::InsufficientFunds),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(ErrorKind::Internal),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = test_app(&temp_dir).await;

        let (status, body) = send(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "credit-ledger");
    }

    #[tokio::test]
    async fn test_missing_identity_is_401() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = test_app(&temp_dir).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/credits/transfer",
            None,
            Some(json!({"amount": -1})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_transfer_over_http() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = test_app(&temp_dir).await;

        let (status, body) = send(&app, Method::POST, "/v1/accounts", Some("a"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["account"]["credits"], 100);
        send(&app, Method::POST, "/v1/accounts", Some("b"), None).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/credits/transfer",
            Some("a"),
            Some(json!({"amount": 30, "recipientUserId": "b"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "newBalance": 70}));

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/credits/transfer",
            Some("a"),
            Some(json!({"amount": 500, "recipientUserId": "b"})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"], "insufficient_funds");

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/credits/transfer",
            Some("a"),
            Some(json!({"amount": 10, "recipientUserId": "nobody"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (_, body) = send(&app, Method::GET, "/v1/accounts/me", Some("b"), None).await;
        assert_eq!(body["credits"], 130);

        let (_, body) = send(
            &app,
            Method::GET,
            "/v1/accounts/me/transactions",
            Some("b"),
            None,
        )
        .await;
        assert_eq!(body[0]["type"], "received");
    }

    #[tokio::test]
    async fn test_purchase_flow_over_http() {
        let temp_dir = tempfile::tempdir().unwrap();
        let state = test_state(&temp_dir).await;
        let app = build_app(state.clone());
        let internal = build_internal_app(state);
        send(&app, Method::POST, "/v1/accounts", Some("buyer"), None).await;
        send(&app, Method::POST, "/v1/accounts", Some("creator"), None).await;

        let (status, _) = send(
            &internal,
            Method::PUT,
            "/v1/products/guide",
            None,
            Some(json!({
                "creatorId": "creator",
                "creatorName": "Creator",
                "title": "Guide",
                "price": 20,
                "status": "draft",
                "productFiles": ["guide.pdf"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/products/purchase",
            Some("buyer"),
            Some(json!({"productId": "guide"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_state");

        send(
            &internal,
            Method::PUT,
            "/v1/products/guide",
            None,
            Some(json!({
                "creatorId": "creator",
                "title": "Guide",
                "price": 20,
                "status": "approved",
                "productFiles": ["guide.pdf"]
            })),
        )
        .await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/products/purchase",
            Some("buyer"),
            Some(json!({"productId": "guide"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["newBalance"], 80);
        assert_eq!(body["productFiles"], json!(["guide.pdf"]));

        let (_, body) = send(
            &app,
            Method::POST,
            "/v1/products/access",
            Some("buyer"),
            Some(json!({"productId": "guide"})),
        )
        .await;
        assert_eq!(body, json!({"hasPurchased": true}));
    }

    #[tokio::test]
    async fn test_catalog_sync_is_not_on_public_router() {
        let temp_dir = tempfile::tempdir().unwrap();
        let state = test_state(&temp_dir).await;
        let app = build_app(state.clone());
        let internal = build_internal_app(state);
        send(&app, Method::POST, "/v1/accounts", Some("mallory"), None).await;
        send(&app, Method::POST, "/v1/accounts", Some("creator"), None).await;

        let listing = json!({
            "creatorId": "creator",
            "title": "Guide",
            "price": 20,
            "status": "approved"
        });
        send(
            &internal,
            Method::PUT,
            "/v1/products/guide",
            None,
            Some(listing),
        )
        .await;

        // A caller trying to reprice and redirect the product
        let (status, _) = send(
            &app,
            Method::PUT,
            "/v1/products/guide",
            Some("mallory"),
            Some(json!({
                "creatorId": "mallory",
                "title": "Guide",
                "price": 0,
                "status": "approved"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/products/purchase",
            Some("mallory"),
            Some(json!({"productId": "guide"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["newBalance"], 80);

        let (_, body) = send(&app, Method::GET, "/v1/accounts/me", Some("creator"), None).await;
        assert_eq!(body["credits"], 120);
    }

    #[tokio::test]
    async fn test_referral_over_http() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = test_app(&temp_dir).await;
        let (_, body) = send(&app, Method::POST, "/v1/accounts", Some("r"), None).await;
        let code = body["account"]["referralCode"].as_str().unwrap().to_string();
        send(&app, Method::POST, "/v1/accounts", Some("n"), None).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/referrals",
            Some("n"),
            Some(json!({"referralCode": code})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "bonusCredits": 25}));

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/referrals",
            Some("n"),
            Some(json!({"referralCode": code})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_referred");

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/referrals",
            Some("n"),
            Some(json!({"referralCode": "NOPE0000"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (_, body) = send(&app, Method::GET, "/v1/accounts/me/referrals", Some("r"), None).await;
        assert_eq!(body[0]["referredUserId"], "n");
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = test_app(&temp_dir).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/products/purchase")
            .header(USER_ID_HEADER, "buyer")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = test_app(&temp_dir).await;
        send(&app, Method::POST, "/v1/accounts", Some("a"), None).await;

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("open_account"));
    }
}
