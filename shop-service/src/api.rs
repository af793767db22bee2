use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use serde::{Deserialize, Serialize};
use shared::*;
use tower_http::services::ServeDir;
use uuid::Uuid;
use crate::accounts::{AccountStore, OrderSummary, ProfileUpdate, RegisterRequest};
use crate::cart_store::CartStore;
use crate::catalog::{CatalogStore, CategorySummary, ProductDetail, ProductFilter, ProductSummary};
use crate::gateway::{BackUrls, PaymentGateway};
use crate::handlers::{CheckoutHandler, OrderFinalizer};
use crate::models::User;
use crate::outbox::InvoiceProcessor;

type DbPool = Pool<AsyncPgConnection>;

/// Header carrying the id of the user authenticated by the fronting layer.
pub const USER_HEADER: &str = "x-user-id";

const CATALOG_PATH: &str = "/products";

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub gateway: Arc<dyn PaymentGateway>,
    pub invoices: InvoiceProcessor,
    pub back_urls: BackUrls,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: String,
    pub message: String,
}

/// Error returned by every handler. Domain failures are recognised by
/// downcasting to `StoreError`; anything else is an internal error.
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let store_error = self.0.downcast_ref::<StoreError>();

        let (status, message) = match store_error {
            Some(StoreError::NotFound { .. }) => {
                tracing::info!("{}, redirecting to catalog", self.0);
                return Redirect::to(CATALOG_PATH).into_response();
            }
            Some(StoreError::EmptyCart) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "No hay productos en el carrito.".to_string())
            }
            Some(StoreError::Gateway(_)) => {
                tracing::error!("Checkout failed: {}", self.0);
                (StatusCode::BAD_GATEWAY, "No se pudo iniciar el pago. Intentá nuevamente.".to_string())
            }
            Some(StoreError::Render(_)) => {
                tracing::error!("Invoice generation failed: {}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Ocurrió un error al generar el pedido.".to_string(),
                )
            }
            Some(StoreError::Invalid(message)) => (StatusCode::BAD_REQUEST, message.clone()),
            Some(StoreError::Conflict(message)) => (StatusCode::CONFLICT, message.clone()),
            Some(StoreError::Unauthorized) => {
                (StatusCode::UNAUTHORIZED, "Autenticación requerida.".to_string())
            }
            None => {
                tracing::error!("Request failed: {:#}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "Error interno.".to_string())
            }
        };

        (
            status,
            Json(ErrorResponse {
                status: "error".to_string(),
                message,
            }),
        )
            .into_response()
    }
}

/// The authenticated caller, taken from the `X-User-Id` header.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(CurrentUser)
            .ok_or_else(|| StoreError::Unauthorized.into())
    }
}

#[derive(Debug, Serialize)]
pub struct CartLineView {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub stock: i32,
    pub unit_price: BigDecimal,
    pub subtotal: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct CartView {
    pub id: Uuid,
    pub shipping_address: Option<String>,
    pub lines: Vec<CartLineView>,
    pub item_count: i64,
    pub total: BigDecimal,
}

impl From<Cart> for CartView {
    fn from(cart: Cart) -> Self {
        let total = cart.total();
        let item_count = cart.item_count();
        Self {
            id: cart.id,
            shipping_address: cart.shipping_address,
            lines: cart
                .lines
                .into_iter()
                .map(|line| CartLineView {
                    unit_price: line.unit_price(),
                    subtotal: line.subtotal(),
                    product_id: line.product_id,
                    product_name: line.product_name,
                    quantity: line.quantity,
                    stock: line.stock,
                })
                .collect(),
            item_count,
            total,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub init_point: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FinalizeRequest {
    pub address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub status: String,
    pub message: String,
    pub order_id: Uuid,
    pub order_number: String,
    pub total: BigDecimal,
    pub pdf_url: String,
}

pub fn create_router(state: AppState) -> Router {
    let invoice_dir = state.invoices.store().dir().to_path_buf();
    let invoice_url = state.invoices.store().url_prefix().to_string();

    Router::new()
        .route("/health", get(health_check))
        .route(CATALOG_PATH, get(list_products))
        .route("/products/:id", get(product_detail))
        .route("/categories", get(list_categories))
        .route("/cart", get(view_cart).delete(clear_cart))
        .route("/cart/items/:product_id", post(add_to_cart).delete(remove_from_cart))
        .route("/checkout", post(checkout))
        .route("/orders", post(finalize_order))
        .route("/accounts", post(register))
        .route("/account", get(profile).put(update_profile))
        .route("/account/orders", get(order_history))
        .nest_service(&invoice_url, ServeDir::new(invoice_dir))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn list_products(
    State(state): State<AppState>,
    Query(filter): Query<ProductFilter>,
) -> Result<Json<Vec<ProductSummary>>, ApiError> {
    let products = CatalogStore::new(state.pool).list(&filter).await?;
    Ok(Json(products.into_iter().map(ProductSummary::from).collect()))
}

pub async fn product_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProductDetail>, ApiError> {
    Ok(Json(CatalogStore::new(state.pool).detail(id).await?))
}

pub async fn list_categories(State(state): State<AppState>) -> Result<Json<Vec<CategorySummary>>, ApiError> {
    Ok(Json(CatalogStore::new(state.pool).categories().await?))
}

pub async fn view_cart(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<CartView>, ApiError> {
    let cart = CartStore::new(state.pool).view(user_id).await?;
    Ok(Json(cart.into()))
}

pub async fn add_to_cart(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(product_id): Path<Uuid>,
) -> Result<Json<CartView>, ApiError> {
    let cart = CartStore::new(state.pool).add(user_id, product_id).await?;
    Ok(Json(cart.into()))
}

pub async fn remove_from_cart(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(product_id): Path<Uuid>,
) -> Result<Json<CartView>, ApiError> {
    let cart = CartStore::new(state.pool).remove(user_id, product_id).await?;
    Ok(Json(cart.into()))
}

pub async fn clear_cart(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<CartView>, ApiError> {
    let cart = CartStore::new(state.pool).clear(user_id).await?;
    Ok(Json(cart.into()))
}

pub async fn checkout(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    request: Option<Json<CheckoutRequest>>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let handler = CheckoutHandler::new(state.pool, state.gateway, state.back_urls);
    let init_point = handler.start(user_id, request.address.trim()).await?;
    Ok(Json(CheckoutResponse { init_point }))
}

/// Called once the processor reports the payment as approved.
pub async fn finalize_order(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    request: Option<Json<FinalizeRequest>>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let finalized = OrderFinalizer::new(state.pool).finalize(user_id, request.address).await?;

    // The order is committed at this point; a failed render leaves the
    // invoice request pending for the outbox processor.
    let pdf_url = state.invoices.issue_for_order(finalized.order.id).await?;

    Ok(Json(FinalizeResponse {
        status: "ok".to_string(),
        message: "Pedido generado correctamente.".to_string(),
        order_id: finalized.order.id,
        order_number: finalized.order.number().to_string(),
        total: finalized.order.total,
        pdf_url,
    }))
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let store = AccountStore::new(state.pool, state.invoices.store().clone());
    let user = store.register(request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn profile(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<User>, ApiError> {
    let store = AccountStore::new(state.pool, state.invoices.store().clone());
    Ok(Json(store.profile(user_id).await?))
}

pub async fn update_profile(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<User>, ApiError> {
    let store = AccountStore::new(state.pool, state.invoices.store().clone());
    Ok(Json(store.update_profile(user_id, update).await?))
}

pub async fn order_history(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<OrderSummary>>, ApiError> {
    let store = AccountStore::new(state.pool, state.invoices.store().clone());
    Ok(Json(store.order_history(user_id).await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::InvoiceStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use chrono::FixedOffset;
    use diesel_async::pooled_connection::AsyncDieselConnectionManager;
    use std::str::FromStr;
    use tower::ServiceExt;

    struct UnusedGateway;

    #[async_trait]
    impl PaymentGateway for UnusedGateway {
        async fn create_checkout(
            &self,
            _request: &crate::gateway::PreferenceRequest,
        ) -> Result<String, StoreError> {
            Err(StoreError::Gateway("not configured".to_string()))
        }
    }

    fn state() -> AppState {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new("postgres://unused@127.0.0.1:1/unused");
        let pool = Pool::builder().build_unchecked(manager);
        AppState {
            pool: pool.clone(),
            gateway: Arc::new(UnusedGateway),
            invoices: InvoiceProcessor::new(
                pool,
                InvoiceStore::new(std::env::temp_dir().join("shop-service-tests")),
                FixedOffset::west_opt(3 * 3600).unwrap(),
            ),
            back_urls: BackUrls::under("http://localhost:3000"),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = create_router(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_cart_requires_user_header() {
        let response = create_router(state())
            .oneshot(Request::builder().uri("/cart").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_malformed_user_header_is_rejected() {
        let response = create_router(state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/orders")
                    .header(USER_HEADER, "not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_not_found_redirects_to_catalog() {
        let response = ApiError::from(StoreError::product_not_found(Uuid::new_v4())).into_response();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], CATALOG_PATH);
    }

    #[tokio::test]
    async fn test_empty_cart_is_a_structured_error() {
        let response = ApiError::from(StoreError::EmptyCart).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "No hay productos en el carrito.");
    }

    #[tokio::test]
    async fn test_gateway_and_render_details_are_not_leaked() {
        let response = ApiError::from(StoreError::Gateway("token APP_USR-123 rejected".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert!(!body["message"].as_str().unwrap().contains("APP_USR"));

        let response = ApiError::from(StoreError::Render("disk full".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(!body["message"].as_str().unwrap().contains("disk full"));
    }

    #[test]
    fn test_error_statuses() {
        let cases = [
            (StoreError::Invalid("email is required".to_string()), StatusCode::BAD_REQUEST),
            (StoreError::Conflict("username ana is taken".to_string()), StatusCode::CONFLICT),
            (StoreError::Unauthorized, StatusCode::UNAUTHORIZED),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }

        let internal = ApiError::from(anyhow::anyhow!("connection reset")).into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_cart_view_totals() {
        let cart = Cart {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            shipping_address: Some("Calle Falsa 123".to_string()),
            lines: vec![CartLine {
                product_id: Uuid::new_v4(),
                product_name: "Silla Ergonómica".to_string(),
                quantity: 2,
                price: BigDecimal::from_str("150.00").unwrap(),
                discount: 10,
                stock: 3,
            }],
        };

        let view = CartView::from(cart);
        assert_eq!(view.item_count, 2);
        assert_eq!(view.lines[0].unit_price, BigDecimal::from(135));
        assert_eq!(view.lines[0].subtotal, BigDecimal::from(270));
        assert_eq!(view.total, BigDecimal::from(270));
    }
}
