use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use ph_core::{config, db, http, logging, migrations, server};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use std::net::SocketAddr;

mod comments;
mod documents;
mod pizzas;


pub use documents::{CommentDocument, PizzaDocument, ReplyDocument};

const SERVICE_NAME: &str = "ph-api";

/// Pizza collection route; `POST` creates one pizza or a batch.
pub const PIZZAS_PATH: &str = "/api/pizzas";

#[derive(Clone)]
pub struct AppState {
    pool: Pool<Sqlite>,
}

impl AppState {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database request failed");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "DB_ERROR", err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(rejection.status(), "INVALID_PAYLOAD", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let payload = ErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(payload)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthStatus {
    status: String,
}

pub struct ApiConfig {
    pub addr: SocketAddr,
    pub database_url: String,
}

pub fn load_config() -> Result<ApiConfig> {
    let addr = config::socket_addr_from_env("PIZZA_API_ADDR", "0.0.0.0:3001")?;
    let database_url = config::env_or("DATABASE_URL", "sqlite://data/pizza_hunt_api.db?mode=rwc");
    Ok(ApiConfig { addr, database_url })
}

pub async fn run(config: ApiConfig) -> Result<()> {
    logging::init(SERVICE_NAME);

    let pool = db::connect(&config.database_url).await?;
    migrations::run(&pool).await?;

    let router = http::apply_standard_layers(router(AppState::new(pool)), SERVICE_NAME);
    server::serve(config.addr, router).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            PIZZAS_PATH,
            get(pizzas::list_pizzas).post(pizzas::create_pizzas),
        )
        .route(
            "/api/pizzas/:id",
            get(pizzas::get_pizza)
                .put(pizzas::update_pizza)
                .delete(pizzas::delete_pizza),
        )
        .route("/api/comments/:pizza_id", post(comments::add_comment))
        .route(
            "/api/comments/:pizza_id/:comment_id",
            put(comments::add_reply).delete(comments::remove_comment),
        )
        .route(
            "/api/comments/:pizza_id/:comment_id/:reply_id",
            delete(comments::remove_reply),
        )
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match db::check_ready(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(HealthStatus { status: "ok".into() })),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "unavailable".into(),
            }),
        ),
    }
}
