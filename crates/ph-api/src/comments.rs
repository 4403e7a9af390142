use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::documents::{fetch_comment, fetch_pizza, CommentDocument, PizzaDocument};
use crate::{ApiError, ApiResult, AppState};

const PIZZA_NOT_FOUND: &str = "No pizza found with this id!";
const COMMENT_NOT_FOUND: &str = "No comment found with this id!";
const NAME_REQUIRED: &str = "You need to provide your name!";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRequest {
    pub written_by: Option<String>,
    pub comment_body: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRequest {
    pub reply_body: Option<String>,
    pub written_by: Option<String>,
}

pub async fn add_comment(
    State(state): State<AppState>,
    Path(pizza_id): Path<String>,
    payload: Result<Json<CommentRequest>, JsonRejection>,
) -> ApiResult<Json<PizzaDocument>> {
    let Json(request) = payload?;
    let mut fields = RequiredFields::new("Comment");
    let written_by = fields.take("writtenBy", request.written_by, NAME_REQUIRED);
    let comment_body = fields.take(
        "commentBody",
        request.comment_body,
        "You need to provide a comment!",
    );
    fields.finish()?;

    let exists = sqlx::query("SELECT 1 FROM pizzas WHERE id = ?1")
        .bind(&pizza_id)
        .fetch_optional(&state.pool)
        .await?;
    if exists.is_none() {
        return Err(ApiError::not_found(PIZZA_NOT_FOUND));
    }

    let comment_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO comments (id, pizza_id, written_by, comment_body, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&comment_id)
    .bind(&pizza_id)
    .bind(&written_by)
    .bind(&comment_body)
    .bind(Utc::now())
    .execute(&state.pool)
    .await?;

    tracing::info!(pizza_id = %pizza_id, comment_id = %comment_id, "comment added");
    load_pizza(&state, &pizza_id).await
}

pub async fn add_reply(
    State(state): State<AppState>,
    Path((pizza_id, comment_id)): Path<(String, String)>,
    payload: Result<Json<ReplyRequest>, JsonRejection>,
) -> ApiResult<Json<CommentDocument>> {
    let Json(request) = payload?;
    let mut fields = RequiredFields::new("Reply");
    let reply_body = fields.take(
        "replyBody",
        request.reply_body,
        "You need to provide a reply!",
    );
    let written_by = fields.take("writtenBy", request.written_by, NAME_REQUIRED);
    fields.finish()?;

    if fetch_comment(&state.pool, &pizza_id, &comment_id)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found(COMMENT_NOT_FOUND));
    }

    let reply_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO replies (id, comment_id, reply_body, written_by, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&reply_id)
    .bind(&comment_id)
    .bind(&reply_body)
    .bind(&written_by)
    .bind(Utc::now())
    .execute(&state.pool)
    .await?;

    tracing::info!(comment_id = %comment_id, reply_id = %reply_id, "reply added");
    load_comment(&state, &pizza_id, &comment_id).await
}

pub async fn remove_comment(
    State(state): State<AppState>,
    Path((pizza_id, comment_id)): Path<(String, String)>,
) -> ApiResult<Json<PizzaDocument>> {
    let result = sqlx::query("DELETE FROM comments WHERE id = ?1 AND pizza_id = ?2")
        .bind(&comment_id)
        .bind(&pizza_id)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found(COMMENT_NOT_FOUND));
    }

    tracing::info!(pizza_id = %pizza_id, comment_id = %comment_id, "comment removed");
    load_pizza(&state, &pizza_id).await
}

/// Removing a reply that is already gone still returns the comment.
pub async fn remove_reply(
    State(state): State<AppState>,
    Path((pizza_id, comment_id, reply_id)): Path<(String, String, String)>,
) -> ApiResult<Json<CommentDocument>> {
    if fetch_comment(&state.pool, &pizza_id, &comment_id)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found(COMMENT_NOT_FOUND));
    }

    sqlx::query("DELETE FROM replies WHERE id = ?1 AND comment_id = ?2")
        .bind(&reply_id)
        .bind(&comment_id)
        .execute(&state.pool)
        .await?;

    load_comment(&state, &pizza_id, &comment_id).await
}

async fn load_pizza(state: &AppState, pizza_id: &str) -> ApiResult<Json<PizzaDocument>> {
    fetch_pizza(&state.pool, pizza_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(PIZZA_NOT_FOUND))
}

async fn load_comment(
    state: &AppState,
    pizza_id: &str,
    comment_id: &str,
) -> ApiResult<Json<CommentDocument>> {
    fetch_comment(&state.pool, pizza_id, comment_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(COMMENT_NOT_FOUND))
}

/// Collects trimmed required string fields and reports every missing one in a
/// single validation error.
struct RequiredFields {
    document: &'static str,
    missing: Map<String, Value>,
}

impl RequiredFields {
    fn new(document: &'static str) -> Self {
        Self {
            document,
            missing: Map::new(),
        }
    }

    fn take(&mut self, field: &'static str, value: Option<String>, message: &str) -> String {
        let trimmed = value
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        if trimmed.is_empty() {
            self.missing
                .insert(field.to_string(), Value::String(message.to_string()));
        }
        trimmed
    }

    fn finish(self) -> ApiResult<()> {
        if self.missing.is_empty() {
            return Ok(());
        }
        let reasons = self
            .missing
            .iter()
            .map(|(field, message)| format!("{field}: {}", message.as_str().unwrap_or_default()))
            .collect::<Vec<_>>()
            .join(", ");
        Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            format!("{} validation failed: {reasons}", self.document),
        )
        .with_details(Value::Object(self.missing)))
    }
}
