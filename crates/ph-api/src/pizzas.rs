use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::documents::{fetch_all_pizzas, fetch_pizza, PizzaDocument};
use crate::{ApiError, ApiResult, AppState};

const DEFAULT_SIZE: &str = "Large";
const PIZZA_NOT_FOUND: &str = "No pizza found with this id!";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PizzaRequest {
    pub pizza_name: Option<String>,
    pub created_by: Option<String>,
    pub size: Option<String>,
    pub toppings: Option<Vec<String>>,
}

/// Creation accepts one document or a batch; the offline outbox always sends
/// a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CreatePizzaBody {
    Many(Vec<PizzaRequest>),
    One(PizzaRequest),
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum CreatedPizzas {
    Many(Vec<PizzaDocument>),
    One(PizzaDocument),
}

pub async fn list_pizzas(State(state): State<AppState>) -> ApiResult<Json<Vec<PizzaDocument>>> {
    Ok(Json(fetch_all_pizzas(&state.pool).await?))
}

pub async fn get_pizza(
    State(state): State<AppState>,
    Path(pizza_id): Path<String>,
) -> ApiResult<Json<PizzaDocument>> {
    fetch_pizza(&state.pool, &pizza_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(PIZZA_NOT_FOUND))
}

pub async fn create_pizzas(
    State(state): State<AppState>,
    payload: Result<Json<CreatePizzaBody>, JsonRejection>,
) -> ApiResult<Json<CreatedPizzas>> {
    let Json(body) = payload?;

    let mut tx = state.pool.begin().await?;
    let created = match body {
        CreatePizzaBody::One(request) => CreatedPizzas::One(insert_pizza(&mut *tx, request).await?),
        CreatePizzaBody::Many(requests) => {
            let mut documents = Vec::with_capacity(requests.len());
            for request in requests {
                documents.push(insert_pizza(&mut *tx, request).await?);
            }
            CreatedPizzas::Many(documents)
        }
    };
    tx.commit().await?;

    match &created {
        CreatedPizzas::One(pizza) => tracing::info!(pizza_id = %pizza.id, "pizza created"),
        CreatedPizzas::Many(pizzas) => tracing::info!(count = pizzas.len(), "pizza batch created"),
    }

    Ok(Json(created))
}

pub async fn update_pizza(
    State(state): State<AppState>,
    Path(pizza_id): Path<String>,
    payload: Result<Json<PizzaRequest>, JsonRejection>,
) -> ApiResult<Json<PizzaDocument>> {
    let Json(request) = payload?;
    let toppings = request.toppings.as_deref().map(encode_toppings).transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE pizzas
        SET pizza_name = COALESCE(?1, pizza_name),
            created_by = COALESCE(?2, created_by),
            size = COALESCE(?3, size),
            toppings = COALESCE(?4, toppings)
        WHERE id = ?5
        "#,
    )
    .bind(&request.pizza_name)
    .bind(&request.created_by)
    .bind(&request.size)
    .bind(&toppings)
    .bind(&pizza_id)
    .execute(&state.pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found(PIZZA_NOT_FOUND));
    }

    fetch_pizza(&state.pool, &pizza_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(PIZZA_NOT_FOUND))
}

pub async fn delete_pizza(
    State(state): State<AppState>,
    Path(pizza_id): Path<String>,
) -> ApiResult<Json<PizzaDocument>> {
    let Some(pizza) = fetch_pizza(&state.pool, &pizza_id).await? else {
        return Err(ApiError::not_found(PIZZA_NOT_FOUND));
    };

    sqlx::query("DELETE FROM pizzas WHERE id = ?1")
        .bind(&pizza_id)
        .execute(&state.pool)
        .await?;

    tracing::info!(pizza_id = %pizza_id, "pizza deleted");
    Ok(Json(pizza))
}

async fn insert_pizza(
    conn: &mut SqliteConnection,
    request: PizzaRequest,
) -> Result<PizzaDocument, ApiError> {
    let pizza = PizzaDocument {
        id: Uuid::new_v4().to_string(),
        pizza_name: request.pizza_name,
        created_by: request.created_by,
        created_at: Utc::now(),
        size: request.size.unwrap_or_else(|| DEFAULT_SIZE.to_string()),
        toppings: request.toppings.unwrap_or_default(),
        comments: Vec::new(),
        comment_count: 0,
    };
    let toppings = encode_toppings(&pizza.toppings)?;

    sqlx::query(
        r#"
        INSERT INTO pizzas (id, pizza_name, created_by, size, toppings, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&pizza.id)
    .bind(&pizza.pizza_name)
    .bind(&pizza.created_by)
    .bind(&pizza.size)
    .bind(&toppings)
    .bind(pizza.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(pizza)
}

fn encode_toppings(toppings: &[String]) -> ApiResult<String> {
    serde_json::to_string(toppings).map_err(|err| {
        ApiError::new(StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", err.to_string())
    })
}
