//! Document views over the relational tables. Pizzas are returned with their
//! comments populated and replies nested inside each comment, together with
//! the derived counters clients display.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyDocument {
    pub reply_id: String,
    pub reply_body: String,
    pub written_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub written_by: String,
    pub comment_body: String,
    pub created_at: DateTime<Utc>,
    pub replies: Vec<ReplyDocument>,
    pub reply_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PizzaDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub pizza_name: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size: String,
    pub toppings: Vec<String>,
    pub comments: Vec<CommentDocument>,
    pub comment_count: usize,
}

impl PizzaDocument {
    pub(crate) fn with_comments(mut self, comments: Vec<CommentDocument>) -> Self {
        self.comment_count = comment_count(&comments);
        self.comments = comments;
        self
    }
}

/// Every comment counts once, plus once per reply.
pub(crate) fn comment_count(comments: &[CommentDocument]) -> usize {
    comments
        .iter()
        .fold(0, |total, comment| total + comment.replies.len() + 1)
}

pub(crate) async fn fetch_pizza(
    pool: &Pool<Sqlite>,
    pizza_id: &str,
) -> Result<Option<PizzaDocument>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, pizza_name, created_by, size, toppings, created_at FROM pizzas WHERE id = ?1",
    )
    .bind(pizza_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let pizza = row_to_pizza(&row)?;
    let comments = fetch_comments(pool, &pizza.id).await?;
    Ok(Some(pizza.with_comments(comments)))
}

pub(crate) async fn fetch_all_pizzas(pool: &Pool<Sqlite>) -> Result<Vec<PizzaDocument>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, pizza_name, created_by, size, toppings, created_at FROM pizzas
        ORDER BY created_at DESC, rowid DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut pizzas = Vec::with_capacity(rows.len());
    for row in rows {
        let pizza = row_to_pizza(&row)?;
        let comments = fetch_comments(pool, &pizza.id).await?;
        pizzas.push(pizza.with_comments(comments));
    }
    Ok(pizzas)
}

pub(crate) async fn fetch_comment(
    pool: &Pool<Sqlite>,
    pizza_id: &str,
    comment_id: &str,
) -> Result<Option<CommentDocument>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, written_by, comment_body, created_at FROM comments
        WHERE id = ?1 AND pizza_id = ?2
        "#,
    )
    .bind(comment_id)
    .bind(pizza_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let reply_rows = sqlx::query(
        r#"
        SELECT id, comment_id, reply_body, written_by, created_at FROM replies
        WHERE comment_id = ?1 ORDER BY rowid
        "#,
    )
    .bind(comment_id)
    .fetch_all(pool)
    .await?;

    let replies = reply_rows
        .iter()
        .map(row_to_reply)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(row_to_comment(&row, replies)?))
}

async fn fetch_comments(
    pool: &Pool<Sqlite>,
    pizza_id: &str,
) -> Result<Vec<CommentDocument>, sqlx::Error> {
    let comment_rows = sqlx::query(
        r#"
        SELECT id, written_by, comment_body, created_at FROM comments
        WHERE pizza_id = ?1 ORDER BY rowid
        "#,
    )
    .bind(pizza_id)
    .fetch_all(pool)
    .await?;

    if comment_rows.is_empty() {
        return Ok(Vec::new());
    }

    let reply_rows = sqlx::query(
        r#"
        SELECT r.id, r.comment_id, r.reply_body, r.written_by, r.created_at
        FROM replies r JOIN comments c ON c.id = r.comment_id
        WHERE c.pizza_id = ?1 ORDER BY r.rowid
        "#,
    )
    .bind(pizza_id)
    .fetch_all(pool)
    .await?;

    let mut replies_by_comment: HashMap<String, Vec<ReplyDocument>> = HashMap::new();
    for row in &reply_rows {
        let comment_id: String = row.try_get("comment_id")?;
        replies_by_comment
            .entry(comment_id)
            .or_default()
            .push(row_to_reply(row)?);
    }

    comment_rows
        .iter()
        .map(|row| {
            let id: String = row.try_get("id")?;
            let replies = replies_by_comment.remove(&id).unwrap_or_default();
            row_to_comment(row, replies)
        })
        .collect()
}

fn row_to_pizza(row: &SqliteRow) -> Result<PizzaDocument, sqlx::Error> {
    let toppings_raw: String = row.try_get("toppings")?;
    let toppings: Vec<String> =
        serde_json::from_str(&toppings_raw).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;

    Ok(PizzaDocument {
        id: row.try_get("id")?,
        pizza_name: row.try_get("pizza_name")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        size: row.try_get("size")?,
        toppings,
        comments: Vec::new(),
        comment_count: 0,
    })
}

fn row_to_comment(
    row: &SqliteRow,
    replies: Vec<ReplyDocument>,
) -> Result<CommentDocument, sqlx::Error> {
    Ok(CommentDocument {
        id: row.try_get("id")?,
        written_by: row.try_get("written_by")?,
        comment_body: row.try_get("comment_body")?,
        created_at: row.try_get("created_at")?,
        reply_count: replies.len(),
        replies,
    })
}

fn row_to_reply(row: &SqliteRow) -> Result<ReplyDocument, sqlx::Error> {
    Ok(ReplyDocument {
        reply_id: row.try_get("id")?,
        reply_body: row.try_get("reply_body")?,
        written_by: row.try_get("written_by")?,
        created_at: row.try_get("created_at")?,
    })
}
