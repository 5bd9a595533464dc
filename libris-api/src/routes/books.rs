//! Catalog endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::debug;

use crate::db;
use crate::error::{ApiError, ApiJson};
use crate::model::{Book, NewBook};
use crate::state::InstanceContext;

#[derive(Debug, Deserialize)]
pub struct BooksQuery {
    pub category: Option<String>,
}

/// GET /books — full catalog, optionally filtered by category.
pub async fn list_books(
    State(ctx): State<Arc<InstanceContext>>,
    Query(query): Query<BooksQuery>,
) -> Result<Json<Vec<Book>>, ApiError> {
    let books = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
        db::list_books(conn, query.category.as_deref())
    })
    .await?;
    Ok(Json(books))
}

/// GET /books/{isbn} — the cache path. A hit skips the pool entirely;
/// a miss leases a connection, queries, and populates the cache.
pub async fn get_book(
    State(ctx): State<Arc<InstanceContext>>,
    Path(isbn): Path<String>,
) -> Result<Json<Book>, ApiError> {
    if let Some(book) = ctx.cache.get(&isbn).await {
        debug!(isbn = %isbn, "book served from cache");
        return Ok(Json(book));
    }

    let lookup = isbn.clone();
    let book = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
        db::get_book(conn, &lookup)
    })
    .await?;

    match book {
        Some(book) => {
            ctx.cache.put(isbn, book.clone()).await;
            Ok(Json(book))
        }
        None => Err(ApiError::NotFound(format!("book {isbn}"))),
    }
}

/// POST /books — admin write. A new book starts fully available; the
/// cache entry for the ISBN is invalidated so the next read sees the
/// database row.
pub async fn create_book(
    State(ctx): State<Arc<InstanceContext>>,
    ApiJson(new_book): ApiJson<NewBook>,
) -> Result<(StatusCode, Json<Book>), ApiError> {
    if new_book.isbn.trim().is_empty() {
        return Err(ApiError::Validation("isbn must not be empty".into()));
    }
    if new_book.title.trim().is_empty() {
        return Err(ApiError::Validation("title must not be empty".into()));
    }

    let isbn = new_book.isbn.clone();
    let result = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
        db::insert_book(conn, &new_book)
    })
    .await;

    match result {
        Ok(book) => {
            ctx.cache.invalidate(&isbn).await;
            Ok((StatusCode::CREATED, Json(book)))
        }
        Err(err) if err.is_constraint_violation() => {
            Err(ApiError::Conflict(format!("book {isbn} already exists")))
        }
        Err(err) => Err(err.into()),
    }
}
