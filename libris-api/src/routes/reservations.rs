//! The asynchronous reservation write path.
//!
//! `POST /reservations` validates, persists a pending row, enqueues, and
//! returns 202; the actual booking decision happens later in the batch
//! workers. Queueing is fire-and-forget: once the client has its 202, a
//! dropped connection does not cancel anything.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::db;
use crate::error::{ApiError, ApiJson};
use crate::model::{NewReservation, QueueEntry, Reservation};
use crate::state::InstanceContext;

/// POST /reservations
pub async fn create_reservation(
    State(ctx): State<Arc<InstanceContext>>,
    ApiJson(body): ApiJson<NewReservation>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let user_id = body.user_id.clone();
    let isbn = body.isbn.clone();

    // Validate both references and insert the pending row on one lease.
    let inserted = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
        if !db::user_exists(conn, &body.user_id)? {
            return Ok(Err(format!("unknown user_id {}", body.user_id)));
        }
        if !db::book_exists(conn, &body.isbn)? {
            return Ok(Err(format!("unknown isbn {}", body.isbn)));
        }
        Ok(Ok(db::insert_pending_reservation(
            conn,
            &body.user_id,
            &body.isbn,
        )?))
    })
    .await?;

    let reservation_id = match inserted {
        Ok(id) => id,
        Err(detail) => return Err(ApiError::Validation(detail)),
    };

    let entry = QueueEntry::new(reservation_id, user_id, isbn.clone());
    if ctx.queue.enqueue(entry).await.is_err() {
        warn!(reservation = reservation_id, "queue full, rejecting reservation");
        // The pending row was already written; flip it so no orphaned
        // PENDING reservation survives the 503.
        let mark = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
            db::mark_rejected(conn, reservation_id, "queue full")
        })
        .await;
        if let Err(e) = mark {
            error!(reservation = reservation_id, error = %e, "failed to reject overflow reservation");
        }
        return Err(ApiError::QueueFull {
            retry_after_secs: ctx.config.batch_interval.ceil().max(1.0) as u64,
        });
    }

    info!(reservation = reservation_id, isbn = %isbn, "reservation queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "reservation_id": reservation_id,
            "status": "pending",
        })),
    ))
}

/// GET /reservations/my/{user_id} — newest first. An unknown user simply
/// has no reservations.
pub async fn my_reservations(
    State(ctx): State<Arc<InstanceContext>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Reservation>>, ApiError> {
    let reservations = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
        db::reservations_for_user(conn, &user_id)
    })
    .await?;
    Ok(Json(reservations))
}
