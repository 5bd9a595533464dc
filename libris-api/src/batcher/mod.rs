//! Batch drain + worker group for reservation processing.
//!
//! One timer task drains the queue every `batch_interval` and routes each
//! entry to a fixed worker by `xxh3(isbn) % worker_threads`. All entries
//! for an ISBN therefore serialize through one worker in enqueue order,
//! which is what prevents double-booking without a coarse lock. Each
//! worker applies its entries transactionally, invalidates the cache on
//! confirmation, and records an end-to-end latency sample per terminal
//! outcome.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::db::{self, ExecutionOutcome};
use crate::model::QueueEntry;
use crate::state::InstanceContext;

/// Worker index for an ISBN. Stable for the lifetime of the instance.
pub fn partition(isbn: &str, workers: usize) -> usize {
    (xxh3_64(isbn.as_bytes()) % workers.max(1) as u64) as usize
}

/// Spawn the dispatch timer and the worker group. All tasks stop after
/// `shutdown` flips: the dispatcher performs a final bounded drain, then
/// closes the worker channels and the workers finish their backlogs.
pub fn spawn(
    ctx: Arc<InstanceContext>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let workers = ctx.config.worker_threads;
    let mut handles = Vec::with_capacity(workers + 1);
    let mut senders = Vec::with_capacity(workers);

    for index in 0..workers {
        let (tx, rx) = mpsc::channel::<QueueEntry>(ctx.config.batch_size.max(1));
        senders.push(tx);
        handles.push(tokio::spawn(worker_loop(ctx.clone(), index, rx)));
    }

    handles.push(tokio::spawn(dispatch_loop(ctx, senders, shutdown)));
    handles
}

async fn dispatch_loop(
    ctx: Arc<InstanceContext>,
    senders: Vec<mpsc::Sender<QueueEntry>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(ctx.config.batch_interval_duration());
    loop {
        tokio::select! {
            _ = interval.tick() => dispatch_batch(&ctx, &senders).await,
            _ = shutdown.changed() => break,
        }
    }

    // Final drain, bounded by the shutdown grace period.
    let deadline = Instant::now() + ctx.config.shutdown_grace_duration();
    loop {
        if ctx.queue.is_empty().await {
            break;
        }
        if Instant::now() >= deadline {
            let remaining = ctx.queue.depth().await;
            warn!(remaining, "shutdown grace expired with entries still queued");
            break;
        }
        dispatch_batch(&ctx, &senders).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    info!("batch dispatcher stopped");
    // Dropping the senders closes every worker channel.
}

async fn dispatch_batch(ctx: &Arc<InstanceContext>, senders: &[mpsc::Sender<QueueEntry>]) {
    let batch = ctx.queue.drain(ctx.config.batch_size).await;
    if batch.is_empty() {
        return;
    }
    debug!(size = batch.len(), "dispatching batch");

    for entry in batch {
        let index = partition(&entry.isbn, senders.len());
        if senders[index].send(entry).await.is_err() {
            error!(worker = index, "worker channel closed while dispatching");
        }
    }
}

async fn worker_loop(
    ctx: Arc<InstanceContext>,
    index: usize,
    mut rx: mpsc::Receiver<QueueEntry>,
) {
    while let Some(entry) = rx.recv().await {
        process_entry(&ctx, index, entry).await;
    }
    debug!(worker = index, "batch worker stopped");
}

/// Apply one reservation. Terminal outcomes (confirmed, out of copies,
/// unknown references, retries exhausted) record a latency sample;
/// transient failures requeue at the head for the next tick.
pub async fn process_entry(ctx: &Arc<InstanceContext>, worker: usize, mut entry: QueueEntry) {
    let delay = ctx.config.processing_delay_duration();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let reservation_id = entry.reservation_id;
    let isbn = entry.isbn.clone();
    let result = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
        db::execute_reservation(conn, reservation_id, &isbn)
    })
    .await;

    match result {
        Ok(ExecutionOutcome::Confirmed) => {
            ctx.cache.invalidate(&entry.isbn).await;
            ctx.monitor
                .record_latency(entry.enqueued_at.elapsed().as_secs_f64());
            info!(
                worker,
                reservation = reservation_id,
                isbn = %entry.isbn,
                "reservation confirmed"
            );
        }
        Ok(ExecutionOutcome::Rejected(reason)) => {
            ctx.monitor
                .record_latency(entry.enqueued_at.elapsed().as_secs_f64());
            info!(
                worker,
                reservation = reservation_id,
                reason = %reason,
                "reservation rejected"
            );
        }
        Err(err) if err.is_transient() && entry.attempts + 1 < ctx.config.max_retries => {
            entry.attempts += 1;
            warn!(
                worker,
                reservation = reservation_id,
                attempts = entry.attempts,
                error = %err,
                "transient failure, requeueing at head"
            );
            ctx.queue.requeue_front(entry).await;
        }
        Err(err) => {
            error!(
                worker,
                reservation = reservation_id,
                attempts = entry.attempts + 1,
                error = %err,
                "reservation processing failed, rejecting"
            );
            let mark = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
                db::mark_rejected(conn, reservation_id, "processing error")
            })
            .await;
            if let Err(e) = mark {
                error!(reservation = reservation_id, error = %e, "failed to record rejection");
            }
            ctx.monitor
                .record_latency(entry.enqueued_at.elapsed().as_secs_f64());
        }
    }
}
