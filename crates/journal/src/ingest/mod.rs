// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive batching of parsed entries into the cache and the store.
//!
//! Producers append to a shared [`buffer::IngestBuffer`] through an [`IngestHandle`]. A single
//! controller task owns the ticker and the [`control::FlushControl`] state: on every tick it
//! takes the buffer, dispatches the batch and adjusts its cadence. Each batch is processed by
//! its own task, which updates the cache and writes to the store only when a connector is
//! idle.

pub mod buffer;
pub mod control;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::JournalConfig;
use crate::entry::{Entry, Message};
use crate::parser::Parser;
use crate::store::pool::ConnectorPool;
use buffer::IngestBuffer;
use control::FlushControl;

#[derive(Debug)]
pub enum IngestCommand {
    /// Batch taken early because the buffer overflowed.
    Flush(Vec<Arc<Entry>>),
    BatchDone,
    Shutdown,
}

/// Counters exposed on the metrics endpoint.
#[derive(Debug, Default)]
pub struct IngestStats {
    parsed: AtomicU64,
    batches: AtomicU64,
    inserted: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    pending: AtomicUsize,
    interval_ms: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IngestSnapshot {
    pub buffered: usize,
    pub pending_batches: usize,
    pub flush_interval_ms: u64,
    pub parsed_entries: u64,
    pub batches: u64,
    pub inserted_entries: u64,
    pub skipped_entries: u64,
    pub failed_entries: u64,
    pub pool_size: usize,
    pub pool_idle: usize,
}

#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<IngestCommand>,
    buffer: Arc<IngestBuffer>,
    parser: Arc<Parser>,
    stats: Arc<IngestStats>,
    pool: ConnectorPool,
}

impl IngestHandle {
    /// Parses a message and buffers the resulting entries. Returns how many were produced.
    pub fn ingest(&self, message: &Message) -> usize {
        let entries = self.parser.parse(message);
        let count = entries.len();
        self.stats.parsed.fetch_add(count as u64, Ordering::Relaxed);
        self.push(entries);
        count
    }

    pub fn push(&self, entries: Vec<Entry>) {
        if entries.is_empty() {
            return;
        }
        let entries = entries.into_iter().map(Arc::new).collect();
        if let Some(batch) = self.buffer.push(entries) {
            debug!("Ingest buffer full, forcing a flush of {} entries", batch.len());
            if self.tx.send(IngestCommand::Flush(batch)).is_err() {
                warn!("Ingest service is stopped, dropping forced batch");
            }
        }
    }

    pub fn stats(&self) -> IngestSnapshot {
        IngestSnapshot {
            buffered: self.buffer.len(),
            pending_batches: self.stats.pending.load(Ordering::Relaxed),
            flush_interval_ms: self.stats.interval_ms.load(Ordering::Relaxed),
            parsed_entries: self.stats.parsed.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            inserted_entries: self.stats.inserted.load(Ordering::Relaxed),
            skipped_entries: self.stats.skipped.load(Ordering::Relaxed),
            failed_entries: self.stats.failed.load(Ordering::Relaxed),
            pool_size: self.pool.size(),
            pool_idle: self.pool.idle(),
        }
    }

    /// Stops the controller after a last flush.
    pub fn close(&self) -> Result<(), mpsc::error::SendError<IngestCommand>> {
        self.tx.send(IngestCommand::Shutdown)
    }
}

pub struct IngestService {
    cache: Cache,
    pool: ConnectorPool,
    buffer: Arc<IngestBuffer>,
    stats: Arc<IngestStats>,
    control: FlushControl,
    dispatch_capacity: usize,
    tx: mpsc::UnboundedSender<IngestCommand>,
    rx: mpsc::UnboundedReceiver<IngestCommand>,
}

impl IngestService {
    pub fn new(config: &JournalConfig, cache: Cache, pool: ConnectorPool) -> (Self, IngestHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(IngestBuffer::new(config.buffer_capacity));
        let stats = Arc::new(IngestStats::default());
        let control = FlushControl::new(config);
        stats
            .interval_ms
            .store(control.interval().as_millis() as u64, Ordering::Relaxed);

        let handle = IngestHandle {
            tx: tx.clone(),
            buffer: Arc::clone(&buffer),
            parser: Arc::new(Parser::new()),
            stats: Arc::clone(&stats),
            pool: pool.clone(),
        };
        let service = IngestService {
            cache,
            pool,
            buffer,
            stats,
            control,
            dispatch_capacity: config.dispatch_capacity.max(1),
            tx,
            rx,
        };
        (service, handle)
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "Ingest service started, flushing every {:?}",
            self.control.interval()
        );
        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.dispatch_capacity);
        let dispatcher = tokio::spawn(run_dispatcher(
            dispatch_rx,
            self.cache.clone(),
            self.pool.clone(),
            Arc::clone(&self.stats),
            self.tx.clone(),
        ));

        let mut ticker = flush_ticker(self.control.interval());
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(IngestCommand::Flush(batch)) => self.dispatch(batch, &dispatch_tx).await,
                    Some(IngestCommand::BatchDone) => {
                        self.control.completed();
                        self.stats.pending.store(self.control.pending(), Ordering::Relaxed);
                    }
                    Some(IngestCommand::Shutdown) | None => break,
                },
                _ = ticker.tick() => {
                    let batch = self.buffer.take();
                    if !batch.is_empty() {
                        self.dispatch(batch, &dispatch_tx).await;
                    }
                    if self.control.adjust() {
                        debug!("Flush interval is now {:?}", self.control.interval());
                        self.stats
                            .interval_ms
                            .store(self.control.interval().as_millis() as u64, Ordering::Relaxed);
                        ticker = flush_ticker(self.control.interval());
                    }
                }
            }
        }

        let batch = self.buffer.take();
        if !batch.is_empty() {
            self.dispatch(batch, &dispatch_tx).await;
        }
        drop(dispatch_tx);
        if let Err(e) = dispatcher.await {
            error!("Ingest dispatcher failed: {e}");
        }
        info!("Ingest service stopped");
    }

    async fn dispatch(&mut self, batch: Vec<Arc<Entry>>, dispatch_tx: &mpsc::Sender<Vec<Arc<Entry>>>) {
        if dispatch_tx.send(batch).await.is_err() {
            error!("Ingest dispatcher is gone, dropping batch");
            return;
        }
        self.control.dispatched();
        self.stats.pending.store(self.control.pending(), Ordering::Relaxed);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
    }
}

fn flush_ticker(period: std::time::Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Spawns one task per batch and waits for all of them once the channel closes.
async fn run_dispatcher(
    mut rx: mpsc::Receiver<Vec<Arc<Entry>>>,
    cache: Cache,
    pool: ConnectorPool,
    stats: Arc<IngestStats>,
    done: mpsc::UnboundedSender<IngestCommand>,
) {
    let mut tasks = JoinSet::new();
    while let Some(batch) = rx.recv().await {
        let cache = cache.clone();
        let pool = pool.clone();
        let stats = Arc::clone(&stats);
        let done = done.clone();
        tasks.spawn(async move {
            process_batch(batch, &cache, &pool, &stats).await;
            // The controller may already be gone during shutdown.
            let _ = done.send(IngestCommand::BatchDone);
        });
        while tasks.try_join_next().is_some() {}
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Batch task panicked: {e}");
            }
        }
    }
}

async fn process_batch(
    batch: Vec<Arc<Entry>>,
    cache: &Cache,
    pool: &ConnectorPool,
    stats: &IngestStats,
) {
    cache.update(&batch);

    let Some(connector) = pool.try_get() else {
        debug!("No idle store connector, keeping {} entries in cache only", batch.len());
        stats.skipped.fetch_add(batch.len() as u64, Ordering::Relaxed);
        return;
    };
    match connector.insert_multi(&batch).await {
        Ok(()) => {
            stats.inserted.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            warn!("Failed to store {} entries: {e}", batch.len());
            stats.failed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
    }
}
