//! The single cooperative worker that serialises mutations.
//!
//! Every mutating call posts an `Operation` onto the worker's queue and
//! awaits its completion. The worker applies one operation at a time to
//! quiescence, drives the adaptive flush cadence, runs periodic TTL sweeps,
//! and retries transient IO failures. Reads never pass through the queue;
//! they hold the read half of the engine lock, which the worker waits on
//! (bounded by `lock_timeout`) before each mutation.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::codec::{self, Document};
use crate::engine::Engine;
use crate::errors::{Result, TetherError};
use crate::helpers::get_now;

/// A unit of work in the worker queue
pub(crate) struct Operation {
    pub kind: OpKind,
    pub deadline: Option<Instant>,
    pub reply: oneshot::Sender<Result<OpOutput>>,
}

pub(crate) enum OpKind {
    Put { key: String, doc: Document, ttl: Option<Duration>, tags: Vec<String> },
    PutBatch { items: Vec<(String, Document, Option<Duration>)> },
    Delete { key: String },
    DeleteBatch { keys: Vec<String> },
    Purge,
    Cleanup,
    Flush,
    Close,
}

pub(crate) enum OpOutput {
    Key(String),
    Keys(Vec<String>),
    Existed(bool),
    Count(usize),
    Done,
}

pub(crate) struct WorkerConfig {
    pub lock_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub ttl_check_interval: Duration,
    pub cleanup_interval: Duration,
}

pub(crate) struct Worker {
    state: Arc<RwLock<Engine>>,
    rx: mpsc::Receiver<Operation>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        state: Arc<RwLock<Engine>>,
        rx: mpsc::Receiver<Operation>,
        config: WorkerConfig,
    ) -> Self {
        Self { state, rx, config }
    }

    pub async fn run(mut self) {
        let start = tokio::time::Instant::now();
        let mut ttl_tick = tokio::time::interval_at(
            start + self.config.ttl_check_interval,
            self.config.ttl_check_interval,
        );
        let mut scan_tick = tokio::time::interval_at(
            start + self.config.cleanup_interval,
            self.config.cleanup_interval,
        );
        let mut flush_tick =
            tokio::time::interval_at(start + Duration::from_secs(1), Duration::from_secs(1));

        loop {
            tokio::select! {
                op = self.rx.recv() => match op {
                    Some(op) => {
                        if self.handle(op).await.is_break() {
                            break;
                        }
                    }
                    // Every handle dropped: drain is complete, stop
                    None => {
                        self.final_flush().await;
                        break;
                    }
                },
                _ = ttl_tick.tick() => self.sweep().await,
                _ = scan_tick.tick() => self.full_scan().await,
                _ = flush_tick.tick() => self.auto_flush().await,
            }
        }
    }

    async fn handle(&mut self, op: Operation) -> ControlFlow<()> {
        if let Some(deadline) = op.deadline
            && Instant::now() > deadline
        {
            let _ = op.reply.send(Err(TetherError::Timeout));
            return ControlFlow::Continue(());
        }

        if matches!(op.kind, OpKind::Close) {
            self.final_flush().await;
            let _ = op.reply.send(Ok(OpOutput::Done));
            return ControlFlow::Break(());
        }

        let result = self.apply_locked(op.kind).await;
        let _ = op.reply.send(result);

        // Suspension point between operations
        tokio::task::yield_now().await;
        ControlFlow::Continue(())
    }

    /// Take the write half of the engine lock (bounded by `lock_timeout`,
    /// waiting out any read lease) and apply the operation with retries.
    async fn apply_locked(&self, kind: OpKind) -> Result<OpOutput> {
        let Ok(mut engine) = tokio::time::timeout(self.config.lock_timeout, self.state.write()).await
        else {
            return Err(TetherError::LockTimeout);
        };

        let mut attempt = 0;
        let (output, mutations) = loop {
            match apply(&mut engine, &kind).await {
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!("transient IO failure (attempt {attempt}): {err}");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                other => break other?,
            }
        };

        if mutations > 0 {
            engine.flush.record(mutations);
            if engine.flush.should_flush() {
                engine.btree.flush().await?;
                engine.flush.reset();
            }
        }

        Ok(output)
    }

    async fn sweep(&self) {
        let Ok(mut engine) = tokio::time::timeout(self.config.lock_timeout, self.state.write()).await
        else {
            tracing::warn!("TTL sweep skipped: lease did not drain in time");
            return;
        };
        if let Err(err) = engine.sweep(get_now()).await {
            tracing::warn!("TTL sweep failed: {err}");
        }
    }

    async fn full_scan(&self) {
        let Ok(mut engine) = tokio::time::timeout(self.config.lock_timeout, self.state.write()).await
        else {
            tracing::warn!("full scan skipped: lease did not drain in time");
            return;
        };
        if let Err(err) = engine.full_scan(get_now()).await {
            tracing::warn!("full scan failed: {err}");
        }
    }

    /// Time-based flush for quiet periods with mutations pending
    async fn auto_flush(&self) {
        let Ok(mut engine) = tokio::time::timeout(self.config.lock_timeout, self.state.write()).await
        else {
            return;
        };
        if engine.flush.timer_due() {
            if let Err(err) = engine.btree.flush().await {
                tracing::warn!("auto flush failed: {err}");
                return;
            }
            engine.flush.reset();
        }
    }

    async fn final_flush(&self) {
        let mut engine = self.state.write().await;
        if let Err(err) = engine.btree.flush().await {
            tracing::warn!("final flush failed: {err}");
        }
        engine.flush.reset();
    }
}

async fn apply(engine: &mut Engine, kind: &OpKind) -> Result<(OpOutput, u64)> {
    let now = get_now();
    match kind {
        OpKind::Put { key, doc, ttl, tags } => {
            engine.put(key, doc.clone(), *ttl, tags, now).await?;
            Ok((OpOutput::Key(key.clone()), 1))
        }
        OpKind::PutBatch { items } => {
            // All-or-nothing at the result level: reject the whole batch
            // before touching storage if any item breaks the size ceiling
            for (_, doc, _) in items {
                codec::encode_document(doc)?;
            }

            let mut keys = Vec::with_capacity(items.len());
            for (key, doc, ttl) in items {
                engine.put(key, doc.clone(), *ttl, &[], now).await?;
                keys.push(key.clone());
            }
            let applied = keys.len() as u64;
            Ok((OpOutput::Keys(keys), applied))
        }
        OpKind::Delete { key } => {
            let existed = engine.remove(key, now).await?;
            Ok((OpOutput::Existed(existed), 1))
        }
        OpKind::DeleteBatch { keys } => {
            let mut removed = 0;
            for key in keys {
                if engine.remove(key, now).await? {
                    removed += 1;
                }
            }
            Ok((OpOutput::Count(removed), removed as u64))
        }
        OpKind::Purge => {
            let count = engine.purge().await?;
            Ok((OpOutput::Count(count), 0))
        }
        OpKind::Cleanup => {
            let swept = engine.sweep(now).await?;
            Ok((OpOutput::Count(swept), 0))
        }
        OpKind::Flush => {
            engine.btree.flush().await?;
            engine.flush.reset();
            Ok((OpOutput::Done, 0))
        }
        OpKind::Close => unreachable!("Close is handled before apply"),
    }
}
