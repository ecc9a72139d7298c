// src/saver.rs
//! Persistence pipeline.
//!
//! A single writer drains the [`PersistQueue`], resolves each fix to a tracker
//! id and calls `loginsert` on the connection picked by that id. The writer
//! runs on its own OS thread with a private current-thread runtime, so the
//! pool and the identity cache never leave that thread and need no locking.

use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::identity::{IdentityCache, UNKNOWN_TRACKER};
use crate::metrics::Metrics;
use crate::parser::Fix;
use crate::queue::PersistQueue;
use crate::store::{LogRow, Store, StorePool};

pub struct Pipeline<S> {
    pool: StorePool<S>,
    identity: IdentityCache,
    metrics: Arc<Metrics>,
}

impl<S: Store> Pipeline<S> {
    pub fn new(pool: StorePool<S>, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            identity: IdentityCache::new(),
            metrics,
        }
    }

    /// Lookups always hit the first connection.
    pub async fn resolve(&mut self, fix: &Fix) -> Result<u32, StoreError> {
        self.identity
            .resolve(self.pool.primary_mut(), &fix.num, &fix.phone, &fix.kind)
            .await
    }

    /// Persists one fix and returns the tracker id it was logged under.
    pub async fn save(&mut self, fix: &Fix) -> Result<u32, StoreError> {
        let id = self.resolve(fix).await?;
        if id == UNKNOWN_TRACKER {
            self.metrics.inc_fixes_unresolved();
            warn!(num = %fix.num, phone = %fix.phone, kind = %fix.kind, "saver: unknown tracker, logging under id 0");
        }

        let shard = self.pool.shard_for(id);
        let row = LogRow::new(id, fix);

        let t0 = Instant::now();
        self.pool.shard_mut(shard).log_insert(&row).await?;
        self.metrics.record_store(t0.elapsed());
        self.metrics.inc_fixes_saved();

        debug!(id, shard, "saver: {fix}");
        Ok(id)
    }

    /// Writer loop. Returns once the queue is interrupted and drained.
    pub fn run(mut self, queue: &PersistQueue, rt: &Runtime) {
        info!("saver: started, {} store connection(s)", self.pool.len());

        while let Some(fix) = queue.pop() {
            if let Err(e) = rt.block_on(self.save(&fix)) {
                self.metrics.inc_store_errors();
                error!(num = %fix.num, kind = %fix.kind, "saver: store write failed: {e:#}");
            }
        }

        info!("saver: stopped");
    }
}

/// Running writer thread.
pub struct SaverHandle {
    queue: PersistQueue,
    thread: JoinHandle<()>,
}

impl SaverHandle {
    /// Interrupts the queue, lets the writer drain it, and waits for the thread.
    pub fn shutdown(self) -> Result<()> {
        self.queue.interrupt();
        self.thread
            .join()
            .map_err(|_| anyhow!("saver thread panicked"))
    }
}

/// Starts the writer thread.
///
/// `connect` builds the pool on the writer's own runtime. Its error is
/// returned from here, so a store that cannot be reached stops startup.
pub fn spawn<S, F, Fut>(connect: F, queue: PersistQueue, metrics: Arc<Metrics>) -> Result<SaverHandle>
where
    S: Store + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<StorePool<S>, StoreError>>,
{
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
    let q = queue.clone();

    let thread = std::thread::Builder::new()
        .name("trackerd-saver".to_string())
        .spawn(move || {
            let rt = match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(anyhow!("saver runtime: {e}")));
                    return;
                }
            };

            let pool = match rt.block_on(connect()) {
                Ok(pool) => pool,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };

            let _ = ready_tx.send(Ok(()));
            Pipeline::new(pool, metrics).run(&q, &rt);
        })
        .context("spawn saver thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(SaverHandle { queue, thread }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e.context("store pool"))
        }
        Err(_) => {
            let _ = thread.join();
            Err(anyhow!("saver thread exited during startup"))
        }
    }
}
