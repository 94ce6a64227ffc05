//! Bounded pool of external converter processes.
//!
//! Slots are long-lived headless converter processes, each with a private
//! profile directory. Jobs borrow a slot for one conversion under a
//! size-scaled deadline; slots are recycled after a fixed number of
//! operations or when their resident memory crosses the configured ceiling,
//! and idle slots are swept back down to the configured minimum.

pub mod cache;
pub mod job;
pub mod slot;

pub use cache::{content_hash, ConversionCache};
pub use job::{ConversionError, ConversionOutput, ConversionRequest, TargetFormat};
pub use slot::{ProcessSlot, SlotState};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::scratch::TempFileManager;

/// Point-in-time view of one slot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub id: u64,
    pub state: SlotState,
    pub operations_served: u32,
    pub memory_bytes: u64,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub slots: Vec<SlotSnapshot>,
    /// Jobs currently parked waiting for a slot.
    pub queued: usize,
    /// Slots currently mid-spawn; they count against the pool ceiling.
    pub spawning: usize,
    pub completed: u64,
    pub failed: u64,
    pub cache_hits: u64,
}

#[derive(Default)]
struct PoolMetrics {
    completed: u64,
    failed: u64,
    cache_hits: u64,
}

struct SlotTable {
    slots: HashMap<u64, ProcessSlot>,
    /// Ids of slots mid-spawn; they count against the pool ceiling and show
    /// up as Starting in status snapshots.
    spawning: HashSet<u64>,
    /// FIFO of jobs waiting for a slot, keyed by a token so a timed-out
    /// waiter can withdraw its own entry under the table lock.
    waiters: VecDeque<(u64, oneshot::Sender<u64>)>,
    next_waiter_token: u64,
}

struct PoolInner {
    config: IngestConfig,
    default_timeout: Duration,
    max_input_bytes: u64,
    binary: PathBuf,
    scratch: TempFileManager,
    table: Mutex<SlotTable>,
    cache: Option<ConversionCache>,
    shutting_down: AtomicBool,
    next_slot_id: AtomicU64,
    metrics: std::sync::Mutex<PoolMetrics>,
}

/// Exclusive hold on one slot for the duration of a job.
///
/// Dropping an armed lease (the job future was cancelled mid-conversion)
/// recycles the slot, since the conversion child may still be writing into
/// its scratch directory.
struct SlotLease {
    inner: Arc<PoolInner>,
    id: u64,
    armed: bool,
}

impl SlotLease {
    fn new(inner: Arc<PoolInner>, id: u64) -> Self {
        Self {
            inner,
            id,
            armed: true,
        }
    }

    /// The slot finished its job in a usable state; return it to the pool.
    async fn complete(mut self) {
        self.armed = false;
        PoolInner::release_slot(&self.inner, self.id).await;
    }

    /// The slot is suspect (timeout or crash); kill and replace it.
    async fn fail(mut self) {
        self.armed = false;
        PoolInner::kill_and_replace(&self.inner, self.id).await;
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = self.inner.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tracing::warn!("Conversion job abandoned, recycling slot {}", id);
                PoolInner::kill_and_replace(&inner, id).await;
            });
        }
    }
}

enum AcquireAction {
    Lease(u64),
    Spawn(u64),
    Wait(u64, oneshot::Receiver<u64>),
}

pub struct ConversionProcessPool {
    inner: Arc<PoolInner>,
    sweep_task: JoinHandle<()>,
    orphan_task: Option<JoinHandle<()>>,
}

impl ConversionProcessPool {
    /// Build the pool, prewarm the minimum number of slots, and start the
    /// background sweeps. Prewarm failures are logged, not fatal; slots are
    /// respawned on demand and by the sweep.
    pub async fn new(config: IngestConfig) -> anyhow::Result<Self> {
        let binary = resolve_binary(&config)?;
        let scratch = TempFileManager::new(&config.common)
            .context("failed to initialize scratch storage")?;
        let cache = config
            .pool
            .enable_conversion_cache
            .then(|| ConversionCache::new(config.pool.conversion_cache_size));
        let default_timeout = config.common.default_timeout();
        let max_input_bytes = config.common.max_document_size_bytes();
        let inner = Arc::new(PoolInner {
            config,
            default_timeout,
            max_input_bytes,
            binary,
            scratch,
            table: Mutex::new(SlotTable {
                slots: HashMap::new(),
                spawning: HashSet::new(),
                waiters: VecDeque::new(),
                next_waiter_token: 0,
            }),
            cache,
            shutting_down: AtomicBool::new(false),
            next_slot_id: AtomicU64::new(1),
            metrics: std::sync::Mutex::new(PoolMetrics::default()),
        });

        for _ in 0..inner.config.pool.min_processes {
            PoolInner::replenish(&inner).await;
        }

        let sweep_inner = inner.clone();
        let sweep_period = Duration::from_secs(inner.config.pool.sweep_interval_secs.max(1));
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                PoolInner::sweep_once(&sweep_inner).await;
            }
        });

        let orphan_task = if inner.config.common.enable_cleanup {
            let orphan_inner = inner.clone();
            let period =
                Duration::from_secs(inner.config.common.cleanup_interval_secs.max(1));
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let removed = orphan_inner.scratch.sweep_orphans();
                    if removed > 0 {
                        tracing::info!("Removed {} orphaned scratch entries", removed);
                    }
                }
            }))
        } else {
            None
        };

        Ok(Self {
            inner,
            sweep_task,
            orphan_task,
        })
    }

    /// Convert one document. Resolves when the conversion finishes, fails,
    /// or the job's deadline expires while still queued.
    pub async fn submit(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionOutput, ConversionError> {
        let job_id = Uuid::new_v4();
        let started = Instant::now();
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ConversionError::ShuttingDown);
        }
        let size = request.input.len() as u64;
        if size > self.inner.max_input_bytes {
            return Err(ConversionError::InputTooLarge {
                size,
                limit: self.inner.max_input_bytes,
            });
        }

        let hash = self
            .inner
            .cache
            .as_ref()
            .map(|_| content_hash(&request.input));
        if let (Some(cache), Some(hash)) = (self.inner.cache.as_ref(), hash.as_deref()) {
            if let Some(data) = cache.get(hash, request.target) {
                tracing::debug!("Conversion cache hit for job {}", job_id);
                self.inner.with_metrics(|m| m.cache_hits += 1);
                return Ok(ConversionOutput {
                    job_id,
                    data,
                    target: request.target,
                    duration: started.elapsed(),
                    from_cache: true,
                });
            }
        }

        let deadline = job::deadline_for(size, self.inner.default_timeout, &self.inner.config.pool);
        let lease = PoolInner::acquire_slot(&self.inner, started, deadline).await?;
        let slot_id = lease.id;
        tracing::debug!(
            "Job {} ({} bytes -> {}) running on slot {}",
            job_id,
            size,
            request.target,
            slot_id
        );

        let result = self
            .run_job(job_id, &request, slot_id, started, deadline)
            .await;
        match result {
            Ok(data) => {
                lease.complete().await;
                if let (Some(cache), Some(hash)) = (self.inner.cache.as_ref(), hash) {
                    cache.insert(hash, request.target, data.clone());
                }
                self.inner.with_metrics(|m| m.completed += 1);
                Ok(ConversionOutput {
                    job_id,
                    data,
                    target: request.target,
                    duration: started.elapsed(),
                    from_cache: false,
                })
            }
            Err(err) => {
                match &err {
                    ConversionError::ConversionTimeout(_) | ConversionError::ProcessCrash(_) => {
                        tracing::warn!("Job {} failed on slot {}: {}", job_id, slot_id, err);
                        lease.fail().await;
                    }
                    _ => {
                        tracing::debug!("Job {} rejected: {}", job_id, err);
                        lease.complete().await;
                    }
                }
                self.inner.with_metrics(|m| m.failed += 1);
                Err(err)
            }
        }
    }

    async fn run_job(
        &self,
        job_id: Uuid,
        request: &ConversionRequest,
        slot_id: u64,
        started: Instant,
        deadline: Duration,
    ) -> Result<Vec<u8>, ConversionError> {
        let dir = self.inner.scratch.scoped(&format!("job-{job_id}"))?;
        let ext = sanitize_extension(&request.source_extension);
        let input_path = dir.path().join(format!("input.{ext}"));
        tokio::fs::write(&input_path, &request.input).await?;
        let outdir = dir.path().join("out");
        tokio::fs::create_dir(&outdir).await?;

        let profile = {
            let table = self.inner.table.lock().await;
            table
                .slots
                .get(&slot_id)
                .map(|s| s.profile_path().to_path_buf())
                .ok_or_else(|| {
                    ConversionError::ProcessCrash("slot disappeared before conversion".into())
                })?
        };

        let remaining = deadline
            .checked_sub(started.elapsed())
            .ok_or(ConversionError::ConversionTimeout(deadline))?;
        let output_path = slot::run_conversion(
            &self.inner.binary,
            &self.inner.config.pool.convert_args,
            &input_path,
            &outdir,
            request.target,
            &profile,
            remaining,
        )
        .await?;
        Ok(tokio::fs::read(&output_path).await?)
    }

    pub async fn status(&self) -> PoolStatus {
        let table = self.inner.table.lock().await;
        let mut slots: Vec<SlotSnapshot> = table
            .slots
            .values()
            .map(|s| SlotSnapshot {
                id: s.id,
                state: s.state,
                operations_served: s.operations_served,
                memory_bytes: s.memory_bytes,
            })
            .collect();
        slots.extend(table.spawning.iter().map(|&id| SlotSnapshot {
            id,
            state: SlotState::Starting,
            operations_served: 0,
            memory_bytes: 0,
        }));
        slots.sort_by_key(|s| s.id);
        let (completed, failed, cache_hits) = {
            let metrics = self
                .inner
                .metrics
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            (metrics.completed, metrics.failed, metrics.cache_hits)
        };
        PoolStatus {
            slots,
            queued: table.waiters.len(),
            spawning: table.spawning.len(),
            completed,
            failed,
            cache_hits,
        }
    }

    /// Stop accepting jobs, wake queued waiters with `ShuttingDown`, and
    /// kill every slot.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.sweep_task.abort();
        if let Some(task) = &self.orphan_task {
            task.abort();
        }
        let mut table = self.inner.table.lock().await;
        table.waiters.clear();
        let ids: Vec<u64> = table.slots.keys().copied().collect();
        for id in ids {
            if let Some(mut slot) = table.slots.remove(&id) {
                slot.kill().await;
            }
        }
        tracing::info!("Converter pool shut down");
    }
}

impl Drop for ConversionProcessPool {
    /// Callers that skip `shutdown()` must not leak the background tasks:
    /// each holds an `Arc<PoolInner>` that would otherwise keep every slot
    /// child alive until process exit.
    fn drop(&mut self) {
        self.sweep_task.abort();
        if let Some(task) = &self.orphan_task {
            task.abort();
        }
    }
}

impl PoolInner {
    fn with_metrics(&self, f: impl FnOnce(&mut PoolMetrics)) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut metrics);
    }

    /// Get an exclusive slot: reuse an idle one, spawn below the ceiling,
    /// or queue until one frees up within the job's deadline.
    async fn acquire_slot(
        inner: &Arc<PoolInner>,
        started: Instant,
        deadline: Duration,
    ) -> Result<SlotLease, ConversionError> {
        loop {
            if inner.shutting_down.load(Ordering::SeqCst) {
                return Err(ConversionError::ShuttingDown);
            }
            let action = {
                let mut table = inner.table.lock().await;
                debug_assert!(
                    table.slots.len() + table.spawning.len() <= inner.config.pool.max_processes
                );
                let idle_id = table
                    .slots
                    .values()
                    .filter(|s| s.state == SlotState::Idle)
                    .min_by_key(|s| s.last_used_at)
                    .map(|s| s.id);
                if let Some(id) = idle_id {
                    let alive = table
                        .slots
                        .get_mut(&id)
                        .map(|s| s.poll_alive())
                        .unwrap_or(false);
                    if alive {
                        if let Some(slot) = table.slots.get_mut(&id) {
                            slot.state = SlotState::Busy;
                        }
                        AcquireAction::Lease(id)
                    } else {
                        if let Some(mut dead) = table.slots.remove(&id) {
                            tracing::warn!("Discarding dead converter slot {}", id);
                            dead.state = SlotState::Dead;
                            dead.kill().await;
                        }
                        continue;
                    }
                } else if table.slots.len() + table.spawning.len()
                    < inner.config.pool.max_processes
                {
                    let id = inner.next_slot_id.fetch_add(1, Ordering::Relaxed);
                    table.spawning.insert(id);
                    AcquireAction::Spawn(id)
                } else {
                    let token = table.next_waiter_token;
                    table.next_waiter_token += 1;
                    let (tx, rx) = oneshot::channel();
                    table.waiters.push_back((token, tx));
                    AcquireAction::Wait(token, rx)
                }
            };
            match action {
                AcquireAction::Lease(id) => return Ok(SlotLease::new(inner.clone(), id)),
                AcquireAction::Spawn(id) => {
                    let id = Self::spawn_busy_slot(inner, id).await?;
                    return Ok(SlotLease::new(inner.clone(), id));
                }
                AcquireAction::Wait(token, mut rx) => {
                    let remaining = deadline
                        .checked_sub(started.elapsed())
                        .filter(|d| !d.is_zero())
                        .unwrap_or(Duration::ZERO);
                    match tokio::time::timeout(remaining, &mut rx).await {
                        Ok(Ok(id)) => return Ok(SlotLease::new(inner.clone(), id)),
                        Ok(Err(_)) => return Err(ConversionError::ShuttingDown),
                        Err(_) => {
                            // Withdraw under the table lock. Handoffs send
                            // while holding the same lock, so if our entry
                            // is gone the slot id is already in the channel
                            // and must be taken, not stranded as Busy.
                            let mut table = inner.table.lock().await;
                            let before = table.waiters.len();
                            table.waiters.retain(|(t, _)| *t != token);
                            let withdrawn = table.waiters.len() != before;
                            drop(table);
                            if withdrawn {
                                return Err(ConversionError::PoolSaturated(deadline));
                            }
                            match rx.try_recv() {
                                Ok(id) => return Ok(SlotLease::new(inner.clone(), id)),
                                Err(_) => {
                                    if inner.shutting_down.load(Ordering::SeqCst) {
                                        return Err(ConversionError::ShuttingDown);
                                    }
                                    return Err(ConversionError::PoolSaturated(deadline));
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Spawn a slot for the acquiring job. The caller has already reserved
    /// `id` in the spawning set; this settles it.
    async fn spawn_busy_slot(inner: &Arc<PoolInner>, id: u64) -> Result<u64, ConversionError> {
        let spawned = Self::spawn_process(inner, id).await;
        let mut table = inner.table.lock().await;
        table.spawning.remove(&id);
        match spawned {
            Ok(mut slot) => {
                slot.state = SlotState::Busy;
                table.slots.insert(id, slot);
                Ok(id)
            }
            Err(err) => Err(err),
        }
    }

    async fn spawn_process(
        inner: &Arc<PoolInner>,
        id: u64,
    ) -> Result<ProcessSlot, ConversionError> {
        let profile = inner.scratch.scoped(&format!("profile-{id}"))?;
        ProcessSlot::spawn(
            id,
            &inner.binary,
            &inner.config.pool.spawn_args,
            profile,
            inner.config.pool.startup_timeout(),
        )
        .await
    }

    /// Background spawn toward the minimum, handing the new slot to a queued
    /// waiter when one is pending. Failures are logged; the sweep retries.
    async fn replenish(inner: &Arc<PoolInner>) {
        if inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let id = {
            let mut table = inner.table.lock().await;
            if table.slots.len() + table.spawning.len() >= inner.config.pool.max_processes {
                return;
            }
            let id = inner.next_slot_id.fetch_add(1, Ordering::Relaxed);
            table.spawning.insert(id);
            id
        };
        let spawned = Self::spawn_process(inner, id).await;
        let mut table = inner.table.lock().await;
        table.spawning.remove(&id);
        match spawned {
            Ok(mut slot) => {
                let mut handed = false;
                while let Some((_, tx)) = table.waiters.pop_front() {
                    if tx.send(id).is_ok() {
                        handed = true;
                        break;
                    }
                }
                slot.state = if handed {
                    SlotState::Busy
                } else {
                    SlotState::Idle
                };
                table.slots.insert(id, slot);
            }
            Err(err) => tracing::warn!("Failed to spawn converter slot {}: {}", id, err),
        }
    }

    /// Return a healthy slot to the pool, recycling it when worn out.
    async fn release_slot(inner: &Arc<PoolInner>, id: u64) {
        let mut table = inner.table.lock().await;
        let worn = match table.slots.get_mut(&id) {
            Some(slot) => {
                slot.operations_served += 1;
                slot.last_used_at = Instant::now();
                slot.refresh_memory();
                let memory_cap = inner.config.pool.max_memory_mb * 1024 * 1024;
                !slot.poll_alive()
                    || slot.operations_served >= inner.config.pool.max_operations_per_process
                    || slot.memory_bytes > memory_cap
            }
            None => return,
        };
        if worn {
            if let Some(mut slot) = table.slots.remove(&id) {
                slot.state = SlotState::Draining;
                tracing::info!(
                    "Recycling slot {} after {} operations, {} bytes RSS",
                    id,
                    slot.operations_served,
                    slot.memory_bytes
                );
                slot.kill().await;
            }
            let needed = table.slots.len() + table.spawning.len()
                < inner.config.pool.min_processes
                || !table.waiters.is_empty();
            drop(table);
            if needed {
                let inner = inner.clone();
                tokio::spawn(async move {
                    PoolInner::replenish(&inner).await;
                });
            }
        } else {
            let mut handed = false;
            while let Some((_, tx)) = table.waiters.pop_front() {
                if tx.send(id).is_ok() {
                    handed = true;
                    break;
                }
            }
            if !handed {
                if let Some(slot) = table.slots.get_mut(&id) {
                    slot.state = SlotState::Idle;
                }
            }
        }
    }

    /// Kill a suspect slot and schedule a replacement if needed.
    async fn kill_and_replace(inner: &Arc<PoolInner>, id: u64) {
        let mut table = inner.table.lock().await;
        if let Some(mut slot) = table.slots.remove(&id) {
            slot.state = SlotState::Dead;
            slot.kill().await;
        }
        let needed = table.slots.len() + table.spawning.len() < inner.config.pool.min_processes
            || !table.waiters.is_empty();
        drop(table);
        if needed {
            let inner = inner.clone();
            tokio::spawn(async move {
                PoolInner::replenish(&inner).await;
            });
        }
    }

    /// Periodic maintenance: drop dead slots, evict long-idle slots down to
    /// the minimum (oldest first), then respawn up to the minimum.
    async fn sweep_once(inner: &Arc<PoolInner>) {
        if inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let idle_deadline = inner
            .default_timeout
            .mul_f64(inner.config.pool.process_idle_timeout_multiplier.max(0.0));
        let deficit;
        {
            let mut table = inner.table.lock().await;
            let dead: Vec<u64> = table
                .slots
                .values_mut()
                .filter_map(|s| {
                    if s.state == SlotState::Idle && !s.poll_alive() {
                        Some(s.id)
                    } else {
                        None
                    }
                })
                .collect();
            for id in dead {
                tracing::warn!("Sweeping dead converter slot {}", id);
                if let Some(mut slot) = table.slots.remove(&id) {
                    slot.state = SlotState::Dead;
                    slot.kill().await;
                }
            }

            let mut idle: Vec<(u64, Duration)> = table
                .slots
                .values()
                .filter(|s| s.state == SlotState::Idle)
                .map(|s| (s.id, s.idle_for(now)))
                .collect();
            idle.sort_by(|a, b| b.1.cmp(&a.1));
            for (id, idled) in idle {
                if table.slots.len() <= inner.config.pool.min_processes || idled < idle_deadline {
                    break;
                }
                tracing::info!("Evicting idle converter slot {} after {:?}", id, idled);
                if let Some(mut slot) = table.slots.remove(&id) {
                    slot.kill().await;
                }
            }

            deficit = inner
                .config
                .pool
                .min_processes
                .saturating_sub(table.slots.len() + table.spawning.len());
        }
        for _ in 0..deficit {
            Self::replenish(inner).await;
        }
    }
}

/// Pick the converter binary: explicit configuration wins, otherwise the
/// usual names are looked up on PATH.
fn resolve_binary(config: &IngestConfig) -> anyhow::Result<PathBuf> {
    if let Some(path) = &config.pool.converter_binary {
        return Ok(path.clone());
    }
    for candidate in ["libreoffice", "soffice"] {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }
    anyhow::bail!("no converter binary found on PATH (tried libreoffice, soffice)")
}

fn sanitize_extension(ext: &str) -> String {
    let cleaned: String = ext
        .trim()
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(10)
        .collect();
    if cleaned.is_empty() {
        "bin".to_string()
    } else {
        cleaned.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_extension() {
        assert_eq!(sanitize_extension(".DOCX"), "docx");
        assert_eq!(sanitize_extension("doc"), "doc");
        assert_eq!(sanitize_extension("../../etc"), "etc");
        assert_eq!(sanitize_extension(""), "bin");
        assert_eq!(sanitize_extension("?!"), "bin");
    }

    #[test]
    fn test_resolve_binary_prefers_config() {
        let mut config = IngestConfig::default();
        config.pool.converter_binary = Some(PathBuf::from("/opt/soffice/soffice"));
        let resolved = resolve_binary(&config).unwrap();
        assert_eq!(resolved, PathBuf::from("/opt/soffice/soffice"));
    }
}
