//! Pipeline Scheduler
//!
//! Fixed-size worker pool over three FIFO queues: input (batches awaiting
//! job creation), processing (jobs awaiting a worker) and output (finished
//! jobs retained for inspection). Workers race for jobs in enqueue order;
//! a claimed job is run to completion and never claimed twice. One failing
//! job marks itself failed and the worker moves on.
//!
//! `start()` also spawns three maintenance loops: retention cleanup, a
//! queue-depth monitor and a statistics publisher.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::SchedulerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::processors::{default_processors, Processor};
use crate::storage::{MetricsStore, TimeSeriesStore};
use crate::types::{
    AggregationResult, DataBatch, JobKind, JobStatus, PipelineStatsSnapshot, PipelineStatus,
    ProcessingJob, QueueSizes,
};

/// Shared atomic counters for the whole pipeline
#[derive(Debug, Default)]
pub struct SchedulerStats {
    batches_ingested: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    points_processed: AtomicU64,
    points_expired: AtomicU64,
}

impl SchedulerStats {
    /// Consistent-enough snapshot of all counters
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            batches_ingested: self.batches_ingested.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            points_processed: self.points_processed.load(Ordering::Relaxed),
            points_expired: self.points_expired.load(Ordering::Relaxed),
        }
    }
}

/// The three scheduler queues, each behind its own lock
#[derive(Debug, Default)]
struct JobQueues {
    input: Mutex<VecDeque<DataBatch>>,
    processing: Mutex<VecDeque<ProcessingJob>>,
    output: Mutex<VecDeque<ProcessingJob>>,
}

impl JobQueues {
    fn sizes(&self) -> QueueSizes {
        QueueSizes {
            input: self.input.lock().len(),
            processing: self.processing.lock().len(),
            output: self.output.lock().len(),
        }
    }
}

/// Worker-pool scheduler driving batches through the processor stages
pub struct PipelineScheduler {
    config: SchedulerConfig,
    status: Arc<RwLock<PipelineStatus>>,
    queues: Arc<JobQueues>,
    processors: Arc<HashMap<String, Arc<dyn Processor>>>,
    timeseries: Arc<TimeSeriesStore>,
    metrics_store: Arc<MetricsStore>,
    cache: Arc<dyn CacheStore>,
    stats: Arc<SchedulerStats>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineScheduler")
            .field("status", &*self.status.read())
            .field("queues", &self.queues.sizes())
            .finish_non_exhaustive()
    }
}

impl PipelineScheduler {
    /// Create a stopped scheduler wired to the given stores
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        timeseries: Arc<TimeSeriesStore>,
        metrics_store: Arc<MetricsStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        let processors: HashMap<String, Arc<dyn Processor>> = default_processors()
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();

        Self {
            config,
            status: Arc::new(RwLock::new(PipelineStatus::Stopped)),
            queues: Arc::new(JobQueues::default()),
            processors: Arc::new(processors),
            timeseries,
            metrics_store,
            cache,
            stats: Arc::new(SchedulerStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            maintenance: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        }
    }

    /// Spin up the worker pool and maintenance loops; idempotent
    ///
    /// A failed start leaves the status at `Error`.
    pub fn start(&self) -> PipelineResult<()> {
        {
            let mut status = self.status.write();
            if *status == PipelineStatus::Running {
                debug!("Scheduler already running, start() is a no-op");
                return Ok(());
            }
            *status = PipelineStatus::Starting;
        }

        if self.config.num_workers == 0 {
            *self.status.write() = PipelineStatus::Error;
            return Err(PipelineError::configuration(
                "num_workers must be at least 1",
            ));
        }

        self.shutdown.store(false, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());

        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.num_workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                self.config.clone(),
                Arc::clone(&self.status),
                Arc::clone(&self.queues),
                Arc::clone(&self.processors),
                Arc::clone(&self.timeseries),
                Arc::clone(&self.metrics_store),
                Arc::clone(&self.cache),
                Arc::clone(&self.stats),
                Arc::clone(&self.shutdown),
            )));
        }
        drop(workers);

        let mut maintenance = self.maintenance.lock();
        maintenance.push(tokio::spawn(cleanup_loop(
            self.config.clone(),
            Arc::clone(&self.timeseries),
            Arc::clone(&self.stats),
        )));
        maintenance.push(tokio::spawn(monitor_loop(
            self.config.clone(),
            Arc::clone(&self.queues),
        )));
        maintenance.push(tokio::spawn(stats_loop(
            self.config.clone(),
            Arc::clone(&self.stats),
        )));
        drop(maintenance);

        *self.status.write() = PipelineStatus::Running;
        info!(
            "Pipeline scheduler started with {} workers",
            self.config.num_workers
        );
        Ok(())
    }

    /// Stop the pool: signal shutdown, let workers finish their current
    /// job, abort the maintenance loops. No-op unless running or paused.
    pub async fn stop(&self) {
        {
            let status = *self.status.read();
            if status != PipelineStatus::Running && status != PipelineStatus::Paused {
                debug!("Scheduler not running, stop() is a no-op");
                return;
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }

        for handle in self.maintenance.lock().drain(..) {
            handle.abort();
        }

        *self.started_at.lock() = None;
        *self.status.write() = PipelineStatus::Stopped;
        info!("Pipeline scheduler stopped");
    }

    /// Pause job claiming; queued jobs wait until `resume()`
    pub fn pause(&self) -> PipelineResult<()> {
        let mut status = self.status.write();
        if *status != PipelineStatus::Running {
            return Err(PipelineError::not_running());
        }
        *status = PipelineStatus::Paused;
        info!("Pipeline scheduler paused");
        Ok(())
    }

    /// Resume job claiming after a pause; a no-op while running
    pub fn resume(&self) -> PipelineResult<()> {
        let mut status = self.status.write();
        match *status {
            PipelineStatus::Running => Ok(()),
            PipelineStatus::Paused => {
                *status = PipelineStatus::Running;
                info!("Pipeline scheduler resumed");
                Ok(())
            }
            _ => Err(PipelineError::not_running()),
        }
    }

    /// Accept a batch while running; builds its job synchronously and
    /// enqueues it for the pool. Never blocks the caller.
    pub fn enqueue_batch(&self, kind: JobKind, batch: DataBatch) -> PipelineResult<Uuid> {
        if *self.status.read() != PipelineStatus::Running {
            return Err(PipelineError::not_running());
        }

        let batch_id = batch.id;
        self.queues.input.lock().push_back(batch);
        self.stats.batches_ingested.fetch_add(1, Ordering::Relaxed);

        // Jobs are created synchronously from ingested batches, so the
        // input queue drains immediately
        let mut input = self.queues.input.lock();
        let mut processing = self.queues.processing.lock();
        while let Some(batch) = input.pop_front() {
            let job = ProcessingJob::new(kind, batch, self.config.default_processors.clone());
            processing.push_back(job);
        }

        Ok(batch_id)
    }

    /// Enqueue a prepared job directly, bypassing batch conversion
    pub fn submit_job(&self, job: ProcessingJob) -> PipelineResult<Uuid> {
        if *self.status.read() != PipelineStatus::Running {
            return Err(PipelineError::not_running());
        }
        let job_id = job.id;
        self.queues.processing.lock().push_back(job);
        Ok(job_id)
    }

    /// Terminal status of a finished job, if it is still retained
    pub fn finished_job(&self, job_id: Uuid) -> Option<ProcessingJob> {
        self.queues
            .output
            .lock()
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    /// Current pipeline status
    pub fn status(&self) -> PipelineStatus {
        *self.status.read()
    }

    /// Sizes of the three queues
    pub fn queue_sizes(&self) -> QueueSizes {
        self.queues.sizes()
    }

    /// Counter snapshot
    pub fn stats_snapshot(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Seconds since the last successful `start()`
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at
            .lock()
            .map_or(0, |started| started.elapsed().as_secs())
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    config: SchedulerConfig,
    status: Arc<RwLock<PipelineStatus>>,
    queues: Arc<JobQueues>,
    processors: Arc<HashMap<String, Arc<dyn Processor>>>,
    timeseries: Arc<TimeSeriesStore>,
    metrics_store: Arc<MetricsStore>,
    cache: Arc<dyn CacheStore>,
    stats: Arc<SchedulerStats>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        if *status.read() == PipelineStatus::Paused {
            tokio::time::sleep(config.processing_interval).await;
            continue;
        }

        let job = queues.processing.lock().pop_front();
        let Some(mut job) = job else {
            tokio::time::sleep(config.processing_interval).await;
            continue;
        };

        run_job(
            &mut job,
            &processors,
            &timeseries,
            &metrics_store,
            cache.as_ref(),
            &stats,
        )
        .await;

        let mut output = queues.output.lock();
        if output.len() >= config.output_queue_limit {
            output.pop_front();
        }
        output.push_back(job);
    }

    debug!("Worker {} exited", worker_id);
}

/// Run a claimed job to a terminal state. Processor failures mark the job
/// failed; storage failures are logged and do not fail the job.
async fn run_job(
    job: &mut ProcessingJob,
    processors: &HashMap<String, Arc<dyn Processor>>,
    timeseries: &TimeSeriesStore,
    metrics_store: &MetricsStore,
    cache: &dyn CacheStore,
    stats: &SchedulerStats,
) {
    job.status = JobStatus::Running;
    job.started_at = Some(Utc::now());
    let started = Instant::now();

    let mut failure: Option<String> = None;
    for name in &job.processors.clone() {
        let Some(processor) = processors.get(name) else {
            failure = Some(format!("unknown processor '{name}'"));
            break;
        };
        match processor.process(&mut job.batch).await {
            Ok(result) => {
                job.results.insert(name.clone(), result);
            }
            Err(e) => {
                failure = Some(format!("processor '{name}' failed: {e}"));
                break;
            }
        }
    }

    job.completed_at = Some(Utc::now());
    job.batch.processing_duration = Some(started.elapsed());

    match failure {
        Some(reason) => {
            job.status = JobStatus::Failed;
            job.error = Some(reason.clone());
            job.batch.error = Some(reason.clone());
            stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
            error!("Job {} failed: {}", job.id, reason);
        }
        None => {
            job.batch.processed = true;
            job.status = JobStatus::Completed;
            stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
            stats
                .points_processed
                .fetch_add(job.batch.points.len() as u64, Ordering::Relaxed);

            persist_results(job, timeseries, metrics_store, cache).await;
            debug!(
                "Job {} completed, {} points in {:?}",
                job.id,
                job.batch.points.len(),
                started.elapsed()
            );
        }
    }
}

/// Write the processed points and any aggregation rows out to the stores,
/// then place the per-group stage results in the cache as the hot copy
async fn persist_results(
    job: &ProcessingJob,
    timeseries: &TimeSeriesStore,
    metrics_store: &MetricsStore,
    cache: &dyn CacheStore,
) {
    if let Err(e) = timeseries.store_many(&job.batch.points).await {
        warn!("Failed to persist points for job {}: {}", job.id, e);
    }

    cache_hot_results(job, cache).await;

    let Some(agg) = job.results.get("aggregator") else {
        return;
    };
    let Some(results) = agg.get("results") else {
        return;
    };
    match serde_json::from_value::<HashMap<String, AggregationResult>>(results.clone()) {
        Ok(results) => {
            if let Err(e) = metrics_store.store_aggregation_results(&results).await {
                warn!("Failed to persist aggregation for job {}: {}", job.id, e);
            }
        }
        Err(e) => warn!("Malformed aggregator output for job {}: {}", job.id, e),
    }
}

/// Cache the latest aggregation and analysis result for each
/// `source:metric` group, keyed by stage, with the default TTL
async fn cache_hot_results(job: &ProcessingJob, cache: &dyn CacheStore) {
    for (stage, prefix) in [("aggregator", "aggregation"), ("analyzer", "analysis")] {
        let Some(groups) = job
            .results
            .get(stage)
            .and_then(|r| r.get("results"))
            .and_then(serde_json::Value::as_object)
        else {
            continue;
        };
        for (group, result) in groups {
            let key = format!("{prefix}:{group}");
            if let Err(e) = cache.set(&key, result.clone(), None).await {
                warn!("Failed to cache {} result for job {}: {}", stage, job.id, e);
            }
        }
    }
}

async fn cleanup_loop(
    config: SchedulerConfig,
    timeseries: Arc<TimeSeriesStore>,
    stats: Arc<SchedulerStats>,
) {
    loop {
        tokio::time::sleep(config.cleanup_interval).await;

        let cutoff = Utc::now() - chrono::Duration::days(config.retention_days);
        match timeseries.cleanup_expired(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    info!("Retention cleanup removed {} points", removed);
                    stats
                        .points_expired
                        .fetch_add(removed as u64, Ordering::Relaxed);
                }
            }
            Err(e) => warn!("Retention cleanup failed: {}", e),
        }
    }
}

/// Samples queue depths and warns past `max_queue_size`; warning-only, the
/// queues themselves stay unbounded
async fn monitor_loop(config: SchedulerConfig, queues: Arc<JobQueues>) {
    loop {
        tokio::time::sleep(config.queue_monitor_interval).await;

        let sizes = queues.sizes();
        if sizes.processing > config.max_queue_size {
            warn!(
                "Processing queue depth {} exceeds limit {}",
                sizes.processing, config.max_queue_size
            );
        }
    }
}

async fn stats_loop(config: SchedulerConfig, stats: Arc<SchedulerStats>) {
    loop {
        tokio::time::sleep(config.stats_interval).await;

        let snapshot = stats.snapshot();
        info!(
            "Pipeline stats: {} batches, {} completed, {} failed, {} points",
            snapshot.batches_ingested,
            snapshot.jobs_completed,
            snapshot.jobs_failed,
            snapshot.points_processed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::{CacheConfig, MetricsStoreConfig, TimeSeriesConfig};
    use crate::types::{DataPoint, MetricValue};
    use std::time::Duration;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn scheduler_with_config(config: SchedulerConfig) -> PipelineResult<PipelineScheduler> {
        let timeseries = Arc::new(TimeSeriesStore::new(TimeSeriesConfig {
            database_path: None,
            ..TimeSeriesConfig::default()
        })?);
        let metrics_store = Arc::new(MetricsStore::new(MetricsStoreConfig {
            database_path: None,
            ..MetricsStoreConfig::default()
        })?);
        let cache = Arc::new(MemoryCache::new(CacheConfig::default()));
        Ok(PipelineScheduler::new(config, timeseries, metrics_store, cache))
    }

    fn scheduler() -> PipelineResult<PipelineScheduler> {
        scheduler_with_config(SchedulerConfig {
            num_workers: 2,
            processing_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        })
    }

    fn batch(points: usize) -> DataBatch {
        let points = (0..points)
            .map(|i| DataPoint::new("system", "cpu", MetricValue::Number(i as f64)))
            .collect();
        DataBatch::new("system", points)
    }

    async fn wait_for_finish(
        sched: &PipelineScheduler,
        job_id: Uuid,
    ) -> Option<ProcessingJob> {
        for _ in 0..200 {
            if let Some(job) = sched.finished_job(job_id) {
                return Some(job);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_enqueue_rejected_when_stopped() -> TestResult {
        let sched = scheduler()?;
        let err = sched.enqueue_batch(JobKind::Metrics, batch(1));
        assert!(err.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() -> TestResult {
        let sched = scheduler()?;
        sched.start()?;

        let job = ProcessingJob::new(
            JobKind::Metrics,
            batch(3),
            vec!["transformer".to_string(), "aggregator".to_string()],
        );
        let job_id = sched.submit_job(job)?;

        let finished = wait_for_finish(&sched, job_id).await.ok_or("job never finished")?;
        assert_eq!(finished.status, JobStatus::Completed);
        assert!(finished.batch.processed);
        assert!(finished.results.contains_key("aggregator"));

        sched.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_job_does_not_poison_pool() -> TestResult {
        let sched = scheduler()?;
        sched.start()?;

        let bad = ProcessingJob::new(
            JobKind::Metrics,
            batch(1),
            vec!["no_such_processor".to_string()],
        );
        let bad_id = sched.submit_job(bad)?;

        let good = ProcessingJob::new(
            JobKind::Metrics,
            batch(2),
            vec!["transformer".to_string()],
        );
        let good_id = sched.submit_job(good)?;

        let bad_done = wait_for_finish(&sched, bad_id).await.ok_or("bad job lost")?;
        let good_done = wait_for_finish(&sched, good_id).await.ok_or("good job lost")?;
        assert_eq!(bad_done.status, JobStatus::Failed);
        assert!(bad_done.error.is_some());
        assert_eq!(good_done.status, JobStatus::Completed);

        let stats = sched.stats_snapshot();
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.jobs_completed, 1);

        sched.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_start_is_idempotent() -> TestResult {
        let sched = scheduler()?;
        sched.start()?;
        sched.start()?;
        assert_eq!(sched.status(), PipelineStatus::Running);
        sched.stop().await;
        sched.stop().await;
        assert_eq!(sched.status(), PipelineStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn test_output_queue_is_bounded() -> TestResult {
        let sched = scheduler_with_config(SchedulerConfig {
            num_workers: 1,
            processing_interval: Duration::from_millis(5),
            output_queue_limit: 3,
            ..SchedulerConfig::default()
        })?;
        sched.start()?;

        let mut last = None;
        for _ in 0..6 {
            let job = ProcessingJob::new(
                JobKind::Metrics,
                batch(1),
                vec!["transformer".to_string()],
            );
            last = Some(sched.submit_job(job)?);
        }
        let last = last.ok_or("no jobs submitted")?;
        wait_for_finish(&sched, last).await.ok_or("last job lost")?;

        assert!(sched.queue_sizes().output <= 3);
        sched.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_completed_job_caches_hot_results() -> TestResult {
        let timeseries = Arc::new(TimeSeriesStore::new(TimeSeriesConfig {
            database_path: None,
            ..TimeSeriesConfig::default()
        })?);
        let metrics_store = Arc::new(MetricsStore::new(MetricsStoreConfig {
            database_path: None,
            ..MetricsStoreConfig::default()
        })?);
        let cache = Arc::new(MemoryCache::new(CacheConfig::default()));
        let config = SchedulerConfig {
            num_workers: 1,
            processing_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        };
        let sched =
            PipelineScheduler::new(config, timeseries, metrics_store, cache.clone());
        sched.start()?;

        let job_id = sched.enqueue_batch(JobKind::Metrics, batch(10))?;
        wait_for_finish(&sched, job_id).await.ok_or("job never finished")?;

        assert!(cache.stats().sets >= 1);
        let hot = cache.get("aggregation:system:cpu").await?;
        let hot = hot.ok_or("no cached aggregation for the group")?;
        assert_eq!(hot.get("count").and_then(serde_json::Value::as_u64), Some(10));
        assert!(cache.get("analysis:system:cpu").await?.is_some());

        sched.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_workers_fails_start_with_error_status() -> TestResult {
        let sched = scheduler_with_config(SchedulerConfig {
            num_workers: 0,
            ..SchedulerConfig::default()
        })?;
        assert!(sched.start().is_err());
        assert_eq!(sched.status(), PipelineStatus::Error);
        assert!(sched.enqueue_batch(JobKind::Metrics, batch(1)).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_and_resume() -> TestResult {
        let sched = scheduler()?;
        sched.start()?;

        sched.pause()?;
        assert_eq!(sched.status(), PipelineStatus::Paused);
        assert!(sched.enqueue_batch(JobKind::Metrics, batch(1)).is_err());

        sched.resume()?;
        assert_eq!(sched.status(), PipelineStatus::Running);
        let job_id = sched.enqueue_batch(JobKind::Metrics, batch(1))?;
        wait_for_finish(&sched, job_id).await.ok_or("job never finished")?;

        sched.pause()?;
        sched.stop().await;
        assert_eq!(sched.status(), PipelineStatus::Stopped);
        assert!(sched.pause().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_resets_uptime() -> TestResult {
        let sched = scheduler()?;
        sched.start()?;
        sched.stop().await;
        assert_eq!(sched.uptime_seconds(), 0);
        Ok(())
    }
}
