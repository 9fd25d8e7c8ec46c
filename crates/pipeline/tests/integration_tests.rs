//! End-to-end pipeline tests: ingestion through processing to storage,
//! job isolation, cache TTL semantics and durable round-trips.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use flowmetrics_pipeline::cache::{build_cache, CacheStore, MemoryCache};
use flowmetrics_pipeline::config::{
    CacheBackend, CacheConfig, MetricsStoreConfig, SchedulerConfig, TimeSeriesConfig,
};
use flowmetrics_pipeline::scheduler::PipelineScheduler;
use flowmetrics_pipeline::storage::{MetricsStore, TimeSeriesStore};
use flowmetrics_pipeline::types::{JobKind, JobStatus, MetricValue, ProcessingJob};
use flowmetrics_pipeline::{
    DataBatch, DataPoint, DataPointFilter, MetricsPipeline, PipelineConfig, PipelineStatus,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn running_pipeline() -> Result<MetricsPipeline, Box<dyn std::error::Error>> {
    let mut config = PipelineConfig::in_memory();
    config.scheduler.num_workers = 2;
    config.scheduler.processing_interval = Duration::from_millis(10);
    let pipeline = MetricsPipeline::new(config).await?;
    pipeline.start()?;
    Ok(pipeline)
}

fn numeric_points(source: &str, metric: &str, values: &[f64]) -> Vec<DataPoint> {
    values
        .iter()
        .map(|v| DataPoint::new(source, metric, MetricValue::Number(*v)))
        .collect()
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn ingested_batch_eventually_reaches_terminal_state() -> TestResult {
    let pipeline = running_pipeline().await?;

    pipeline.ingest(numeric_points("system", "cpu", &[1.0, 2.0, 3.0]), "system")?;

    let done = wait_until(|| pipeline.get_status().stats.jobs_completed >= 1).await;
    assert!(done, "job never reached a terminal state");

    pipeline.stop().await;
    Ok(())
}

#[tokio::test]
async fn ingest_rejected_when_not_running() -> TestResult {
    let pipeline = MetricsPipeline::new(PipelineConfig::in_memory()).await?;
    let result = pipeline.ingest(numeric_points("system", "cpu", &[1.0]), "system");
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn stop_is_a_noop_when_not_running() -> TestResult {
    let pipeline = MetricsPipeline::new(PipelineConfig::in_memory()).await?;
    pipeline.stop().await;
    assert_eq!(pipeline.get_status().status, PipelineStatus::Stopped);
    Ok(())
}

#[tokio::test]
async fn failing_job_does_not_affect_other_jobs() -> TestResult {
    let timeseries = Arc::new(TimeSeriesStore::new(TimeSeriesConfig {
        database_path: None,
        ..TimeSeriesConfig::default()
    })?);
    let metrics_store = Arc::new(MetricsStore::new(MetricsStoreConfig {
        database_path: None,
        ..MetricsStoreConfig::default()
    })?);
    let config = SchedulerConfig {
        num_workers: 2,
        processing_interval: Duration::from_millis(10),
        ..SchedulerConfig::default()
    };
    let cache = Arc::new(MemoryCache::new(CacheConfig::default()));
    let scheduler = PipelineScheduler::new(config, timeseries, metrics_store, cache);
    scheduler.start()?;

    let bad = ProcessingJob::new(
        JobKind::Metrics,
        DataBatch::new("system", numeric_points("system", "cpu", &[1.0])),
        vec!["does_not_exist".to_string()],
    );
    let bad_id = scheduler.submit_job(bad)?;

    let good = ProcessingJob::new(
        JobKind::Metrics,
        DataBatch::new("system", numeric_points("system", "cpu", &[2.0, 3.0])),
        vec!["transformer".to_string(), "aggregator".to_string()],
    );
    let good_id = scheduler.submit_job(good)?;

    let both_done = wait_until(|| {
        scheduler.finished_job(bad_id).is_some() && scheduler.finished_job(good_id).is_some()
    })
    .await;
    assert!(both_done, "jobs never finished");

    let bad = scheduler.finished_job(bad_id).ok_or("bad job missing")?;
    let good = scheduler.finished_job(good_id).ok_or("good job missing")?;
    assert_eq!(bad.status, JobStatus::Failed);
    assert_eq!(good.status, JobStatus::Completed);
    assert!(good.error.is_none());

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn processed_points_round_trip_through_storage() -> TestResult {
    let pipeline = running_pipeline().await?;

    let start = Utc::now() - ChronoDuration::minutes(1);
    pipeline.ingest(
        numeric_points("web_server", "response_time", &[120.0, 95.0, 143.0]),
        "web_server",
    )?;

    let stored = wait_until(|| pipeline.get_status().stats.points_processed >= 3).await;
    assert!(stored, "points never processed");
    // Persistence happens right after job completion
    tokio::time::sleep(Duration::from_millis(100)).await;

    let end = Utc::now() + ChronoDuration::minutes(1);
    let filter = DataPointFilter {
        source: Some("web_server".to_string()),
        metric_name: Some("response_time".to_string()),
        start_time: Some(start),
        end_time: Some(end),
        ..DataPointFilter::default()
    };
    let points = pipeline.query_data(&filter).await?;
    assert_eq!(points.len(), 3);
    for point in &points {
        assert_eq!(point.source, "web_server");
        assert_eq!(point.metric_name, "response_time");
        assert!(point.timestamp >= start && point.timestamp <= end);
    }

    pipeline.stop().await;
    Ok(())
}

#[tokio::test]
async fn component_metrics_become_points() -> TestResult {
    let pipeline = running_pipeline().await?;

    let mut metrics = HashMap::new();
    metrics.insert("requests_total".to_string(), json!(1024));
    metrics.insert("healthy".to_string(), json!(true));
    pipeline.store_component_metrics("api_gateway", metrics)?;

    let done = wait_until(|| pipeline.get_status().stats.points_processed >= 2).await;
    assert!(done);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let filter = DataPointFilter {
        source: Some("api_gateway".to_string()),
        ..DataPointFilter::default()
    };
    let points = pipeline.query_data(&filter).await?;
    assert_eq!(points.len(), 2);

    pipeline.stop().await;
    Ok(())
}

#[tokio::test]
async fn report_ingestion_is_accepted() -> TestResult {
    let pipeline = running_pipeline().await?;

    pipeline.store_report("weekly_activity", json!({"events": 42}))?;
    let done = wait_until(|| pipeline.get_status().stats.jobs_completed >= 1).await;
    assert!(done);

    pipeline.stop().await;
    Ok(())
}

#[tokio::test]
async fn health_status_reflects_running_pipeline() -> TestResult {
    let pipeline = running_pipeline().await?;

    let health = pipeline.get_health_status().await;
    assert!(health.healthy);
    assert!(health.health_score > 90.0);
    assert_eq!(health.stores.len(), 3);

    let status = pipeline.get_status();
    assert!(status.running);
    assert_eq!(status.status, PipelineStatus::Running);

    pipeline.stop().await;
    assert!(!pipeline.get_status().running);
    Ok(())
}

#[tokio::test]
async fn cache_ttl_expires_entries() -> TestResult {
    let config = CacheConfig {
        backend: CacheBackend::Memory,
        ..CacheConfig::default()
    };
    let cache = build_cache(&config).await?;

    cache
        .set("session", json!("token"), Some(Duration::from_secs(1)))
        .await?;
    assert_eq!(cache.get("session").await?, Some(json!("token")));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(cache.get("session").await?, None);
    Ok(())
}

#[tokio::test]
async fn cache_eviction_keeps_capacity_bounded() -> TestResult {
    let cache = MemoryCache::new(CacheConfig {
        max_entries: 20,
        ..CacheConfig::default()
    });

    for i in 0..40 {
        cache.set(&format!("key_{i}"), json!(i), None).await?;
    }

    let stats = cache.stats();
    assert!(stats.evictions > 0);
    assert_eq!(stats.sets, 40);
    Ok(())
}

#[tokio::test]
async fn sqlite_cache_survives_reopen_in_pipeline_config() -> TestResult {
    let dir = tempfile::tempdir()?;
    let config = CacheConfig {
        backend: CacheBackend::EmbeddedSql,
        database_path: Some(dir.path().join("cache.db")),
        ..CacheConfig::default()
    };

    {
        let cache = build_cache(&config).await?;
        cache.set("persisted", json!({"a": 1}), None).await?;
    }

    let cache = build_cache(&config).await?;
    assert_eq!(cache.get("persisted").await?, Some(json!({"a": 1})));
    Ok(())
}

#[tokio::test]
async fn completed_jobs_place_hot_results_in_cache() -> TestResult {
    let pipeline = running_pipeline().await?;

    let values: Vec<f64> = (0..10).map(f64::from).collect();
    pipeline.ingest(numeric_points("system", "cpu", &values), "system")?;

    let done = wait_until(|| pipeline.get_status().stats.jobs_completed >= 1).await;
    assert!(done, "job never completed");

    assert!(pipeline.cache().stats().sets >= 1);
    let hot = pipeline
        .cache()
        .get("aggregation:system:cpu")
        .await?
        .ok_or("no cached aggregation for the processed group")?;
    assert_eq!(hot.get("count").and_then(serde_json::Value::as_u64), Some(10));

    pipeline.stop().await;
    Ok(())
}

#[tokio::test]
async fn pause_suspends_ingestion_until_resume() -> TestResult {
    let pipeline = running_pipeline().await?;

    pipeline.pause()?;
    assert_eq!(pipeline.get_status().status, PipelineStatus::Paused);
    assert!(pipeline
        .ingest(numeric_points("system", "cpu", &[1.0]), "system")
        .is_err());

    pipeline.resume()?;
    pipeline.ingest(numeric_points("system", "cpu", &[1.0]), "system")?;
    let done = wait_until(|| pipeline.get_status().stats.jobs_completed >= 1).await;
    assert!(done, "job never completed after resume");

    pipeline.stop().await;
    Ok(())
}

#[tokio::test]
async fn stopped_pipeline_reports_zero_uptime() -> TestResult {
    let pipeline = running_pipeline().await?;
    pipeline.stop().await;

    let status = pipeline.get_status();
    assert_eq!(status.status, PipelineStatus::Stopped);
    assert_eq!(status.uptime_seconds, 0);
    assert!(!status.running);
    Ok(())
}
