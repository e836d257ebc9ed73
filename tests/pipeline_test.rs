// ABOUTME: Scenario tests for the extract -> detect -> load pipeline over in-memory adapters
// ABOUTME: Covers watermark ordering, partial batches, event delivery, namespace isolation and hybrid pulls

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use warehouse_sync::cache::MemoryCache;
use warehouse_sync::detector::{ChangeCriteria, WatchedFields};
use warehouse_sync::memory::{MemoryPublisher, MemorySink, MemorySource};
use warehouse_sync::offset::{CacheOffsetStore, OffsetStore};
use warehouse_sync::pipeline::{EngineState, EtlPipeline, PipelineSettings, RunMode, Strategy};
use warehouse_sync::sink::PublishMode;
use warehouse_sync::{Record, RecordKey, SyncError};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn robot(id: &str, secs: i64, state: &str) -> Record {
    Record::new(id, ts(secs))
        .with_field("state", state)
        .with_field("battery", 80i64)
}

struct Harness {
    source: Arc<MemorySource>,
    sink: Arc<MemorySink>,
    publisher: Arc<MemoryPublisher>,
    offsets: Arc<CacheOffsetStore>,
    pipeline: EtlPipeline,
}

fn watched_settings(name: &str) -> PipelineSettings {
    let mut settings = PipelineSettings::new(name, "robot");
    settings.criteria = ChangeCriteria::Fields(WatchedFields::new(["state"]));
    settings.publish_mode = PublishMode::Confirmed;
    settings
}

fn harness(settings: PipelineSettings) -> Harness {
    let source = Arc::new(MemorySource::new("robots"));
    let sink = Arc::new(MemorySink::new("robot_status"));
    let publisher = Arc::new(MemoryPublisher::new());
    let cache = Arc::new(MemoryCache::new());
    let offsets = Arc::new(CacheOffsetStore::new(cache.clone(), "wsync"));

    let pipeline = EtlPipeline::new(
        settings,
        source.clone(),
        sink.clone(),
        cache,
        offsets.clone(),
    )
    .with_publisher(publisher.clone());

    Harness {
        source,
        sink,
        publisher,
        offsets,
        pipeline,
    }
}

async fn stored_offset(h: &Harness) -> Option<RecordKey> {
    h.offsets
        .get(h.pipeline.name())
        .await
        .unwrap()
        .map(|offset| offset.key())
}

#[tokio::test]
async fn test_offset_never_moves_backwards() {
    let h = harness(watched_settings("robot-status"));
    h.source
        .upsert_all([robot("A", 1, "IDLE"), robot("B", 2, "IDLE")])
        .await;

    let outcome = h.pipeline.run(RunMode::Bootstrap).await.unwrap();
    assert_eq!(outcome.accepted_count, 2);
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(2), "B")));

    h.source.upsert(robot("C", 3, "BUSY")).await;
    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.extracted, 1);
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(3), "C")));

    // A second bootstrap re-reads everything but leaves the offset where it was
    let outcome = h.pipeline.run(RunMode::Bootstrap).await.unwrap();
    assert_eq!(outcome.extracted, 3);
    assert_eq!(outcome.accepted_count, 0);
    assert_eq!(outcome.suppressed, 3);
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(3), "C")));
}

#[tokio::test]
async fn test_same_event_time_ties_break_on_entity_id() {
    let mut settings = watched_settings("robot-status");
    settings.page_size = 1;
    let h = harness(settings);
    h.source
        .upsert_all([robot("B", 5, "IDLE"), robot("A", 5, "IDLE")])
        .await;

    let outcome = h.pipeline.run(RunMode::Bootstrap).await.unwrap();

    assert_eq!(outcome.accepted_count, 2);
    assert_eq!(
        h.sink.writes().await,
        vec![RecordKey::new(ts(5), "A"), RecordKey::new(ts(5), "B")]
    );
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(5), "B")));

    // Nothing sorts after (t5, B): the next pass is empty, nothing is skipped or repeated
    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.extracted, 0);
    assert_eq!(h.sink.writes().await.len(), 2);
}

#[tokio::test]
async fn test_partial_batch_keeps_offset_at_last_loaded_record() {
    let h = harness(watched_settings("robot-status"));
    h.source
        .upsert_all((1..=5).map(|i| robot(&format!("R{}", i), i, "IDLE")))
        .await;
    h.sink.fail_on("R3").await;

    let err = h.pipeline.run(RunMode::Bootstrap).await.unwrap_err();
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::PartialLoad {
            loaded,
            attempted,
            entity_id,
            ..
        }) => {
            assert_eq!(*loaded, 2);
            assert_eq!(*attempted, 5);
            assert_eq!(entity_id, "R3");
        }
        other => panic!("expected a partial load, got {:?}", other),
    }
    assert_eq!(h.pipeline.state(), EngineState::Error);
    assert_eq!(h.sink.len().await, 2);
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(2), "R2")));

    // The next run re-extracts R3..R5 and nothing before them
    h.sink.clear_failures().await;
    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.extracted, 3);
    assert_eq!(outcome.accepted_count, 3);
    assert_eq!(h.pipeline.state(), EngineState::Stopped);
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(5), "R5")));
    assert_eq!(h.sink.len().await, 5);
}

#[tokio::test]
async fn test_cold_start_extracts_from_the_beginning() {
    let h = harness(watched_settings("sync-x"));
    h.source
        .upsert_all([robot("A", 1, "IDLE"), robot("B", 2, "IDLE")])
        .await;
    assert_eq!(stored_offset(&h).await, None);

    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();

    assert_eq!(outcome.extracted, 2);
    assert_eq!(outcome.accepted_count, 2);
    let offset = h.offsets.get("sync-x").await.unwrap().unwrap();
    assert_eq!(offset.job_name, "sync-x");
    assert_eq!(offset.key(), RecordKey::new(ts(2), "B"));
}

#[tokio::test]
async fn test_incremental_run_is_capped_by_page_limit() {
    let mut settings = watched_settings("robot-status");
    settings.page_size = 2;
    settings.max_pages_per_run = 2;
    let h = harness(settings);
    h.source
        .upsert_all((1..=7).map(|i| robot(&format!("R{}", i), i, "IDLE")))
        .await;

    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.extracted, 4);
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(4), "R4")));

    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.extracted, 3);
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(7), "R7")));
}

#[tokio::test]
async fn test_unwatched_change_is_suppressed_but_offset_advances() {
    let h = harness(watched_settings("robot-status"));
    h.source.upsert(robot("A", 1, "IDLE")).await;
    h.pipeline.run(RunMode::Incremental).await.unwrap();

    // Only the battery level moved
    h.source
        .upsert(robot("A", 2, "IDLE").with_field("battery", 40i64))
        .await;
    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();

    assert_eq!(outcome.extracted, 1);
    assert_eq!(outcome.accepted_count, 0);
    assert_eq!(outcome.suppressed, 1);
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(2), "A")));
    assert_eq!(h.publisher.published().await.len(), 1);

    h.source.upsert(robot("A", 3, "CHARGING")).await;
    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.accepted_count, 1);
    assert_eq!(h.sink.get("A").await.unwrap().event_time, ts(3));
}

#[tokio::test]
async fn test_loaded_records_are_published_to_topic() {
    let mut settings = watched_settings("robot-status");
    settings.topic = "robot-status-changed".to_string();
    let h = harness(settings);
    h.source
        .upsert_all([robot("A", 1, "IDLE"), robot("B", 2, "BUSY")])
        .await;

    h.pipeline.run(RunMode::Bootstrap).await.unwrap();

    let published = h.publisher.published().await;
    assert_eq!(published.len(), 2);
    assert!(published
        .iter()
        .all(|(topic, _)| topic == "robot-status-changed"));
    assert_eq!(published[0].1.entity_id, "A");
    assert_eq!(published[1].1.entity_id, "B");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fire_and_forget_events_keep_load_order() {
    let mut settings = watched_settings("robot-status");
    settings.publish_mode = PublishMode::FireAndForget;
    let h = harness(settings);
    h.source
        .upsert_all((0..500).map(|i| robot(&format!("R{:03}", i), i, "IDLE")))
        .await;

    let outcome = h.pipeline.run(RunMode::Bootstrap).await.unwrap();
    assert_eq!(outcome.accepted_count, 500);
    h.pipeline.flush_events().await;

    let published: Vec<String> = h
        .publisher
        .published()
        .await
        .into_iter()
        .map(|(_, record)| record.entity_id)
        .collect();
    let loaded: Vec<String> = h
        .sink
        .writes()
        .await
        .into_iter()
        .map(|key| key.entity_id)
        .collect();
    assert_eq!(published.len(), 500);
    assert_eq!(published, loaded);
}

#[tokio::test]
async fn test_publish_failure_does_not_block_the_offset() {
    let h = harness(watched_settings("robot-status"));
    h.source
        .upsert_all([robot("A", 1, "IDLE"), robot("B", 2, "IDLE")])
        .await;
    h.publisher.set_failing(true).await;

    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();

    assert_eq!(outcome.accepted_count, 2);
    assert_eq!(h.sink.len().await, 2);
    assert!(h.publisher.published().await.is_empty());
    assert_eq!(stored_offset(&h).await, Some(RecordKey::new(ts(2), "B")));
    assert_eq!(h.pipeline.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_pipelines_sharing_entity_type_keep_separate_snapshots() {
    let cache = Arc::new(MemoryCache::new());
    let offsets = Arc::new(CacheOffsetStore::new(cache.clone(), "wsync"));
    let vendor_a_source = Arc::new(MemorySource::new("vendor_a_robots"));
    let vendor_b_source = Arc::new(MemorySource::new("vendor_b_robots"));
    let sink = Arc::new(MemorySink::new("robot_status"));
    vendor_a_source.upsert(robot("R1", 1, "IDLE")).await;
    vendor_b_source.upsert(robot("R1", 1, "IDLE")).await;

    let vendor_a = EtlPipeline::new(
        watched_settings("vendor-a-robots"),
        vendor_a_source.clone(),
        sink.clone(),
        cache.clone(),
        offsets.clone(),
    );
    let vendor_b = EtlPipeline::new(
        watched_settings("vendor-b-robots"),
        vendor_b_source.clone(),
        sink.clone(),
        cache.clone(),
        offsets.clone(),
    );

    let outcome = vendor_a.run(RunMode::Bootstrap).await.unwrap();
    assert_eq!(outcome.accepted_count, 1);
    // Same entity type and id, but vendor B has never emitted R1
    let outcome = vendor_b.run(RunMode::Bootstrap).await.unwrap();
    assert_eq!(outcome.accepted_count, 1);
    assert_eq!(outcome.suppressed, 0);
    assert_eq!(sink.writes().await.len(), 2);

    // Resetting one pipeline leaves the other's snapshots alone
    assert_eq!(vendor_a.clear_snapshots().await.unwrap(), 1);
    assert_eq!(vendor_b.status().await.cached_entities, Some(1));
    assert_ne!(
        vendor_a.status().await.snapshot_namespace,
        vendor_b.status().await.snapshot_namespace
    );

    vendor_b_source.upsert(robot("R1", 2, "IDLE")).await;
    let outcome = vendor_b.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.suppressed, 1);
    assert_eq!(outcome.accepted_count, 0);
}

#[tokio::test]
async fn test_unreachable_source_yields_empty_run_and_unhealthy_pipeline() {
    let h = harness(watched_settings("robot-status"));
    h.source.upsert(robot("A", 1, "IDLE")).await;
    h.source.set_available(false).await;

    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();

    assert_eq!(outcome.extracted, 0);
    assert_eq!(outcome.accepted_count, 0);
    assert!(outcome.extraction_error.is_some());
    assert!(!h.pipeline.is_connected());
    assert!(!h.pipeline.is_healthy().await);
    assert!(h.sink.is_empty().await);
    assert_eq!(stored_offset(&h).await, None);

    // Recovers on its own once the source answers again
    h.source.set_available(true).await;
    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.accepted_count, 1);
    assert!(h.pipeline.is_connected());
}

#[tokio::test]
async fn test_slow_source_hits_io_deadline() {
    let mut settings = watched_settings("robot-status");
    settings.io_timeout = Duration::from_millis(50);
    let h = harness(settings);
    h.source.upsert(robot("A", 1, "IDLE")).await;
    h.source.set_latency(Some(Duration::from_secs(2))).await;

    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();

    let error = outcome.extraction_error.unwrap();
    assert!(error.contains("timed out"), "unexpected error: {}", error);
    assert!(!h.pipeline.is_connected());
    assert!(h.sink.is_empty().await);
}

#[tokio::test]
async fn test_preflight_reports_missing_tables() {
    let h = harness(watched_settings("robot-status"));
    h.sink.set_table_exists(false).await;

    let err = h.pipeline.preflight().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::SchemaMissing(_))
    ));
    assert_eq!(h.pipeline.state(), EngineState::Error);

    h.sink.set_table_exists(true).await;
    h.pipeline.preflight().await.unwrap();
    assert!(h.pipeline.is_connected());
}

#[tokio::test]
async fn test_stats_average_is_total_time_over_runs() {
    let h = harness(watched_settings("robot-status"));
    h.source.upsert(robot("A", 1, "IDLE")).await;

    for _ in 0..3 {
        h.pipeline.run(RunMode::Incremental).await.unwrap();
    }

    let stats = h.pipeline.stats();
    assert_eq!(stats.runs, 3);
    assert_eq!(stats.total_extracted, 1);
    assert_eq!(stats.total_loaded, 1);
    assert_eq!(
        stats.average_processing_time_ms,
        stats.total_execution_time_ms as f64 / 3.0
    );
    assert!(stats.last_execution_time.is_some());
}

#[tokio::test]
async fn test_hybrid_pipeline_emits_only_changes() {
    let mut settings = PipelineSettings::new("pod-status", "pod");
    settings.strategy = Strategy::Hybrid {
        full_sync_interval: Duration::from_secs(600),
    };
    settings.criteria = ChangeCriteria::FullRecord;
    settings.compare_event_time = true;
    settings.publish_mode = PublishMode::Confirmed;
    let h = harness(settings);
    h.source
        .upsert_all([robot("P1", 1, "IDLE"), robot("P2", 2, "IDLE")])
        .await;

    let outcome = h.pipeline.run(RunMode::Bootstrap).await.unwrap();
    assert_eq!(outcome.accepted_count, 2);
    assert_eq!(h.source.full_pulls(), 1);

    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.accepted_count, 0);
    assert_eq!(h.source.incremental_pulls(), 1);

    h.source.upsert(robot("P1", 3, "BUSY")).await;
    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.accepted_count, 1);
    assert_eq!(h.sink.get("P1").await.unwrap().event_time, ts(3));

    let status = h.pipeline.status().await;
    assert_eq!(status.strategy, "hybrid");
    assert_eq!(status.cached_entities, Some(2));
    assert!(status.offset.is_none());
}

#[tokio::test]
async fn test_hybrid_failed_load_is_retried() {
    let mut settings = PipelineSettings::new("pod-status", "pod");
    settings.strategy = Strategy::Hybrid {
        full_sync_interval: Duration::from_secs(600),
    };
    settings.compare_event_time = true;
    let h = harness(settings);
    h.source.upsert(robot("P1", 1, "IDLE")).await;
    h.sink.fail_on("P1").await;

    assert!(h.pipeline.run(RunMode::Bootstrap).await.is_err());
    assert!(h.sink.is_empty().await);

    h.sink.clear_failures().await;
    let outcome = h.pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(outcome.accepted_count, 1);
    assert_eq!(h.sink.len().await, 1);
}
