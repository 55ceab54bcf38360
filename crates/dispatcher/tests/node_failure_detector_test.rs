mod common;

use chrono::{Duration as ChronoDuration, Utc};
use taskmesh_core::{keys, CoordinationStore, TaskResultRecord};
use taskmesh_dispatcher::{FailureDetectorConfig, NodeFailureDetector, ResultCollector};

use common::*;

fn detector(registry: &taskmesh_core::NodeRegistry) -> NodeFailureDetector {
    NodeFailureDetector::new(
        registry.clone(),
        FailureDetectorConfig {
            node_timeout: NODE_TIMEOUT,
        },
    )
}

#[tokio::test]
async fn test_config_default() {
    let config = FailureDetectorConfig::default();
    assert_eq!(config.node_timeout.as_secs(), 5);
}

#[tokio::test]
async fn test_stale_node_tasks_are_requeued() {
    let store = store();
    let registry = registry_with_cap(store.clone(), 5);
    let mut detector = detector(&registry);
    let now = Utc::now();

    let dead = live_node_at(&registry, 10.0, 10.0, now).await;
    let snapshot = registry.read_all().await.unwrap();
    assert!(detector.scan_and_recover(&snapshot, now).await.unwrap().is_empty());
    assert!(detector.active_nodes().contains(&dead));

    // 队列中的待处理任务、执行中的槽位任务，以及一个已在全局队列中的任务
    store.rpush(&keys::task_queue(dead), &payload(1)).await.unwrap();
    store.rpush(&keys::task_queue(dead), &payload(2)).await.unwrap();
    registry.claim_slot(dead, 0, &payload(3)).await.unwrap();
    registry.mark_assigned(dead, &payload(2)).await.unwrap();
    store.rpush(keys::UNASSIGNED_TASKS, &payload(1)).await.unwrap();

    let later = now + ChronoDuration::seconds(6);
    let snapshot = registry.read_all().await.unwrap();
    let reports = detector.scan_and_recover(&snapshot, later).await.unwrap();

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.node, Some(dead));
    assert_eq!(report.requeued, vec![payload(2), payload(3)]);
    assert_eq!(report.skipped_duplicates, 2);

    assert_eq!(
        store.lrange_all(keys::UNASSIGNED_TASKS).await.unwrap(),
        vec![payload(1), payload(2), payload(3)]
    );
    assert!(registry.read(dead).await.unwrap().is_none());
    assert!(!store.exists(&keys::task_queue(dead)).await.unwrap());
    assert!(!detector.active_nodes().contains(&dead));
}

#[tokio::test]
async fn test_results_of_dead_node_are_salvaged() {
    let store = store();
    let registry = registry_with_cap(store.clone(), 5);
    let mut detector = detector(&registry);
    let now = Utc::now();
    let dead = live_node_at(&registry, 10.0, 10.0, now - ChronoDuration::seconds(10)).await;

    let result = TaskResultRecord::success(4, serde_json::json!({"text": "hola"}), 0.5)
        .encode()
        .unwrap();
    store.rpush(&keys::results(dead), &result).await.unwrap();

    let snapshot = registry.read_all().await.unwrap();
    let reports = detector.scan_and_recover(&snapshot, now).await.unwrap();
    assert_eq!(reports[0].salvaged_results, vec![result]);
    assert!(reports[0].retired);
    assert!(!store.exists(&keys::results(dead)).await.unwrap());
}

#[tokio::test]
async fn test_failed_removal_still_delivers_salvaged_results() {
    let store = FaultyStore::new();
    let registry = registry_with_cap(store.clone(), 5);
    let mut detector = detector(&registry);
    let mut collector = ResultCollector::new(store.clone(), NODE_TIMEOUT);
    let now = Utc::now();
    let dead = live_node_at(&registry, 10.0, 10.0, now - ChronoDuration::seconds(10)).await;

    let result = TaskResultRecord::success(3, serde_json::json!({"text": "fin"}), 0.2)
        .encode()
        .unwrap();
    store.rpush(&keys::results(dead), &result).await.unwrap();
    store.fail_next("del", &keys::node_stats(dead));

    let snapshot = registry.read_all().await.unwrap();
    let reports = detector.scan_and_recover(&snapshot, now).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].retired);
    assert_eq!(collector.ingest_salvaged(&reports[0].salvaged_results).len(), 1);
    assert!(collector.collected().contains_key(&3));
    assert!(registry.read(dead).await.unwrap().is_some());

    // 下个周期完成删除
    let snapshot = registry.read_all().await.unwrap();
    let reports = detector.scan_and_recover(&snapshot, now).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].retired);
    assert!(registry.read(dead).await.unwrap().is_none());
    assert!(collector.ingest_salvaged(&reports[0].salvaged_results).is_empty());
}

#[tokio::test]
async fn test_one_failing_node_does_not_hide_other_reports() {
    let store = FaultyStore::new();
    let registry = registry_with_cap(store.clone(), 5);
    let mut detector = detector(&registry);
    let now = Utc::now();
    let stale_at = now - ChronoDuration::seconds(10);
    let first = live_node_at(&registry, 10.0, 10.0, stale_at).await;
    let second = live_node_at(&registry, 10.0, 10.0, stale_at).await;
    store.rpush(&keys::task_queue(second), &payload(8)).await.unwrap();
    store.fail_next("lrange_all", &keys::task_queue(first));

    let snapshot = registry.read_all().await.unwrap();
    let reports = detector.scan_and_recover(&snapshot, now).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].node, Some(second));
    assert_eq!(reports[0].requeued, vec![payload(8)]);
    assert!(registry.read(first).await.unwrap().is_some());

    let snapshot = registry.read_all().await.unwrap();
    let reports = detector.scan_and_recover(&snapshot, now).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].node, Some(first));
    assert!(registry.read(first).await.unwrap().is_none());
}

#[tokio::test]
async fn test_newly_registered_node_is_left_alone() {
    let store = store();
    let registry = registry_with_cap(store.clone(), 5);
    let mut detector = detector(&registry);
    let now = Utc::now();
    let fresh = registry.register_at("booting", now).await.unwrap();

    let snapshot = registry.read_all().await.unwrap();
    let reports = detector.scan_and_recover(&snapshot, now).await.unwrap();
    assert!(reports.is_empty());
    assert!(registry.read(fresh).await.unwrap().is_some());
    assert!(!detector.active_nodes().contains(&fresh));

    // 超时仍未发送心跳则被清理
    let later = now + ChronoDuration::seconds(6);
    let reports = detector.scan_and_recover(&snapshot, later).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(registry.read(fresh).await.unwrap().is_none());
}

#[tokio::test]
async fn test_live_nodes_are_untouched() {
    let store = store();
    let registry = registry_with_cap(store.clone(), 5);
    let mut detector = detector(&registry);
    let now = Utc::now();
    let alive = live_node_at(&registry, 10.0, 10.0, now).await;
    store.rpush(&keys::task_queue(alive), &payload(1)).await.unwrap();

    let snapshot = registry.read_all().await.unwrap();
    let reports = detector.scan_and_recover(&snapshot, now).await.unwrap();
    assert!(reports.is_empty());
    assert_eq!(store.llen(&keys::task_queue(alive)).await.unwrap(), 1);
    assert_eq!(store.llen(keys::UNASSIGNED_TASKS).await.unwrap(), 0);
}

#[tokio::test]
async fn test_vanished_node_leaves_active_set() {
    let store = store();
    let registry = registry_with_cap(store.clone(), 5);
    let mut detector = detector(&registry);
    let now = Utc::now();
    let node = live_node_at(&registry, 10.0, 10.0, now).await;

    let snapshot = registry.read_all().await.unwrap();
    detector.scan_and_recover(&snapshot, now).await.unwrap();
    registry.remove(node).await.unwrap();

    let snapshot = registry.read_all().await.unwrap();
    detector.scan_and_recover(&snapshot, now).await.unwrap();
    assert!(detector.active_nodes().is_empty());
}
