use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskmesh_core::{
    keys, CoordinationStore, NodeId, NodeRegistry, ResourceSnapshot, SchedulerError,
    SchedulerResult, TaskEnvelope, TaskResultRecord, WorkerConfig,
};
use taskmesh_infrastructure::{InMemoryCoordinationStore, ResourceProbe, StaticResourceProbe};
use tokio::sync::{broadcast, Semaphore};

use crate::executors::{HandlerRegistry, TaskHandler};
use crate::service::{ControlStep, WorkerService};

/// 按顺序返回预设采样，最后一个值一直保留
struct ScriptedProbe {
    samples: Mutex<VecDeque<ResourceSnapshot>>,
}

impl ScriptedProbe {
    fn new(samples: &[ResourceSnapshot]) -> Self {
        Self {
            samples: Mutex::new(samples.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl ResourceProbe for ScriptedProbe {
    async fn sample(&self) -> SchedulerResult<ResourceSnapshot> {
        let mut samples = self.samples.lock().unwrap();
        let next = if samples.len() > 1 {
            samples.pop_front()
        } else {
            samples.front().copied()
        };
        Ok(next.unwrap_or_else(ResourceSnapshot::fully_loaded))
    }
}

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn kind(&self) -> &'static str {
        "transcription"
    }

    async fn execute(&self, task: &TaskEnvelope) -> SchedulerResult<Value> {
        Ok(json!({ "text": format!("echo {}", task.index) }))
    }
}

struct FailingHandler;

#[async_trait]
impl TaskHandler for FailingHandler {
    fn kind(&self) -> &'static str {
        "transcription"
    }

    async fn execute(&self, _task: &TaskEnvelope) -> SchedulerResult<Value> {
        Err(SchedulerError::task_execution("decoder crashed"))
    }
}

/// 拿到许可后才返回
struct GatedHandler {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl TaskHandler for GatedHandler {
    fn kind(&self) -> &'static str {
        "transcription"
    }

    async fn execute(&self, task: &TaskEnvelope) -> SchedulerResult<Value> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| SchedulerError::task_execution(e.to_string()))?;
        permit.forget();
        Ok(json!({ "index": task.index }))
    }
}

fn idle() -> ResourceSnapshot {
    ResourceSnapshot::new(10.0, 10.0, 10.0)
}

fn busy() -> ResourceSnapshot {
    ResourceSnapshot::new(95.0, 10.0, 10.0)
}

fn test_config(max_concurrent_tasks: u32) -> WorkerConfig {
    WorkerConfig {
        max_concurrent_tasks,
        heartbeat_interval_ms: 20,
        pop_timeout_ms: 50,
        join_timeout_seconds: 1,
        max_task_attempts: 2,
        ..WorkerConfig::default()
    }
}

async fn service_with(
    probe: Arc<dyn ResourceProbe>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
) -> WorkerService {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let mut handlers = HandlerRegistry::new();
    handlers.register(handler);
    WorkerService::builder(NodeRegistry::new(store), probe)
        .config(config)
        .handlers(handlers)
        .hostname("test-host")
        .build()
        .await
        .unwrap()
}

async fn push_task(service: &WorkerService, task: &TaskEnvelope) {
    service
        .registry()
        .store()
        .rpush(&keys::task_queue(service.node()), &task.encode().unwrap())
        .await
        .unwrap();
}

async fn results(service: &WorkerService) -> Vec<TaskResultRecord> {
    service
        .registry()
        .store()
        .lrange_all(&keys::results(service.node()))
        .await
        .unwrap()
        .iter()
        .map(|raw| TaskResultRecord::decode(raw).unwrap())
        .collect()
}

async fn wait_for_results(service: &WorkerService, count: usize) -> Vec<TaskResultRecord> {
    for _ in 0..200 {
        let current = results(service).await;
        if current.len() >= count {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("等待 {count} 个结果超时");
}

#[tokio::test]
async fn test_dispatches_and_reports_result() {
    let service = service_with(
        Arc::new(StaticResourceProbe::new(idle())),
        Arc::new(EchoHandler),
        test_config(2),
    )
    .await;
    let pool = service.start_pool();
    push_task(&service, &TaskEnvelope::transcription(3, "audios/3.mp3")).await;

    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Dispatched);
    let results = wait_for_results(&service, 1).await;
    assert_eq!(results[0].index, 3);
    assert_eq!(results[0].payload["text"], "echo 3");
    assert_eq!(results[0].node, Some(service.node()));

    pool.shutdown().await;
    let record = service.registry().read(service.node()).await.unwrap().unwrap();
    assert_eq!(record.active_task_count, 0);
    assert!(record.slot_markers.is_empty());
    assert!(record.last_time >= 0.0);
}

#[tokio::test]
async fn test_empty_queue_is_idle() {
    let service = service_with(
        Arc::new(StaticResourceProbe::new(idle())),
        Arc::new(EchoHandler),
        test_config(2),
    )
    .await;
    let pool = service.start_pool();
    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Idle);
}

#[tokio::test]
async fn test_overloaded_node_does_not_pop() {
    let service = service_with(
        Arc::new(StaticResourceProbe::new(busy())),
        Arc::new(EchoHandler),
        test_config(2),
    )
    .await;
    let pool = service.start_pool();
    push_task(&service, &TaskEnvelope::transcription(0, "a.mp3")).await;

    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Overloaded);
    let store = service.registry().store();
    assert_eq!(store.llen(&keys::task_queue(service.node())).await.unwrap(), 1);

    let record = service.registry().read(service.node()).await.unwrap().unwrap();
    assert!(record.is_overloaded());
}

#[tokio::test]
async fn test_task_popped_while_overloaded_is_returned() {
    let probe = Arc::new(ScriptedProbe::new(&[idle(), busy()]));
    let service = service_with(probe, Arc::new(EchoHandler), test_config(2)).await;
    let pool = service.start_pool();
    let task = TaskEnvelope::transcription(0, "a.mp3");
    push_task(&service, &task).await;

    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Returned);
    let queue = service
        .registry()
        .store()
        .lrange_all(&keys::task_queue(service.node()))
        .await
        .unwrap();
    assert_eq!(queue, vec![task.encode().unwrap()]);
    assert_eq!(pool.in_flight(), 0);
}

#[tokio::test]
async fn test_active_tasks_never_exceed_capacity() {
    let gate = Arc::new(Semaphore::new(0));
    let service = service_with(
        Arc::new(StaticResourceProbe::new(idle())),
        Arc::new(GatedHandler { gate: gate.clone() }),
        test_config(2),
    )
    .await;
    let pool = service.start_pool();
    for index in 0..5 {
        push_task(&service, &TaskEnvelope::transcription(index, "a.mp3")).await;
    }

    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Dispatched);
    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Dispatched);
    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::AtCapacity);

    gate.add_permits(5);
    for _ in 0..100 {
        service.step(&pool).await.unwrap();
        assert!(pool.in_flight() <= 2);
        let record = service.registry().read(service.node()).await.unwrap().unwrap();
        assert!(record.active_task_count <= record.max_concurrent_tasks);
        if results(&service).await.len() == 5 {
            break;
        }
    }

    let mut indices: Vec<u64> = wait_for_results(&service, 5)
        .await
        .iter()
        .map(|r| r.index)
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_handler_failure_requeues_then_reports() {
    let service = service_with(
        Arc::new(StaticResourceProbe::new(idle())),
        Arc::new(FailingHandler),
        test_config(2),
    )
    .await;
    let store = service.registry().store().clone();
    let pool = service.start_pool();
    push_task(&service, &TaskEnvelope::transcription(8, "a.mp3")).await;
    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Dispatched);

    let mut retried = None;
    for _ in 0..200 {
        if let Some(raw) = store.lpop(keys::UNASSIGNED_TASKS).await.unwrap() {
            retried = Some(raw);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let retried = TaskEnvelope::decode(&retried.expect("任务应被重新放回全局队列")).unwrap();
    assert_eq!(retried.index, 8);
    assert_eq!(retried.attempts, 1);
    assert!(results(&service).await.is_empty());

    push_task(&service, &retried).await;
    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Dispatched);
    let results = wait_for_results(&service, 1).await;
    assert!(!results[0].is_success());
    assert!(results[0].error.as_deref().unwrap().contains("decoder crashed"));
    assert_eq!(store.llen(keys::UNASSIGNED_TASKS).await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_payload_is_dropped() {
    let service = service_with(
        Arc::new(StaticResourceProbe::new(idle())),
        Arc::new(EchoHandler),
        test_config(2),
    )
    .await;
    let pool = service.start_pool();
    service
        .registry()
        .store()
        .rpush(&keys::task_queue(service.node()), "{broken")
        .await
        .unwrap();

    assert_eq!(service.step(&pool).await.unwrap(), ControlStep::Dispatched);
    pool.shutdown().await;
    assert!(results(&service).await.is_empty());
    let record = service.registry().read(service.node()).await.unwrap().unwrap();
    assert_eq!(record.active_task_count, 0);
}

#[tokio::test]
async fn test_reregisters_when_record_is_reclaimed() {
    let service = service_with(
        Arc::new(StaticResourceProbe::new(idle())),
        Arc::new(EchoHandler),
        test_config(2),
    )
    .await;
    let pool = service.start_pool();
    assert_eq!(service.node(), NodeId(1));

    service.registry().remove(NodeId(1)).await.unwrap();
    service.step(&pool).await.unwrap();
    assert_eq!(service.node(), NodeId(2));
    assert!(service.registry().read(NodeId(2)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_run_processes_until_shutdown() {
    let service = service_with(
        Arc::new(StaticResourceProbe::new(idle())),
        Arc::new(EchoHandler),
        test_config(2),
    )
    .await;
    push_task(&service, &TaskEnvelope::transcription(1, "a.mp3")).await;
    let store = service.registry().store().clone();
    let results_key = keys::results(service.node());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { service.run(shutdown_rx).await });

    let mut delivered = false;
    for _ in 0..200 {
        if store.llen(&results_key).await.unwrap() == 1 {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
