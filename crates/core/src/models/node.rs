use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::fields;
use crate::SchedulerError;

/// 节点唯一标识，由全局计数器单调分配，渲染为 `node{n}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("node")
            .and_then(|n| n.parse::<u64>().ok())
            .map(NodeId)
            .ok_or_else(|| SchedulerError::MalformedRecord(format!("无效的节点ID: {s}")))
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for NodeId {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// 节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Available,
    Overloaded,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Available => "available",
            NodeStatus::Overloaded => "overloaded",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(NodeStatus::Available),
            "overloaded" => Ok(NodeStatus::Overloaded),
            other => Err(SchedulerError::MalformedRecord(format!("无效的节点状态: {other}"))),
        }
    }
}

/// 节点上报的资源使用率（百分比）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
}

impl ResourceSnapshot {
    pub fn new(cpu: f64, ram: f64, disk: f64) -> Self {
        Self { cpu, ram, disk }
    }

    /// 注册时使用的悲观值，保证节点在首次心跳前不会被选中
    pub fn fully_loaded() -> Self {
        Self::new(100.0, 100.0, 100.0)
    }
}

/// 活跃性判断必须存在的字段
const REQUIRED_FIELDS: [&str; 4] = [
    fields::CPU,
    fields::RAM,
    fields::DISK,
    fields::LAST_HEARTBEAT,
];

/// 注册表中的节点记录
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub resources: ResourceSnapshot,
    pub status: NodeStatus,
    pub active_task_count: u32,
    pub max_concurrent_tasks: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
    pub avg_time: f64,
    pub last_time: f64,
    pub hostname: Option<String>,
    /// Dispatcher最近一次分配的任务负载
    pub assigned_task: Option<String>,
    /// 每个执行槽位正在运行的任务负载
    pub slot_markers: BTreeMap<usize, String>,
    /// 所有必需字段都存在且可解析
    pub complete: bool,
}

impl NodeRecord {
    /// 从存储中的哈希字段构建记录
    ///
    /// 缺失或无法解析的资源字段按满负载处理，并将记录标记为不完整，
    /// 不完整的记录永远不会被判定为存活。
    pub fn from_fields(id: NodeId, raw: &HashMap<String, String>) -> Self {
        let float = |name: &str| raw.get(name).and_then(|v| v.trim().parse::<f64>().ok());
        let count = |name: &str| {
            raw.get(name)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(|v| v.max(0) as u32)
        };

        let complete = REQUIRED_FIELDS.iter().all(|name| float(name).is_some());

        let mut slot_markers = BTreeMap::new();
        for (field, value) in raw {
            if let Some(slot) = fields::parse_slot_marker(field) {
                slot_markers.insert(slot, value.clone());
            }
        }

        Self {
            id,
            resources: ResourceSnapshot {
                cpu: float(fields::CPU).unwrap_or(100.0),
                ram: float(fields::RAM).unwrap_or(100.0),
                disk: float(fields::DISK).unwrap_or(100.0),
            },
            status: raw
                .get(fields::STATUS)
                .and_then(|s| s.parse().ok())
                .unwrap_or(NodeStatus::Available),
            active_task_count: count(fields::TASKS).unwrap_or(0),
            max_concurrent_tasks: count(fields::MAX_TASKS).unwrap_or(1).max(1),
            last_heartbeat: float(fields::LAST_HEARTBEAT).and_then(from_epoch_seconds),
            registered_at: float(fields::REGISTERED_AT).and_then(from_epoch_seconds),
            avg_time: float(fields::AVG_TIME).unwrap_or(0.0),
            last_time: float(fields::LAST_TIME).unwrap_or(0.0),
            hostname: raw.get(fields::HOSTNAME).cloned(),
            assigned_task: raw.get(fields::CURRENT_TASK).cloned(),
            slot_markers,
            complete,
        }
    }

    /// 节点存活: 记录完整且最近一次心跳没有超时
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !self.complete {
            return false;
        }
        match self.last_heartbeat {
            Some(heartbeat) => (now - heartbeat).num_milliseconds() <= timeout.as_millis() as i64,
            None => false,
        }
    }

    /// 节点已失联: 不存活，且最近的心跳（或注册时间）已经超过超时时间
    ///
    /// 刚注册、尚未发送第一次心跳的节点不算失联。
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.is_alive(now, timeout) {
            return false;
        }
        match self.last_heartbeat.or(self.registered_at) {
            Some(seen) => (now - seen).num_milliseconds() > timeout.as_millis() as i64,
            None => true,
        }
    }

    pub fn is_overloaded(&self) -> bool {
        self.status == NodeStatus::Overloaded
    }

    pub fn has_capacity(&self) -> bool {
        self.active_task_count < self.max_concurrent_tasks
    }

    /// 分配标记和所有槽位标记，去重后按槽位顺序返回
    pub fn in_flight_markers(&self) -> Vec<String> {
        let mut markers: Vec<String> = Vec::new();
        if let Some(assigned) = &self.assigned_task {
            markers.push(assigned.clone());
        }
        for payload in self.slot_markers.values() {
            if !markers.contains(payload) {
                markers.push(payload.clone());
            }
        }
        markers
    }
}

/// 一个调度周期内使用的注册表快照
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub nodes: BTreeMap<NodeId, NodeRecord>,
}

impl RegistrySnapshot {
    pub fn new(records: impl IntoIterator<Item = NodeRecord>) -> Self {
        Self {
            nodes: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&id)
    }

    /// 按节点ID升序遍历
    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn alive(&self, now: DateTime<Utc>, timeout: Duration) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values().filter(move |r| r.is_alive(now, timeout))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub fn to_epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn raw_record(now: DateTime<Utc>, heartbeat_age_secs: i64) -> HashMap<String, String> {
        let heartbeat = now - ChronoDuration::seconds(heartbeat_age_secs);
        HashMap::from([
            ("cpu".to_string(), "20.5".to_string()),
            ("ram".to_string(), "40".to_string()),
            ("disk".to_string(), "10".to_string()),
            ("status".to_string(), "available".to_string()),
            ("tasks".to_string(), "1".to_string()),
            ("max_tasks".to_string(), "3".to_string()),
            (
                "last_heartbeat".to_string(),
                to_epoch_seconds(heartbeat).to_string(),
            ),
        ])
    }

    #[test]
    fn test_node_id_parse_and_display() {
        let id: NodeId = "node42".parse().unwrap();
        assert_eq!(id, NodeId(42));
        assert_eq!(id.to_string(), "node42");
        assert!("worker-1".parse::<NodeId>().is_err());
        assert!("node".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_ordering_is_numeric() {
        assert!(NodeId(2) < NodeId(10));
    }

    #[test]
    fn test_record_from_fields() {
        let now = Utc::now();
        let mut raw = raw_record(now, 1);
        raw.insert("current_task:0".to_string(), "{\"index\":1}".to_string());
        raw.insert("current_task".to_string(), "{\"index\":2}".to_string());

        let record = NodeRecord::from_fields(NodeId(1), &raw);
        assert!(record.complete);
        assert_eq!(record.resources.cpu, 20.5);
        assert_eq!(record.active_task_count, 1);
        assert_eq!(record.max_concurrent_tasks, 3);
        assert_eq!(record.slot_markers.get(&0).unwrap(), "{\"index\":1}");
        assert_eq!(
            record.in_flight_markers(),
            vec!["{\"index\":2}".to_string(), "{\"index\":1}".to_string()]
        );
    }

    #[test]
    fn test_heartbeat_timeout() {
        let now = Utc::now();
        let timeout = Duration::from_secs(5);

        let fresh = NodeRecord::from_fields(NodeId(1), &raw_record(now, 1));
        assert!(fresh.is_alive(now, timeout));
        assert!(!fresh.is_stale(now, timeout));

        let old = NodeRecord::from_fields(NodeId(2), &raw_record(now, 6));
        assert!(!old.is_alive(now, timeout));
        assert!(old.is_stale(now, timeout));
    }

    #[test]
    fn test_incomplete_record_is_never_alive() {
        let now = Utc::now();
        let mut raw = raw_record(now, 0);
        raw.remove("disk");
        let record = NodeRecord::from_fields(NodeId(1), &raw);
        assert!(!record.complete);
        assert!(!record.is_alive(now, Duration::from_secs(5)));
    }

    #[test]
    fn test_freshly_registered_node_is_not_stale() {
        let now = Utc::now();
        let raw = HashMap::from([
            ("cpu".to_string(), "100".to_string()),
            ("ram".to_string(), "100".to_string()),
            ("disk".to_string(), "100".to_string()),
            ("registered_at".to_string(), to_epoch_seconds(now).to_string()),
        ]);
        let record = NodeRecord::from_fields(NodeId(1), &raw);
        let timeout = Duration::from_secs(5);
        assert!(!record.is_alive(now, timeout));
        assert!(!record.is_stale(now, timeout));
        assert!(record.is_stale(now + ChronoDuration::seconds(6), timeout));
    }

    #[test]
    fn test_negative_task_count_is_clamped() {
        let now = Utc::now();
        let mut raw = raw_record(now, 0);
        raw.insert("tasks".to_string(), "-2".to_string());
        let record = NodeRecord::from_fields(NodeId(1), &raw);
        assert_eq!(record.active_task_count, 0);
    }

    #[test]
    fn test_node_id_serde_as_string() {
        let json = serde_json::to_string(&NodeId(5)).unwrap();
        assert_eq!(json, "\"node5\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeId(5));
    }
}
