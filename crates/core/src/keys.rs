//! 协调存储中的键布局
//!
//! 键名与现有部署保持一致，外部的只读状态面板依赖这些名字。

use crate::models::NodeId;

pub const NODE_COUNTER: &str = "global:node_counter";
pub const TASK_COUNTER: &str = "global:task_counter";
pub const UNASSIGNED_TASKS: &str = "global:unassigned_tasks";
pub const DISPATCH_STAGING: &str = "global:dispatch_staging";
pub const SNAKE_STATE: &str = "snake:state";

pub const NODE_STATS_PREFIX: &str = "node_stats:";
pub const TASK_QUEUE_PREFIX: &str = "task_queue:";
pub const RESULTS_PREFIX: &str = "results:";

pub fn node_stats(node: NodeId) -> String {
    format!("{NODE_STATS_PREFIX}{node}")
}

pub fn task_queue(node: NodeId) -> String {
    format!("{TASK_QUEUE_PREFIX}{node}")
}

pub fn results(node: NodeId) -> String {
    format!("{RESULTS_PREFIX}{node}")
}

pub fn pattern(prefix: &str) -> String {
    format!("{prefix}*")
}

/// 从 `node_stats:node3` 这类键中解析节点ID
pub fn node_id_from_key(key: &str, prefix: &str) -> Option<NodeId> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// 节点记录中的字段名
pub mod fields {
    pub const CPU: &str = "cpu";
    pub const RAM: &str = "ram";
    pub const DISK: &str = "disk";
    pub const STATUS: &str = "status";
    pub const TASKS: &str = "tasks";
    pub const MAX_TASKS: &str = "max_tasks";
    pub const LAST_HEARTBEAT: &str = "last_heartbeat";
    pub const REGISTERED_AT: &str = "registered_at";
    pub const AVG_TIME: &str = "avg_time";
    pub const LAST_TIME: &str = "last_time";
    pub const HOSTNAME: &str = "hostname";
    /// Dispatcher写入的分配标记
    pub const CURRENT_TASK: &str = "current_task";

    const SLOT_MARKER_PREFIX: &str = "current_task:";

    /// 执行槽位标记字段名
    pub fn slot_marker(slot: usize) -> String {
        format!("{SLOT_MARKER_PREFIX}{slot}")
    }

    pub fn parse_slot_marker(field: &str) -> Option<usize> {
        field.strip_prefix(SLOT_MARKER_PREFIX)?.parse().ok()
    }
}
