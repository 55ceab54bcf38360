use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::SchedulerResult;

/// 列表的一端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Head,
    Tail,
}

impl ListEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListEnd::Head => "LEFT",
            ListEnd::Tail => "RIGHT",
        }
    }
}

/// 协调存储抽象接口
///
/// 调度器与节点之间唯一的通信渠道。所有修改都应尽量使用原子操作
/// (push/pop/incr)，避免跨进程的读-改-写竞争。
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// 读取哈希字段
    async fn hget(&self, key: &str, field: &str) -> SchedulerResult<Option<String>>;

    /// 写入单个哈希字段
    async fn hset(&self, key: &str, field: &str, value: &str) -> SchedulerResult<()>;

    /// 批量写入哈希字段
    async fn hset_multiple(&self, key: &str, items: &[(String, String)]) -> SchedulerResult<()>;

    /// 仅当哈希已存在时批量写入，检查与写入是原子的，返回是否写入
    async fn hset_multiple_if_exists(
        &self,
        key: &str,
        items: &[(String, String)],
    ) -> SchedulerResult<bool>;

    /// 原子增减哈希字段，返回新值
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> SchedulerResult<i64>;

    async fn hdel(&self, key: &str, field: &str) -> SchedulerResult<()>;

    /// 读取整个哈希，键不存在时返回空表
    async fn hgetall(&self, key: &str) -> SchedulerResult<HashMap<String, String>>;

    async fn exists(&self, key: &str) -> SchedulerResult<bool>;

    async fn del(&self, key: &str) -> SchedulerResult<()>;

    /// 追加到列表尾部，返回列表长度
    async fn rpush(&self, key: &str, value: &str) -> SchedulerResult<usize>;

    /// 插入到列表头部，返回列表长度
    async fn lpush(&self, key: &str, value: &str) -> SchedulerResult<usize>;

    /// 非阻塞弹出列表头部
    async fn lpop(&self, key: &str) -> SchedulerResult<Option<String>>;

    /// 阻塞弹出列表头部，超时返回 None
    async fn blpop(&self, key: &str, timeout: Duration) -> SchedulerResult<Option<String>>;

    /// 读取整个列表但不移除
    async fn lrange_all(&self, key: &str) -> SchedulerResult<Vec<String>>;

    /// 移除所有等于 value 的元素，返回移除数量
    async fn lrem(&self, key: &str, value: &str) -> SchedulerResult<usize>;

    /// 原子地从 src 的一端弹出并推入 dst 的一端
    async fn lmove(
        &self,
        src: &str,
        dst: &str,
        from: ListEnd,
        to: ListEnd,
    ) -> SchedulerResult<Option<String>>;

    async fn llen(&self, key: &str) -> SchedulerResult<usize>;

    /// 原子自增计数器，返回新值
    async fn incr(&self, key: &str) -> SchedulerResult<i64>;

    async fn get(&self, key: &str) -> SchedulerResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> SchedulerResult<()>;

    /// 按通配模式列出键
    async fn keys(&self, pattern: &str) -> SchedulerResult<Vec<String>>;
}
