use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use taskmesh_core::{CoordinationStore, ListEnd, SchedulerError, SchedulerResult};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    strings: HashMap<String, String>,
}

impl StoreState {
    fn pop(&mut self, key: &str, end: ListEnd) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = match end {
            ListEnd::Head => list.pop_front(),
            ListEnd::Tail => list.pop_back(),
        };
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    fn push(&mut self, key: &str, value: String, end: ListEnd) -> usize {
        let list = self.lists.entry(key.to_string()).or_default();
        match end {
            ListEnd::Head => list.push_front(value),
            ListEnd::Tail => list.push_back(value),
        }
        list.len()
    }
}

/// 内存协调存储实现
///
/// 语义与 Redis 保持一致: 空列表和空哈希会被删除，阻塞弹出通过 `Notify` 唤醒。
/// 用于测试和单进程部署。
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    state: Mutex<StoreState>,
    pushed: Notify,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        debug!("Creating in-memory coordination store");
        Self::default()
    }
}

/// 只支持 `*` 通配符
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn hget(&self, key: &str, field: &str) -> SchedulerResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, items: &[(String, String)]) -> SchedulerResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in items {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hset_multiple_if_exists(
        &self,
        key: &str,
        items: &[(String, String)],
    ) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        for (field, value) in items {
            hash.insert(field.clone(), value.clone());
        }
        Ok(true)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> SchedulerResult<i64> {
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                SchedulerError::store(format!("HINCRBY: hash value is not an integer: {raw}"))
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hdel(&self, key: &str, field: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                state.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> SchedulerResult<HashMap<String, String>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> SchedulerResult<bool> {
        let state = self.state.lock().await;
        Ok(state.hashes.contains_key(key)
            || state.lists.contains_key(key)
            || state.strings.contains_key(key))
    }

    async fn del(&self, key: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        state.hashes.remove(key);
        state.lists.remove(key);
        state.strings.remove(key);
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        let len = self
            .state
            .lock()
            .await
            .push(key, value.to_string(), ListEnd::Tail);
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpush(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        let len = self
            .state
            .lock()
            .await
            .push(key, value.to_string(), ListEnd::Head);
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> SchedulerResult<Option<String>> {
        Ok(self.state.lock().await.pop(key, ListEnd::Head))
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> SchedulerResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // 先注册再检查，避免错过检查与等待之间的推送
            notified.as_mut().enable();

            if let Some(value) = self.lpop(key).await? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn lrange_all(&self, key: &str) -> SchedulerResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lrem(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        let mut state = self.state.lock().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        let removed = before - list.len();
        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(removed)
    }

    async fn lmove(
        &self,
        src: &str,
        dst: &str,
        from: ListEnd,
        to: ListEnd,
    ) -> SchedulerResult<Option<String>> {
        let moved = {
            let mut state = self.state.lock().await;
            match state.pop(src, from) {
                Some(value) => {
                    state.push(dst, value.clone(), to);
                    Some(value)
                }
                None => None,
            }
        };
        if moved.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn llen(&self, key: &str) -> SchedulerResult<usize> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn incr(&self, key: &str) -> SchedulerResult<i64> {
        let mut state = self.state.lock().await;
        let current = match state.strings.get(key) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| SchedulerError::store(format!("INCR: value is not an integer: {raw}")))?,
            None => 0,
        };
        let next = current + 1;
        state.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn get(&self, key: &str) -> SchedulerResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        state.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> SchedulerResult<Vec<String>> {
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state
            .hashes
            .keys()
            .chain(state.lists.keys())
            .chain(state.strings.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
