//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 计数存储抽象层
//!
//! 定义共享计数存储接口和内存实现。所有限流状态都只存在于存储中，
//! 协调器本身不持有任何进程内计数。
//!
//! 每个键的读-改-写原子性由 [`CounterStore::compare_and_swap`] 保证。

use crate::clock::Clock;
use crate::error::StorageError;
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// 计数存储接口
///
/// 所有 `ttl_ms` 参数为 0 时表示永不过期。
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 获取值
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// 比较并交换
    ///
    /// 仅当当前值等于 `expected`（`None` 表示键不存在）时写入 `value`。
    /// 返回是否写入成功。
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StorageError>;

    /// 设置值
    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), StorageError>;

    /// 原子增加哈希字段，返回新值
    ///
    /// `ttl_ms` 大于 0 时刷新整个哈希的过期时间，为 0 时保留原有过期时间。
    async fn hash_increment(
        &self,
        hash: &str,
        field: &str,
        delta: i64,
        ttl_ms: u64,
    ) -> Result<i64, StorageError>;

    /// 读取整个哈希
    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, i64)>, StorageError>;

    /// 统计以 `prefix` 开头的存活键数量
    async fn count_prefix(&self, prefix: &str) -> Result<u64, StorageError>;

    /// 原子清除
    ///
    /// 删除 `keys` 中的所有键以及 `hash_fields` 中的所有 `(哈希, 字段)`，
    /// 按顺序返回被删除字段的原值（不存在为 0）。
    async fn purge(
        &self,
        keys: &[String],
        hash_fields: &[(String, String)],
    ) -> Result<Vec<i64>, StorageError>;
}

/// 为存储调用加上超时
///
/// 超时映射为 [`StorageError::TimeoutError`]。
pub async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::TimeoutError(format!(
            "存储调用超过 {}ms",
            timeout.as_millis()
        ))),
    }
}

/// 存储值（包含过期时间）
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    /// 过期时间戳（毫秒），None 表示永不过期
    expires_at_ms: Option<i64>,
}

impl StoredValue {
    fn new(value: &str, ttl_ms: u64, now_ms: i64) -> Self {
        Self {
            value: value.to_string(),
            expires_at_ms: expiry(ttl_ms, now_ms),
        }
    }

    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |expires| now_ms < expires)
    }
}

fn expiry(ttl_ms: u64, now_ms: i64) -> Option<i64> {
    (ttl_ms > 0).then(|| now_ms.saturating_add(ttl_ms as i64))
}

/// 带过期时间的哈希
#[derive(Debug, Default)]
struct StoredHash {
    fields: HashMap<String, i64>,
    expires_at_ms: Option<i64>,
}

impl StoredHash {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |expires| now_ms < expires)
    }
}

/// 内存计数存储
///
/// 使用 DashMap 的单键条目锁实现比较并交换，过期时间由注入的时钟判定。
/// 读到的过期条目会被顺手删除；从不再访问的键由 [`MemoryCounterStore::spawn_sweeper`]
/// 定期清理。适用于单进程部署和测试。
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    data: DashMap<String, StoredValue>,
    hashes: DashMap<String, StoredHash>,
    /// 普通操作持有读锁，purge 持有写锁
    purge_gate: parking_lot::RwLock<()>,
}

impl MemoryCounterStore {
    /// 创建新的内存存储
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data: DashMap::new(),
            hashes: DashMap::new(),
            purge_gate: parking_lot::RwLock::new(()),
        }
    }

    /// 清理过期的键和哈希，返回清理数量
    pub fn cleanup_expired(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut count = 0;
        self.data.retain(|_, value| {
            let live = value.is_live(now);
            if !live {
                count += 1;
            }
            live
        });
        self.hashes.retain(|_, hash| {
            let live = hash.is_live(now);
            if !live {
                count += 1;
            }
            live
        });
        count
    }

    /// 启动后台清理任务
    ///
    /// 每隔 `every` 调用一次 [`cleanup_expired`](Self::cleanup_expired)。
    /// 任务只持有弱引用，存储被释放后自行退出。
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.cleanup_expired();
                if removed > 0 {
                    debug!("清理过期计数条目: removed={}", removed);
                }
            }
        })
    }

    /// 哈希数量（包括未清理的过期哈希）
    pub fn hash_count(&self) -> usize {
        self.hashes.len()
    }

    /// 条目总数（包括未清理的过期条目）
    pub fn raw_len(&self) -> usize {
        self.data.len()
    }

    /// 存活键数量
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.data.iter().filter(|entry| entry.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _gate = self.purge_gate.read();
        let now = self.clock.now_ms();
        match self.data.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.data.remove_if(key, |_, value| !value.is_live(now));
        Ok(None)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StorageError> {
        let _gate = self.purge_gate.read();
        let now = self.clock.now_ms();

        // 条目锁在整个比较和写入期间持有
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let (live, matches) = {
                    let current = occupied.get();
                    let live = current.is_live(now);
                    (live, live.then_some(current.value.as_str()) == expected)
                };
                if !matches {
                    if !live {
                        occupied.remove();
                    }
                    return Ok(false);
                }
                occupied.insert(StoredValue::new(value, ttl_ms, now));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(StoredValue::new(value, ttl_ms, now));
                Ok(true)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), StorageError> {
        let _gate = self.purge_gate.read();
        let now = self.clock.now_ms();
        self.data
            .insert(key.to_string(), StoredValue::new(value, ttl_ms, now));
        Ok(())
    }

    async fn hash_increment(
        &self,
        hash: &str,
        field: &str,
        delta: i64,
        ttl_ms: u64,
    ) -> Result<i64, StorageError> {
        let _gate = self.purge_gate.read();
        let now = self.clock.now_ms();
        let mut stored = self.hashes.entry(hash.to_string()).or_default();
        if !stored.is_live(now) {
            *stored = StoredHash::default();
        }
        if ttl_ms > 0 {
            stored.expires_at_ms = expiry(ttl_ms, now);
        }
        let counter = stored.fields.entry(field.to_string()).or_insert(0);
        *counter = counter.saturating_add(delta);
        Ok(*counter)
    }

    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, i64)>, StorageError> {
        let _gate = self.purge_gate.read();
        let now = self.clock.now_ms();
        match self.hashes.get(hash) {
            Some(stored) if stored.is_live(now) => {
                return Ok(stored
                    .fields
                    .iter()
                    .map(|(field, value)| (field.clone(), *value))
                    .collect())
            }
            Some(_) => {}
            None => return Ok(Vec::new()),
        }
        self.hashes.remove_if(hash, |_, stored| !stored.is_live(now));
        Ok(Vec::new())
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let _gate = self.purge_gate.read();
        let now = self.clock.now_ms();
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.is_live(now))
            .count() as u64)
    }

    async fn purge(
        &self,
        keys: &[String],
        hash_fields: &[(String, String)],
    ) -> Result<Vec<i64>, StorageError> {
        let _gate = self.purge_gate.write();
        let now = self.clock.now_ms();
        for key in keys {
            self.data.remove(key);
        }
        let mut removed = Vec::with_capacity(hash_fields.len());
        for (hash, field) in hash_fields {
            let value = self
                .hashes
                .get_mut(hash)
                .filter(|stored| stored.is_live(now))
                .and_then(|mut stored| stored.fields.remove(field))
                .unwrap_or(0);
            removed.push(value);
        }
        Ok(removed)
    }
}

/// 不可用存储的表现方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutageMode {
    /// 立即返回连接错误
    Refuse,
    /// 永不返回（由调用方超时）
    Hang,
}

/// 模拟故障的存储
///
/// 所有操作按 [`OutageMode`] 失败，用于验证失败开放策略。
pub struct UnavailableStore {
    mode: OutageMode,
}

impl UnavailableStore {
    pub fn new(mode: OutageMode) -> Self {
        Self { mode }
    }

    async fn fail<T>(&self) -> Result<T, StorageError> {
        if self.mode == OutageMode::Hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Err(StorageError::ConnectionError("计数存储不可达".to_string()))
    }
}

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        self.fail().await
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _value: &str,
        _ttl_ms: u64,
    ) -> Result<bool, StorageError> {
        self.fail().await
    }

    async fn set(&self, _key: &str, _value: &str, _ttl_ms: u64) -> Result<(), StorageError> {
        self.fail().await
    }

    async fn hash_increment(
        &self,
        _hash: &str,
        _field: &str,
        _delta: i64,
        _ttl_ms: u64,
    ) -> Result<i64, StorageError> {
        self.fail().await
    }

    async fn hash_get_all(&self, _hash: &str) -> Result<Vec<(String, i64)>, StorageError> {
        self.fail().await
    }

    async fn count_prefix(&self, _prefix: &str) -> Result<u64, StorageError> {
        self.fail().await
    }

    async fn purge(
        &self,
        _keys: &[String],
        _hash_fields: &[(String, String)],
    ) -> Result<Vec<i64>, StorageError> {
        self.fail().await
    }
}
