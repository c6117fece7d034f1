//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Redis计数存储
//!
//! 多个服务进程共享同一组限流计数时使用的 [`CounterStore`] 实现。
//!
//! # 特性
//!
//! - **连接管理**: 使用ConnectionManager管理连接，连接错误时重建
//! - **重试机制**: 指数退避重试，次数受配置限制
//! - **Lua脚本**: 比较并交换、多键清除在服务端原子执行
//!
//! 单次调用的总耗时仍受协调器的存储超时约束，重试次数应保持在超时预算内。

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, IntoConnectionInfo};
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::StorageError;
use crate::lua_scripts::{LuaScriptManager, LuaScriptType};
use crate::storage::CounterStore;

/// 最大键总长度
const MAX_KEY_LENGTH: usize = 1024;

/// SCAN 每批返回的建议数量
const SCAN_BATCH_SIZE: usize = 500;

/// 验证完整键
fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::QueryError("键不能为空".to_string()));
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::QueryError(format!(
            "键长度超过限制（最大 {} 字符）",
            MAX_KEY_LENGTH
        )));
    }

    if key.contains('\0') {
        return Err(StorageError::QueryError("键包含非法字符".to_string()));
    }

    Ok(())
}

/// 把前缀转义为 SCAN MATCH 模式
///
/// 身份中可能出现 glob 元字符，按字面匹配。
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Redis配置
#[derive(Clone)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 数据库索引
    pub db: i64,
    /// 密码（使用 Secret 包装以防止意外泄露）
    pub password: Option<Secret<String>>,
    /// 连接超时
    pub connection_timeout: Duration,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试初始退避时间
    pub retry_initial_backoff: Duration,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connection_timeout", &self.connection_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_backoff", &self.retry_initial_backoff)
            .finish()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: 0,
            password: None,
            connection_timeout: Duration::from_secs(5),
            max_retries: 1,
            retry_initial_backoff: Duration::from_millis(20),
        }
    }
}

impl RedisConfig {
    /// 创建新的Redis配置
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 设置数据库索引
    pub fn db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// 设置密码
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// 设置密码（使用 Secret）
    pub fn password_secret(mut self, password: Secret<String>) -> Self {
        self.password = Some(password);
        self
    }

    /// 设置连接超时
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// 设置重试初始退避时间
    pub fn retry_initial_backoff(mut self, backoff: Duration) -> Self {
        self.retry_initial_backoff = backoff;
        self
    }
}

/// 重试统计
#[derive(Debug, Default, Clone)]
pub struct RetryStats {
    successful_retries: Arc<AtomicU64>,
    failed_retries: Arc<AtomicU64>,
}

impl RetryStats {
    /// 获取总重试次数
    pub fn total_retries(&self) -> u64 {
        self.successful_retries() + self.failed_retries()
    }

    /// 获取成功重试次数
    pub fn successful_retries(&self) -> u64 {
        self.successful_retries.load(Ordering::Relaxed)
    }

    /// 获取失败重试次数
    pub fn failed_retries(&self) -> u64 {
        self.failed_retries.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        self.successful_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Redis计数存储
#[derive(Clone)]
pub struct RedisCounterStore {
    /// 连接管理器
    conn_manager: Arc<Mutex<Option<ConnectionManager>>>,
    /// 配置
    config: RedisConfig,
    /// Lua脚本管理器
    lua_manager: Arc<LuaScriptManager>,
    /// 重试统计
    retry_stats: RetryStats,
}

impl RedisCounterStore {
    /// 连接Redis并预加载脚本
    pub async fn new(config: RedisConfig) -> Result<Self, StorageError> {
        info!("创建Redis计数存储, URL: {}", config.url);

        let store = Self {
            conn_manager: Arc::new(Mutex::new(None)),
            config,
            lua_manager: Arc::new(LuaScriptManager::new()),
            retry_stats: RetryStats::default(),
        };

        store.connect().await?;
        let mut conn = store.connection().await?;
        store.lua_manager.preload_all_scripts(&mut conn).await?;

        info!("Redis计数存储创建成功");
        Ok(store)
    }

    /// 检查Redis连接
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
                error!("Redis PING失败: {}", e);
                StorageError::from(e)
            })?;
            Ok(())
        })
        .await
    }

    /// 获取重试统计
    pub fn retry_stats(&self) -> &RetryStats {
        &self.retry_stats
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        self.conn_manager
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| StorageError::ConnectionError("连接未初始化".to_string()))
    }

    /// 建立连接
    async fn connect(&self) -> Result<(), StorageError> {
        debug!("建立Redis连接");

        let mut info = self.config.url.as_str().into_connection_info().map_err(|e| {
            error!("无效的Redis URL: {}", e);
            StorageError::ConnectionError(format!("无效的Redis URL: {}", e))
        })?;
        info.redis.db = self.config.db;
        if let Some(password) = &self.config.password {
            info.redis.password = Some(password.expose_secret().clone());
        }

        let client = Client::open(info).map_err(|e| {
            error!("创建Redis客户端失败: {}", e);
            StorageError::ConnectionError(format!("创建Redis客户端失败: {}", e))
        })?;

        let conn_manager =
            tokio::time::timeout(self.config.connection_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| {
                    StorageError::TimeoutError(format!(
                        "连接Redis超过 {:?}",
                        self.config.connection_timeout
                    ))
                })?
                .map_err(|e| {
                    error!("创建Redis连接管理器失败: {}", e);
                    StorageError::ConnectionError(format!("创建Redis连接管理器失败: {}", e))
                })?;

        *self.conn_manager.lock().await = Some(conn_manager);
        info!("Redis连接建立成功");
        Ok(())
    }

    /// 重新连接
    async fn reconnect(&self) -> Result<(), StorageError> {
        debug!("尝试重新连接Redis");
        *self.conn_manager.lock().await = None;
        self.connect().await?;
        // 新连接可能指向已重启的实例，脚本缓存需要重新加载
        self.lua_manager.clear_sha_cache();
        Ok(())
    }

    /// 带重试的执行
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let mut backoff = self.config.retry_initial_backoff;
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        self.retry_stats.record_success();
                        debug!("重试成功，尝试次数: {}", attempt);
                    }
                    return Ok(result);
                }
                // 查询错误重试也不会成功
                Err(e @ StorageError::QueryError(_)) => return Err(e),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Redis操作失败，将在 {:?} 后重试 (尝试 {}/{}): {}",
                        backoff, attempt, self.config.max_retries, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);

                    if matches!(e, StorageError::ConnectionError(_)) {
                        if let Err(reconnect_err) = self.reconnect().await {
                            error!("重新连接失败: {}", reconnect_err);
                        }
                    }
                }
                Err(e) => {
                    if attempt > 0 {
                        self.retry_stats.record_failure();
                    }
                    error!("Redis操作失败，已达最大重试次数: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        validate_key(key)?;
        trace!("GET {}", key);
        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;
            conn.get::<_, Option<String>>(key)
                .await
                .map_err(StorageError::from)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StorageError> {
        validate_key(key)?;
        let keys = vec![key.to_string()];
        let args = vec![
            if expected.is_some() { "1" } else { "0" }.to_string(),
            expected.unwrap_or_default().to_string(),
            value.to_string(),
            ttl_ms.to_string(),
        ];

        let swapped: i64 = self
            .execute_with_retry(|| async {
                let mut conn = self.connection().await?;
                self.lua_manager
                    .execute_script(&mut conn, LuaScriptType::CompareAndSwap, &keys, &args)
                    .await
            })
            .await?;
        Ok(swapped == 1)
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), StorageError> {
        validate_key(key)?;
        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if ttl_ms > 0 {
                cmd.arg("PX").arg(ttl_ms);
            }
            cmd.query_async::<_, ()>(&mut conn)
                .await
                .map_err(StorageError::from)
        })
        .await
    }

    async fn hash_increment(
        &self,
        hash: &str,
        field: &str,
        delta: i64,
        ttl_ms: u64,
    ) -> Result<i64, StorageError> {
        validate_key(hash)?;
        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;
            if ttl_ms == 0 {
                return conn
                    .hincr::<_, _, _, i64>(hash, field, delta)
                    .await
                    .map_err(StorageError::from);
            }
            // MULTI/EXEC，计数和过期时间一起生效
            let (count,): (i64,) = redis::pipe()
                .atomic()
                .hincr(hash, field, delta)
                .cmd("PEXPIRE")
                .arg(hash)
                .arg(ttl_ms)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(StorageError::from)?;
            Ok(count)
        })
        .await
    }

    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, i64)>, StorageError> {
        validate_key(hash)?;
        let entries: HashMap<String, i64> = self
            .execute_with_retry(|| async {
                let mut conn = self.connection().await?;
                conn.hgetall::<_, HashMap<String, i64>>(hash)
                    .await
                    .map_err(StorageError::from)
            })
            .await?;
        Ok(entries.into_iter().collect())
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        validate_key(prefix)?;
        let pattern = prefix_pattern(prefix);

        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;
            let mut cursor: u64 = 0;
            let mut count: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH_SIZE)
                    .query_async(&mut conn)
                    .await
                    .map_err(StorageError::from)?;
                count += keys.len() as u64;
                if next == 0 {
                    return Ok(count);
                }
                cursor = next;
            }
        })
        .await
    }

    async fn purge(
        &self,
        keys: &[String],
        hash_fields: &[(String, String)],
    ) -> Result<Vec<i64>, StorageError> {
        for key in keys {
            validate_key(key)?;
        }
        let mut script_keys: Vec<String> = keys.to_vec();
        let mut args = vec![keys.len().to_string()];
        for (hash, field) in hash_fields {
            validate_key(hash)?;
            script_keys.push(hash.clone());
            args.push(field.clone());
        }

        self.execute_with_retry(|| async {
            let mut conn = self.connection().await?;
            self.lua_manager
                .execute_script(&mut conn, LuaScriptType::Purge, &script_keys, &args)
                .await
        })
        .await
    }
}
