//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Lua脚本管理器
//!
//! Redis 计数存储中需要原子执行的两个操作：比较并交换、多键清除。
//! 脚本在连接建立时通过 `SCRIPT LOAD` 预加载，之后用 `EVALSHA` 执行，
//! 服务端丢失脚本缓存时自动重新加载。

use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use crate::error::StorageError;

/// Lua脚本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaScriptType {
    /// 比较并交换
    CompareAndSwap,
    /// 多键清除
    Purge,
}

impl LuaScriptType {
    /// 获取脚本名称
    pub fn name(&self) -> &str {
        match self {
            LuaScriptType::CompareAndSwap => "compare_and_swap",
            LuaScriptType::Purge => "purge",
        }
    }
}

/// 比较并交换脚本
///
/// 参数: KEYS[1] - key, ARGV[1] - 是否期望存在 ("1"/"0"), ARGV[2] - 期望值,
/// ARGV[3] - 新值, ARGV[4] - ttl (ms，0 表示不过期)
/// 返回: 1 写入成功, 0 当前值不匹配
pub const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])

if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end

local ttl = tonumber(ARGV[4])
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
    redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// 多键清除脚本
///
/// 参数: KEYS[1..n] - 待删除的键, KEYS[n+1..] - 哈希名,
/// ARGV[1] - n, ARGV[2..] - 与哈希名一一对应的字段
/// 返回: 每个哈希字段被删除前的值（不存在为 0）
pub const PURGE_SCRIPT: &str = r#"
local n = tonumber(ARGV[1])
if n > 0 then
    redis.call('DEL', unpack(KEYS, 1, n))
end

local removed = {}
for i = n + 1, #KEYS do
    local field = ARGV[i - n + 1]
    local value = redis.call('HGET', KEYS[i], field)
    redis.call('HDEL', KEYS[i], field)
    removed[#removed + 1] = tonumber(value) or 0
end
return removed
"#;

/// Lua脚本信息
#[derive(Debug, Clone)]
pub struct LuaScriptInfo {
    /// 脚本类型
    pub script_type: LuaScriptType,
    /// 脚本内容
    pub script: &'static str,
    /// SHA哈希（计算后填充）
    pub sha: Arc<parking_lot::Mutex<Option<String>>>,
}

impl LuaScriptInfo {
    /// 创建新的脚本信息
    pub fn new(script_type: LuaScriptType, script: &'static str) -> Self {
        Self {
            script_type,
            script,
            sha: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// 获取脚本SHA，如果未计算则返回None
    pub fn get_sha(&self) -> Option<String> {
        self.sha.lock().clone()
    }

    /// 设置脚本SHA
    pub fn set_sha(&self, sha: String) {
        *self.sha.lock() = Some(sha);
    }
}

/// Lua脚本管理器
pub struct LuaScriptManager {
    /// 脚本映射
    scripts: HashMap<LuaScriptType, LuaScriptInfo>,
}

impl LuaScriptManager {
    /// 创建新的脚本管理器
    pub fn new() -> Self {
        let mut scripts = HashMap::new();
        scripts.insert(
            LuaScriptType::CompareAndSwap,
            LuaScriptInfo::new(LuaScriptType::CompareAndSwap, COMPARE_AND_SWAP_SCRIPT),
        );
        scripts.insert(
            LuaScriptType::Purge,
            LuaScriptInfo::new(LuaScriptType::Purge, PURGE_SCRIPT),
        );
        Self { scripts }
    }

    /// 获取脚本信息
    pub fn get_script(&self, script_type: LuaScriptType) -> Option<&LuaScriptInfo> {
        self.scripts.get(&script_type)
    }

    /// 获取所有脚本
    pub fn get_all_scripts(&self) -> Vec<&LuaScriptInfo> {
        self.scripts.values().collect()
    }

    /// 预加载所有脚本到Redis
    pub async fn preload_all_scripts<C>(&self, conn: &mut C) -> Result<(), StorageError>
    where
        C: redis::aio::ConnectionLike,
    {
        info!("开始预加载Lua脚本到Redis");
        for script_info in self.get_all_scripts() {
            self.preload_script(conn, script_info).await?;
        }
        info!("Lua脚本预加载完成");
        Ok(())
    }

    /// 预加载单个脚本
    pub async fn preload_script<C>(
        &self,
        conn: &mut C,
        script_info: &LuaScriptInfo,
    ) -> Result<(), StorageError>
    where
        C: redis::aio::ConnectionLike,
    {
        let sha = Script::new(script_info.script).get_hash().to_string();

        let _: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script_info.script)
            .query_async(conn)
            .await
            .map_err(|e| {
                error!("预加载脚本失败: {:?}, 错误: {}", script_info.script_type, e);
                StorageError::from(e)
            })?;

        script_info.set_sha(sha.clone());
        debug!(
            "脚本预加载成功: {:?}, SHA: {}",
            script_info.script_type, sha
        );
        Ok(())
    }

    /// 执行脚本（使用SHA）
    pub async fn execute_script<C, T>(
        &self,
        conn: &mut C,
        script_type: LuaScriptType,
        keys: &[String],
        args: &[String],
    ) -> Result<T, StorageError>
    where
        C: redis::aio::ConnectionLike,
        T: redis::FromRedisValue,
    {
        let script_info = self
            .get_script(script_type)
            .ok_or_else(|| StorageError::QueryError(format!("未找到脚本: {:?}", script_type)))?;

        if script_info.get_sha().is_none() {
            self.preload_script(conn, script_info).await?;
        }
        let sha = script_info
            .get_sha()
            .ok_or_else(|| StorageError::QueryError("脚本SHA未初始化".to_string()))?;

        trace!("执行脚本: {:?}, SHA: {}", script_type, sha);

        let result = redis::cmd("EVALSHA")
            .arg(&sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<_, T>(conn)
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
                debug!("脚本SHA不存在，重新加载: {:?}", script_type);
                self.preload_script(conn, script_info).await?;
                redis::cmd("EVALSHA")
                    .arg(&sha)
                    .arg(keys.len())
                    .arg(keys)
                    .arg(args)
                    .query_async::<_, T>(conn)
                    .await
                    .map_err(|e| {
                        error!("脚本执行失败: {:?}, 错误: {}", script_type, e);
                        StorageError::from(e)
                    })
            }
            Err(e) => {
                error!("脚本执行失败: {:?}, 错误: {}", script_type, e);
                Err(StorageError::from(e))
            }
        }
    }

    /// 清除所有脚本的SHA缓存
    pub fn clear_sha_cache(&self) {
        for script_info in self.get_all_scripts() {
            *script_info.sha.lock() = None;
        }
        debug!("已清除所有脚本的SHA缓存");
    }
}

impl Default for LuaScriptManager {
    fn default() -> Self {
        Self::new()
    }
}
