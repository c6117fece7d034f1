//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。准入检查路径本身不返回错误，
//! 这里的错误只出现在构造、配置加载和存储层。

use thiserror::Error;

/// ShelfGuard 错误类型
#[derive(Error, Debug)]
pub enum ShelfGuardError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// 验证错误
    #[error("验证错误: {0}")]
    ValidationError(String),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// 存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StorageError::TimeoutError(err.to_string())
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error()
        {
            StorageError::ConnectionError(err.to_string())
        } else {
            StorageError::QueryError(err.to_string())
        }
    }
}
