//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! ShelfGuard - 图书馆 API 准入控制与限流
//!
//! 按 `(角色, 路由类别)` 为每个请求选择限流策略，所有计数保存在共享计数存储中。
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use shelfguard::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Coordinator`] - 限流协调器，策略选择、存储读写、降级
//! - [`AdmissionMiddleware`] - 准入中间件，豁免路径与响应头
//! - [`RateLimitConfig`] - 路由、角色倍率和策略配置
//! - [`Verdict`] - 单次检查的结果
//!
//! ## Limiters
//!
//! 纯函数限流算法：令牌桶、滑动窗口、指数退避、渐进惩罚。
//!
//! ## Storage
//!
//! - [`MemoryCounterStore`] - 单进程内存存储
//! - `RedisCounterStore` - 多进程共享存储（需要 `redis` feature）
//!
//! # Examples
//!
//! ```rust
//! use shelfguard::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RateLimitConfig::library_defaults();
//!     let clock = Arc::new(SystemClock);
//!     let store = Arc::new(MemoryCounterStore::new(clock.clone()));
//!     let coordinator = Coordinator::new(&config, store, clock).unwrap();
//!
//!     let request = CheckRequest::new(Role::Student, "s-1024", "api");
//!     let verdict = coordinator.check_rate_limit(&request).await;
//!     assert!(verdict.allowed);
//!     assert_eq!(verdict.limit, 20);
//! }
//! ```
//!
//! # Features
//!
//! - `redis`: Redis 计数存储
//! - `telemetry`: `tracing-subscriber` 日志初始化
//! - `monitoring`: Prometheus 指标

pub mod prelude;

pub mod clock;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod limiters;
pub mod log_redaction;
#[cfg(feature = "redis")]
pub mod lua_scripts;
pub mod matchers;
pub mod middleware;
#[cfg(feature = "redis")]
pub mod redis_storage;
pub mod storage;
#[cfg(any(feature = "telemetry", feature = "monitoring"))]
pub mod telemetry;
pub mod tracker;

// 重新导出常用类型
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    FailMode, LimitConfig, LimiterConfig, LimiterSpec, PenaltyConfig, PolicyTable,
    RateLimitConfig, RoleMultipliers, RoleOverride, RoutePolicy, StatsSettings, StoreSettings,
};
pub use coordinator::{CheckRequest, Coordinator, Verdict};
pub use error::{ShelfGuardError, StorageError};
pub use key::{Algorithm, KeyLayout, RateLimitKey, Role, SubjectKey};
pub use limiters::{
    AdmissionStrategy, Evaluation, ExponentialBackoff, Outcome, PenaltyPolicy, Progressive,
    SlidingWindow, TokenBucket,
};
#[cfg(feature = "redis")]
pub use lua_scripts::{LuaScriptInfo, LuaScriptManager, LuaScriptType};
pub use matchers::{ExemptionMatcher, RequestContext, RouteClassifier};
pub use middleware::{rate_limit_headers, Admission, AdmissionMiddleware, RejectionBody};
#[cfg(feature = "redis")]
pub use redis_storage::{RedisConfig, RedisCounterStore, RetryStats};
pub use storage::{CounterStore, MemoryCounterStore, OutageMode, UnavailableStore};
#[cfg(feature = "telemetry")]
pub use telemetry::init_logging;
#[cfg(feature = "monitoring")]
pub use telemetry::Metrics;
pub use tracker::{RateLimitStats, ViolationTracker, ViolatorEntry};
