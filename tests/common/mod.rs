//! 测试通用工具模块
//!
//! 提供测试中常用的工具函数和辅助结构。

#![allow(dead_code)]

use shelfguard::{
    clock::ManualClock,
    config::{FailMode, LimiterConfig, PenaltyConfig, RateLimitConfig, RoutePolicy},
    coordinator::{CheckRequest, Coordinator, Verdict},
    key::Role,
    storage::{CounterStore, MemoryCounterStore},
};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// 安装测试日志输出，`RUST_LOG` 控制级别
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// 测试夹具：协调器、底层存储和手动时钟
pub struct Fixture {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<MemoryCounterStore>,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub fn new(config: &RateLimitConfig) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let coordinator = Arc::new(
            Coordinator::new(config, store.clone(), clock.clone())
                .expect("测试配置应当有效"),
        );
        Self {
            coordinator,
            store,
            clock,
        }
    }

    /// 使用图书馆默认配置
    pub fn library() -> Self {
        Self::new(&RateLimitConfig::library_defaults())
    }

    pub async fn check(&self, role: Role, identity: &str, route_class: &str) -> Verdict {
        self.coordinator
            .check_rate_limit(&CheckRequest::new(role, identity, route_class))
            .await
    }

    /// 连续检查 `times` 次，返回放行次数
    pub async fn admitted(&self, role: Role, identity: &str, route_class: &str, times: usize) -> usize {
        let mut allowed = 0;
        for _ in 0..times {
            if self.check(role, identity, route_class).await.allowed {
                allowed += 1;
            }
        }
        allowed
    }
}

/// 使用任意存储创建协调器
pub fn coordinator_on(
    config: &RateLimitConfig,
    store: Arc<dyn CounterStore>,
) -> (Arc<Coordinator>, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::default());
    let coordinator =
        Coordinator::new(config, store, clock.clone()).expect("测试配置应当有效");
    (Arc::new(coordinator), clock)
}

/// 只有一个 `default` 路由类别的配置
pub fn single_route_config(
    limiter: LimiterConfig,
    penalty: Option<PenaltyConfig>,
    fail_mode: FailMode,
) -> RateLimitConfig {
    let mut config = RateLimitConfig::library_defaults();
    config.routes = vec![RoutePolicy {
        name: "default".to_string(),
        patterns: Vec::new(),
        limiter,
        penalty,
        fail_mode,
    }];
    config.overrides.clear();
    config
}

pub fn sliding_window(window: &str, max_requests: u64) -> LimiterConfig {
    LimiterConfig::SlidingWindow {
        window: window.to_string(),
        max_requests,
    }
}

pub fn token_bucket(capacity: u64, refill_per_sec: f64) -> LimiterConfig {
    LimiterConfig::TokenBucket {
        capacity,
        refill_per_sec,
    }
}

pub fn penalty(base_minutes: u64, max_minutes: u64, threshold: u32) -> PenaltyConfig {
    PenaltyConfig {
        base_minutes,
        max_minutes,
        threshold,
        forgive_after: "24h".to_string(),
    }
}
