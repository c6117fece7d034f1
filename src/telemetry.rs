//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 监控和日志模块
//!
//! - `telemetry` feature：[`init_logging`] 安装 `tracing-subscriber` 格式化输出
//! - `monitoring` feature：[`Metrics`] Prometheus 指标
//!
//! # 示例
//!
//! ```rust,ignore
//! use shelfguard::telemetry::{init_logging, Metrics};
//!
//! init_logging("shelfguard=debug").unwrap();
//! let metrics = Metrics::new().unwrap();
//! println!("{}", metrics.gather());
//! ```

#[cfg(feature = "monitoring")]
use crate::key::Algorithm;
#[cfg(feature = "monitoring")]
use prometheus::{Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
#[cfg(feature = "monitoring")]
use std::time::Duration;
#[cfg(feature = "monitoring")]
use tracing::error;

/// 初始化日志订阅器
///
/// 优先使用 `RUST_LOG` 环境变量，未设置时使用 `default_filter`。
/// 已经安装过订阅器时返回错误。
#[cfg(feature = "telemetry")]
pub fn init_logging(default_filter: &str) -> Result<(), String> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| format!("无效的日志过滤规则 {}: {}", default_filter, e))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| format!("日志订阅器初始化失败: {}", e))
}

/// 监控指标
#[cfg(feature = "monitoring")]
#[derive(Clone)]
pub struct Metrics {
    /// 总检查数
    pub checks_total: Counter,
    /// 允许的请求数
    pub requests_allowed: Counter,
    /// 拒绝的请求数
    pub requests_rejected: Counter,
    /// 按算法统计的拒绝数
    pub rejected_by_algorithm: CounterVec,
    /// 降级放行（或降级拒绝）的请求数
    pub degraded_total: Counter,
    /// 存储错误数
    pub store_errors_total: Counter,
    /// 检查延迟分布
    pub check_duration: Histogram,
    /// 指标注册表
    registry: Registry,
}

#[cfg(feature = "monitoring")]
impl Metrics {
    /// 创建并注册所有指标
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let checks_total = Counter::with_opts(Opts::new(
            "shelfguard_checks_total",
            "Total number of admission checks",
        ))?;
        let requests_allowed = Counter::with_opts(Opts::new(
            "shelfguard_requests_allowed_total",
            "Total number of admitted requests",
        ))?;
        let requests_rejected = Counter::with_opts(Opts::new(
            "shelfguard_requests_rejected_total",
            "Total number of rejected requests",
        ))?;
        let rejected_by_algorithm = CounterVec::new(
            Opts::new(
                "shelfguard_rejected_by_algorithm_total",
                "Rejected requests by limiting algorithm",
            ),
            &["algorithm"],
        )?;
        let degraded_total = Counter::with_opts(Opts::new(
            "shelfguard_degraded_total",
            "Checks decided without the counter store",
        ))?;
        let store_errors_total = Counter::with_opts(Opts::new(
            "shelfguard_store_errors_total",
            "Counter store failures and timeouts",
        ))?;
        let check_duration = Histogram::with_opts(
            HistogramOpts::new(
                "shelfguard_check_duration_seconds",
                "Duration of admission checks in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(checks_total.clone()))?;
        registry.register(Box::new(requests_allowed.clone()))?;
        registry.register(Box::new(requests_rejected.clone()))?;
        registry.register(Box::new(rejected_by_algorithm.clone()))?;
        registry.register(Box::new(degraded_total.clone()))?;
        registry.register(Box::new(store_errors_total.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            checks_total,
            requests_allowed,
            requests_rejected,
            rejected_by_algorithm,
            degraded_total,
            store_errors_total,
            check_duration,
            registry,
        })
    }

    /// 收集所有指标并返回Prometheus格式的文本
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// 记录一次检查
    pub fn record_check(&self, duration: Duration, allowed: bool, algorithm: Algorithm) {
        self.check_duration.observe(duration.as_secs_f64());
        self.checks_total.inc();
        if allowed {
            self.requests_allowed.inc();
        } else {
            self.requests_rejected.inc();
            self.rejected_by_algorithm
                .with_label_values(&[algorithm.as_str()])
                .inc();
        }
    }

    /// 记录一次降级决策
    pub fn record_degraded(&self) {
        self.degraded_total.inc();
        self.store_errors_total.inc();
    }
}
