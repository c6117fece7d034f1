//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 限流协调器
//!
//! 每个请求调用一次 [`Coordinator::check_rate_limit`]：解析角色、标识、路由类别和限流配置，
//! 对计数存储中的状态运行限流算法并通过比较并交换提交，叠加惩罚层，最后给出 [`Verdict`]。
//!
//! 检查路径不返回错误。存储不可用、超时或 CAS 重试耗尽时按路由的 `fail_mode`
//! 降级：默认放行并标记 `degraded`，`closed` 路由拒绝。

use crate::clock::Clock;
use crate::config::{FailMode, LimitConfig, LimiterSpec, PolicyTable, RateLimitConfig};
use crate::constants::{FAIL_CLOSED_RETRY_SECS, MS_PER_SECOND};
use crate::error::{ShelfGuardError, StorageError};
use crate::key::{Algorithm, KeyLayout, RateLimitKey, Role, SubjectKey};
use crate::limiters::{AdmissionStrategy, Outcome, PenaltyPolicy, ProgressivePenaltyState};
use crate::log_redaction::redact_subject;
use crate::matchers::{RequestContext, RouteClassifier};
use crate::storage::{with_timeout, CounterStore};
use crate::tracker::{RateLimitStats, ViolationTracker};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

#[cfg(feature = "monitoring")]
use crate::telemetry::Metrics;

/// 检查请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub role: Role,
    /// 已认证用户ID，否则客户端IP
    pub identity: String,
    pub route_class: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl CheckRequest {
    pub fn new(role: Role, identity: impl Into<String>, route_class: impl Into<String>) -> Self {
        Self {
            role,
            identity: identity.into(),
            route_class: route_class.into(),
            ip: None,
            user_agent: None,
        }
    }

    pub fn subject(&self) -> SubjectKey {
        SubjectKey::new(self.role, self.identity.clone(), self.route_class.clone())
    }
}

/// 准入判定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// 限制完全恢复的时间（毫秒时间戳）
    pub reset_at_ms: i64,
    pub algorithm: Algorithm,
    pub role: Role,
    pub retry_after_secs: Option<u64>,
    /// 未经计数存储做出的判定
    pub degraded: bool,
}

impl Verdict {
    fn from_outcome(outcome: Outcome, algorithm: Algorithm, role: Role) -> Self {
        Self {
            allowed: outcome.allowed,
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at_ms: outcome.reset_at_ms,
            algorithm,
            role,
            retry_after_secs: outcome.retry_after_secs,
            degraded: false,
        }
    }

    /// 恢复时间（Unix 秒，向上取整），用于 `X-RateLimit-Reset`
    pub fn reset_at_secs(&self) -> i64 {
        let per_second = MS_PER_SECOND as i64;
        (self.reset_at_ms + per_second - 1).div_euclid(per_second)
    }
}

/// 路由分类器和策略表，热更新时整体替换
struct PolicySet {
    table: PolicyTable,
    classifier: RouteClassifier,
}

impl PolicySet {
    fn from_config(config: &RateLimitConfig) -> Result<Self, ShelfGuardError> {
        Ok(Self {
            table: PolicyTable::from_config(config)?,
            classifier: RouteClassifier::from_config(config)?,
        })
    }
}

/// 限流协调器
///
/// 不持有任何进程内计数，可以在多个进程间共享同一个计数存储。
pub struct Coordinator {
    policies: RwLock<Arc<PolicySet>>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    layout: KeyLayout,
    tracker: ViolationTracker,
    timeout: Duration,
    max_cas_retries: u32,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<Metrics>>,
}

impl Coordinator {
    /// 创建协调器
    pub fn new(
        config: &RateLimitConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ShelfGuardError> {
        let policies = PolicySet::from_config(config)?;
        let layout = KeyLayout::new(config.store.key_prefix.clone());
        let timeout = config.store.timeout();
        let tracker = ViolationTracker::new(
            store.clone(),
            layout.clone(),
            config.stats.top_n,
            config.stats.horizon_ms()?,
            timeout,
        );

        info!(
            "限流协调器已创建: routes={}, prefix={}, timeout_ms={}",
            config.routes.len(),
            layout.prefix(),
            config.store.timeout_ms
        );

        Ok(Self {
            policies: RwLock::new(Arc::new(policies)),
            store,
            clock,
            layout,
            tracker,
            timeout,
            max_cas_retries: config.store.max_cas_retries,
            #[cfg(feature = "monitoring")]
            metrics: None,
        })
    }

    /// 附加 Prometheus 指标
    #[cfg(feature = "monitoring")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 替换路由和策略
    ///
    /// 存储设置（键前缀、超时）在创建时确定，不随热更新变化。
    #[instrument(skip(self, config))]
    pub fn update_config(&self, config: &RateLimitConfig) -> Result<(), ShelfGuardError> {
        let policies = PolicySet::from_config(config)?;
        if config.store.key_prefix != self.layout.prefix() {
            warn!(
                "热更新忽略存储设置变化: prefix={} -> {}",
                self.layout.prefix(),
                config.store.key_prefix
            );
        }
        *self.policies.write() = Arc::new(policies);
        info!("更新限流配置: version={}", config.version);
        Ok(())
    }

    fn snapshot(&self) -> Arc<PolicySet> {
        self.policies.read().clone()
    }

    /// 路径对应的路由类别
    pub fn classify(&self, path: &str) -> String {
        self.snapshot().classifier.classify(path).to_string()
    }

    /// 解析 `(角色, 路由类别)` 的限流配置
    pub fn config_for(&self, role: Role, route_class: &str) -> Arc<LimitConfig> {
        self.snapshot().table.resolve(role, route_class)
    }

    pub fn key_layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// 检查 HTTP 请求
    ///
    /// 标识取已认证用户ID，否则客户端IP；路由类别由路径分类得到。
    pub async fn check_request(&self, context: &RequestContext) -> Verdict {
        let request = CheckRequest {
            role: context.role,
            identity: context.identity(),
            route_class: self.classify(context.route_path()),
            ip: context.client_ip(),
            user_agent: context.user_agent.clone(),
        };
        self.check_rate_limit(&request).await
    }

    /// 检查限流
    #[instrument(skip(self, request), fields(role = %request.role, route_class = %request.route_class))]
    pub async fn check_rate_limit(&self, request: &CheckRequest) -> Verdict {
        #[cfg(feature = "monitoring")]
        let start = std::time::Instant::now();

        let config = self.config_for(request.role, &request.route_class);
        let subject = request.subject();

        let verdict = match self.evaluate(&config, &subject).await {
            Ok(verdict) => verdict,
            Err(e) => self.degraded(&config, &subject, e),
        };

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_check(start.elapsed(), verdict.allowed, verdict.algorithm);
        }

        trace!(
            "检查完成: subject={}, allowed={}, remaining={}",
            redact_subject(&subject),
            verdict.allowed,
            verdict.remaining
        );
        verdict
    }

    /// 限流统计
    pub async fn get_rate_limit_stats(&self) -> Result<RateLimitStats, ShelfGuardError> {
        Ok(self.tracker.get_stats(self.clock.now_ms()).await?)
    }

    /// 重置主体的全部限流状态
    ///
    /// 清除成功（包括主体本就不存在）返回 `true`，存储故障返回 `false`。
    #[instrument(skip(self, subject))]
    pub async fn reset_rate_limit(&self, subject: &SubjectKey) -> bool {
        match self.tracker.reset(subject, self.clock.now_ms()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "重置限流状态失败: subject={}, error={}",
                    redact_subject(subject),
                    e
                );
                false
            }
        }
    }

    async fn evaluate(
        &self,
        config: &LimitConfig,
        subject: &SubjectKey,
    ) -> Result<Verdict, StorageError> {
        let algorithm = config.limiter.algorithm();
        let now = self.clock.now_ms();

        if config.penalty.is_some() {
            if let Some(penalty) = self.active_penalty(subject, now).await? {
                let blocked_ms = penalty.blocked_for(now).unwrap_or(0);
                debug!(
                    "惩罚期内直接拒绝: subject={}, blocked_ms={}",
                    redact_subject(subject),
                    blocked_ms
                );
                let verdict = Verdict {
                    allowed: false,
                    limit: config.limiter.limit(),
                    remaining: 0,
                    reset_at_ms: penalty.penalty_until_ms,
                    algorithm,
                    role: subject.role,
                    retry_after_secs: Some(blocked_ms.div_ceil(MS_PER_SECOND).max(1)),
                    degraded: false,
                };
                self.note_violation(subject, now, blocked_ms).await;
                return Ok(verdict);
            }
        }

        let outcome = match &config.limiter {
            LimiterSpec::TokenBucket(strategy) => self.run_strategy(strategy, subject, now).await?,
            LimiterSpec::SlidingWindow(strategy) => self.run_strategy(strategy, subject, now).await?,
            LimiterSpec::ExponentialBackoff(strategy) => {
                self.run_strategy(strategy, subject, now).await?
            }
            LimiterSpec::Progressive(strategy) => self.run_strategy(strategy, subject, now).await?,
        };
        let mut verdict = Verdict::from_outcome(outcome, algorithm, subject.role);

        if !verdict.allowed {
            if let Some(policy) = &config.penalty {
                // 拒绝已提交，惩罚升级失败只记日志
                match self.escalate_penalty(policy, subject, now).await {
                    Ok(penalty) => {
                        if let Some(blocked_ms) = penalty.blocked_for(now) {
                            info!(
                                "惩罚升级: subject={}, violations={}, blocked_ms={}",
                                redact_subject(subject),
                                penalty.violation_count,
                                blocked_ms
                            );
                            let blocked_secs = blocked_ms.div_ceil(MS_PER_SECOND).max(1);
                            verdict.retry_after_secs =
                                Some(verdict.retry_after_secs.unwrap_or(0).max(blocked_secs));
                            verdict.reset_at_ms =
                                verdict.reset_at_ms.max(penalty.penalty_until_ms);
                        }
                    }
                    Err(e) => warn!(
                        "惩罚升级失败，保留主算法判定: subject={}, error={}",
                        redact_subject(subject),
                        e
                    ),
                }
            }
            let block_ms = verdict.retry_after_secs.unwrap_or(1) * MS_PER_SECOND;
            self.note_violation(subject, now, block_ms).await;
        }

        Ok(verdict)
    }

    async fn run_strategy<S: AdmissionStrategy>(
        &self,
        strategy: &S,
        subject: &SubjectKey,
        now: i64,
    ) -> Result<Outcome, StorageError> {
        let key = self
            .layout
            .state_key(&RateLimitKey::new(strategy.algorithm(), subject.clone()));
        self.compare_and_update(
            &key,
            || strategy.initial_state(now),
            |state| strategy.sanitize(state),
            |state| {
                let evaluation = strategy.evaluate(state, now);
                (evaluation.state, evaluation.ttl_ms, evaluation.outcome)
            },
        )
        .await
    }

    /// 当前生效的惩罚
    async fn active_penalty(
        &self,
        subject: &SubjectKey,
        now: i64,
    ) -> Result<Option<ProgressivePenaltyState>, StorageError> {
        let key = self.layout.penalty_key(subject);
        let raw = with_timeout(self.timeout, self.store.get(&key)).await?;
        let state = raw.and_then(|raw| self.decode::<ProgressivePenaltyState>(&raw));
        Ok(state.filter(|penalty| penalty.blocked_for(now).is_some()))
    }

    async fn escalate_penalty(
        &self,
        policy: &PenaltyPolicy,
        subject: &SubjectKey,
        now: i64,
    ) -> Result<ProgressivePenaltyState, StorageError> {
        let key = self.layout.penalty_key(subject);
        self.compare_and_update(
            &key,
            ProgressivePenaltyState::default,
            Some,
            |state| {
                let next = policy.register_strike(state, now);
                let ttl_ms = policy.ttl_ms(&next, now);
                (next.clone(), ttl_ms, next)
            },
        )
        .await
    }

    /// 读取-计算-比较并交换，冲突时重读重算
    async fn compare_and_update<T, R>(
        &self,
        key: &str,
        initial: impl Fn() -> T,
        sanitize: impl Fn(T) -> Option<T>,
        mut step: impl FnMut(T) -> (T, u64, R),
    ) -> Result<R, StorageError>
    where
        T: Serialize + DeserializeOwned,
    {
        for attempt in 0..self.max_cas_retries {
            let current = with_timeout(self.timeout, self.store.get(key)).await?;
            let state = current
                .as_deref()
                .and_then(|raw| self.decode::<T>(raw))
                .and_then(&sanitize)
                .unwrap_or_else(&initial);

            let (next, ttl_ms, result) = step(state);
            let encoded = serde_json::to_string(&next)
                .map_err(|e| StorageError::QueryError(format!("状态序列化失败: {}", e)))?;

            let swapped = with_timeout(
                self.timeout,
                self.store
                    .compare_and_swap(key, current.as_deref(), &encoded, ttl_ms),
            )
            .await?;
            if swapped {
                return Ok(result);
            }
            debug!("CAS 冲突，重试: attempt={}", attempt + 1);
        }

        Err(StorageError::QueryError(format!(
            "CAS 重试 {} 次后仍冲突",
            self.max_cas_retries
        )))
    }

    /// 解码已存状态，损坏时记录警告并按不存在处理
    fn decode<T: DeserializeOwned>(&self, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(
                    "限流状态损坏，按新状态处理: prefix={}, error={}",
                    self.layout.prefix(),
                    e
                );
                None
            }
        }
    }

    /// 记录违规；失败只记日志，不改变判定
    async fn note_violation(&self, subject: &SubjectKey, now: i64, block_ms: u64) {
        if let Err(e) = self.tracker.record_violation(subject, now, block_ms).await {
            warn!(
                "违规记录失败: subject={}, error={}",
                redact_subject(subject),
                e
            );
        }
    }

    fn degraded(&self, config: &LimitConfig, subject: &SubjectKey, error: StorageError) -> Verdict {
        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_degraded();
        }

        let now = self.clock.now_ms();
        let limit = config.limiter.limit();
        let algorithm = config.limiter.algorithm();

        match config.fail_mode {
            FailMode::Open => {
                warn!(
                    "计数存储不可用，降级放行: subject={}, error={}",
                    redact_subject(subject),
                    error
                );
                Verdict {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at_ms: now,
                    algorithm,
                    role: subject.role,
                    retry_after_secs: None,
                    degraded: true,
                }
            }
            FailMode::Closed => {
                warn!(
                    "计数存储不可用，降级拒绝: subject={}, error={}",
                    redact_subject(subject),
                    error
                );
                Verdict {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at_ms: now + (FAIL_CLOSED_RETRY_SECS * MS_PER_SECOND) as i64,
                    algorithm,
                    role: subject.role,
                    retry_after_secs: Some(FAIL_CLOSED_RETRY_SECS),
                    degraded: true,
                }
            }
        }
    }
}
