//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 限流算法模块
//!
//! 四种准入算法，每种都是 `(已存状态, 当前时间) -> (是否允许, 新状态, 元数据)` 的纯函数。
//! 状态的读取和原子提交由协调器负责，这里不做任何 IO，也不读取墙上时间。

use crate::constants::{MS_PER_MINUTE, MS_PER_SECOND, TTL_MARGIN_MS};
use crate::key::Algorithm;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// 向上取整到秒，至少 1 秒
fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(MS_PER_SECOND).max(1)
}

/// 单次检查的结果元数据
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// 限制完全恢复的时间（毫秒时间戳）
    pub reset_at_ms: i64,
    pub retry_after_secs: Option<u64>,
}

/// 单次检查的完整结果
#[derive(Debug, Clone)]
pub struct Evaluation<S> {
    pub state: S,
    pub outcome: Outcome,
    /// 新状态在存储中的存活时间
    pub ttl_ms: u64,
}

/// 准入策略
///
/// 新增算法只需实现此 trait 并在 [`crate::config::LimiterSpec`] 中增加一个变体。
pub trait AdmissionStrategy: Send + Sync {
    /// 持久化状态
    type State: Serialize + DeserializeOwned + Clone + Send + Sync;

    fn algorithm(&self) -> Algorithm;

    /// 窗口内的基础配额（用于响应头）
    fn limit(&self) -> u64;

    /// 键首次出现时的状态
    fn initial_state(&self, now_ms: i64) -> Self::State;

    /// 修正越界状态，返回 None 表示状态不可用
    fn sanitize(&self, state: Self::State) -> Option<Self::State> {
        Some(state)
    }

    fn evaluate(&self, state: Self::State, now_ms: i64) -> Evaluation<Self::State>;
}

// ============================================================================
// 令牌桶
// ============================================================================

/// 令牌桶状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

/// 令牌桶
///
/// 令牌在读取时惰性补充，不依赖后台定时器。空闲足够久的客户端可以立即突发
/// `capacity` 个请求。
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    pub capacity: u64,
    /// 每秒补充的令牌数
    pub refill_per_sec: f64,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    fn refill_per_ms(&self) -> f64 {
        self.refill_per_sec / MS_PER_SECOND as f64
    }

    /// 计算 `now` 时刻的令牌数（上限为容量）
    pub fn refilled(&self, state: &TokenBucketState, now_ms: i64) -> f64 {
        let elapsed = now_ms.saturating_sub(state.last_refill_ms).max(0) as f64;
        (state.tokens + elapsed * self.refill_per_ms()).min(self.capacity as f64)
    }
}

impl AdmissionStrategy for TokenBucket {
    type State = TokenBucketState;

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn limit(&self) -> u64 {
        self.capacity
    }

    fn initial_state(&self, now_ms: i64) -> TokenBucketState {
        TokenBucketState {
            tokens: self.capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    fn sanitize(&self, state: TokenBucketState) -> Option<TokenBucketState> {
        if !state.tokens.is_finite() {
            return None;
        }
        Some(TokenBucketState {
            tokens: state.tokens.clamp(0.0, self.capacity as f64),
            last_refill_ms: state.last_refill_ms,
        })
    }

    fn evaluate(&self, state: TokenBucketState, now_ms: i64) -> Evaluation<TokenBucketState> {
        let capacity = self.capacity as f64;
        let mut tokens = self.refilled(&state, now_ms);
        let last_refill_ms = now_ms.max(state.last_refill_ms);

        let (allowed, retry_after_secs) = if tokens >= 1.0 {
            tokens -= 1.0;
            (true, None)
        } else {
            let wait_secs = ((1.0 - tokens) / self.refill_per_sec).ceil() as u64;
            (false, Some(wait_secs.max(1)))
        };

        let until_full_ms = ((capacity - tokens) / self.refill_per_ms()).ceil() as u64;
        Evaluation {
            state: TokenBucketState {
                tokens,
                last_refill_ms,
            },
            outcome: Outcome {
                allowed,
                limit: self.capacity,
                remaining: tokens.floor() as u64,
                reset_at_ms: now_ms.saturating_add(until_full_ms as i64),
                retry_after_secs,
            },
            // 过期后重新创建的满桶与补满后的状态一致
            ttl_ms: until_full_ms.saturating_add(TTL_MARGIN_MS),
        }
    }
}

// ============================================================================
// 滑动窗口
// ============================================================================

/// 滑动窗口状态：窗口内已接受请求的时间戳（升序）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub hits: VecDeque<i64>,
}

impl SlidingWindowState {
    /// `[now - window_ms, now]` 内的请求数
    pub fn count_at(&self, now_ms: i64, window_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(window_ms as i64);
        self.hits
            .iter()
            .filter(|&&hit| hit >= cutoff && hit <= now_ms)
            .count()
    }
}

/// 滑动窗口
///
/// 精确统计尾随窗口内的请求。存储量随窗口内流量增长，窗口较短且会过期。
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindow {
    pub window_ms: u64,
    pub max_requests: u64,
}

impl SlidingWindow {
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }
}

impl AdmissionStrategy for SlidingWindow {
    type State = SlidingWindowState;

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn limit(&self) -> u64 {
        self.max_requests
    }

    fn initial_state(&self, _now_ms: i64) -> SlidingWindowState {
        SlidingWindowState::default()
    }

    fn sanitize(&self, mut state: SlidingWindowState) -> Option<SlidingWindowState> {
        state.hits.make_contiguous().sort_unstable();
        Some(state)
    }

    fn evaluate(&self, mut state: SlidingWindowState, now_ms: i64) -> Evaluation<SlidingWindowState> {
        let window = self.window_ms as i64;
        let cutoff = now_ms.saturating_sub(window);

        while let Some(&front) = state.hits.front() {
            if front < cutoff {
                state.hits.pop_front();
            } else {
                break;
            }
        }

        let count = state.hits.len() as u64;
        let (allowed, retry_after_secs) = if count < self.max_requests {
            state.hits.push_back(now_ms);
            (true, None)
        } else {
            // 最早的时间戳在 front + window + 1 时离开窗口
            let oldest = state.hits.front().copied().unwrap_or(now_ms);
            let wait_ms = (oldest + window + 1).saturating_sub(now_ms).max(0) as u64;
            (false, Some(ceil_secs(wait_ms)))
        };

        let used = state.hits.len() as u64;
        let reset_at_ms = state
            .hits
            .front()
            .map_or(now_ms + window, |oldest| oldest + window);

        Evaluation {
            state,
            outcome: Outcome {
                allowed,
                limit: self.max_requests,
                remaining: self.max_requests.saturating_sub(used),
                reset_at_ms,
                retry_after_secs,
            },
            ttl_ms: self.window_ms + TTL_MARGIN_MS,
        }
    }
}

// ============================================================================
// 指数退避
// ============================================================================

/// 指数退避状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackoffState {
    /// 当前尝试窗口内的请求数
    pub attempts: u64,
    pub window_start_ms: i64,
    pub violation_count: u32,
    pub last_violation_ms: i64,
}

/// 指数退避
///
/// 尝试窗口内用尽 `max_attempts` 后开始违规；违规未消除前再次请求会让锁定时长翻倍，
/// 到达上限后保持不变。在计算出的延迟之后到达的请求清零违规并放行。
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub window_ms: u64,
    pub max_attempts: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ExponentialBackoff {
    /// 第 `violation_count` 次违规对应的延迟
    ///
    /// `base_delay * 2^(violation_count - 1)`，上限为 `max_delay`。
    pub fn delay_ms(&self, violation_count: u32) -> u64 {
        if violation_count == 0 {
            return 0;
        }
        let factor = 1u64
            .checked_shl(violation_count - 1)
            .unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    fn deny(&self, mut state: BackoffState, now_ms: i64) -> Evaluation<BackoffState> {
        state.violation_count = state.violation_count.saturating_add(1);
        state.last_violation_ms = now_ms;
        let delay = self.delay_ms(state.violation_count);
        Evaluation {
            ttl_ms: self.window_ms.max(delay) + TTL_MARGIN_MS,
            outcome: Outcome {
                allowed: false,
                limit: self.max_attempts,
                remaining: 0,
                reset_at_ms: now_ms.saturating_add(delay as i64),
                retry_after_secs: Some(ceil_secs(delay)),
            },
            state,
        }
    }

    fn allow(&self, state: BackoffState) -> Evaluation<BackoffState> {
        Evaluation {
            outcome: Outcome {
                allowed: true,
                limit: self.max_attempts,
                remaining: self.max_attempts.saturating_sub(state.attempts),
                reset_at_ms: state.window_start_ms + self.window_ms as i64,
                retry_after_secs: None,
            },
            ttl_ms: self.window_ms + TTL_MARGIN_MS,
            state,
        }
    }
}

impl AdmissionStrategy for ExponentialBackoff {
    type State = BackoffState;

    fn algorithm(&self) -> Algorithm {
        Algorithm::ExponentialBackoff
    }

    fn limit(&self) -> u64 {
        self.max_attempts
    }

    fn initial_state(&self, now_ms: i64) -> BackoffState {
        BackoffState {
            window_start_ms: now_ms,
            ..Default::default()
        }
    }

    fn evaluate(&self, mut state: BackoffState, now_ms: i64) -> Evaluation<BackoffState> {
        if state.violation_count > 0 {
            let next_permitted =
                state.last_violation_ms + self.delay_ms(state.violation_count) as i64;
            if now_ms < next_permitted {
                return self.deny(state, now_ms);
            }
            // 延迟已过，原谅之前的违规
            state.violation_count = 0;
            state.attempts = 1;
            state.window_start_ms = now_ms;
            return self.allow(state);
        }

        if now_ms - state.window_start_ms >= self.window_ms as i64 {
            state.attempts = 0;
            state.window_start_ms = now_ms;
        }

        if state.attempts < self.max_attempts {
            state.attempts += 1;
            self.allow(state)
        } else {
            self.deny(state, now_ms)
        }
    }
}

// ============================================================================
// 渐进式惩罚
// ============================================================================

/// 惩罚状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressivePenaltyState {
    pub violation_count: u32,
    pub penalty_until_ms: i64,
    /// 距离下一次违规累计的拒绝次数
    #[serde(default)]
    pub strikes: u32,
}

impl ProgressivePenaltyState {
    /// 惩罚生效时返回剩余毫秒数
    pub fn blocked_for(&self, now_ms: i64) -> Option<u64> {
        (now_ms < self.penalty_until_ms).then(|| (self.penalty_until_ms - now_ms) as u64)
    }
}

/// 惩罚策略
///
/// 每次违规 `violation_count + 1`，惩罚时长
/// `min(max_penalty_minutes, base_penalty_minutes * violation_count)`。
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyPolicy {
    pub base_penalty_minutes: u64,
    pub max_penalty_minutes: u64,
    /// 累计多少次拒绝算作一次违规
    pub threshold: u32,
    /// 惩罚结束后记录保留多久
    pub forgive_after_ms: u64,
}

impl PenaltyPolicy {
    /// 第 `violation_count` 次违规的惩罚时长
    pub fn penalty_ms(&self, violation_count: u32) -> u64 {
        self.base_penalty_minutes
            .saturating_mul(violation_count as u64)
            .min(self.max_penalty_minutes)
            .saturating_mul(MS_PER_MINUTE)
    }

    /// 记录一次拒绝，达到阈值时升级惩罚
    pub fn register_strike(
        &self,
        mut state: ProgressivePenaltyState,
        now_ms: i64,
    ) -> ProgressivePenaltyState {
        state.strikes = state.strikes.saturating_add(1);
        if state.strikes >= self.threshold.max(1) {
            state.strikes = 0;
            state.violation_count = state.violation_count.saturating_add(1);
            state.penalty_until_ms = now_ms.saturating_add(self.penalty_ms(state.violation_count) as i64);
        }
        state
    }

    pub fn ttl_ms(&self, state: &ProgressivePenaltyState, now_ms: i64) -> u64 {
        state.blocked_for(now_ms).unwrap_or(0) + self.forgive_after_ms
    }
}

/// 渐进式惩罚作为主算法时的状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressiveState {
    pub hits: u64,
    pub window_start_ms: i64,
    pub penalty: ProgressivePenaltyState,
}

/// 渐进式惩罚（主算法）
///
/// 固定窗口计数，超出 `max_requests` 的请求计为拒绝并按 [`PenaltyPolicy`] 升级惩罚；
/// 惩罚期间所有请求直接拒绝。
#[derive(Debug, Clone, PartialEq)]
pub struct Progressive {
    pub window_ms: u64,
    pub max_requests: u64,
    pub penalty: PenaltyPolicy,
}

impl Progressive {
    fn penalized(&self, state: ProgressiveState, now_ms: i64, blocked_ms: u64) -> Evaluation<ProgressiveState> {
        Evaluation {
            ttl_ms: self.window_ms.max(self.penalty.ttl_ms(&state.penalty, now_ms)) + TTL_MARGIN_MS,
            outcome: Outcome {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_at_ms: state.penalty.penalty_until_ms,
                retry_after_secs: Some(ceil_secs(blocked_ms)),
            },
            state,
        }
    }
}

impl AdmissionStrategy for Progressive {
    type State = ProgressiveState;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Progressive
    }

    fn limit(&self) -> u64 {
        self.max_requests
    }

    fn initial_state(&self, now_ms: i64) -> ProgressiveState {
        ProgressiveState {
            window_start_ms: now_ms,
            ..Default::default()
        }
    }

    fn evaluate(&self, mut state: ProgressiveState, now_ms: i64) -> Evaluation<ProgressiveState> {
        if let Some(blocked_ms) = state.penalty.blocked_for(now_ms) {
            return self.penalized(state, now_ms, blocked_ms);
        }

        if now_ms - state.window_start_ms >= self.window_ms as i64 {
            state.hits = 0;
            state.window_start_ms = now_ms;
        }

        if state.hits < self.max_requests {
            state.hits += 1;
            let ttl_ms = self.window_ms.max(self.penalty.ttl_ms(&state.penalty, now_ms)) + TTL_MARGIN_MS;
            return Evaluation {
                outcome: Outcome {
                    allowed: true,
                    limit: self.max_requests,
                    remaining: self.max_requests - state.hits,
                    reset_at_ms: state.window_start_ms + self.window_ms as i64,
                    retry_after_secs: None,
                },
                ttl_ms,
                state,
            };
        }

        state.penalty = self.penalty.register_strike(state.penalty, now_ms);
        match state.penalty.blocked_for(now_ms) {
            Some(blocked_ms) => {
                // 惩罚结束后从新窗口开始计数
                state.hits = 0;
                state.window_start_ms = state.penalty.penalty_until_ms;
                self.penalized(state, now_ms, blocked_ms)
            }
            None => {
                let window_end = state.window_start_ms + self.window_ms as i64;
                let wait_ms = window_end.saturating_sub(now_ms).max(0) as u64;
                Evaluation {
                    ttl_ms: self.window_ms.max(self.penalty.ttl_ms(&state.penalty, now_ms)) + TTL_MARGIN_MS,
                    outcome: Outcome {
                        allowed: false,
                        limit: self.max_requests,
                        remaining: 0,
                        reset_at_ms: window_end,
                        retry_after_secs: Some(ceil_secs(wait_ms)),
                    },
                    state,
                }
            }
        }
    }
}
