//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 违规追踪与统计
//!
//! 记录每次拒绝，提供管理端统计和重置。统计只用于观测，从不参与准入判断。
//!
//! 违规计数按天分桶存放，每个桶带 TTL，统计时汇总时间范围内的桶。

use crate::constants::{MIN_BLOCK_MARKER_MS, MS_PER_DAY};
use crate::error::StorageError;
use crate::key::{Algorithm, KeyLayout, SubjectKey};
use crate::log_redaction::redact_subject;
use crate::storage::{with_timeout, CounterStore};
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 违规者条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolatorEntry {
    /// 主体键 `role:identity:route_class`
    pub key: String,
    pub count: u64,
    /// 最近一次违规的时间（毫秒时间戳）
    pub last_violation_ms: Option<i64>,
}

/// 限流统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    /// 存活的算法状态键数量
    pub total_keys: u64,
    /// 当前处于拒绝状态的主体数量
    pub active_limits: u64,
    /// 统计范围内违规次数最多的主体，按次数降序
    pub top_violators: Vec<ViolatorEntry>,
    /// 统计范围内按角色的违规分布
    #[serde(rename = "distribution")]
    pub distribution_by_role: BTreeMap<String, u64>,
}

/// 违规追踪器
pub struct ViolationTracker {
    store: Arc<dyn CounterStore>,
    layout: KeyLayout,
    top_n: usize,
    /// 统计范围包含的天数
    horizon_days: i64,
    timeout: Duration,
}

impl ViolationTracker {
    /// 创建追踪器
    ///
    /// `horizon_ms` 向上取整到整天，最少一天。
    pub fn new(
        store: Arc<dyn CounterStore>,
        layout: KeyLayout,
        top_n: usize,
        horizon_ms: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            layout,
            top_n,
            horizon_days: horizon_ms.div_ceil(MS_PER_DAY).max(1) as i64,
            timeout,
        }
    }

    fn day_of(now_ms: i64) -> i64 {
        now_ms.div_euclid(MS_PER_DAY as i64)
    }

    /// 统计范围内的天
    fn days(&self, now_ms: i64) -> RangeInclusive<i64> {
        let today = Self::day_of(now_ms);
        (today - self.horizon_days + 1)..=today
    }

    /// 桶的存活时间：覆盖统计范围并多留一天
    fn bucket_ttl_ms(&self) -> u64 {
        (self.horizon_days as u64 + 1) * MS_PER_DAY
    }

    /// 记录一次拒绝
    ///
    /// `retry_after_ms` 是封锁标记的存活时间，通常为 retry-after 或惩罚剩余时长。
    pub async fn record_violation(
        &self,
        subject: &SubjectKey,
        now_ms: i64,
        retry_after_ms: u64,
    ) -> Result<(), StorageError> {
        let field = subject.to_string();
        let day = Self::day_of(now_ms);
        let ttl_ms = self.bucket_ttl_ms();

        let count = with_timeout(
            self.timeout,
            self.store
                .hash_increment(&self.layout.violations_hash(day), &field, 1, ttl_ms),
        )
        .await?;
        with_timeout(
            self.timeout,
            self.store.hash_increment(
                &self.layout.violations_by_role_hash(day),
                subject.role.as_str(),
                1,
                ttl_ms,
            ),
        )
        .await?;
        with_timeout(
            self.timeout,
            self.store.set(
                &self.layout.last_violation_key(subject),
                &now_ms.to_string(),
                self.horizon_days as u64 * MS_PER_DAY,
            ),
        )
        .await?;
        with_timeout(
            self.timeout,
            self.store.set(
                &self.layout.blocked_key(subject),
                &count.to_string(),
                retry_after_ms.max(MIN_BLOCK_MARKER_MS),
            ),
        )
        .await?;

        debug!(
            "记录违规: subject={}, count_today={}, retry_after_ms={}",
            redact_subject(subject),
            count,
            retry_after_ms
        );
        Ok(())
    }

    /// 汇总统计范围内各天的哈希
    async fn sum_buckets(
        &self,
        now_ms: i64,
        hash_for_day: impl Fn(i64) -> String,
    ) -> Result<HashMap<String, u64>, StorageError> {
        let mut totals: HashMap<String, u64> = HashMap::new();
        for day in self.days(now_ms) {
            let entries =
                with_timeout(self.timeout, self.store.hash_get_all(&hash_for_day(day))).await?;
            for (field, count) in entries {
                if count > 0 {
                    *totals.entry(field).or_insert(0) += count as u64;
                }
            }
        }
        Ok(totals)
    }

    /// 当前统计
    pub async fn get_stats(&self, now_ms: i64) -> Result<RateLimitStats, StorageError> {
        let mut total_keys = 0;
        for algorithm in Algorithm::ALL {
            total_keys += with_timeout(
                self.timeout,
                self.store
                    .count_prefix(&self.layout.state_prefix(algorithm)),
            )
            .await?;
        }

        let active_limits = with_timeout(
            self.timeout,
            self.store.count_prefix(&self.layout.blocked_prefix()),
        )
        .await?;

        let mut ranked: Vec<(String, u64)> = self
            .sum_buckets(now_ms, |day| self.layout.violations_hash(day))
            .await?
            .into_iter()
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.top_n);

        let mut top_violators = Vec::with_capacity(ranked.len());
        for (key, count) in ranked {
            let last_violation_ms = match key.parse::<SubjectKey>() {
                Ok(subject) => with_timeout(
                    self.timeout,
                    self.store.get(&self.layout.last_violation_key(&subject)),
                )
                .await?
                .and_then(|raw| raw.parse().ok()),
                Err(_) => None,
            };
            top_violators.push(ViolatorEntry {
                key,
                count,
                last_violation_ms,
            });
        }

        let distribution_by_role = self
            .sum_buckets(now_ms, |day| self.layout.violations_by_role_hash(day))
            .await?
            .into_iter()
            .collect();

        Ok(RateLimitStats {
            total_keys,
            active_limits,
            top_violators,
            distribution_by_role,
        })
    }

    /// 重置主体的全部限流状态
    ///
    /// 四种算法状态、惩罚记录、封锁标记和统计范围内的违规计数在一次清除中删除。
    /// 主体不存在时同样返回 `Ok`。
    pub async fn reset(&self, subject: &SubjectKey, now_ms: i64) -> Result<(), StorageError> {
        let keys = self.layout.subject_keys(subject);
        let days: Vec<i64> = self.days(now_ms).collect();
        let field = subject.to_string();
        let hash_fields: Vec<(String, String)> = days
            .iter()
            .map(|day| (self.layout.violations_hash(*day), field.clone()))
            .collect();

        let removed = with_timeout(self.timeout, self.store.purge(&keys, &hash_fields)).await?;

        let mut removed_count = 0;
        for (day, count) in days.iter().zip(removed) {
            if count <= 0 {
                continue;
            }
            removed_count += count;
            let decremented = with_timeout(
                self.timeout,
                self.store.hash_increment(
                    &self.layout.violations_by_role_hash(*day),
                    subject.role.as_str(),
                    -count,
                    0,
                ),
            )
            .await;
            if let Err(e) = decremented {
                warn!(
                    "角色违规分布未能同步扣减: subject={}, error={}",
                    redact_subject(subject),
                    e
                );
            }
        }

        info!(
            "重置限流状态: subject={}, removed_violations={}",
            redact_subject(subject),
            removed_count
        );
        Ok(())
    }
}
