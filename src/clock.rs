//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 时钟抽象
//!
//! 限流算法从不直接读取墙上时间，而是通过注入的 [`Clock`] 获取毫秒时间戳，
//! 测试中使用 [`ManualClock`] 精确推进时间。

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// 时间源
pub trait Clock: Send + Sync {
    /// 当前 Unix 毫秒时间戳
    fn now_ms(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 手动时钟
///
/// 只有显式调用 [`ManualClock::advance`] 或 [`ManualClock::set`] 时才会前进。
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// 以给定毫秒时间戳创建
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    /// 前进指定时长
    pub fn advance(&self, by: Duration) {
        self.advance_ms(by.as_millis() as i64);
    }

    /// 前进指定毫秒数
    pub fn advance_ms(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// 设置为指定时间戳
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2026-01-01T00:00:00Z
        Self::new(1_767_225_600_000)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
