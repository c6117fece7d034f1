//! 端到端测试：计数存储故障
//!
//! 测试场景：
//! - 存储挂起时超时后降级放行
//! - 失败关闭的路由在故障时拒绝
//! - 存储恢复后计数继续生效
//! - 惩罚写入失败时保留主算法的拒绝
//! - 管理接口把故障报告给调用方

use crate::common::{coordinator_on, penalty, single_route_config, sliding_window};
use async_trait::async_trait;
use shelfguard::{
    clock::ManualClock,
    config::{FailMode, RateLimitConfig},
    coordinator::CheckRequest,
    error::StorageError,
    key::{Role, SubjectKey},
    matchers::RequestContext,
    middleware::{Admission, AdmissionMiddleware},
    storage::{CounterStore, MemoryCounterStore, OutageMode, UnavailableStore},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 可以随时切换故障状态的存储
struct FlakyStore {
    inner: MemoryCounterStore,
    down: AtomicBool,
    /// 只让惩罚键的写入失败
    penalty_writes_down: AtomicBool,
}

impl FlakyStore {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: MemoryCounterStore::new(clock),
            down: AtomicBool::new(false),
            penalty_writes_down: AtomicBool::new(false),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn set_penalty_writes_down(&self, down: bool) {
        self.penalty_writes_down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StorageError::ConnectionError("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StorageError> {
        self.check()?;
        if key.contains(":penalty:") && self.penalty_writes_down.load(Ordering::SeqCst) {
            return Err(StorageError::TimeoutError("penalty write timed out".to_string()));
        }
        self.inner.compare_and_swap(key, expected, value, ttl_ms).await
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), StorageError> {
        self.check()?;
        self.inner.set(key, value, ttl_ms).await
    }

    async fn hash_increment(
        &self,
        hash: &str,
        field: &str,
        delta: i64,
        ttl_ms: u64,
    ) -> Result<i64, StorageError> {
        self.check()?;
        self.inner.hash_increment(hash, field, delta, ttl_ms).await
    }

    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, i64)>, StorageError> {
        self.check()?;
        self.inner.hash_get_all(hash).await
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.count_prefix(prefix).await
    }

    async fn purge(
        &self,
        keys: &[String],
        hash_fields: &[(String, String)],
    ) -> Result<Vec<i64>, StorageError> {
        self.check()?;
        self.inner.purge(keys, hash_fields).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_hanging_store_fails_open_after_timeout() {
    let mut config = RateLimitConfig::library_defaults();
    config.store.timeout_ms = 20;
    let (coordinator, _clock) = coordinator_on(&config, Arc::new(UnavailableStore::new(OutageMode::Hang)));

    for _ in 0..30 {
        let verdict = coordinator
            .check_rate_limit(&CheckRequest::new(Role::Unauthenticated, "10.4.0.1", "api"))
            .await;
        assert!(verdict.allowed);
        assert!(verdict.degraded);
        assert_eq!(verdict.limit, 10);
        assert_eq!(verdict.remaining, 10);
        assert_eq!(verdict.retry_after_secs, None);
    }
}

#[tokio::test]
async fn test_fail_closed_route_rejects_during_outage() {
    let config = single_route_config(sliding_window("1m", 100), None, FailMode::Closed);
    let (coordinator, _clock) =
        coordinator_on(&config, Arc::new(UnavailableStore::new(OutageMode::Refuse)));

    let verdict = coordinator
        .check_rate_limit(&CheckRequest::new(Role::Admin, "root", "default"))
        .await;
    assert!(!verdict.allowed);
    assert!(verdict.degraded);
    assert_eq!(verdict.retry_after_secs, Some(1));
}

#[tokio::test]
async fn test_counting_resumes_after_recovery() {
    let config = RateLimitConfig::library_defaults();
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(FlakyStore::new(clock.clone()));
    let coordinator = shelfguard::coordinator::Coordinator::new(&config, store.clone(), clock).unwrap();
    let request = CheckRequest::new(Role::Unauthenticated, "10.4.0.2", "api");

    for _ in 0..6 {
        assert!(coordinator.check_rate_limit(&request).await.allowed);
    }

    store.set_down(true);
    for _ in 0..20 {
        let verdict = coordinator.check_rate_limit(&request).await;
        assert!(verdict.allowed && verdict.degraded);
    }

    // 故障期间的请求不计数，恢复后从 6 次继续
    store.set_down(false);
    let mut admitted = 0;
    for _ in 0..10 {
        let verdict = coordinator.check_rate_limit(&request).await;
        assert!(!verdict.degraded);
        if verdict.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 4);
}

#[tokio::test]
async fn test_failed_penalty_write_keeps_denial() {
    let config = single_route_config(
        sliding_window("1m", 1),
        Some(penalty(2, 10, 1)),
        FailMode::Open,
    );
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(FlakyStore::new(clock.clone()));
    store.set_penalty_writes_down(true);
    let coordinator =
        shelfguard::coordinator::Coordinator::new(&config, store.clone(), clock).unwrap();
    let request = CheckRequest::new(Role::Unauthenticated, "10.4.0.5", "default");

    let mut admitted = 0;
    for _ in 0..20 {
        let verdict = coordinator.check_rate_limit(&request).await;
        assert!(!verdict.degraded);
        if verdict.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);

    // 违规照常记录
    let stats = coordinator.get_rate_limit_stats().await.unwrap();
    assert_eq!(stats.top_violators[0].count, 19);
    assert_eq!(stats.active_limits, 1);
}

#[tokio::test]
async fn test_admin_operations_report_outage() {
    let config = RateLimitConfig::library_defaults();
    let (coordinator, _clock) =
        coordinator_on(&config, Arc::new(UnavailableStore::new(OutageMode::Refuse)));

    tokio_test::assert_err!(coordinator.get_rate_limit_stats().await);
    let subject = SubjectKey::new(Role::Student, "student-3", "api");
    assert!(!coordinator.reset_rate_limit(&subject).await);
}

#[tokio::test]
async fn test_middleware_keeps_serving_during_outage() {
    let config = RateLimitConfig::library_defaults();
    let (coordinator, _clock) =
        coordinator_on(&config, Arc::new(UnavailableStore::new(OutageMode::Refuse)));
    let middleware = AdmissionMiddleware::from_config(coordinator, &config).unwrap();

    let health = RequestContext::new(Role::Unauthenticated, "/health").with_ip("10.4.0.3");
    assert_eq!(middleware.admit(&health).await, Admission::Exempt);

    let catalog = RequestContext::new(Role::Unauthenticated, "/api/books").with_ip("10.4.0.3");
    match middleware.admit(&catalog).await {
        Admission::Allowed { verdict, headers } => {
            assert!(verdict.degraded);
            assert_eq!(headers.len(), 5);
        }
        other => panic!("降级时应当放行: {:?}", other),
    }
}
