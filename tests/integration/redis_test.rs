//! Redis集成测试
//!
//! 测试Redis计数存储与协调器的集成功能

use shelfguard::{
    clock::{ManualClock, SystemClock},
    config::RateLimitConfig,
    coordinator::{CheckRequest, Coordinator},
    key::{Role, SubjectKey},
    redis_storage::{RedisConfig, RedisCounterStore},
    storage::CounterStore,
};
use std::sync::Arc;

const REDIS_URL: &str = "redis://127.0.0.1:6379";

async fn store() -> RedisCounterStore {
    RedisCounterStore::new(RedisConfig::new(REDIS_URL).db(15))
        .await
        .unwrap()
}

/// 每个测试使用独立的键前缀，避免互相干扰
fn config_with_prefix(prefix: &str) -> RateLimitConfig {
    let mut config = RateLimitConfig::library_defaults();
    config.store.key_prefix = format!("{}{}", prefix, std::process::id());
    config
}

/// 测试Redis连接
#[tokio::test]
#[ignore] // 需要Redis服务器运行
async fn test_redis_connection() {
    let store = store().await;
    assert!(store.ping().await.is_ok());
}

/// 测试比较并交换
#[tokio::test]
#[ignore]
async fn test_redis_compare_and_swap() {
    let store = store().await;
    let key = format!("cas-test:{}", std::process::id());
    store.purge(&[key.clone()], &[]).await.unwrap();

    assert!(store.compare_and_swap(&key, None, "1", 10_000).await.unwrap());
    assert!(!store.compare_and_swap(&key, None, "2", 10_000).await.unwrap());
    assert!(!store.compare_and_swap(&key, Some("0"), "2", 10_000).await.unwrap());
    assert!(store.compare_and_swap(&key, Some("1"), "2", 10_000).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("2"));

    store.purge(&[key], &[]).await.unwrap();
}

/// 测试哈希计数与清除
#[tokio::test]
#[ignore]
async fn test_redis_hash_and_purge() {
    let store = store().await;
    let hash = format!("hash-test:{}", std::process::id());
    let key = format!("{}:marker", hash);

    store.set(&key, "x", 10_000).await.unwrap();
    assert_eq!(store.hash_increment(&hash, "a", 3, 60_000).await.unwrap(), 3);
    assert_eq!(store.hash_increment(&hash, "b", 1, 0).await.unwrap(), 1);
    assert_eq!(store.count_prefix(&format!("{}:", hash)).await.unwrap(), 1);

    let removed = store
        .purge(&[key.clone()], &[(hash.clone(), "a".to_string())])
        .await
        .unwrap();
    assert_eq!(removed, vec![3]);
    assert_eq!(store.get(&key).await.unwrap(), None);
    assert_eq!(store.hash_get_all(&hash).await.unwrap(), vec![("b".to_string(), 1)]);

    store
        .purge(&[], &[(hash, "b".to_string())])
        .await
        .unwrap();
}

/// 测试两个协调器共享同一组计数
#[tokio::test]
#[ignore]
async fn test_redis_shared_across_coordinators() {
    let config = config_with_prefix("shared");
    let store: Arc<dyn CounterStore> = Arc::new(store().await);
    let first = Coordinator::new(&config, store.clone(), Arc::new(SystemClock)).unwrap();
    let second = Coordinator::new(&config, store, Arc::new(SystemClock)).unwrap();

    let request = CheckRequest::new(Role::Unauthenticated, "10.6.0.1", "api");
    let subject = request.subject();
    assert!(first.reset_rate_limit(&subject).await);

    let mut admitted = 0;
    for i in 0..20 {
        let coordinator = if i % 2 == 0 { &first } else { &second };
        let verdict = coordinator.check_rate_limit(&request).await;
        assert!(!verdict.degraded);
        if verdict.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);

    assert!(second.reset_rate_limit(&subject).await);
}

/// 测试统计与重置
#[tokio::test]
#[ignore]
async fn test_redis_stats_and_reset() {
    let config = config_with_prefix("stats");
    let store = Arc::new(store().await);
    let coordinator = Coordinator::new(&config, store, Arc::new(ManualClock::default())).unwrap();
    let subject = SubjectKey::new(Role::Student, "student-redis", "api");
    coordinator.reset_rate_limit(&subject).await;

    let request = CheckRequest::new(subject.role, subject.identity.clone(), subject.route_class.clone());
    for _ in 0..22 {
        coordinator.check_rate_limit(&request).await;
    }

    let stats = coordinator.get_rate_limit_stats().await.unwrap();
    let entry = stats
        .top_violators
        .iter()
        .find(|entry| entry.key == subject.to_string())
        .unwrap();
    assert_eq!(entry.count, 2);

    assert!(coordinator.reset_rate_limit(&subject).await);
    let stats = coordinator.get_rate_limit_stats().await.unwrap();
    assert!(stats.top_violators.iter().all(|entry| entry.key != subject.to_string()));
}
