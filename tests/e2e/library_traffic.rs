//! 端到端测试：日常图书馆流量
//!
//! 测试场景：
//! - 同一路由上角色越高配额越大
//! - 仪表盘令牌桶突发与补充
//! - 滑动窗口随时间滑动
//! - 并发请求下令牌不超发
//! - 请求路径分类到正确的算法

use crate::common::{single_route_config, token_bucket, Fixture};
use shelfguard::{
    config::{FailMode, RateLimitConfig},
    constants::{HEADER_ALGORITHM, HEADER_LIMIT},
    coordinator::CheckRequest,
    key::{Algorithm, Role},
    matchers::RequestContext,
    middleware::{Admission, AdmissionMiddleware},
};
use std::sync::Arc;

#[tokio::test]
async fn test_higher_roles_get_more_requests() {
    let fixture = Fixture::library();

    let mut admitted = Vec::new();
    for role in Role::ALL {
        admitted.push(fixture.admitted(role, "reader-1", "api", 60).await);
    }

    // 未认证 10、学生 20、教职工 50，馆员和管理员不受 60 次请求限制
    assert_eq!(admitted, vec![10, 20, 50, 60, 60]);
    assert!(admitted.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn test_dashboard_burst_then_refill() {
    let fixture = Fixture::library();

    for _ in 0..20 {
        assert!(fixture.check(Role::Unauthenticated, "10.1.0.1", "dashboard").await.allowed);
    }
    let denied = fixture.check(Role::Unauthenticated, "10.1.0.1", "dashboard").await;
    assert!(!denied.allowed);
    assert_eq!(denied.algorithm, Algorithm::TokenBucket);
    assert_eq!(denied.retry_after_secs, Some(2));

    // 0.5 令牌/秒，略多于 2 秒后恰好补充一个令牌
    fixture.clock.advance_ms(2_100);
    assert!(fixture.check(Role::Unauthenticated, "10.1.0.1", "dashboard").await.allowed);
    assert!(!fixture.check(Role::Unauthenticated, "10.1.0.1", "dashboard").await.allowed);
}

#[tokio::test]
async fn test_sliding_window_reopens_after_window() {
    let fixture = Fixture::library();

    assert_eq!(fixture.admitted(Role::Unauthenticated, "10.1.0.2", "api", 11).await, 10);

    fixture.clock.advance_ms(30_000);
    assert!(!fixture.check(Role::Unauthenticated, "10.1.0.2", "api").await.allowed);

    fixture.clock.advance_ms(30_001);
    assert_eq!(fixture.admitted(Role::Unauthenticated, "10.1.0.2", "api", 11).await, 10);
}

#[tokio::test]
async fn test_subjects_are_independent() {
    let fixture = Fixture::library();

    assert_eq!(fixture.admitted(Role::Unauthenticated, "10.1.0.3", "api", 15).await, 10);
    // 另一个客户端、另一个路由类别、另一个角色各自计数
    assert_eq!(fixture.admitted(Role::Unauthenticated, "10.1.0.4", "api", 15).await, 10);
    assert_eq!(fixture.admitted(Role::Unauthenticated, "10.1.0.3", "default", 15).await, 10);
    assert_eq!(fixture.admitted(Role::Student, "10.1.0.3", "api", 15).await, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_never_overspend_tokens() {
    let mut config = single_route_config(token_bucket(20, 0.001), None, FailMode::Open);
    // 每次成功写入只让一个竞争者失败一次，重试预算大于并发数即可保证收敛
    config.store.max_cas_retries = 100;
    let fixture = Fixture::new(&config);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let coordinator = Arc::clone(&fixture.coordinator);
        handles.push(tokio::spawn(async move {
            coordinator
                .check_rate_limit(&CheckRequest::new(Role::Unauthenticated, "10.1.0.5", "default"))
                .await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        let verdict = handle.await.unwrap();
        assert!(!verdict.degraded);
        if verdict.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 20);
}

#[tokio::test]
async fn test_paths_map_to_route_algorithms() {
    let config = RateLimitConfig::library_defaults();
    let fixture = Fixture::new(&config);
    let middleware = AdmissionMiddleware::from_config(fixture.coordinator.clone(), &config).unwrap();

    let cases = [
        ("/api/auth/login", "exponential_backoff", "5"),
        ("/api/dashboard/overview", "token_bucket", "20"),
        ("/api/students/import?dry_run=1", "progressive", "5"),
        ("/api/books/42", "sliding_window", "10"),
        ("/opac/search", "sliding_window", "10"),
    ];

    for (path, algorithm, limit) in cases {
        let context = RequestContext::new(Role::Unauthenticated, path).with_ip("10.1.0.6");
        let admission = middleware.admit(&context).await;
        let header = |name: &str| {
            admission
                .headers()
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };
        assert!(admission.is_admitted(), "{} 应当放行", path);
        assert_eq!(header(HEADER_ALGORITHM).as_deref(), Some(algorithm), "{}", path);
        assert_eq!(header(HEADER_LIMIT).as_deref(), Some(limit), "{}", path);
    }

    let asset = RequestContext::new(Role::Unauthenticated, "/covers/42.png").with_ip("10.1.0.6");
    assert_eq!(middleware.admit(&asset).await, Admission::Exempt);
}

#[tokio::test]
async fn test_authenticated_users_are_keyed_by_user_id() {
    let config = RateLimitConfig::library_defaults();
    let fixture = Fixture::new(&config);
    let middleware = AdmissionMiddleware::from_config(fixture.coordinator.clone(), &config).unwrap();

    // 同一个学生换了两个 IP，仍共享一个配额
    let mut admitted = 0;
    for i in 0..30 {
        let ip = format!("10.2.0.{}", i % 2);
        let context = RequestContext::new(Role::Student, "/api/books")
            .with_user_id("student-88")
            .with_ip(&ip);
        if middleware.admit(&context).await.is_admitted() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 20);
}
