//! 端到端测试：滥用与惩罚升级
//!
//! 测试场景：
//! - 登录暴力破解：指数退避叠加惩罚
//! - 批量导入：渐进式惩罚逐次加长并封顶
//! - 违规统计与管理员重置

use crate::common::{penalty, single_route_config, Fixture};
use shelfguard::{
    config::{FailMode, LimiterConfig},
    key::{Algorithm, Role, SubjectKey},
};

const MINUTE_MS: i64 = 60_000;

#[tokio::test]
async fn test_login_bruteforce_escalates_to_penalty() {
    let fixture = Fixture::library();
    let attacker = "203.0.113.7";

    for _ in 0..5 {
        assert!(fixture.check(Role::Unauthenticated, attacker, "auth").await.allowed);
    }

    // 退避延迟 1s、2s、4s；第三次拒绝达到惩罚阈值，封禁 5 分钟
    let retries: Vec<Option<u64>> = {
        let mut retries = Vec::new();
        for _ in 0..3 {
            let verdict = fixture.check(Role::Unauthenticated, attacker, "auth").await;
            assert!(!verdict.allowed);
            assert_eq!(verdict.algorithm, Algorithm::ExponentialBackoff);
            retries.push(verdict.retry_after_secs);
        }
        retries
    };
    assert_eq!(retries, vec![Some(1), Some(2), Some(300)]);

    // 惩罚期间的请求不再升级惩罚
    fixture.clock.advance_ms(MINUTE_MS);
    let blocked = fixture.check(Role::Unauthenticated, attacker, "auth").await;
    assert!(!blocked.allowed);
    assert_eq!(blocked.retry_after_secs, Some(240));

    fixture.clock.advance_ms(4 * MINUTE_MS);
    assert!(fixture.check(Role::Unauthenticated, attacker, "auth").await.allowed);

    // 其他客户端不受影响
    assert!(fixture.check(Role::Unauthenticated, "198.51.100.2", "auth").await.allowed);
}

#[tokio::test]
async fn test_import_penalty_grows_per_violation() {
    let fixture = Fixture::library();
    let uploader = "192.0.2.10";

    assert_eq!(fixture.admitted(Role::Unauthenticated, uploader, "import", 5).await, 5);
    let first = fixture.check(Role::Unauthenticated, uploader, "import").await;
    assert!(!first.allowed);
    assert_eq!(first.algorithm, Algorithm::Progressive);
    assert_eq!(first.retry_after_secs, Some(15 * 60));

    fixture.clock.advance_ms(15 * MINUTE_MS);
    assert_eq!(fixture.admitted(Role::Unauthenticated, uploader, "import", 5).await, 5);
    let second = fixture.check(Role::Unauthenticated, uploader, "import").await;
    assert_eq!(second.retry_after_secs, Some(30 * 60));
}

#[tokio::test]
async fn test_progressive_penalty_is_capped() {
    let config = single_route_config(
        LimiterConfig::Progressive {
            window: "1m".to_string(),
            max_requests: 1,
            penalty: penalty(10, 25, 1),
        },
        None,
        FailMode::Open,
    );
    let fixture = Fixture::new(&config);

    let mut penalties = Vec::new();
    for _ in 0..4 {
        assert!(fixture.check(Role::Unauthenticated, "10.3.0.1", "default").await.allowed);
        let denied = fixture.check(Role::Unauthenticated, "10.3.0.1", "default").await;
        assert!(!denied.allowed);
        let retry = denied.retry_after_secs.unwrap();
        penalties.push(retry / 60);
        fixture.clock.advance_ms(retry as i64 * 1_000);
    }

    assert_eq!(penalties, vec![10, 20, 25, 25]);
}

#[tokio::test]
async fn test_quiet_period_forgives_violations() {
    let config = single_route_config(
        LimiterConfig::Progressive {
            window: "1m".to_string(),
            max_requests: 1,
            penalty: penalty(10, 60, 1),
        },
        None,
        FailMode::Open,
    );
    let fixture = Fixture::new(&config);

    assert!(fixture.check(Role::Unauthenticated, "10.3.0.2", "default").await.allowed);
    let first = fixture.check(Role::Unauthenticated, "10.3.0.2", "default").await;
    assert_eq!(first.retry_after_secs, Some(600));

    // 惩罚结束后又安静了一整天
    fixture.clock.advance_ms(10 * MINUTE_MS + 24 * 60 * MINUTE_MS + MINUTE_MS);

    assert!(fixture.check(Role::Unauthenticated, "10.3.0.2", "default").await.allowed);
    let again = fixture.check(Role::Unauthenticated, "10.3.0.2", "default").await;
    assert_eq!(again.retry_after_secs, Some(600));
}

#[tokio::test]
async fn test_violation_stats_and_admin_reset() {
    let fixture = Fixture::library();
    let noisy = SubjectKey::new(Role::Unauthenticated, "203.0.113.50", "api");
    let student = SubjectKey::new(Role::Student, "student-7", "api");

    assert_eq!(fixture.admitted(Role::Unauthenticated, &noisy.identity, "api", 14).await, 10);
    assert_eq!(fixture.admitted(Role::Student, &student.identity, "api", 21).await, 20);

    let stats = fixture.coordinator.get_rate_limit_stats().await.unwrap();
    assert_eq!(stats.total_keys, 2);
    assert_eq!(stats.active_limits, 2);
    assert_eq!(stats.top_violators[0].key, noisy.to_string());
    assert_eq!(stats.top_violators[0].count, 4);
    assert_eq!(stats.top_violators[1].count, 1);
    assert_eq!(stats.distribution_by_role.get("unauthenticated"), Some(&4));
    assert_eq!(stats.distribution_by_role.get("student"), Some(&1));

    assert!(fixture.coordinator.reset_rate_limit(&noisy).await);
    assert!(fixture.check(Role::Unauthenticated, &noisy.identity, "api").await.allowed);

    let stats = fixture.coordinator.get_rate_limit_stats().await.unwrap();
    assert_eq!(stats.top_violators.len(), 1);
    assert_eq!(stats.top_violators[0].key, student.to_string());
    assert_eq!(stats.distribution_by_role.get("unauthenticated"), None);
    assert_eq!(stats.active_limits, 1);

    // 重置不存在的主体同样成功
    let stranger = SubjectKey::new(Role::Staff, "nobody", "api");
    assert!(fixture.coordinator.reset_rate_limit(&stranger).await);
}
