//! 配置加载与热更新集成测试
//!
//! 测试配置文件、角色覆盖与运行中替换策略的交互

use crate::common::Fixture;
use shelfguard::{
    config::RateLimitConfig,
    key::{Algorithm, Role},
};
use std::io::Write;

const LIBRARY_YAML: &str = r#"
version: "2.0"
roles:
  student: 3
routes:
  - name: "api"
    patterns: ["^/api/"]
    limiter:
      type: SlidingWindow
      window: "1m"
      max_requests: 10
  - name: "default"
    limiter:
      type: SlidingWindow
      window: "1m"
      max_requests: 5
overrides:
  - role: librarian
    route_class: "api"
    limiter:
      type: TokenBucket
      capacity: 3
      refill_per_sec: 1.0
exempt: ["^/health"]
"#;

const STRICT_TOML: &str = r#"
version = "2.1"

[[routes]]
name = "api"
patterns = ["^/api/"]

[routes.limiter]
type = "SlidingWindow"
window = "1m"
max_requests = 3

[[routes]]
name = "default"

[routes.limiter]
type = "SlidingWindow"
window = "1m"
max_requests = 5
"#;

fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_yaml_file_drives_coordinator() {
    let file = write_config(".yaml", LIBRARY_YAML);
    let config = RateLimitConfig::from_file(file.path()).unwrap();
    let fixture = Fixture::new(&config);

    assert_eq!(fixture.coordinator.classify("/api/books"), "api");
    assert_eq!(fixture.coordinator.classify("/opac"), "default");

    // 学生倍数被覆盖为 3
    assert_eq!(fixture.admitted(Role::Student, "student-1", "api", 40).await, 30);

    // 馆员使用覆盖的令牌桶，不乘倍数
    let verdict = fixture.check(Role::Librarian, "librarian-1", "api").await;
    assert_eq!(verdict.algorithm, Algorithm::TokenBucket);
    assert_eq!(verdict.limit, 3);
}

#[tokio::test]
async fn test_hot_reload_keeps_existing_counts() {
    let fixture = Fixture::new(&RateLimitConfig::from_yaml_str(LIBRARY_YAML).unwrap());
    assert_eq!(fixture.admitted(Role::Unauthenticated, "10.5.0.1", "api", 2).await, 2);

    let file = write_config(".toml", STRICT_TOML);
    let strict = RateLimitConfig::from_file(file.path()).unwrap();
    fixture.coordinator.update_config(&strict).unwrap();

    // 已有的 2 次请求仍在窗口内，新上限只剩 1 次
    assert_eq!(fixture.admitted(Role::Unauthenticated, "10.5.0.1", "api", 5).await, 1);
    let verdict = fixture.check(Role::Librarian, "librarian-1", "api").await;
    assert_eq!(verdict.algorithm, Algorithm::SlidingWindow);
    assert_eq!(verdict.limit, 30);
}

#[tokio::test]
async fn test_invalid_reload_keeps_previous_policies() {
    let fixture = Fixture::new(&RateLimitConfig::from_yaml_str(LIBRARY_YAML).unwrap());

    let mut broken = RateLimitConfig::from_yaml_str(LIBRARY_YAML).unwrap();
    broken.routes[0].patterns = vec!["(unclosed".to_string()];
    assert!(fixture.coordinator.update_config(&broken).is_err());

    assert_eq!(fixture.coordinator.classify("/api/books"), "api");
    assert_eq!(
        fixture
            .coordinator
            .config_for(Role::Unauthenticated, "api")
            .limiter
            .limit(),
        10
    );
}

#[test]
fn test_unsupported_extension_is_rejected() {
    let file = write_config(".ini", "version = 1");
    assert!(RateLimitConfig::from_file(file.path()).is_err());
}
