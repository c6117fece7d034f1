//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配置模块
//!
//! 定义准入控制的配置结构，以及按 `(角色, 路由类别)` 预先解析好的策略表。

use crate::constants::{
    DEFAULT_FALLBACK_ROUTE, DEFAULT_KEY_PREFIX, DEFAULT_MAX_BACKOFF_DELAY_MS,
    DEFAULT_MAX_CAS_RETRIES, DEFAULT_MAX_PENALTY_MINUTES, DEFAULT_PENALTY_FORGIVE_MS,
    DEFAULT_STATS_HORIZON_DAYS, DEFAULT_STORE_TIMEOUT_MS,
    DEFAULT_TOP_VIOLATORS, KEY_DELIMITER, STRICTEST_MAX_REQUESTS, STRICTEST_WINDOW_MS,
};
use crate::error::ShelfGuardError;
use crate::key::{Algorithm, Role};
use crate::limiters::{
    AdmissionStrategy, ExponentialBackoff, PenaltyPolicy, Progressive, SlidingWindow, TokenBucket,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// 解析时长字符串
///
/// 支持的格式：
/// - `500ms` - 500毫秒
/// - `10s` - 10秒
/// - `15m` - 15分钟
/// - `2h` - 2小时
/// - `1d` - 1天
pub fn parse_duration(input: &str) -> Result<Duration, ShelfGuardError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ShelfGuardError::ConfigError("时长不能为空".to_string()));
    }

    let (num_part, unit_part) =
        input.split_at(input.find(|c: char| c.is_alphabetic()).unwrap_or(input.len()));
    let num_str = num_part.trim();
    let unit = unit_part.trim().to_lowercase();

    if num_str.is_empty() {
        return Err(ShelfGuardError::ConfigError(
            "时长格式错误：缺少数字部分".to_string(),
        ));
    }

    let num: u64 = num_str
        .parse()
        .map_err(|_| ShelfGuardError::ConfigError(format!("无效的数字格式: {}", num_str)))?;

    if num == 0 {
        return Err(ShelfGuardError::ConfigError("时长必须大于0".to_string()));
    }

    let seconds = |factor: u64| {
        num.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| ShelfGuardError::ConfigError(format!("时长过大: {}", input)))
    };

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(num)),
        "" | "s" | "sec" | "second" | "seconds" => seconds(1),
        "m" | "min" | "minute" | "minutes" => seconds(60),
        "h" | "hr" | "hour" | "hours" => seconds(3600),
        "d" | "day" | "days" => seconds(86_400),
        _ => Err(ShelfGuardError::ConfigError(format!(
            "不支持的单位: {}。支持的单位: ms, s, m, h, d",
            unit
        ))),
    }
}

fn duration_ms(input: &str) -> Result<u64, ShelfGuardError> {
    Ok(parse_duration(input)?.as_millis() as u64)
}

/// 准入控制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub version: String,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub roles: RoleMultipliers,
    pub routes: Vec<RoutePolicy>,
    #[serde(default)]
    pub overrides: Vec<RoleOverride>,
    /// 豁免路径的正则（在协调器之前匹配）
    #[serde(default)]
    pub exempt: Vec<String>,
    #[serde(default = "default_fallback_route")]
    pub fallback_route: String,
    #[serde(default)]
    pub stats: StatsSettings,
}

fn default_fallback_route() -> String {
    DEFAULT_FALLBACK_ROUTE.to_string()
}

impl RateLimitConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.version.is_empty() {
            return Err("版本号不能为空".to_string());
        }

        self.store.validate()?;
        self.roles.validate()?;

        if self.routes.is_empty() {
            return Err("至少需要一个路由策略".to_string());
        }

        let mut names = HashSet::new();
        for (index, route) in self.routes.iter().enumerate() {
            if !names.insert(route.name.as_str()) {
                return Err(format!("路由类别重复: {}", route.name));
            }
            route
                .validate()
                .map_err(|e| format!("路由[{}]校验失败: {}", index, e))?;
        }

        for (index, entry) in self.overrides.iter().enumerate() {
            if !names.contains(entry.route_class.as_str()) {
                return Err(format!(
                    "覆盖[{}]引用了未知路由类别: {}",
                    index, entry.route_class
                ));
            }
            entry
                .limiter
                .validate()
                .map_err(|e| format!("覆盖[{}]: {}", index, e))?;
        }

        for pattern in &self.exempt {
            regex::Regex::new(pattern).map_err(|e| format!("无效的豁免规则 {}: {}", pattern, e))?;
        }

        if self.fallback_route.is_empty() {
            return Err("兜底路由类别不能为空".to_string());
        }

        if self.stats.top_n == 0 {
            return Err("统计条目数不能为0".to_string());
        }
        self.stats
            .horizon_ms()
            .map_err(|e| format!("统计时间范围: {}", e))?;

        Ok(())
    }

    /// 从 YAML 字符串加载并校验
    pub fn from_yaml_str(input: &str) -> Result<Self, ShelfGuardError> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate().map_err(ShelfGuardError::ConfigError)?;
        Ok(config)
    }

    /// 从 TOML 字符串加载并校验
    pub fn from_toml_str(input: &str) -> Result<Self, ShelfGuardError> {
        let config: Self = toml::from_str(input)?;
        config.validate().map_err(ShelfGuardError::ConfigError)?;
        Ok(config)
    }

    /// 从文件加载，按扩展名选择格式
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ShelfGuardError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(ShelfGuardError::ConfigError(format!(
                "不支持的配置文件格式: {:?}",
                other
            ))),
        }
    }

    /// 图书馆系统默认策略
    ///
    /// 未认证用户在 `api` 上每分钟 10 次，管理员乘以 100 即每分钟 1000 次。
    pub fn library_defaults() -> Self {
        let sliding = |window: &str, max_requests| LimiterConfig::SlidingWindow {
            window: window.to_string(),
            max_requests,
        };

        Self {
            version: "1.0".to_string(),
            store: StoreSettings::default(),
            roles: RoleMultipliers::default(),
            routes: vec![
                RoutePolicy {
                    name: "auth".to_string(),
                    patterns: vec!["^/api/auth/".to_string()],
                    limiter: LimiterConfig::ExponentialBackoff {
                        window: "15m".to_string(),
                        max_attempts: 5,
                        base_delay: "1s".to_string(),
                        max_delay: "1h".to_string(),
                    },
                    penalty: Some(PenaltyConfig {
                        base_minutes: 5,
                        max_minutes: DEFAULT_MAX_PENALTY_MINUTES,
                        threshold: 3,
                        forgive_after: "24h".to_string(),
                    }),
                    fail_mode: FailMode::Open,
                },
                RoutePolicy {
                    name: "dashboard".to_string(),
                    patterns: vec!["^/api/dashboard".to_string()],
                    limiter: LimiterConfig::TokenBucket {
                        capacity: 20,
                        refill_per_sec: 0.5,
                    },
                    penalty: None,
                    fail_mode: FailMode::Open,
                },
                RoutePolicy {
                    name: "import".to_string(),
                    patterns: vec!["^/api/(books|students|equipment)/import".to_string()],
                    limiter: LimiterConfig::Progressive {
                        window: "1h".to_string(),
                        max_requests: 5,
                        penalty: PenaltyConfig {
                            base_minutes: 15,
                            max_minutes: DEFAULT_MAX_PENALTY_MINUTES,
                            threshold: 1,
                            forgive_after: "24h".to_string(),
                        },
                    },
                    penalty: None,
                    fail_mode: FailMode::Open,
                },
                RoutePolicy {
                    name: "api".to_string(),
                    patterns: vec!["^/api/".to_string()],
                    limiter: sliding("1m", 10),
                    penalty: None,
                    fail_mode: FailMode::Open,
                },
                RoutePolicy {
                    name: DEFAULT_FALLBACK_ROUTE.to_string(),
                    patterns: Vec::new(),
                    limiter: sliding("1m", 10),
                    penalty: None,
                    fail_mode: FailMode::Open,
                },
            ],
            overrides: Vec::new(),
            exempt: vec![
                "^/health".to_string(),
                "^/static/".to_string(),
                r"\.(css|js|png|jpg|jpeg|gif|svg|ico|woff2?)$".to_string(),
            ],
            fallback_route: DEFAULT_FALLBACK_ROUTE.to_string(),
            stats: StatsSettings::default(),
        }
    }
}

/// 计数存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub key_prefix: String,
    /// 单次存储调用超时（毫秒）
    pub timeout_ms: u64,
    /// CAS 冲突后的最大重试次数
    pub max_cas_retries: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }
}

impl StoreSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.key_prefix.is_empty() || self.key_prefix.contains(KEY_DELIMITER) {
            return Err(format!("无效的键前缀: {:?}", self.key_prefix));
        }
        if self.timeout_ms == 0 {
            return Err("存储超时不能为0".to_string());
        }
        if self.max_cas_retries == 0 {
            return Err("CAS重试次数不能为0".to_string());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 角色配额倍数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoleMultipliers {
    pub unauthenticated: u64,
    pub student: u64,
    pub staff: u64,
    pub librarian: u64,
    pub admin: u64,
}

impl Default for RoleMultipliers {
    fn default() -> Self {
        Self {
            unauthenticated: 1,
            student: 2,
            staff: 5,
            librarian: 10,
            admin: 100,
        }
    }
}

impl RoleMultipliers {
    pub fn for_role(&self, role: Role) -> u64 {
        match role {
            Role::Unauthenticated => self.unauthenticated,
            Role::Student => self.student,
            Role::Staff => self.staff,
            Role::Librarian => self.librarian,
            Role::Admin => self.admin,
        }
    }

    /// 倍数必须不小于1，且随权限等级单调不减
    pub fn validate(&self) -> Result<(), String> {
        let mut previous = 1;
        for role in Role::ALL {
            let multiplier = self.for_role(role);
            if multiplier < previous {
                return Err(format!(
                    "角色倍数必须不小于1且随权限递增: {} = {}",
                    role, multiplier
                ));
            }
            previous = multiplier;
        }
        Ok(())
    }
}

/// 路由策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// 路由类别名称
    pub name: String,
    /// 路由路径正则，按配置顺序匹配
    #[serde(default)]
    pub patterns: Vec<String>,
    pub limiter: LimiterConfig,
    /// 惩罚叠加层
    #[serde(default)]
    pub penalty: Option<PenaltyConfig>,
    #[serde(default)]
    pub fail_mode: FailMode,
}

impl RoutePolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("路由类别名称不能为空".to_string());
        }
        for pattern in &self.patterns {
            regex::Regex::new(pattern).map_err(|e| format!("无效的路由规则 {}: {}", pattern, e))?;
        }
        self.limiter.validate()?;
        if let Some(penalty) = &self.penalty {
            penalty.validate()?;
        }
        Ok(())
    }
}

/// 角色覆盖：为某角色在某路由类别上指定完整的限流器，不再乘以倍数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleOverride {
    pub role: Role,
    pub route_class: String,
    pub limiter: LimiterConfig,
}

/// 存储不可用时的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// 放行并标记为降级
    #[default]
    Open,
    /// 拒绝
    Closed,
}

/// 统计配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsSettings {
    pub top_n: usize,
    /// 违规计数保留多久，按天取整
    pub horizon: String,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_VIOLATORS,
            horizon: format!("{}d", DEFAULT_STATS_HORIZON_DAYS),
        }
    }
}

impl StatsSettings {
    pub fn horizon_ms(&self) -> Result<u64, ShelfGuardError> {
        duration_ms(&self.horizon)
    }
}

/// 限流器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum LimiterConfig {
    TokenBucket {
        capacity: u64,
        refill_per_sec: f64,
    },
    SlidingWindow {
        window: String,
        max_requests: u64,
    },
    ExponentialBackoff {
        window: String,
        max_attempts: u64,
        base_delay: String,
        #[serde(default = "default_max_delay")]
        max_delay: String,
    },
    Progressive {
        window: String,
        max_requests: u64,
        penalty: PenaltyConfig,
    },
}

fn default_max_delay() -> String {
    format!("{}ms", DEFAULT_MAX_BACKOFF_DELAY_MS)
}

impl LimiterConfig {
    /// 校验限流器
    pub fn validate(&self) -> Result<(), String> {
        self.build(1).map(|_| ()).map_err(|e| e.to_string())
    }

    /// 按角色倍数构造算法实例
    pub fn build(&self, multiplier: u64) -> Result<LimiterSpec, ShelfGuardError> {
        let scale = |value: u64| value.saturating_mul(multiplier.max(1));
        let spec = match self {
            LimiterConfig::TokenBucket {
                capacity,
                refill_per_sec,
            } => {
                if *capacity == 0 {
                    return Err(ShelfGuardError::ConfigError("令牌桶容量不能为0".to_string()));
                }
                if !refill_per_sec.is_finite() || *refill_per_sec <= 0.0 {
                    return Err(ShelfGuardError::ConfigError("填充速率必须大于0".to_string()));
                }
                LimiterSpec::TokenBucket(TokenBucket::new(
                    scale(*capacity),
                    refill_per_sec * multiplier.max(1) as f64,
                ))
            }
            LimiterConfig::SlidingWindow {
                window,
                max_requests,
            } => {
                if *max_requests == 0 {
                    return Err(ShelfGuardError::ConfigError("最大请求数不能为0".to_string()));
                }
                LimiterSpec::SlidingWindow(SlidingWindow::new(
                    duration_ms(window)?,
                    scale(*max_requests),
                ))
            }
            LimiterConfig::ExponentialBackoff {
                window,
                max_attempts,
                base_delay,
                max_delay,
            } => {
                if *max_attempts == 0 {
                    return Err(ShelfGuardError::ConfigError("最大尝试次数不能为0".to_string()));
                }
                let base_delay_ms = duration_ms(base_delay)?;
                let max_delay_ms = duration_ms(max_delay)?;
                if max_delay_ms < base_delay_ms {
                    return Err(ShelfGuardError::ConfigError(
                        "最大延迟不能小于基础延迟".to_string(),
                    ));
                }
                LimiterSpec::ExponentialBackoff(ExponentialBackoff {
                    window_ms: duration_ms(window)?,
                    max_attempts: scale(*max_attempts),
                    base_delay_ms,
                    max_delay_ms,
                })
            }
            LimiterConfig::Progressive {
                window,
                max_requests,
                penalty,
            } => {
                if *max_requests == 0 {
                    return Err(ShelfGuardError::ConfigError("最大请求数不能为0".to_string()));
                }
                LimiterSpec::Progressive(Progressive {
                    window_ms: duration_ms(window)?,
                    max_requests: scale(*max_requests),
                    penalty: penalty.build()?,
                })
            }
        };
        Ok(spec)
    }
}

/// 惩罚配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PenaltyConfig {
    pub base_minutes: u64,
    #[serde(default = "default_max_penalty_minutes")]
    pub max_minutes: u64,
    /// 累计多少次拒绝算作一次违规
    #[serde(default = "default_penalty_threshold")]
    pub threshold: u32,
    #[serde(default = "default_forgive_after")]
    pub forgive_after: String,
}

fn default_max_penalty_minutes() -> u64 {
    DEFAULT_MAX_PENALTY_MINUTES
}

fn default_penalty_threshold() -> u32 {
    1
}

fn default_forgive_after() -> String {
    format!("{}ms", DEFAULT_PENALTY_FORGIVE_MS)
}

impl PenaltyConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.build().map(|_| ()).map_err(|e| e.to_string())
    }

    pub fn build(&self) -> Result<PenaltyPolicy, ShelfGuardError> {
        if self.base_minutes == 0 {
            return Err(ShelfGuardError::ConfigError("基础惩罚时长不能为0".to_string()));
        }
        if self.max_minutes < self.base_minutes {
            return Err(ShelfGuardError::ConfigError(
                "最大惩罚时长不能小于基础惩罚时长".to_string(),
            ));
        }
        if self.threshold == 0 {
            return Err(ShelfGuardError::ConfigError("惩罚阈值不能为0".to_string()));
        }
        Ok(PenaltyPolicy {
            base_penalty_minutes: self.base_minutes,
            max_penalty_minutes: self.max_minutes,
            threshold: self.threshold,
            forgive_after_ms: duration_ms(&self.forgive_after)?,
        })
    }
}

/// 已构造的算法实例
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterSpec {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
    ExponentialBackoff(ExponentialBackoff),
    Progressive(Progressive),
}

impl LimiterSpec {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            LimiterSpec::TokenBucket(s) => s.algorithm(),
            LimiterSpec::SlidingWindow(s) => s.algorithm(),
            LimiterSpec::ExponentialBackoff(s) => s.algorithm(),
            LimiterSpec::Progressive(s) => s.algorithm(),
        }
    }

    pub fn limit(&self) -> u64 {
        match self {
            LimiterSpec::TokenBucket(s) => s.limit(),
            LimiterSpec::SlidingWindow(s) => s.limit(),
            LimiterSpec::ExponentialBackoff(s) => s.limit(),
            LimiterSpec::Progressive(s) => s.limit(),
        }
    }
}

/// 解析后的限流配置（不可变）
#[derive(Debug, Clone, PartialEq)]
pub struct LimitConfig {
    pub route_class: String,
    pub role: Role,
    pub limiter: LimiterSpec,
    /// 惩罚叠加层，主算法为渐进式惩罚时不使用
    pub penalty: Option<PenaltyPolicy>,
    pub fail_mode: FailMode,
}

/// 策略表
///
/// 启动时为每个 `(角色, 路由类别)` 构造一次 [`LimitConfig`]，检查路径上只做查表。
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: HashMap<(Role, String), Arc<LimitConfig>>,
    strictest: Arc<LimitConfig>,
}

impl PolicyTable {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, ShelfGuardError> {
        config.validate().map_err(ShelfGuardError::ConfigError)?;

        let mut entries = HashMap::new();
        for route in &config.routes {
            let penalty = route.penalty.as_ref().map(PenaltyConfig::build).transpose()?;
            for role in Role::ALL {
                let explicit = config
                    .overrides
                    .iter()
                    .rev()
                    .find(|entry| entry.role == role && entry.route_class == route.name);
                let limiter = match explicit {
                    Some(entry) => entry.limiter.build(1)?,
                    None => route.limiter.build(config.roles.for_role(role))?,
                };
                // 渐进式惩罚自带惩罚状态
                let penalty = match limiter {
                    LimiterSpec::Progressive(_) => None,
                    _ => penalty.clone(),
                };
                entries.insert(
                    (role, route.name.clone()),
                    Arc::new(LimitConfig {
                        route_class: route.name.clone(),
                        role,
                        limiter,
                        penalty,
                        fail_mode: route.fail_mode,
                    }),
                );
            }
        }

        let strictest = entries
            .get(&(Role::Unauthenticated, config.fallback_route.clone()))
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(LimitConfig {
                    route_class: config.fallback_route.clone(),
                    role: Role::Unauthenticated,
                    limiter: LimiterSpec::SlidingWindow(SlidingWindow::new(
                        STRICTEST_WINDOW_MS,
                        STRICTEST_MAX_REQUESTS,
                    )),
                    penalty: None,
                    fail_mode: FailMode::Open,
                })
            });

        Ok(Self { entries, strictest })
    }

    /// 查找配置，找不到时退回最严格的未认证配置
    pub fn resolve(&self, role: Role, route_class: &str) -> Arc<LimitConfig> {
        match self.entries.get(&(role, route_class.to_string())) {
            Some(config) => config.clone(),
            None => {
                warn!(
                    "未找到限流配置，使用最严格的兜底配置: role={}, route_class={}",
                    role, route_class
                );
                self.strictest.clone()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
