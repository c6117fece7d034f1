//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 限流键
//!
//! 定义角色、算法名称以及计数存储中的键布局：
//! `<prefix>:<namespace>:<role>:<identity>:<route_class>`。
//! 标识和路由类别中的 `%` 与 `:` 会被百分号转义，保证分隔符不会出现在组件内部。

use crate::constants::KEY_DELIMITER;
use crate::error::ShelfGuardError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 角色
///
/// 顺序即权限等级，从最严格到最宽松。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// 未认证
    Unauthenticated,
    /// 学生
    Student,
    /// 教职工
    Staff,
    /// 图书管理员
    Librarian,
    /// 管理员
    Admin,
}

impl Role {
    /// 所有角色，按权限升序
    pub const ALL: [Role; 5] = [
        Role::Unauthenticated,
        Role::Student,
        Role::Staff,
        Role::Librarian,
        Role::Admin,
    ];

    /// 角色名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unauthenticated => "unauthenticated",
            Role::Student => "student",
            Role::Staff => "staff",
            Role::Librarian => "librarian",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ShelfGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| ShelfGuardError::ValidationError(format!("未知角色: {}", s)))
    }
}

/// 限流算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// 令牌桶
    TokenBucket,
    /// 滑动窗口
    SlidingWindow,
    /// 指数退避
    ExponentialBackoff,
    /// 渐进式惩罚
    Progressive,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::TokenBucket,
        Algorithm::SlidingWindow,
        Algorithm::ExponentialBackoff,
        Algorithm::Progressive,
    ];

    /// 算法名称（同时用作存储命名空间和响应头取值）
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::ExponentialBackoff => "exponential_backoff",
            Algorithm::Progressive => "progressive",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 转义键组件
fn escape_component(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            KEY_DELIMITER => escaped.push_str("%3A"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// 反转义键组件
fn unescape_component(input: &str) -> Result<String, ShelfGuardError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            output.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.as_str() {
            "25" => output.push('%'),
            "3A" => output.push(KEY_DELIMITER),
            _ => {
                return Err(ShelfGuardError::ValidationError(format!(
                    "无效的转义序列: %{}",
                    code
                )))
            }
        }
    }
    Ok(output)
}

/// 限流主体
///
/// `(角色, 标识, 路由类别)` 三元组，不含算法。违规统计和管理员重置都以它为单位。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectKey {
    pub role: Role,
    pub identity: String,
    pub route_class: String,
}

impl SubjectKey {
    pub fn new(role: Role, identity: impl Into<String>, route_class: impl Into<String>) -> Self {
        Self {
            role,
            identity: identity.into(),
            route_class: route_class.into(),
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{d}{}{d}{}",
            self.role,
            escape_component(&self.identity),
            escape_component(&self.route_class),
            d = KEY_DELIMITER
        )
    }
}

impl FromStr for SubjectKey {
    type Err = ShelfGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(KEY_DELIMITER).collect();
        if parts.len() != 3 {
            return Err(ShelfGuardError::ValidationError(format!(
                "无效的主体键: {}",
                s
            )));
        }
        Ok(Self {
            role: parts[0].parse()?,
            identity: unescape_component(parts[1])?,
            route_class: unescape_component(parts[2])?,
        })
    }
}

/// 限流键
///
/// 算法名称是键的一部分，切换算法不会读到形状不同的旧状态。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub algorithm: Algorithm,
    pub subject: SubjectKey,
}

impl RateLimitKey {
    pub fn new(algorithm: Algorithm, subject: SubjectKey) -> Self {
        Self { algorithm, subject }
    }
}

/// 存储键布局
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 算法状态键
    pub fn state_key(&self, key: &RateLimitKey) -> String {
        format!(
            "{}{d}{}{d}{}",
            self.prefix,
            key.algorithm,
            key.subject,
            d = KEY_DELIMITER
        )
    }

    /// 某算法命名空间下所有状态键的公共前缀
    pub fn state_prefix(&self, algorithm: Algorithm) -> String {
        format!("{}{d}{}{d}", self.prefix, algorithm, d = KEY_DELIMITER)
    }

    /// 惩罚叠加层状态键
    pub fn penalty_key(&self, subject: &SubjectKey) -> String {
        format!("{}{d}penalty{d}{}", self.prefix, subject, d = KEY_DELIMITER)
    }

    /// 封锁标记键（用于统计当前生效的限制数）
    pub fn blocked_key(&self, subject: &SubjectKey) -> String {
        format!("{}{d}blocked{d}{}", self.prefix, subject, d = KEY_DELIMITER)
    }

    pub fn blocked_prefix(&self) -> String {
        format!("{}{d}blocked{d}", self.prefix, d = KEY_DELIMITER)
    }

    /// 最近一次违规时间键
    pub fn last_violation_key(&self, subject: &SubjectKey) -> String {
        format!("{}{d}last_violation{d}{}", self.prefix, subject, d = KEY_DELIMITER)
    }

    /// 某天的违规计数哈希（字段为主体键）
    ///
    /// `day` 是 Unix 纪元以来的天数。
    pub fn violations_hash(&self, day: i64) -> String {
        format!("{}{d}violations{d}{}", self.prefix, day, d = KEY_DELIMITER)
    }

    /// 某天的按角色违规分布哈希（字段为角色名）
    pub fn violations_by_role_hash(&self, day: i64) -> String {
        format!("{}{d}violations_by_role{d}{}", self.prefix, day, d = KEY_DELIMITER)
    }

    /// 主体的全部普通键（四种算法 + 惩罚 + 封锁标记 + 最近违规时间）
    pub fn subject_keys(&self, subject: &SubjectKey) -> Vec<String> {
        let mut keys: Vec<String> = Algorithm::ALL
            .iter()
            .map(|algorithm| self.state_key(&RateLimitKey::new(*algorithm, subject.clone())))
            .collect();
        keys.push(self.penalty_key(subject));
        keys.push(self.blocked_key(subject));
        keys.push(self.last_violation_key(subject));
        keys
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_KEY_PREFIX)
    }
}
