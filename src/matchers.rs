//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 匹配器模块
//!
//! 请求上下文、标识提取、路由类别分类以及豁免路径匹配。

use crate::config::RateLimitConfig;
use crate::constants::{MAX_IDENTITY_LENGTH, MAX_PATH_LENGTH};
use crate::error::ShelfGuardError;
use crate::key::Role;
use ahash::AHashMap as HashMap;
use regex::{Regex, RegexSet};
use std::net::IpAddr;

/// 无法识别客户端时使用的标识
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// HTTP请求上下文
///
/// 由 HTTP 层填充。`role` 来自上游身份解析器，请求头从不参与角色判断。
#[derive(Clone)]
pub struct RequestContext {
    /// 角色
    pub role: Role,
    /// 已认证的用户ID
    pub user_id: Option<String>,
    /// 客户端IP
    pub ip: Option<String>,
    /// 请求路径
    pub path: String,
    pub user_agent: Option<String>,
    /// HTTP头
    pub headers: HashMap<String, String>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 脱敏 headers
        let headers: HashMap<String, String> = self
            .headers
            .iter()
            .map(|(k, v)| {
                let lower = k.to_lowercase();
                let v = if lower.contains("auth") || lower.contains("cookie") || lower.contains("key")
                {
                    "***".to_string()
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect();

        f.debug_struct("RequestContext")
            .field("role", &self.role)
            .field("user_id", &self.user_id)
            .field("ip", &self.ip)
            .field("path", &self.path)
            .field("user_agent", &self.user_agent)
            .field("headers", &headers)
            .finish()
    }
}

impl RequestContext {
    /// 创建新的请求上下文
    pub fn new(role: Role, path: &str) -> Self {
        Self {
            role,
            user_id: None,
            ip: None,
            path: path.to_string(),
            user_agent: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    /// 设置客户端IP
    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }

    /// 添加HTTP头
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// 规范化后的客户端IP
    ///
    /// 无法解析的地址返回 None。
    pub fn client_ip(&self) -> Option<String> {
        self.ip
            .as_deref()
            .map(str::trim)
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .map(|ip| ip.to_string())
    }

    /// 限流标识：已认证用户ID，否则客户端IP
    ///
    /// 超长的用户ID视为无效，与匿名请求一样按IP计数。
    pub fn identity(&self) -> String {
        match self.user_id.as_deref().map(str::trim) {
            Some(user_id)
                if !user_id.is_empty() && user_id.chars().count() <= MAX_IDENTITY_LENGTH =>
            {
                user_id.to_string()
            }
            _ => self
                .client_ip()
                .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string()),
        }
    }

    /// 去掉查询串后的路径
    pub fn route_path(&self) -> &str {
        let path = self.path.split(['?', '#']).next().unwrap_or("");
        if path.len() > MAX_PATH_LENGTH {
            // 超长路径只用于分类，截到字符边界
            let mut end = MAX_PATH_LENGTH;
            while !path.is_char_boundary(end) {
                end -= 1;
            }
            &path[..end]
        } else {
            path
        }
    }
}

/// 路由类别分类器
///
/// 路由按配置顺序匹配，第一个命中的类别生效；都不命中时使用兜底类别。
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    routes: Vec<(String, Vec<Regex>)>,
    fallback: String,
}

impl RouteClassifier {
    pub fn new(
        routes: Vec<(String, Vec<String>)>,
        fallback: impl Into<String>,
    ) -> Result<Self, ShelfGuardError> {
        let routes = routes
            .into_iter()
            .map(|(name, patterns)| {
                let compiled = patterns
                    .iter()
                    .map(|pattern| {
                        Regex::new(pattern).map_err(|e| {
                            ShelfGuardError::ConfigError(format!("无效的路由规则 {}: {}", pattern, e))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((name, compiled))
            })
            .collect::<Result<Vec<_>, ShelfGuardError>>()?;

        Ok(Self {
            routes,
            fallback: fallback.into(),
        })
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self, ShelfGuardError> {
        Self::new(
            config
                .routes
                .iter()
                .map(|route| (route.name.clone(), route.patterns.clone()))
                .collect(),
            config.fallback_route.clone(),
        )
    }

    /// 路径对应的路由类别
    pub fn classify(&self, path: &str) -> &str {
        self.routes
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|pattern| pattern.is_match(path)))
            .map_or(self.fallback.as_str(), |(name, _)| name.as_str())
    }
}

/// 豁免路径匹配器
#[derive(Debug, Clone)]
pub struct ExemptionMatcher {
    patterns: RegexSet,
}

impl ExemptionMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self, ShelfGuardError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = RegexSet::new(patterns)
            .map_err(|e| ShelfGuardError::ConfigError(format!("无效的豁免规则: {}", e)))?;
        Ok(Self { patterns })
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self, ShelfGuardError> {
        Self::new(&config.exempt)
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.patterns.is_match(path)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
