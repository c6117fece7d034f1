//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 日志脱敏模块
//!
//! 用户ID和客户端IP写入日志前先脱敏。

use crate::key::SubjectKey;
use std::net::IpAddr;

/// 基础脱敏：保留首尾各两个字符
#[inline]
pub fn redact_basic(value: Option<&str>) -> String {
    let Some(value) = value else {
        return "unknown".to_string();
    };

    let value = value.trim();
    if value.is_empty() {
        return "unknown".to_string();
    }

    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "***".to_string();
    }

    let prefix: String = chars[..2].iter().collect();
    let suffix: String = chars[chars.len() - 2..].iter().collect();
    format!("{}***{}", prefix, suffix)
}

/// IP地址脱敏
#[inline]
pub fn redact_ip(value: Option<&str>) -> String {
    let Some(value) = value else {
        return "unknown".to_string();
    };

    let value = value.trim();
    if value.is_empty() {
        return "unknown".to_string();
    }

    // IPv4 保留前两段
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() == 4 {
        return format!("{}.{}.***.***", parts[0], parts[1]);
    }

    // IPv6 保留第一段
    if value.contains(':') {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() >= 2 {
            return format!("{}:***:***", parts[0]);
        }
    }

    redact_basic(Some(value))
}

/// 限流标识脱敏（用户ID或IP）
#[inline]
pub fn redact_identity(identity: &str) -> String {
    if identity.parse::<IpAddr>().is_ok() {
        redact_ip(Some(identity))
    } else {
        redact_basic(Some(identity))
    }
}

/// 主体脱敏，角色和路由类别保持原样
pub fn redact_subject(subject: &SubjectKey) -> String {
    format!(
        "{}:{}:{}",
        subject.role,
        redact_identity(&subject.identity),
        subject.route_class
    )
}
