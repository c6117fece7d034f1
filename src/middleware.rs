//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 准入中间件
//!
//! 在路由处理之前对每个请求调用一次协调器。豁免路径（健康检查、静态资源）
//! 在协调器之前匹配，完全不访问计数存储。
//!
//! 结果以 [`Admission`] 返回给 HTTP 层，响应头由 HTTP 层写入，这里不修改任何共享响应。

use crate::config::RateLimitConfig;
use crate::constants::{
    HEADER_ALGORITHM, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
    HEADER_ROLE, STATUS_TOO_MANY_REQUESTS,
};
use crate::coordinator::{Coordinator, Verdict};
use crate::error::ShelfGuardError;
use crate::matchers::{ExemptionMatcher, RequestContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// 拒绝响应体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub retry_after: u64,
}

/// 准入结果
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// 豁免路径，未经限流
    Exempt,
    /// 放行，HTTP 层附加 `headers` 后转发请求
    Allowed {
        verdict: Verdict,
        headers: Vec<(String, String)>,
    },
    /// 拒绝，请求体不得转发给下游处理器
    Rejected {
        verdict: Verdict,
        headers: Vec<(String, String)>,
        status: u16,
        body: RejectionBody,
    },
}

impl Admission {
    /// 是否继续转发请求
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            Admission::Exempt => None,
            Admission::Allowed { verdict, .. } | Admission::Rejected { verdict, .. } => {
                Some(verdict)
            }
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        match self {
            Admission::Exempt => &[],
            Admission::Allowed { headers, .. } | Admission::Rejected { headers, .. } => headers,
        }
    }
}

/// 限流响应头
///
/// 顺序固定：Limit、Remaining、Reset、Algorithm、Role，拒绝时追加 Retry-After。
pub fn rate_limit_headers(verdict: &Verdict) -> Vec<(String, String)> {
    let mut headers = vec![
        (HEADER_LIMIT.to_string(), verdict.limit.to_string()),
        (HEADER_REMAINING.to_string(), verdict.remaining.to_string()),
        (HEADER_RESET.to_string(), verdict.reset_at_secs().to_string()),
        (
            HEADER_ALGORITHM.to_string(),
            verdict.algorithm.as_str().to_string(),
        ),
        (HEADER_ROLE.to_string(), verdict.role.as_str().to_string()),
    ];
    if !verdict.allowed {
        headers.push((
            HEADER_RETRY_AFTER.to_string(),
            verdict.retry_after_secs.unwrap_or(1).to_string(),
        ));
    }
    headers
}

/// 准入中间件
pub struct AdmissionMiddleware {
    coordinator: Arc<Coordinator>,
    exemptions: ExemptionMatcher,
}

impl AdmissionMiddleware {
    pub fn new(coordinator: Arc<Coordinator>, exemptions: ExemptionMatcher) -> Self {
        Self {
            coordinator,
            exemptions,
        }
    }

    /// 使用配置中的豁免规则创建
    pub fn from_config(
        coordinator: Arc<Coordinator>,
        config: &RateLimitConfig,
    ) -> Result<Self, ShelfGuardError> {
        Ok(Self::new(coordinator, ExemptionMatcher::from_config(config)?))
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// 准入判断
    pub async fn admit(&self, context: &RequestContext) -> Admission {
        if self.exemptions.is_exempt(context.route_path()) {
            debug!("豁免路径: {}", context.route_path());
            return Admission::Exempt;
        }

        let verdict = self.coordinator.check_request(context).await;
        let headers = rate_limit_headers(&verdict);

        if verdict.allowed {
            Admission::Allowed { verdict, headers }
        } else {
            let retry_after = verdict.retry_after_secs.unwrap_or(1);
            Admission::Rejected {
                body: RejectionBody {
                    error: "Too many requests, please try again later.".to_string(),
                    retry_after,
                },
                status: STATUS_TOO_MANY_REQUESTS,
                verdict,
                headers,
            }
        }
    }
}
