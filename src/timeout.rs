// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 会话超时中间件
//!
//! 对每个非公开的动态请求，根据会话年龄与空闲时长判定：放行、提醒即将超时或强制过期。
//!
//! ## 状态机
//! - `NoSession`：没有会话 id、存储中不存在、读取失败或没有已认证主体。
//!   目标路径需要认证时强制过期（原因 `Unauthenticated`），否则放行，且不修改任何状态。
//! - `Expired`：`now - created_at >= absolute` 或 `now - last_activity_at >= idle`，
//!   绝对超时优先判定。副作用是销毁会话。
//! - `WarningWindow`：剩余空闲时间不超过警告阈值，请求照常处理并刷新活动时间。
//! - `Active`：放行并刷新活动时间。
//!
//! 当前时间总是由调用方传入。

use log::{debug, info, warn};

use crate::session::{SessionState, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub idle_timeout_seconds: u64,
    pub absolute_timeout_seconds: u64,
    pub warning_threshold_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Unauthenticated,
    Idle,
    Absolute,
}

impl ExpiryReason {
    /// 登录页 `timeout` 查询参数使用的标识，未登录时没有对应参数
    pub fn as_query_value(&self) -> Option<&'static str> {
        match self {
            ExpiryReason::Unauthenticated => None,
            ExpiryReason::Idle => Some("idle_timeout"),
            ExpiryReason::Absolute => Some("absolute_timeout"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryReason::Unauthenticated => "unauthenticated",
            ExpiryReason::Idle => "idle_timeout",
            ExpiryReason::Absolute => "absolute_timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    Allow,
    WarnSoon(u64),
    ForceExpire(ExpiryReason),
}

/// 已认证会话在本次请求刷新活动时间之前的超时状态，供页面初始化前端警告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutStatus {
    pub idle_timeout_seconds: u64,
    pub absolute_timeout_seconds: u64,
    pub time_until_idle_timeout: u64,
    pub time_until_absolute_timeout: u64,
    pub warning_threshold_seconds: u64,
    pub should_warn: bool,
}

impl TimeoutPolicy {
    /// 判定一个已认证会话是否已经超时。绝对超时优先。
    pub fn expiry_reason(&self, state: &SessionState, now: i64) -> Option<ExpiryReason> {
        let age = now.saturating_sub(state.created_at);
        let idle = now.saturating_sub(state.last_activity_at);
        if age >= seconds_as_i64(self.absolute_timeout_seconds) {
            Some(ExpiryReason::Absolute)
        } else if idle >= seconds_as_i64(self.idle_timeout_seconds) {
            Some(ExpiryReason::Idle)
        } else {
            None
        }
    }

    /// 剩余空闲预算（秒），调用方须先确认会话未超时
    pub fn idle_remaining(&self, state: &SessionState, now: i64) -> u64 {
        let idle = now.saturating_sub(state.last_activity_at).max(0) as u64;
        self.idle_timeout_seconds.saturating_sub(idle)
    }

    /// 剩余绝对预算（秒）
    pub fn absolute_remaining(&self, state: &SessionState, now: i64) -> u64 {
        let age = now.saturating_sub(state.created_at).max(0) as u64;
        self.absolute_timeout_seconds.saturating_sub(age)
    }

    pub fn status(&self, state: &SessionState, now: i64) -> TimeoutStatus {
        let time_until_idle_timeout = self.idle_remaining(state, now);
        TimeoutStatus {
            idle_timeout_seconds: self.idle_timeout_seconds,
            absolute_timeout_seconds: self.absolute_timeout_seconds,
            time_until_idle_timeout,
            time_until_absolute_timeout: self.absolute_remaining(state, now),
            warning_threshold_seconds: self.warning_threshold_seconds,
            should_warn: time_until_idle_timeout <= self.warning_threshold_seconds,
        }
    }
}

/// 超过 `i64::MAX` 的阈值视为永不超时
fn seconds_as_i64(seconds: u64) -> i64 {
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

pub struct SessionTimeout {
    policy: TimeoutPolicy,
}

impl SessionTimeout {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    pub fn evaluate(
        &self,
        store: &dyn SessionStore,
        session_id: Option<&str>,
        requires_auth: bool,
        now: i64,
    ) -> TimeoutDecision {
        self.evaluate_with_status(store, session_id, requires_auth, now).0
    }

    /// 与 [`SessionTimeout::evaluate`] 相同，放行时另外给出会话的超时状态
    pub fn evaluate_with_status(
        &self,
        store: &dyn SessionStore,
        session_id: Option<&str>,
        requires_auth: bool,
        now: i64,
    ) -> (TimeoutDecision, Option<TimeoutStatus>) {
        let no_session = if requires_auth {
            (TimeoutDecision::ForceExpire(ExpiryReason::Unauthenticated), None)
        } else {
            (TimeoutDecision::Allow, None)
        };

        let session_id = match session_id {
            Some(id) => id,
            None => return no_session,
        };
        let state = match store.get(session_id) {
            Ok(Some(state)) if state.is_authenticated() => state,
            Ok(_) => return no_session,
            Err(e) => {
                warn!("读取会话{}失败：{}，按未登录处理", session_id, e);
                return no_session;
            }
        };

        if let Some(reason) = self.policy.expiry_reason(&state, now) {
            info!(
                "会话超时 - 原因：{}，主体：{}",
                reason.as_str(),
                state.principal_id.as_deref().unwrap_or("unknown")
            );
            if let Err(e) = store.invalidate(session_id) {
                warn!("销毁会话{}失败：{}", session_id, e);
            }
            return (TimeoutDecision::ForceExpire(reason), None);
        }

        let status = self.policy.status(&state, now);
        if let Err(e) = store.touch(session_id, now) {
            warn!("刷新会话{}活动时间失败：{}", session_id, e);
        }
        let decision = if status.should_warn {
            debug!("会话{}将在{}秒后空闲超时", session_id, status.time_until_idle_timeout);
            TimeoutDecision::WarnSoon(status.time_until_idle_timeout)
        } else {
            TimeoutDecision::Allow
        };
        (decision, Some(status))
    }
}
