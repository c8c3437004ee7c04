// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 前端控制器
//!
//! 每个请求的唯一入口，按固定顺序编排：
//! 1. 规范化路径。
//! 2. 静态资源直接交给宿主，不读取会话。
//! 3. 非公开路径经过会话超时中间件；强制过期时立即结束，不解析路由。
//! 4. 解析路由。
//! 5. 调用处理器，或者返回 404。

use log::{debug, info, warn};
use regex::Regex;

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use crate::{
    config::Config,
    exception::Exception,
    handler::{Handler, HandlerContext, HandlerOutput},
    path::{PathNormalizer, RequestPath},
    request::Request,
    resolver::{RouteOutcome, RouteTable},
    session::{is_valid_session_id, SessionStore},
    timeout::{ExpiryReason, SessionTimeout, TimeoutDecision},
};

/// 一次分发的结果，由宿主转换为 HTTP 响应
#[derive(Debug)]
pub enum Dispatch {
    /// 交给宿主按静态文件服务
    Static(PathBuf),
    Handled {
        output: HandlerOutput,
        /// 处于警告窗口时的剩余秒数
        warning: Option<u64>,
    },
    Expired {
        reason: ExpiryReason,
        ajax: bool,
    },
    /// 携带规范化后的路径，用于在 404 页面中回显
    NotFound(String),
    HandlerFailed(Exception),
}

pub struct FrontController {
    normalizer: PathNormalizer,
    table: RouteTable,
    timeout: SessionTimeout,
    public_paths: HashSet<String>,
    anonymous_patterns: Vec<Regex>,
    store: Arc<dyn SessionStore>,
    handler: Arc<dyn Handler>,
    cookie_name: &'static str,
    cookie_secure: bool,
}

impl FrontController {
    pub fn new(
        config: &Config,
        store: Arc<dyn SessionStore>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, Exception> {
        Ok(Self {
            normalizer: PathNormalizer::from_config(config),
            table: RouteTable::from_config(config),
            timeout: SessionTimeout::new(config.timeout_policy()),
            public_paths: config.public_paths().iter().cloned().collect(),
            anonymous_patterns: config.compiled_anonymous_patterns()?,
            store,
            handler,
            cookie_name: config.cookie_name(),
            cookie_secure: config.cookie_secure(),
        })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn timeout(&self) -> &SessionTimeout {
        &self.timeout
    }

    pub fn normalize(&self, raw_uri: &str) -> RequestPath {
        self.normalizer.normalize(raw_uri)
    }

    /// 公开路径（登录页、落地页）完全跳过超时检查
    pub fn is_public(&self, path: &RequestPath) -> bool {
        self.public_paths.contains(path.as_str())
    }

    /// 匿名可访问的路径之外都需要已认证会话
    pub fn requires_auth(&self, path: &RequestPath) -> bool {
        !self
            .anonymous_patterns
            .iter()
            .any(|re| re.is_match(path.as_str()))
    }

    /// 从 Cookie 中取出格式合法的会话 id
    pub fn session_id<'r>(&self, request: &'r Request) -> Option<&'r str> {
        request
            .cookie(self.cookie_name)
            .filter(|id| is_valid_session_id(id))
    }

    pub fn dispatch(&self, request: &Request, id: u128, now: i64) -> Dispatch {
        let path = self.normalizer.normalize(request.target());
        debug!("[ID{}]规范化路径：{}", id, path.as_str());

        if path.is_static() {
            return match self.table.try_locate_static(&path) {
                Ok(file) => Dispatch::Static(file),
                Err(e) => {
                    warn!("[ID{}]静态资源{}：{}", id, path.as_str(), e);
                    Dispatch::NotFound(path.as_str().to_string())
                }
            };
        }

        let session_id = self.session_id(request);
        let mut warning = None;
        let mut session = None;
        let mut timeout_status = None;
        if !self.is_public(&path) {
            let requires_auth = self.requires_auth(&path);
            let (decision, status) = self.timeout.evaluate_with_status(
                self.store.as_ref(),
                session_id,
                requires_auth,
                now,
            );
            timeout_status = status;
            match decision {
                TimeoutDecision::ForceExpire(reason) => {
                    info!("[ID{}]会话过期（{}），终止请求{}", id, reason.as_str(), path.as_str());
                    return Dispatch::Expired {
                        reason,
                        ajax: request.is_ajax(),
                    };
                }
                TimeoutDecision::WarnSoon(remaining) => warning = Some(remaining),
                TimeoutDecision::Allow => {}
            }
            session = session_id.and_then(|sid| match self.store.get(sid) {
                Ok(state) => state,
                Err(e) => {
                    warn!("[ID{}]读取会话快照失败：{}", id, e);
                    None
                }
            });
        }

        let route = match self.table.try_resolve(&path) {
            Ok(RouteOutcome::Handler(route)) => route,
            Ok(RouteOutcome::StaticFile(file)) => return Dispatch::Static(file),
            Ok(RouteOutcome::NotFound) => return Dispatch::NotFound(path.as_str().to_string()),
            Err(e) => {
                warn!("[ID{}]{}：{}", id, path.as_str(), e);
                return Dispatch::NotFound(path.as_str().to_string());
            }
        };

        let ctx = HandlerContext {
            id,
            request,
            path: &path,
            route: &route,
            session_id,
            session,
            warning_remaining: warning,
            policy: self.timeout.policy(),
            timeout_status,
            now,
            store: self.store.as_ref(),
            cookie_name: self.cookie_name,
            cookie_secure: self.cookie_secure,
        };
        match self.handler.invoke(&ctx) {
            Ok(output) => Dispatch::Handled { output, warning },
            Err(e) => {
                warn!("[ID{}]处理器{}执行失败：{}", id, route.handler_path.display(), e);
                Dispatch::HandlerFailed(e)
            }
        }
    }
}
