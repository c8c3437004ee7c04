// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 处理器调用模块
//!
//! 控制器解析出处理器之后，通过 [`Handler`] 把请求交给它，自身不检查处理器的输出。
//! 默认实现 [`CgiHandler`] 以 CGI/1.1 方式调用 PHP 解释器：
//! 工作目录切换到路由给出的目录，请求体写入标准输入，标准输出按 CGI 响应解析。
//!
//! 处理器脚本通过两个控制头修改会话，这些头由处理器单元自己消费，经会话存储适配器生效：
//! - `X-Session-Principal: <id>`：登录成功。旧会话被销毁，换发新的会话 id。
//! - `X-Session-Logout: 1`：主动登出。

use bytes::Bytes;
use log::{debug, error, info, warn};

use std::{
    io::Write,
    path::Path,
    process::{Command, Stdio},
};

use crate::{
    exception::Exception,
    param::reason_phrase,
    path::RequestPath,
    request::Request,
    resolver::RouteMatch,
    session::{expired_session_cookie, new_session_id, session_cookie, SessionState, SessionStore},
    timeout::{TimeoutPolicy, TimeoutStatus},
};

pub const PRINCIPAL_HEADER: &str = "X-Session-Principal";
pub const LOGOUT_HEADER: &str = "X-Session-Logout";

/// 处理器调用时可见的上下文
pub struct HandlerContext<'a> {
    pub id: u128,
    pub request: &'a Request,
    pub path: &'a RequestPath,
    pub route: &'a RouteMatch,
    pub session_id: Option<&'a str>,
    /// 中间件评估之后的会话快照；公开路径不读取会话，因此为 `None`
    pub session: Option<SessionState>,
    /// 处于警告窗口时的剩余秒数
    pub warning_remaining: Option<u64>,
    pub policy: &'a TimeoutPolicy,
    /// 已认证会话在刷新活动时间之前的超时状态
    pub timeout_status: Option<TimeoutStatus>,
    pub now: i64,
    pub store: &'a dyn SessionStore,
    pub cookie_name: &'a str,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HandlerOutput {
    pub fn html(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: vec![("Content-Type".to_string(), "text/html;charset=utf-8".to_string())],
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn take_header(&mut self, name: &str) -> Option<String> {
        let index = self.headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.headers.remove(index).1)
    }
}

pub trait Handler: Send + Sync {
    fn invoke(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutput, Exception>;
}

impl<F> Handler for F
where
    F: Fn(&HandlerContext<'_>) -> Result<HandlerOutput, Exception> + Send + Sync,
{
    fn invoke(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutput, Exception> {
        self(ctx)
    }
}

pub struct CgiHandler {
    interpreter: String,
}

impl CgiHandler {
    pub fn new(interpreter: &str) -> Self {
        Self {
            interpreter: interpreter.to_string(),
        }
    }

    /// 探测解释器是否可用，返回版本首行
    pub fn probe(&self) -> Option<String> {
        let output = Command::new(&self.interpreter).arg("-v").output().ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|l| l.trim().to_string())
    }

    fn command(&self, ctx: &HandlerContext<'_>) -> Command {
        let request = ctx.request;
        let script = ctx.route.handler_path.to_string_lossy().to_string();
        let mut command = Command::new(&self.interpreter);
        command
            .arg(&script)
            .current_dir(&ctx.route.working_directory)
            .env("GATEWAY_INTERFACE", "CGI/1.1")
            .env("SERVER_SOFTWARE", crate::param::SERVER_NAME)
            .env("SERVER_PROTOCOL", request.version().to_string())
            .env("REQUEST_METHOD", request.method().to_string())
            .env("REQUEST_URI", request.target())
            .env("QUERY_STRING", request.query_string())
            .env("SCRIPT_FILENAME", &script)
            .env("SCRIPT_NAME", ctx.path.as_str())
            .env("DOCUMENT_ROOT", &ctx.route.working_directory)
            .env("REDIRECT_STATUS", "200")
            .env("CONTENT_LENGTH", request.body().len().to_string())
            .env("HTTP_USER_AGENT", request.user_agent())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(t) = request.content_type() {
            command.env("CONTENT_TYPE", t);
        }
        if let Some(h) = request.host() {
            command.env("HTTP_HOST", h);
        }
        if let Some(c) = request.raw_cookie() {
            command.env("HTTP_COOKIE", c);
        }
        if request.is_ajax() {
            command.env("HTTP_X_REQUESTED_WITH", "XMLHttpRequest");
        }
        if let Some(id) = ctx.session_id {
            command.env("SESSION_ID", id);
        }
        if let Some(p) = ctx.session.as_ref().and_then(|s| s.principal_id.as_deref()) {
            command.env("SESSION_PRINCIPAL", p);
        }
        command.envs(timeout_env(ctx));
        command
    }

    /// 消费会话控制头，经存储适配器生效
    fn apply_session_controls(&self, ctx: &HandlerContext<'_>, output: &mut HandlerOutput) {
        let logout = output.take_header(LOGOUT_HEADER);
        let principal = output.take_header(PRINCIPAL_HEADER);

        if let Some(principal) = principal.filter(|p| !p.trim().is_empty()) {
            if let Some(old) = ctx.session_id {
                if let Err(e) = ctx.store.invalidate(old) {
                    warn!("[ID{}]登录时销毁旧会话失败：{}", ctx.id, e);
                }
            }
            let session_id = new_session_id();
            match ctx.store.establish(&session_id, principal.trim(), ctx.now) {
                Ok(_) => {
                    info!("[ID{}]主体{}登录，建立新会话", ctx.id, principal.trim());
                    output.headers.push((
                        "Set-Cookie".to_string(),
                        session_cookie(ctx.cookie_name, &session_id, ctx.cookie_secure),
                    ));
                }
                Err(e) => error!("[ID{}]建立会话失败：{}", ctx.id, e),
            }
            return;
        }

        if logout.is_some() {
            if let Some(old) = ctx.session_id {
                if let Err(e) = ctx.store.invalidate(old) {
                    warn!("[ID{}]登出时销毁会话失败：{}", ctx.id, e);
                }
            }
            info!("[ID{}]会话已登出", ctx.id);
            output.headers.push((
                "Set-Cookie".to_string(),
                expired_session_cookie(ctx.cookie_name, ctx.cookie_secure),
            ));
        }
    }
}

impl Handler for CgiHandler {
    fn invoke(&self, ctx: &HandlerContext<'_>) -> Result<HandlerOutput, Exception> {
        debug!(
            "[ID{}]调用处理器{}，工作目录{}",
            ctx.id,
            ctx.route.handler_path.display(),
            ctx.route.working_directory.display()
        );
        let mut child = self.command(ctx).spawn().map_err(|e| {
            error!("[ID{}]无法启动解释器{}：{}", ctx.id, self.interpreter, e);
            Exception::HandlerExecuteFailed
        })?;

        // 在独立线程写入请求体，避免子进程输出阻塞时互相等待
        let writer = child.stdin.take().map(|mut stdin| {
            let body = ctx.request.body().clone();
            std::thread::spawn(move || {
                let _ = stdin.write_all(&body);
            })
        });

        let output = child.wait_with_output().map_err(|e| {
            error!("[ID{}]等待处理器进程失败：{}", ctx.id, e);
            Exception::HandlerExecuteFailed
        })?;
        if let Some(w) = writer {
            let _ = w.join();
        }

        if !output.status.success() {
            error!(
                "[ID{}]处理器{}出错：{}",
                ctx.id,
                script_name(&ctx.route.handler_path),
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(Exception::HandlerCodeError);
        }

        let mut parsed = parse_cgi_output(&output.stdout);
        self.apply_session_controls(ctx, &mut parsed);
        Ok(parsed)
    }
}

/// 页面初始化前端超时警告所需的变量。阈值总是导出，剩余时间只在已认证会话上导出。
pub fn timeout_env(ctx: &HandlerContext<'_>) -> Vec<(&'static str, String)> {
    let policy = ctx.policy;
    let mut env = vec![
        ("SESSION_IDLE_TIMEOUT_SECONDS", policy.idle_timeout_seconds.to_string()),
        ("SESSION_ABSOLUTE_TIMEOUT_SECONDS", policy.absolute_timeout_seconds.to_string()),
        ("SESSION_WARNING_THRESHOLD", policy.warning_threshold_seconds.to_string()),
    ];
    if let Some(status) = ctx.timeout_status {
        env.push(("SESSION_IDLE_REMAINING", status.time_until_idle_timeout.to_string()));
        env.push(("SESSION_ABSOLUTE_REMAINING", status.time_until_absolute_timeout.to_string()));
        env.push(("SESSION_SHOULD_WARN", if status.should_warn { "1" } else { "0" }.to_string()));
    }
    if let Some(r) = ctx.warning_remaining {
        env.push(("SESSION_TIMEOUT_REMAINING", r.to_string()));
    }
    env
}

fn script_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// 解析 CGI 响应：头部与正文之间以空行分隔，`Status:` 头给出状态码。
///
/// 找不到合法头部时，整个输出按 HTML 正文处理。
pub fn parse_cgi_output(stdout: &[u8]) -> HandlerOutput {
    let split = find_subslice(stdout, b"\r\n\r\n")
        .map(|p| (p, p + 4))
        .or_else(|| find_subslice(stdout, b"\n\n").map(|p| (p, p + 2)));

    let (head, body) = match split {
        Some((head_end, body_start)) => match std::str::from_utf8(&stdout[..head_end]) {
            Ok(head) if is_header_block(head) => (head, &stdout[body_start..]),
            _ => return HandlerOutput::html(200, Bytes::copy_from_slice(stdout)),
        },
        None => return HandlerOutput::html(200, Bytes::copy_from_slice(stdout)),
    };

    let mut output = HandlerOutput {
        status: 200,
        reason: reason_phrase(200).to_string(),
        headers: vec![],
        body: Bytes::copy_from_slice(body),
    };
    let mut has_location = false;
    let mut has_status = false;
    for line in head.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("status") {
            let mut parts = value.splitn(2, ' ');
            if let Some(code) = parts.next().and_then(|c| c.parse::<u16>().ok()) {
                output.status = code;
                output.reason = parts
                    .next()
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| reason_phrase(code).to_string());
                has_status = true;
            }
            continue;
        }
        if name.eq_ignore_ascii_case("location") {
            has_location = true;
        }
        output.headers.push((name.to_string(), value.to_string()));
    }
    // CGI 规范：只有 Location 而没有 Status 时，按 302 处理
    if has_location && !has_status {
        output.status = 302;
        output.reason = reason_phrase(302).to_string();
    }
    if output.header("Content-Type").is_none() && !output.body.is_empty() {
        output
            .headers
            .push(("Content-Type".to_string(), "text/html;charset=utf-8".to_string()));
    }
    output
}

fn is_header_block(head: &str) -> bool {
    !head.is_empty()
        && head.lines().all(|line| {
            line.split_once(':').map_or(false, |(name, _)| {
                !name.is_empty()
                    && name
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
            })
        })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathNormalizer;
    use crate::session::MemorySessionStore;
    use std::path::PathBuf;

    #[test]
    fn test_parse_cgi_output_with_status() {
        let out = parse_cgi_output(b"Status: 403 Forbidden\r\nContent-Type: text/plain\r\nX-Powered-By: PHP\r\n\r\nno");
        assert_eq!(out.status, 403);
        assert_eq!(out.reason, "Forbidden");
        assert_eq!(out.header("content-type"), Some("text/plain"));
        assert_eq!(out.header("X-Powered-By"), Some("PHP"));
        assert_eq!(out.body.as_ref(), b"no");
    }

    #[test]
    fn test_parse_cgi_output_location_implies_redirect() {
        let out = parse_cgi_output(b"Location: /unified_login.php\n\n");
        assert_eq!(out.status, 302);
        assert_eq!(out.header("Location"), Some("/unified_login.php"));
    }

    #[test]
    fn test_parse_cgi_output_without_headers() {
        let out = parse_cgi_output(b"<html><body>hello\n\nworld</body></html>");
        assert_eq!(out.status, 200);
        assert_eq!(out.header("Content-Type"), Some("text/html;charset=utf-8"));
        assert!(out.body.starts_with(b"<html>"));
    }

    #[test]
    fn test_parse_cgi_output_defaults_content_type() {
        let out = parse_cgi_output(b"X-A: 1\r\n\r\n<p>x</p>");
        assert_eq!(out.status, 200);
        assert_eq!(out.header("Content-Type"), Some("text/html;charset=utf-8"));
    }

    const POLICY: TimeoutPolicy = TimeoutPolicy {
        idle_timeout_seconds: 900,
        absolute_timeout_seconds: 28800,
        warning_threshold_seconds: 120,
    };

    fn with_ctx<T>(session_id: Option<&str>, store: &MemorySessionStore, f: impl FnOnce(&HandlerContext<'_>) -> T) -> T {
        let request = Request::try_from(b"POST /unified_login.php HTTP/1.1\r\n\r\n", 1).unwrap();
        let path = PathNormalizer::new("", &[]).normalize("/unified_login.php");
        let route = RouteMatch {
            handler_path: PathBuf::from("/srv/unified_login.php"),
            working_directory: PathBuf::from("/srv"),
        };
        let ctx = HandlerContext {
            id: 1,
            request: &request,
            path: &path,
            route: &route,
            session_id,
            session: None,
            warning_remaining: None,
            policy: &POLICY,
            timeout_status: None,
            now: 5000,
            store,
            cookie_name: "PHPSESSID",
            cookie_secure: false,
        };
        f(&ctx)
    }

    #[test]
    fn test_login_control_header_regenerates_session() {
        let store = MemorySessionStore::new();
        store.establish("old", "someone", 10).unwrap();
        let mut output = HandlerOutput::html(302, "");
        output.headers.push((PRINCIPAL_HEADER.to_string(), "student-9".to_string()));

        with_ctx(Some("old"), &store, |ctx| {
            CgiHandler::new("php-cgi").apply_session_controls(ctx, &mut output)
        });

        assert!(output.header(PRINCIPAL_HEADER).is_none());
        assert_eq!(store.get("old").unwrap(), None);
        let cookie = output.header("Set-Cookie").unwrap();
        let new_id = cookie
            .strip_prefix("PHPSESSID=")
            .and_then(|c| c.split(';').next())
            .unwrap();
        let state = store.get(new_id).unwrap().unwrap();
        assert_eq!(state.principal_id.as_deref(), Some("student-9"));
        assert_eq!(state.created_at, 5000);
    }

    #[test]
    fn test_logout_control_header_destroys_session() {
        let store = MemorySessionStore::new();
        store.establish("live", "admin-1", 10).unwrap();
        let mut output = HandlerOutput::html(200, "bye");
        output.headers.push(("x-session-logout".to_string(), "1".to_string()));

        with_ctx(Some("live"), &store, |ctx| {
            CgiHandler::new("php-cgi").apply_session_controls(ctx, &mut output)
        });

        assert_eq!(store.get("live").unwrap(), None);
        assert!(output.header("Set-Cookie").unwrap().contains("Max-Age=0"));
        assert!(output.header(LOGOUT_HEADER).is_none());
    }

    #[test]
    fn test_missing_interpreter_is_execute_failure() {
        let store = MemorySessionStore::new();
        let result = with_ctx(None, &store, |ctx| {
            CgiHandler::new("definitely-not-an-interpreter-xyz").invoke(ctx)
        });
        assert_eq!(result.unwrap_err(), Exception::HandlerExecuteFailed);
    }

    #[test]
    fn test_closure_is_a_handler() {
        let store = MemorySessionStore::new();
        let handler = |ctx: &HandlerContext<'_>| -> Result<HandlerOutput, Exception> {
            Ok(HandlerOutput::html(200, ctx.path.as_str().to_string()))
        };
        let out = with_ctx(None, &store, |ctx| handler.invoke(ctx)).unwrap();
        assert_eq!(out.body.as_ref(), b"/unified_login.php");
    }

    #[test]
    fn test_timeout_env_without_session_only_carries_thresholds() {
        let store = MemorySessionStore::new();
        let env = with_ctx(None, &store, timeout_env);
        assert_eq!(
            env,
            vec![
                ("SESSION_IDLE_TIMEOUT_SECONDS", "900".to_string()),
                ("SESSION_ABSOLUTE_TIMEOUT_SECONDS", "28800".to_string()),
                ("SESSION_WARNING_THRESHOLD", "120".to_string()),
            ]
        );
    }
}
