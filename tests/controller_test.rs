// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 前端控制器的端到端场景：真实目录布局 + 内存会话存储 + 记录调用的处理器

use portal_router::{
    Config, Dispatch, Exception, ExpiryReason, FileCache, FrontController, HandlerContext,
    HandlerOutput, MemorySessionStore, Request, Response, SessionState, SessionStore,
    TimeoutPolicy, TimeoutStatus,
};

use mockall::mock;
use tempfile::TempDir;

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

const NOW: i64 = 1_700_000_000;
const IDLE: i64 = 600;

mock! {
    Store {}
    impl SessionStore for Store {
        fn get(&self, session_id: &str) -> Result<Option<SessionState>, Exception>;
        fn touch(&self, session_id: &str, now: i64) -> Result<(), Exception>;
        fn invalidate(&self, session_id: &str) -> Result<(), Exception>;
        fn establish(&self, session_id: &str, principal_id: &str, now: i64) -> Result<SessionState, Exception>;
        fn purge_expired(&self, policy: &TimeoutPolicy, now: i64) -> Result<usize, Exception>;
        fn count(&self) -> Result<usize, Exception>;
    }
}

/// 处理器被调用时记录的信息
#[derive(Debug, Clone)]
struct Invocation {
    handler_path: PathBuf,
    working_directory: PathBuf,
    warning: Option<u64>,
    timeout_status: Option<TimeoutStatus>,
    principal: Option<String>,
}

struct Portal {
    _dir: TempDir,
    root: PathBuf,
    config: Config,
    store: Arc<MemorySessionStore>,
    calls: Arc<Mutex<Vec<Invocation>>>,
    controller: FrontController,
}

fn touch_file(root: &PathBuf, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn portal_with(prefix: &str) -> Portal {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    touch_file(&root, "website/index.php", "<?php echo 'landing';");
    touch_file(&root, "website/announcements.php", "<?php echo 'news';");
    touch_file(&root, "website/style.css", "body { margin: 0; }");
    touch_file(&root, "website/about.php", "<?php echo 'about';");
    touch_file(&root, "modules/student/dashboard.php", "<?php echo 'dash';");
    touch_file(&root, "modules/admin/reports.php", "<?php echo 'reports';");
    touch_file(&root, "unified_login.php", "<?php echo 'login';");
    touch_file(&root, "assets/app.js", "console.log(1);");

    let config = Config::new()
        .with_app_root(root.to_string_lossy().to_string())
        .with_deployment_prefix(prefix)
        .with_timeouts(IDLE as u64, 8 * 3600, 120);

    let store = Arc::new(MemorySessionStore::new());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&calls);
    let handler = move |ctx: &HandlerContext<'_>| -> Result<HandlerOutput, Exception> {
        recorder.lock().unwrap().push(Invocation {
            handler_path: ctx.route.handler_path.clone(),
            working_directory: ctx.route.working_directory.clone(),
            warning: ctx.warning_remaining,
            timeout_status: ctx.timeout_status,
            principal: ctx.session.as_ref().and_then(|s| s.principal_id.clone()),
        });
        Ok(HandlerOutput::html(200, "handled"))
    };
    let controller = FrontController::new(&config, store.clone(), Arc::new(handler)).unwrap();

    Portal {
        _dir: dir,
        root,
        config,
        store,
        calls,
        controller,
    }
}

fn portal() -> Portal {
    portal_with("")
}

impl Portal {
    fn login(&self, idle_ago: i64) {
        self.store.insert(SessionState {
            session_id: "sid42".to_string(),
            created_at: NOW - 3600,
            last_activity_at: NOW - idle_ago,
            principal_id: Some("student-42".to_string()),
        });
    }

    fn dispatch(&self, target: &str, extra_headers: &str) -> Dispatch {
        let raw = format!(
            "GET {} HTTP/1.1\r\nHost: portal.local\r\nCookie: PHPSESSID=sid42\r\n{}\r\n",
            target, extra_headers
        );
        let request = Request::try_from(raw.as_bytes(), 1).unwrap();
        self.controller.dispatch(&request, 1, NOW)
    }

    fn respond(&self, target: &str, extra_headers: &str) -> Response {
        let raw = format!(
            "GET {} HTTP/1.1\r\nHost: portal.local\r\nCookie: PHPSESSID=sid42\r\n{}\r\n",
            target, extra_headers
        );
        let request = Request::try_from(raw.as_bytes(), 1).unwrap();
        let dispatch = self.controller.dispatch(&request, 1, NOW);
        let cache = Arc::new(Mutex::new(FileCache::from_capacity(4, 1024 * 1024)));
        Response::from_dispatch(dispatch, &request, 1, &cache, &self.config)
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[test]
fn static_asset_is_passed_through_without_session_access() {
    let p = portal();
    p.login(IDLE + 60);

    match p.dispatch("/style.css?v=3", "") {
        Dispatch::Static(file) => assert_eq!(file, p.root.join("website/style.css")),
        other => panic!("unexpected dispatch: {:?}", other),
    }
    // 会话已经超时，但静态资源不会触发超时处理
    assert!(p.store.get("sid42").unwrap().is_some());
    assert!(p.calls().is_empty());
}

#[test]
fn static_asset_falls_back_to_app_root() {
    let p = portal();
    match p.dispatch("/assets/app.js", "") {
        Dispatch::Static(file) => assert_eq!(file, p.root.join("assets/app.js")),
        other => panic!("unexpected dispatch: {:?}", other),
    }
}

#[test]
fn missing_static_asset_is_not_found() {
    let p = portal();
    match p.dispatch("/missing.png", "") {
        Dispatch::NotFound(path) => assert_eq!(path, "/missing.png"),
        other => panic!("unexpected dispatch: {:?}", other),
    }
}

#[test]
fn active_session_reaches_content_root_handler_and_refreshes_activity() {
    let p = portal();
    p.login(30);

    assert!(matches!(
        p.dispatch("/announcements.php", ""),
        Dispatch::Handled { warning: None, .. }
    ));
    let calls = p.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].handler_path, p.root.join("website/announcements.php"));
    assert_eq!(calls[0].working_directory, p.root.join("website"));
    assert_eq!(calls[0].principal.as_deref(), Some("student-42"));
    assert_eq!(p.store.get("sid42").unwrap().unwrap().last_activity_at, NOW);
}

#[test]
fn module_handler_runs_in_its_own_directory() {
    let p = portal();
    p.login(30);

    assert!(matches!(p.dispatch("/dashboard.php", ""), Dispatch::Handled { .. }));
    let calls = p.calls();
    assert_eq!(calls[0].handler_path, p.root.join("modules/student/dashboard.php"));
    assert_eq!(calls[0].working_directory, p.root.join("modules/student"));
}

#[test]
fn landing_handler_serves_root() {
    let p = portal();
    assert!(matches!(p.dispatch("/", ""), Dispatch::Handled { .. }));
    let calls = p.calls();
    assert_eq!(calls[0].handler_path, p.root.join("website/index.php"));
    assert_eq!(calls[0].working_directory, p.root.join("website"));
    // 公开路径不读取会话
    assert_eq!(calls[0].principal, None);
}

#[test]
fn unknown_handler_is_not_found_and_echoes_path() {
    let p = portal();
    p.login(30);

    match p.dispatch("/does_not_exist.php", "") {
        Dispatch::NotFound(path) => assert_eq!(path, "/does_not_exist.php"),
        other => panic!("unexpected dispatch: {:?}", other),
    }
    let response = p.respond("/does_not_exist.php", "");
    assert_eq!(response.status_code(), 404);
    let body = String::from_utf8_lossy(response.content().unwrap()).to_string();
    assert!(body.contains("<code>/does_not_exist.php</code>"));
    assert!(p.calls().is_empty());
}

#[test]
fn idle_session_is_redirected_to_login_and_cleared() {
    let p = portal();
    p.login(11 * 60);

    match p.dispatch("/announcements.php", "") {
        Dispatch::Expired { reason, ajax } => {
            assert_eq!(reason, ExpiryReason::Idle);
            assert!(!ajax);
        }
        other => panic!("unexpected dispatch: {:?}", other),
    }
    assert!(p
        .store
        .get("sid42")
        .unwrap()
        .map_or(true, |s| s.principal_id.is_none()));
    assert!(p.calls().is_empty());
}

#[test]
fn expired_browser_request_gets_login_redirect_with_prefix() {
    let p = portal_with("/EducAid");
    p.login(11 * 60);

    let response = p.respond("/EducAid/announcements.php", "");
    assert_eq!(response.status_code(), 302);
    assert_eq!(
        response.header("Location"),
        Some("/EducAid/unified_login.php?timeout=idle_timeout")
    );
    assert!(response.header("Set-Cookie").unwrap().contains("Max-Age=0"));
}

#[test]
fn expired_ajax_request_gets_json_401() {
    let p = portal();
    p.login(11 * 60);

    let response = p.respond("/announcements.php", "X-Requested-With: XMLHttpRequest\r\n");
    assert_eq!(response.status_code(), 401);
    let body: serde_json::Value = serde_json::from_slice(response.content().unwrap()).unwrap();
    assert_eq!(body["status"], "session_expired");
    assert_eq!(body["reason"], "idle_timeout");
}

#[test]
fn missing_session_on_protected_path_requires_login() {
    let p = portal();
    let response = p.respond("/dashboard.php", "");
    assert_eq!(response.status_code(), 302);
    assert_eq!(response.header("Location"), Some("/unified_login.php"));
    assert!(p.calls().is_empty());
}

#[test]
fn anonymous_path_needs_no_session() {
    let p = portal();
    assert!(matches!(p.dispatch("/website/about.php", ""), Dispatch::Handled { .. }));
    assert_eq!(p.calls()[0].handler_path, p.root.join("website/about.php"));
}

#[test]
fn warning_window_is_signalled_to_handler_and_client() {
    let p = portal();
    p.login(IDLE - 60);

    let response = p.respond("/announcements.php", "");
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.header("X-Session-Expires-In"), Some("60"));
    assert_eq!(p.calls()[0].warning, Some(60));
}

#[test]
fn deployment_prefix_is_stripped_before_routing() {
    let p = portal_with("/EducAid");
    p.login(30);

    assert!(matches!(
        p.dispatch("/EducAid/modules/admin/reports.php", ""),
        Dispatch::Handled { .. }
    ));
    assert_eq!(p.calls()[0].handler_path, p.root.join("modules/admin/reports.php"));
}

#[test]
fn public_path_never_touches_the_session_store() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    touch_file(&root, "unified_login.php", "<?php echo 'login';");

    let config = Config::new().with_app_root(root.to_string_lossy().to_string());
    // 没有设置任何期望：任何存储调用都会使测试失败
    let store = Arc::new(MockStore::new());
    let handler = |_: &HandlerContext<'_>| -> Result<HandlerOutput, Exception> {
        Ok(HandlerOutput::html(200, "login form"))
    };
    let controller = FrontController::new(&config, store, Arc::new(handler)).unwrap();

    let request = Request::try_from(
        b"GET /unified_login.php HTTP/1.1\r\nCookie: PHPSESSID=expired1\r\n\r\n",
        1,
    )
    .unwrap();
    assert!(matches!(
        controller.dispatch(&request, 1, NOW),
        Dispatch::Handled { warning: None, .. }
    ));
}

#[test]
fn handler_failure_is_reported_not_panicked() {
    let p = portal();
    let config = p.config.clone();
    let handler = |_: &HandlerContext<'_>| -> Result<HandlerOutput, Exception> {
        Err(Exception::HandlerCodeError)
    };
    let controller =
        FrontController::new(&config, Arc::new(MemorySessionStore::new()), Arc::new(handler))
            .unwrap();
    let request = Request::try_from(b"GET /unified_login.php HTTP/1.1\r\n\r\n", 1).unwrap();
    assert!(matches!(
        controller.dispatch(&request, 1, NOW),
        Dispatch::HandlerFailed(Exception::HandlerCodeError)
    ));
}

#[test]
fn active_request_carries_full_timeout_status() {
    let p = portal();
    p.login(100);

    assert!(matches!(p.dispatch("/dashboard.php", ""), Dispatch::Handled { .. }));
    let status = p.calls()[0].timeout_status.expect("已认证请求应携带超时状态");
    assert_eq!(status.idle_timeout_seconds, IDLE as u64);
    assert_eq!(status.absolute_timeout_seconds, 8 * 3600);
    assert_eq!(status.time_until_idle_timeout, (IDLE - 100) as u64);
    assert_eq!(status.time_until_absolute_timeout, 7 * 3600);
    assert_eq!(status.warning_threshold_seconds, 120);
    assert!(!status.should_warn);
}

#[test]
fn timeout_status_flags_warning_window() {
    let p = portal();
    p.login(IDLE - 30);

    assert!(matches!(p.dispatch("/dashboard.php", ""), Dispatch::Handled { warning: Some(30), .. }));
    let status = p.calls()[0].timeout_status.unwrap();
    assert_eq!(status.time_until_idle_timeout, 30);
    assert!(status.should_warn);
}

#[test]
fn public_page_has_no_timeout_status() {
    let p = portal();
    p.login(100);

    assert!(matches!(p.dispatch("/unified_login.php", ""), Dispatch::Handled { .. }));
    assert_eq!(p.calls()[0].timeout_status, None);
}
