// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 配置模块
//!
//! 从 TOML 文件读取运行参数，然后应用环境变量覆盖。
//! 会话超时相关的环境变量沿用门户原有的命名：
//! `SESSION_IDLE_TIMEOUT_MINUTES`、`SESSION_ABSOLUTE_TIMEOUT_HOURS`、
//! `SESSION_WARNING_BEFORE_LOGOUT_SECONDS`。

use log::{error, info, warn};
use regex::Regex;
use serde_derive::{Deserialize, Serialize};

use std::fs;
use std::path::{Path, PathBuf};

use crate::{exception::Exception, param::DEFAULT_STATIC_EXTENSIONS, timeout::TimeoutPolicy};

/// 超时阈值的上限，会话时间戳是 `i64` 秒
pub const MAX_TIMEOUT_SECONDS: u64 = i64::MAX as u64;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_app_root")]
    app_root: String,
    #[serde(default = "default_content_root")]
    content_root: String,
    #[serde(default = "default_landing_handler")]
    landing_handler: String,
    #[serde(default = "default_module_roots")]
    module_roots: Vec<String>,
    #[serde(default = "default_handler_extension")]
    handler_extension: String,
    #[serde(default = "default_static_extensions")]
    static_extensions: Vec<String>,
    #[serde(default)]
    deployment_prefix: String,
    #[serde(default = "default_login_path")]
    login_path: String,
    #[serde(default = "default_public_paths")]
    public_paths: Vec<String>,
    #[serde(default = "default_anonymous_patterns")]
    anonymous_patterns: Vec<String>,
    #[serde(default = "default_interpreter")]
    interpreter: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_local")]
    local: bool,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_cache_size")]
    cache_size: usize,
    #[serde(default = "default_cache_max_file_size")]
    cache_max_file_size: u64,
    #[serde(default = "default_max_body_size")]
    max_body_size: usize,
    #[serde(default)]
    session: SessionConfig,
}

/// `[session]` 配置段
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_seconds")]
    idle_timeout_seconds: u64,
    #[serde(default = "default_absolute_timeout_seconds")]
    absolute_timeout_seconds: u64,
    #[serde(default = "default_warning_threshold_seconds")]
    warning_threshold_seconds: u64,
    /// 警告窗口内附加到响应上的头名称，置空则不发出信号
    #[serde(default = "default_warning_header")]
    warning_header: String,
    #[serde(default)]
    cookie_secure: bool,
    #[serde(default = "default_store")]
    store: SessionStoreKind,
    #[serde(default = "default_store_dir")]
    store_dir: String,
    #[serde(default = "default_gc_interval_seconds")]
    gc_interval_seconds: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    Memory,
    File,
}

fn default_app_root() -> String {
    ".".to_string()
}

fn default_content_root() -> String {
    "website".to_string()
}

fn default_landing_handler() -> String {
    "index.php".to_string()
}

fn default_module_roots() -> Vec<String> {
    vec![
        "modules/admin".to_string(),
        "modules/student".to_string(),
        "modules/super_admin".to_string(),
    ]
}

fn default_handler_extension() -> String {
    "php".to_string()
}

fn default_static_extensions() -> Vec<String> {
    DEFAULT_STATIC_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

fn default_login_path() -> String {
    "/unified_login.php".to_string()
}

fn default_public_paths() -> Vec<String> {
    vec![
        "/".to_string(),
        "/unified_login.php".to_string(),
        "/index.php".to_string(),
        "/landingpage.php".to_string(),
        "/website/index.php".to_string(),
        "/website/landingpage.php".to_string(),
    ]
}

fn default_anonymous_patterns() -> Vec<String> {
    vec![r"^/website/".to_string()]
}

fn default_interpreter() -> String {
    "php-cgi".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_local() -> bool {
    true
}

fn default_cache_size() -> usize {
    64
}

fn default_cache_max_file_size() -> u64 {
    1048576 // 1MB
}

fn default_max_body_size() -> usize {
    8388608 // 8MB
}

fn default_idle_timeout_seconds() -> u64 {
    15 * 60
}

fn default_absolute_timeout_seconds() -> u64 {
    8 * 3600
}

fn default_warning_threshold_seconds() -> u64 {
    120
}

fn default_warning_header() -> String {
    "X-Session-Expires-In".to_string()
}

fn default_store() -> SessionStoreKind {
    SessionStoreKind::Memory
}

fn default_store_dir() -> String {
    "sessions".to_string()
}

fn default_gc_interval_seconds() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout_seconds(),
            absolute_timeout_seconds: default_absolute_timeout_seconds(),
            warning_threshold_seconds: default_warning_threshold_seconds(),
            warning_header: default_warning_header(),
            cookie_secure: false,
            store: default_store(),
            store_dir: default_store_dir(),
            gc_interval_seconds: default_gc_interval_seconds(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            app_root: default_app_root(),
            content_root: default_content_root(),
            landing_handler: default_landing_handler(),
            module_roots: default_module_roots(),
            handler_extension: default_handler_extension(),
            static_extensions: default_static_extensions(),
            deployment_prefix: String::new(),
            login_path: default_login_path(),
            public_paths: default_public_paths(),
            anonymous_patterns: default_anonymous_patterns(),
            interpreter: default_interpreter(),
            port: default_port(),
            local: default_local(),
            worker_threads: num_cpus::get(),
            cache_size: default_cache_size(),
            cache_max_file_size: default_cache_max_file_size(),
            max_body_size: default_max_body_size(),
            session: SessionConfig::default(),
        }
    }

    /// 从 TOML 文件构建配置，并应用进程环境变量覆盖。
    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let text = fs::read_to_string(filename).map_err(|e| {
            error!("无法读取配置文件{}：{}", filename, e);
            Exception::ConfigInvalid
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// 解析 TOML 文本。不读取环境变量，便于测试。
    pub fn from_toml_str(text: &str) -> Result<Self, Exception> {
        let mut config: Config = toml::from_str(text).map_err(|e| {
            error!("无法从配置文件构建配置对象：{}", e);
            Exception::ConfigInvalid
        })?;
        if config.worker_threads == 0 {
            config.worker_threads = num_cpus::get();
        }
        if config.cache_size == 0 {
            warn!("cache_size被设置为0，但目前尚不支持禁用缓存，因此该值将被改为{}。", default_cache_size());
            config.cache_size = default_cache_size();
        }
        Ok(config)
    }

    /// 应用环境变量覆盖。`lookup` 一般是 `std::env::var`，测试中可以替换。
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) if v > 0 => Some(v),
                _ => {
                    warn!("环境变量{}的值“{}”无效，已忽略", key, raw);
                    None
                }
            }
        };
        let scaled = |key: &str, unit: u64| -> Option<u64> {
            let value = parse(key)?;
            let seconds = value.checked_mul(unit);
            if seconds.is_none() {
                warn!("环境变量{}的值{}过大，已忽略", key, value);
            }
            seconds
        };
        if let Some(seconds) = scaled("SESSION_IDLE_TIMEOUT_MINUTES", 60) {
            self.session.idle_timeout_seconds = seconds;
        }
        if let Some(seconds) = scaled("SESSION_ABSOLUTE_TIMEOUT_HOURS", 3600) {
            self.session.absolute_timeout_seconds = seconds;
        }
        if let Some(seconds) = parse("SESSION_WARNING_BEFORE_LOGOUT_SECONDS") {
            self.session.warning_threshold_seconds = seconds;
        }
        if let Some(root) = lookup("APP_ROOT") {
            info!("APP_ROOT覆盖应用根目录：{}", root);
            self.app_root = root;
        }
        if let Some(port) = parse("PORT") {
            match u16::try_from(port) {
                Ok(p) => self.port = p,
                Err(_) => warn!("环境变量PORT超出范围：{}", port),
            }
        }
    }

    /// 检查超时阈值与匿名路径正则表达式。
    pub fn validate(&self) -> Result<(), Exception> {
        let s = &self.session;
        if s.idle_timeout_seconds == 0 || s.absolute_timeout_seconds == 0 {
            error!("会话超时阈值必须大于0");
            return Err(Exception::ConfigInvalid);
        }
        if s.idle_timeout_seconds > MAX_TIMEOUT_SECONDS || s.absolute_timeout_seconds > MAX_TIMEOUT_SECONDS {
            error!("会话超时阈值不能超过{}秒", MAX_TIMEOUT_SECONDS);
            return Err(Exception::ConfigInvalid);
        }
        if s.warning_threshold_seconds >= s.idle_timeout_seconds {
            error!(
                "警告阈值{}秒不小于空闲超时{}秒",
                s.warning_threshold_seconds, s.idle_timeout_seconds
            );
            return Err(Exception::ConfigInvalid);
        }
        if self.handler_extension.is_empty() {
            error!("handler_extension不能为空");
            return Err(Exception::ConfigInvalid);
        }
        if !self.login_path.starts_with('/') {
            error!("login_path必须以'/'开头：{}", self.login_path);
            return Err(Exception::ConfigInvalid);
        }
        self.compiled_anonymous_patterns().map(|_| ())
    }

    pub fn compiled_anonymous_patterns(&self) -> Result<Vec<Regex>, Exception> {
        self.anonymous_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    error!("匿名路径表达式{}无效：{}", p, e);
                    Exception::ConfigInvalid
                })
            })
            .collect()
    }
}

impl Config {
    pub fn app_root(&self) -> &Path {
        Path::new(&self.app_root)
    }

    pub fn content_root(&self) -> PathBuf {
        self.app_root().join(&self.content_root)
    }

    pub fn landing_handler(&self) -> &str {
        &self.landing_handler
    }

    /// 模块根目录（已拼接应用根目录），保持配置中的声明顺序
    pub fn module_roots(&self) -> Vec<PathBuf> {
        self.module_roots
            .iter()
            .map(|m| self.app_root().join(m))
            .collect()
    }

    pub fn handler_extension(&self) -> &str {
        &self.handler_extension
    }

    pub fn static_extensions(&self) -> &[String] {
        &self.static_extensions
    }

    pub fn deployment_prefix(&self) -> &str {
        &self.deployment_prefix
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn public_paths(&self) -> &[String] {
        &self.public_paths
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn cache_max_file_size(&self) -> u64 {
        self.cache_max_file_size
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            idle_timeout_seconds: self.session.idle_timeout_seconds,
            absolute_timeout_seconds: self.session.absolute_timeout_seconds,
            warning_threshold_seconds: self.session.warning_threshold_seconds,
        }
    }

    /// 警告信号头名称；配置为空字符串时返回 `None`
    pub fn warning_header(&self) -> Option<&str> {
        match self.session.warning_header.trim() {
            "" => None,
            h => Some(h),
        }
    }

    pub fn cookie_secure(&self) -> bool {
        self.session.cookie_secure
    }

    /// 会话 Cookie 名称。HTTPS 部署使用 `__Host-` 前缀。
    pub fn cookie_name(&self) -> &'static str {
        if self.session.cookie_secure {
            "__Host-PHPSESSID"
        } else {
            "PHPSESSID"
        }
    }

    pub fn session_store(&self) -> SessionStoreKind {
        self.session.store
    }

    pub fn session_store_dir(&self) -> PathBuf {
        self.app_root().join(&self.session.store_dir)
    }

    pub fn session_gc_interval_seconds(&self) -> u64 {
        self.session.gc_interval_seconds.max(1)
    }
}

// 测试与嵌入场景使用的构造方法
impl Config {
    pub fn with_app_root(mut self, root: impl Into<String>) -> Self {
        self.app_root = root.into();
        self
    }

    pub fn with_deployment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.deployment_prefix = prefix.into();
        self
    }

    pub fn with_timeouts(mut self, idle: u64, absolute: u64, warning: u64) -> Self {
        self.session.idle_timeout_seconds = idle;
        self.session.absolute_timeout_seconds = absolute;
        self.session.warning_threshold_seconds = warning;
        self
    }

    pub fn with_warning_header(mut self, header: impl Into<String>) -> Self {
        self.session.warning_header = header.into();
        self
    }

    pub fn with_anonymous_patterns(mut self, patterns: Vec<String>) -> Self {
        self.anonymous_patterns = patterns;
        self
    }
}
