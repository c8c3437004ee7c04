// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由解析模块
//!
//! 把规范化后的路径映射为具体的处理器文件，或者判定为静态文件直出。
//!
//! ## 优先级
//! 候选根目录是一张有序表，按声明顺序逐个检查，先命中者胜出：
//! 1. `/` -> 主内容根目录下的首页处理器。
//! 2. 主内容根目录：处理器文件直接命中；其它普通文件交给宿主按静态文件服务。
//! 3. 各模块根目录（按角色划分）：只接受处理器文件。
//! 4. 应用根目录：先处理器文件，再普通文件。
//! 5. 以上都不满足 -> `NotFound`。
//!
//! 解析只做文件系统查询，从不执行处理器。含有目录穿越序列的路径在查询之前即被拒绝。
//! 落在禁止目录（例如文件会话存储目录）之下的文件一律视为不存在。

use log::{debug, warn};

use std::path::{Path, PathBuf};

use crate::{config::Config, exception::Exception, path::RequestPath, util::percent_decode};

/// 候选根目录接受的文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootAccepts {
    /// 只接受处理器扩展名的文件
    HandlersOnly,
    /// 处理器文件优先，其次任何普通文件（按静态文件服务）
    HandlersAndFiles,
}

/// 处理器执行时所在的工作目录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingDirectory {
    /// 候选根目录本身
    Root,
    /// 处理器文件所在的目录
    HandlerParent,
}

/// 有序候选表中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCandidateRoot {
    pub root_directory: PathBuf,
    pub accepts: RootAccepts,
    pub working_directory: WorkingDirectory,
}

/// 解析出的处理器及其工作目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub handler_path: PathBuf,
    pub working_directory: PathBuf,
}

/// 路由解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Handler(RouteMatch),
    /// 命中了非处理器文件，由宿主按静态文件服务
    StaticFile(PathBuf),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    landing_root: PathBuf,
    landing_handler: String,
    candidates: Vec<RouteCandidateRoot>,
    handler_extension: String,
    denied_roots: Vec<PathBuf>,
}

impl RouteTable {
    pub fn new(
        landing_root: PathBuf,
        landing_handler: &str,
        candidates: Vec<RouteCandidateRoot>,
        handler_extension: &str,
    ) -> Self {
        Self {
            landing_root,
            landing_handler: landing_handler.to_string(),
            candidates,
            handler_extension: handler_extension.to_string(),
            denied_roots: vec![],
        }
    }

    /// 这些目录下的文件永远不会作为处理器或静态文件返回
    pub fn with_denied_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.denied_roots = roots;
        self
    }

    /// 按门户的目录布局构建候选表：内容根目录、各模块根目录、应用根目录
    pub fn from_config(config: &Config) -> Self {
        let content_root = config.content_root();
        let mut candidates = vec![RouteCandidateRoot {
            root_directory: content_root.clone(),
            accepts: RootAccepts::HandlersAndFiles,
            working_directory: WorkingDirectory::Root,
        }];
        candidates.extend(config.module_roots().into_iter().map(|root| RouteCandidateRoot {
            root_directory: root,
            accepts: RootAccepts::HandlersOnly,
            working_directory: WorkingDirectory::HandlerParent,
        }));
        candidates.push(RouteCandidateRoot {
            root_directory: config.app_root().to_path_buf(),
            accepts: RootAccepts::HandlersAndFiles,
            working_directory: WorkingDirectory::Root,
        });
        Self::new(
            content_root,
            config.landing_handler(),
            candidates,
            config.handler_extension(),
        )
        .with_denied_roots(vec![config.session_store_dir()])
    }

    pub fn candidates(&self) -> &[RouteCandidateRoot] {
        &self.candidates
    }

    pub fn resolve(&self, path: &RequestPath) -> RouteOutcome {
        self.try_resolve(path).unwrap_or(RouteOutcome::NotFound)
    }

    /// 与 [`RouteTable::resolve`] 相同，但给出未命中的原因：
    /// `PathTraversalAttempt` 或 `RouteNotFound`。成功时不会返回 `RouteOutcome::NotFound`。
    pub fn try_resolve(&self, path: &RequestPath) -> Result<RouteOutcome, Exception> {
        if path.is_root() {
            let handler_path = self.landing_root.join(&self.landing_handler);
            if !handler_path.is_file() {
                warn!("首页处理器{}不存在", handler_path.display());
                return Err(Exception::RouteNotFound);
            }
            return Ok(RouteOutcome::Handler(RouteMatch {
                handler_path,
                working_directory: self.landing_root.clone(),
            }));
        }

        let relative = relative_path(path.as_str()).map_err(|e| {
            warn!("拒绝包含目录穿越序列的路径：{}", path.as_str());
            e
        })?;
        if relative.as_os_str().is_empty() {
            return Err(Exception::RouteNotFound);
        }

        for candidate in &self.candidates {
            let full_path = candidate.root_directory.join(&relative);
            if !full_path.is_file() {
                continue;
            }
            if self.is_denied(&full_path) {
                warn!("拒绝访问受保护目录中的文件：{}", full_path.display());
                return Err(Exception::RouteNotFound);
            }
            if self.is_handler(&full_path) {
                let working_directory = match candidate.working_directory {
                    WorkingDirectory::Root => candidate.root_directory.clone(),
                    WorkingDirectory::HandlerParent => full_path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| candidate.root_directory.clone()),
                };
                debug!("路由命中处理器：{}", full_path.display());
                return Ok(RouteOutcome::Handler(RouteMatch {
                    handler_path: full_path,
                    working_directory,
                }));
            }
            if candidate.accepts == RootAccepts::HandlersAndFiles {
                debug!("路由命中静态文件：{}", full_path.display());
                return Ok(RouteOutcome::StaticFile(full_path));
            }
        }
        Err(Exception::RouteNotFound)
    }

    /// 为静态资源路径定位实际文件，只查找接受普通文件的根目录
    pub fn locate_static(&self, path: &RequestPath) -> Option<PathBuf> {
        self.try_locate_static(path).ok()
    }

    pub fn try_locate_static(&self, path: &RequestPath) -> Result<PathBuf, Exception> {
        let relative = relative_path(path.as_str()).map_err(|e| {
            warn!("拒绝包含目录穿越序列的静态路径：{}", path.as_str());
            e
        })?;
        if relative.as_os_str().is_empty() {
            return Err(Exception::RouteNotFound);
        }
        let found = self
            .candidates
            .iter()
            .filter(|c| c.accepts == RootAccepts::HandlersAndFiles)
            .map(|c| c.root_directory.join(&relative))
            .find(|p| p.is_file())
            .ok_or(Exception::RouteNotFound)?;
        if self.is_denied(&found) {
            warn!("拒绝访问受保护目录中的文件：{}", found.display());
            return Err(Exception::RouteNotFound);
        }
        Ok(found)
    }

    /// 按字面前缀以及解析符号链接后的真实路径两种方式比较
    fn is_denied(&self, path: &Path) -> bool {
        if self.denied_roots.is_empty() {
            return false;
        }
        let canonical = path.canonicalize().ok();
        self.denied_roots.iter().any(|root| {
            path.starts_with(root)
                || match (&canonical, root.canonicalize()) {
                    (Some(p), Ok(r)) => p.starts_with(r),
                    _ => false,
                }
        })
    }

    fn is_handler(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e == self.handler_extension)
    }
}

/// 把 URL 路径转换为相对文件系统路径。
///
/// 每个分段单独做一次百分号解码；解码后为 `..`、含 `/`、`\` 或 NUL 的分段一律拒绝。
fn relative_path(path: &str) -> Result<PathBuf, Exception> {
    let mut relative = PathBuf::new();
    for raw_segment in path.split('/') {
        let segment = percent_decode(raw_segment).ok_or(Exception::PathTraversalAttempt)?;
        if segment == ".." || segment.contains(['/', '\\', '\0']) {
            return Err(Exception::PathTraversalAttempt);
        }
        if segment.is_empty() || segment == "." {
            continue;
        }
        relative.push(segment);
    }
    Ok(relative)
}
