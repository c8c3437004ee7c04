// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路径规范化模块
//!
//! 把原始请求 URI 转换为 [`RequestPath`]：去掉查询串和片段，
//! 去掉一次部署前缀（例如反向代理子路径 `/EducAid`），
//! 再按扩展名白名单判定为静态资源或动态路径。纯函数，无副作用。

use crate::config::Config;

/// 路径分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// 扩展名命中静态资源白名单，原样交给宿主服务
    Static,
    /// 其余路径，需要经过会话检查与路由解析
    Dynamic,
}

/// 规范化后的请求路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    path: String,
    kind: PathKind,
}

impl RequestPath {
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> PathKind {
        self.kind
    }

    pub fn is_static(&self) -> bool {
        self.kind == PathKind::Static
    }

    /// 根路径判定，空路径同样视为根
    pub fn is_root(&self) -> bool {
        self.path == "/" || self.path.is_empty()
    }
}

/// 路径规范化器，持有部署前缀与静态扩展名白名单
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    prefix: String,
    static_extensions: Vec<String>,
}

impl PathNormalizer {
    pub fn new(prefix: &str, static_extensions: &[String]) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            static_extensions: static_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.deployment_prefix(), config.static_extensions())
    }

    pub fn normalize(&self, raw_uri: &str) -> RequestPath {
        let path = strip_query_and_fragment(raw_uri);
        let path = self.strip_prefix(path);
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let kind = if self.has_static_extension(&path) {
            PathKind::Static
        } else {
            PathKind::Dynamic
        };
        RequestPath { path, kind }
    }

    /// 只在分段边界上去掉一次前缀：`/EducAid/x` 与 `/EducAid` 会被去掉，`/EducAidX` 不会
    fn strip_prefix<'a>(&self, path: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return path;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path,
        }
    }

    fn has_static_extension(&self, path: &str) -> bool {
        let last_segment = path.rsplit('/').next().unwrap_or("");
        match last_segment.rsplit_once('.') {
            Some((_, ext)) => {
                let ext = ext.to_ascii_lowercase();
                self.static_extensions.iter().any(|e| *e == ext)
            }
            None => false,
        }
    }
}

fn strip_query_and_fragment(raw_uri: &str) -> &str {
    let end = raw_uri.find(['?', '#']).unwrap_or(raw_uri.len());
    &raw_uri[..end]
}
