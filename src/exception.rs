// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 前端控制器在处理请求的各个阶段可能产生的异常类型。
//!
//! 控制器从不把这些异常原样暴露给客户端：路由失败统一降级为 404，
//! 会话存储故障统一降级为“需要重新登录”，其余情况映射为对应的状态页。

use std::fmt;

/// 请求处理过程中发生的异常类型。
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exception {
    /// 请求字节流不是合法的 UTF-8。
    RequestIsNotUtf8,
    /// 请求行或请求头的格式无法解析。
    MalformedRequest,
    /// 请求使用了不支持的 HTTP 方法。
    UnSupportedRequestMethod,
    /// 请求使用了不支持的 HTTP 协议版本。
    UnsupportedHttpVersion,
    /// 请求体超过了配置的上限。对应 `413`。
    PayloadTooLarge,
    /// 所有候选根目录中都没有匹配的处理器或静态文件。对应 `404`。
    RouteNotFound,
    /// 路径中包含目录穿越序列，在访问文件系统之前即被拒绝，对外表现为 `404`。
    PathTraversalAttempt,
    /// 会话存储无法读取（数据损坏或后端不可用）。按“无会话”处理，只写日志。
    SessionUnreadable,
    /// 无法启动处理器解释器。
    HandlerExecuteFailed,
    /// 处理器脚本运行失败或输出无法解析。对应 `500`。
    HandlerCodeError,
    /// 配置文件缺失或取值非法。
    ConfigInvalid,
}

use Exception::*;

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            MalformedRequest => write!(f, "Malformed HTTP request"),
            UnSupportedRequestMethod => write!(f, "Unsupported request method"),
            UnsupportedHttpVersion => write!(f, "Unsupported HTTP version"),
            PayloadTooLarge => write!(f, "Request body too large (413)"),
            RouteNotFound => write!(f, "Route not found (404)"),
            PathTraversalAttempt => write!(f, "Path traversal attempt rejected"),
            SessionUnreadable => write!(f, "Session store unreadable"),
            HandlerExecuteFailed => write!(f, "Couldn't invoke handler interpreter"),
            HandlerCodeError => write!(f, "An error happened in handler code"),
            ConfigInvalid => write!(f, "Invalid configuration"),
        }
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(RouteNotFound.to_string(), "Route not found (404)");
        assert_eq!(SessionUnreadable.to_string(), "Session store unreadable");
        assert!(PathTraversalAttempt.to_string().contains("traversal"));
    }
}
