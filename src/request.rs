// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求解析模块
//!
//! 把从 TCP 流中读到的原始字节解析为强类型的 `Request`：
//! 1. 请求行（方法、原始 URI、版本）。
//! 2. 路由与会话需要的请求头：`Cookie`、`X-Requested-With`、`Accept-Encoding` 等。
//! 3. 请求体，原样转交给处理器。

use bytes::Bytes;
use log::error;

use crate::{exception::Exception, param::*};

#[derive(Debug, Clone)]
pub struct Request {
    method: HttpRequestMethod,
    /// 原始请求目标（含查询串）
    target: String,
    version: HttpVersion,
    user_agent: String,
    host: Option<String>,
    accept_encoding: Vec<HttpEncoding>,
    cookie: Option<String>,
    content_type: Option<String>,
    content_length: usize,
    requested_with: Option<String>,
    body: Bytes,
}

/// 返回请求头结束标记 `\r\n\r\n` 之后第一个字节的位置
pub fn header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

impl Request {
    /// 从原始字节缓冲区构建 `Request`。
    ///
    /// `buffer` 需包含完整的请求头；`Content-Length` 之外多余的字节被忽略，
    /// 不足的部分按截断的请求体处理。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        let (head, body) = match header_end(buffer) {
            Some(end) => (&buffer[..end - 4], &buffer[end..]),
            None => (buffer, &buffer[buffer.len()..]),
        };

        let head = match std::str::from_utf8(head) {
            Ok(s) => s,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut lines = head.split(CRLF);
        let request_line = lines.next().unwrap_or("");
        let parts: Vec<&str> = request_line.split(' ').filter(|p| !p.is_empty()).collect();
        if parts.len() < 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::MalformedRequest);
        }

        let method_str = parts[0].to_uppercase();
        let method = match method_str.as_str() {
            "GET" => HttpRequestMethod::Get,
            "HEAD" => HttpRequestMethod::Head,
            "OPTIONS" => HttpRequestMethod::Options,
            "POST" => HttpRequestMethod::Post,
            _ => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, &method_str);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let version_str = parts[parts.len() - 1].to_uppercase();
        let version = match version_str.as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            _ => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, &version_str);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        // 路径中可能含有未编码的空格，用 join 尝试恢复
        let target = parts[1..parts.len() - 1].join(" ");
        if target.contains('\0') {
            error!("[ID{}]请求路径包含空字节", id);
            return Err(Exception::MalformedRequest);
        }

        let mut request = Self {
            method,
            target,
            version,
            user_agent: String::new(),
            host: None,
            accept_encoding: vec![],
            cookie: None,
            content_type: None,
            content_length: 0,
            requested_with: None,
            body: Bytes::new(),
        };

        for line in lines {
            let (name, value) = match line.split_once(':') {
                Some((n, v)) => (n.trim().to_ascii_lowercase(), v.trim()),
                None => continue,
            };
            match name.as_str() {
                "user-agent" => request.user_agent = value.to_string(),
                "host" => request.host = Some(value.to_string()),
                "accept-encoding" => request.accept_encoding = parse_encodings(value),
                "content-type" => request.content_type = Some(value.to_string()),
                "x-requested-with" => request.requested_with = Some(value.to_string()),
                // 多个 Cookie 头合并为一个
                "cookie" => {
                    request.cookie = Some(match request.cookie.take() {
                        Some(prev) => format!("{}; {}", prev, value),
                        None => value.to_string(),
                    })
                }
                "content-length" => {
                    request.content_length = match value.parse::<usize>() {
                        Ok(n) => n,
                        Err(_) => {
                            error!("[ID{}]Content-Length不合法：{}", id, value);
                            return Err(Exception::MalformedRequest);
                        }
                    }
                }
                _ => {}
            }
        }

        let body_len = request.content_length.min(body.len());
        request.body = Bytes::copy_from_slice(&body[..body_len]);
        Ok(request)
    }
}

fn parse_encodings(value: &str) -> Vec<HttpEncoding> {
    let mut encodings = vec![];
    for token in value.split(',') {
        let name = token.split(';').next().unwrap_or("").trim();
        let encoding = match name {
            "gzip" => HttpEncoding::Gzip,
            "deflate" => HttpEncoding::Deflate,
            "br" => HttpEncoding::Br,
            _ => continue,
        };
        if !encodings.contains(&encoding) {
            encodings.push(encoding);
        }
    }
    encodings
}

impl Request {
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// 原始请求目标（含查询串）
    pub fn target(&self) -> &str {
        &self.target
    }

    /// 查询串（不含 `?`），没有时为空字符串
    pub fn query_string(&self) -> &str {
        let without_fragment = self.target.split('#').next().unwrap_or("");
        without_fragment
            .split_once('?')
            .map_or("", |(_, q)| q)
    }

    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn accept_encoding(&self) -> &[HttpEncoding] {
        &self.accept_encoding
    }

    pub fn raw_cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// 按名称读取 Cookie，同名时取第一个
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookie.as_deref()?.split(';').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            if k.trim() == name {
                Some(v.trim())
            } else {
                None
            }
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// 门户前端的 AJAX 请求携带 `X-Requested-With: XMLHttpRequest`
    pub fn is_ajax(&self) -> bool {
        self.requested_with
            .as_deref()
            .map_or(false, |v| v.eq_ignore_ascii_case("xmlhttprequest"))
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
