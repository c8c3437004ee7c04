use crate::{
    cache::FileCache,
    config::Config,
    controller::Dispatch,
    exception::Exception,
    handler::HandlerOutput,
    param::*,
    request::Request,
    session::expired_session_cookie,
    timeout::ExpiryReason,
    util::{percent_encode_component, HtmlBuilder},
};

use brotli::enc::{self, backward_references::BrotliEncoderParams};
use bytes::Bytes;
use chrono::prelude::*;
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use log::{debug, error, warn};

use std::{
    fs,
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
};

#[derive(Debug, Clone)]
pub struct Response {
    version: HttpVersion,
    status_code: u16,
    information: String,
    content_type: Option<String>,
    content_length: u64,
    date: DateTime<Utc>,
    content_encoding: Option<HttpEncoding>,
    server_name: String,
    allow: Option<Vec<HttpRequestMethod>>,
    /// 处理器或会话逻辑追加的其它响应头
    headers: Vec<(String, String)>,
    content: Option<Bytes>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            version: HttpVersion::V1_1,
            status_code: 200,
            information: "OK".to_string(),
            content_type: None,
            content_length: 0,
            date: Utc::now(),
            content_encoding: None,
            server_name: SERVER_NAME.to_string(),
            allow: None,
            headers: vec![],
            content: None,
        }
    }

    /// 把一次分发的结果转换为 HTTP 响应
    pub fn from_dispatch(
        dispatch: Dispatch,
        request: &Request,
        id: u128,
        cache: &Arc<Mutex<FileCache>>,
        config: &Config,
    ) -> Self {
        let headonly = request.method() == HttpRequestMethod::Head;
        let mut response = match dispatch {
            Dispatch::Static(path) => Self::from_file(&path, request, id, cache, headonly),
            Dispatch::Handled { output, warning } => {
                let mut response = Self::from_handler_output(output);
                if let (Some(remaining), Some(header)) = (warning, config.warning_header()) {
                    response.push_header(header, &remaining.to_string());
                }
                response
            }
            Dispatch::Expired { reason, ajax } => Self::session_expired(reason, ajax, config),
            Dispatch::NotFound(path) => Self::not_found(&path),
            Dispatch::HandlerFailed(Exception::HandlerExecuteFailed) => Self::from_status_code(502, None),
            Dispatch::HandlerFailed(_) => Self::from_status_code(500, None),
        };
        if headonly {
            response.content = None;
        }
        debug!("[ID{}]响应状态：{} {}", id, response.status_code, response.information);
        response
    }

    fn from_file(
        path: &Path,
        request: &Request,
        id: u128,
        cache: &Arc<Mutex<FileCache>>,
        headonly: bool,
    ) -> Self {
        let file_metadata = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) => {
                error!("[ID{}]无法获取文件{}的元数据: {}", id, path.display(), e);
                return Self::from_status_code(500, None);
            }
        };
        let file_modified_time = match file_metadata.modified() {
            Ok(time) => time,
            Err(e) => {
                error!("[ID{}]无法获取文件{}的修改时间: {}", id, path.display(), e);
                return Self::from_status_code(500, None);
            }
        };

        let mime = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or("application/octet-stream", mime_for_extension);
        debug!("[ID{}]MIME类型: {}", id, mime);

        let mut response = Self::new();
        response.content_type = Some(mime.to_string());
        if headonly {
            response.content_length = file_metadata.len();
            return response;
        }

        let mut cache_lock = match cache.lock() {
            Ok(lock) => lock,
            Err(poisoned) => {
                warn!("[ID{}]缓存锁被污染，恢复并继续", id);
                poisoned.into_inner()
            }
        };
        let original = match cache_lock.find(path, file_modified_time) {
            Some(bytes) => {
                debug!("[ID{}]缓存命中，原始大小: {} bytes", id, bytes.len());
                bytes
            }
            None => {
                debug!("[ID{}]缓存未命中或文件已修改，读取文件: {}", id, path.display());
                let contents = match fs::read(path) {
                    Ok(c) => Bytes::from(c),
                    Err(e) => {
                        error!("[ID{}]无法读取文件{}。错误：{}", id, path.display(), e);
                        return Self::from_status_code(500, None);
                    }
                };
                cache_lock.push(path, contents.clone(), file_modified_time);
                contents
            }
        };
        drop(cache_lock);

        response.content_encoding = match should_skip_compression(mime) {
            true => None,
            false => decide_encoding(request.accept_encoding()),
        };
        let body = match response.content_encoding {
            None => original,
            Some(_) => match compress(original.to_vec(), response.content_encoding) {
                Ok(c) => Bytes::from(c),
                Err(e) => {
                    error!("[ID{}]压缩文件{}失败: {}，返回未压缩内容", id, path.display(), e);
                    response.content_encoding = None;
                    original
                }
            },
        };
        response.set_content(body);
        response
    }

    pub fn from_handler_output(output: HandlerOutput) -> Self {
        let mut response = Self::new();
        response.status_code = output.status;
        response.information = output.reason;
        for (name, value) in output.headers {
            if name.eq_ignore_ascii_case("content-type") {
                response.content_type = Some(value);
            } else if name.eq_ignore_ascii_case("content-length") {
                // 以实际正文长度为准
                continue;
            } else {
                response.headers.push((name, value));
            }
        }
        response.set_content(output.body);
        response
    }

    /// 状态页，`note` 为已转义的 HTML 片段
    pub fn from_status_code(code: u16, note: Option<&str>) -> Self {
        let mut response = Self::new();
        response.set_code(code);
        let content = match (code, note) {
            (_, Some(n)) => HtmlBuilder::from_status_code(code, Some(n)),
            (400, None) => HtmlBuilder::from_status_code(400, Some("<p>请求格式不正确。</p>")),
            (405, None) => HtmlBuilder::from_status_code(
                405,
                Some("<p>本服务器仅支持GET、HEAD、OPTIONS与POST方法。</p>"),
            ),
            (413, None) => HtmlBuilder::from_status_code(413, Some("<p>请求体超过了服务器允许的大小。</p>")),
            (500, None) => HtmlBuilder::from_status_code(500, Some("<p>服务器出现了一个内部错误。</p>")),
            (502, None) => HtmlBuilder::from_status_code(502, Some("<p>无法调用页面处理程序。</p>")),
            _ => HtmlBuilder::from_status_code(code, None),
        }
        .build();
        if code == 405 {
            response.allow = Some(ALLOWED_METHODS.to_vec());
        }
        response.content_type = Some("text/html;charset=utf-8".to_string());
        response.set_content(Bytes::from(content));
        response
    }

    /// 请求解析失败时的响应
    pub fn from_exception(exception: Exception) -> Self {
        match exception {
            Exception::UnSupportedRequestMethod => Self::from_status_code(405, None),
            Exception::PayloadTooLarge => Self::from_status_code(413, None),
            Exception::HandlerExecuteFailed => Self::from_status_code(502, None),
            Exception::RequestIsNotUtf8
            | Exception::MalformedRequest
            | Exception::UnsupportedHttpVersion => Self::from_status_code(400, None),
            Exception::RouteNotFound | Exception::PathTraversalAttempt => {
                Self::from_status_code(404, None)
            }
            _ => Self::from_status_code(500, None),
        }
    }

    /// 404 页面，回显请求路径
    pub fn not_found(path: &str) -> Self {
        let mut response = Self::new();
        response.set_code(404);
        response.content_type = Some("text/html;charset=utf-8".to_string());
        response.set_content(Bytes::from(HtmlBuilder::not_found(path).build()));
        response
    }

    pub fn options() -> Self {
        let mut response = Self::new();
        response.set_code(204);
        response.allow = Some(ALLOWED_METHODS.to_vec());
        response
    }

    /// 会话过期：浏览器请求重定向到登录页，AJAX 请求返回 401 JSON
    pub fn session_expired(reason: ExpiryReason, ajax: bool, config: &Config) -> Self {
        let location = login_location(config, reason);
        let mut response = Self::new();
        response.push_header(
            "Set-Cookie",
            &expired_session_cookie(config.cookie_name(), config.cookie_secure()),
        );
        if ajax {
            response.set_code(401);
            let body = serde_json::json!({
                "status": "session_expired",
                "reason": reason.as_str(),
                "redirect": location,
            });
            response.content_type = Some("application/json".to_string());
            response.set_content(Bytes::from(body.to_string()));
        } else {
            response.set_code(302);
            response.push_header("Location", &location);
            response.push_header("Cache-Control", "no-store");
        }
        response
    }

    fn set_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.information = match STATUS_CODES.get(&code) {
            Some(&info) => info.to_string(),
            None => {
                warn!("未登记的状态码：{}", code);
                reason_phrase(code).to_string()
            }
        };
        self
    }

    fn set_content(&mut self, content: Bytes) {
        self.content_length = content.len() as u64;
        self.content = Some(content);
    }

    pub fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let status_line = format!("{} {} {}{}", self.version, self.status_code, self.information, CRLF);
        let mut header = status_line;
        if let Some(t) = &self.content_type {
            header.push_str(&["Content-Type: ", t, CRLF].concat());
        }
        if let Some(e) = self.content_encoding {
            header.push_str(&format!("Content-Encoding: {}{}", e, CRLF));
            header.push_str(&["Vary: Accept-Encoding", CRLF].concat());
        }
        header.push_str(&format!("Content-Length: {}{}", self.content_length, CRLF));
        header.push_str(&["Date: ", &format_date(&self.date), CRLF].concat());
        header.push_str(&["Server: ", &self.server_name, CRLF].concat());
        if let Some(a) = &self.allow {
            let allow_str = a.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ");
            header.push_str(&["Allow: ", &allow_str, CRLF].concat());
        }
        for (name, value) in &self.headers {
            header.push_str(&[name.as_str(), ": ", value.as_str(), CRLF].concat());
        }
        header.push_str(&["Connection: close", CRLF, CRLF].concat());
        [
            header.as_bytes(),
            match &self.content {
                Some(c) => c,
                None => b"",
            },
        ]
        .concat()
    }
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<HttpEncoding> {
        self.content_encoding
    }

    pub fn content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    /// 查找追加的响应头，同名时取第一个
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 登录页地址：`{部署前缀}{登录路径}`，超时原因放在 `timeout` 查询参数中
pub fn login_location(config: &Config, reason: ExpiryReason) -> String {
    let base = format!(
        "{}{}",
        config.deployment_prefix().trim_end_matches('/'),
        config.login_path()
    );
    match reason.as_query_value() {
        Some(value) => format!("{}?timeout={}", base, percent_encode_component(value)),
        None => base,
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc2822()
}

fn compress(data: Vec<u8>, mode: Option<HttpEncoding>) -> io::Result<Vec<u8>> {
    let original_size = data.len();
    let result = match mode {
        Some(HttpEncoding::Gzip) => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Deflate) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Br) => {
            let params = BrotliEncoderParams::default();
            let mut output = Vec::new();
            enc::BrotliCompress(&mut io::Cursor::new(data), &mut output, &params)?;
            Ok(output)
        }
        None => Ok(data),
    };

    if let Ok(ref compressed) = result {
        debug!(
            "压缩完成: {:?}, 原始大小: {} bytes, 压缩后: {} bytes",
            mode,
            original_size,
            compressed.len()
        );
    }
    result
}

fn should_skip_compression(mime_type: &str) -> bool {
    let skip_types = [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "image/x-icon",
        "video/",
        "audio/",
        "application/zip",
        "application/gzip",
        "application/pdf",
        "font/woff",
        "font/woff2",
    ];
    skip_types
        .iter()
        .any(|&skip_type| mime_type.starts_with(skip_type))
}

/// 优先 br，其次 gzip、deflate
fn decide_encoding(accept_encoding: &[HttpEncoding]) -> Option<HttpEncoding> {
    [HttpEncoding::Br, HttpEncoding::Gzip, HttpEncoding::Deflate]
        .into_iter()
        .find(|e| accept_encoding.contains(e))
}
