// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 门户前端控制器服务
//!
//! 基于 Tokio 运行时的多线程 HTTP 服务，所有请求都经过同一个前端控制器：
//! - 静态资源直出（LRU 缓存、压缩、HEAD）
//! - 会话空闲与绝对超时检查
//! - 按有序候选根目录解析 PHP 处理器并以 CGI 方式调用
//! - 后台定期清理过期会话
//! - 后台管理控制台（CLI 指令交互）

use portal_router::{
    config::SessionStoreKind,
    param::{HttpRequestMethod, MAX_HEADER_BYTES},
    request::header_end,
    CgiHandler, Config, Exception, FileCache, FileSessionStore, FrontController,
    MemorySessionStore, Request, Response, SessionStore,
};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    runtime::Builder,
    sync::Notify,
    time::{self, Duration},
};

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    process,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

const DEFAULT_CONFIG_PATH: &str = "config/development.toml";
const LOG_CONFIG_PATH: &str = "config/log4rs.yaml";
/// 单次读取请求数据的超时时间
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// 每个连接共享的资源句柄
struct ServerState {
    config: Arc<Config>,
    controller: Arc<FrontController>,
    cache: Arc<Mutex<FileCache>>,
    active_connection: AtomicU32,
}

fn main() {
    // 1. 日志系统：log4rs 通过外部 YAML 配置级别与输出目的地
    if let Err(e) = log4rs::init_file(LOG_CONFIG_PATH, Default::default()) {
        eprintln!("无法从{}初始化日志系统：{}", LOG_CONFIG_PATH, e);
    }

    // 2. 配置：PORTAL_CONFIG 可以覆盖配置文件路径
    let config_path =
        std::env::var("PORTAL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = match Config::from_toml(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("配置文件{}无法使用：{}", config_path, e);
            process::exit(1);
        }
    };
    info!("配置文件{}已载入", config_path);
    info!("应用根目录：{}", config.app_root().display());

    // 3. 异步运行时：工作线程数由配置决定
    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(r) => r,
        Err(e) => {
            error!("无法创建Tokio运行时：{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("服务异常退出：{}", e);
        process::exit(1);
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn SessionStore>, Exception> {
    Ok(match config.session_store() {
        SessionStoreKind::Memory => {
            info!("会话存储：进程内存");
            Arc::new(MemorySessionStore::new())
        }
        SessionStoreKind::File => {
            let dir = config.session_store_dir();
            info!("会话存储：文件目录{}", dir.display());
            Arc::new(FileSessionStore::open(dir)?)
        }
    })
}

async fn serve(config: Config) -> Result<(), String> {
    // 4. 共享资源：会话存储、处理器、前端控制器、静态资源缓存
    let store = open_store(&config).map_err(|e| e.to_string())?;
    let handler = CgiHandler::new(config.interpreter());
    match handler.probe() {
        Some(version) => info!("找到PHP解释器：{}", version),
        None => warn!(
            "无法找到PHP解释器{}。服务器将继续运行，但处理器请求会返回502。",
            config.interpreter()
        ),
    }
    let controller = FrontController::new(&config, Arc::clone(&store), Arc::new(handler))
        .map_err(|e| e.to_string())?;
    let cache = FileCache::from_capacity(config.cache_size(), config.cache_max_file_size());
    let policy = config.timeout_policy();
    info!(
        "会话超时：空闲{}秒，绝对{}秒，提前{}秒警告",
        policy.idle_timeout_seconds, policy.absolute_timeout_seconds, policy.warning_threshold_seconds
    );

    let state = Arc::new(ServerState {
        config: Arc::new(config),
        controller: Arc::new(controller),
        cache: Arc::new(Mutex::new(cache)),
        active_connection: AtomicU32::new(0),
    });

    // 5. 网络层：支持全地址监听或本地回环监听
    let port = state.config.port();
    let address = match state.config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    let socket = SocketAddrV4::new(address, port);
    let listener = TcpListener::bind(socket)
        .await
        .map_err(|e| format!("无法绑定{}：{}", socket, e))?;
    info!("服务端在{}上监听Socket连接", socket);

    let shutdown = Arc::new(Notify::new());
    tokio::spawn(console(Arc::clone(&state), Arc::clone(&shutdown)));
    tokio::spawn(purge_sessions(Arc::clone(&state)));

    let mut id: u128 = 0;

    // 6. 主事件循环
    loop {
        let (mut stream, addr) = tokio::select! {
            _ = shutdown.notified() => {
                info!("主循环接收到停机指令，正在退出...");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("接受连接失败：{}", e);
                    continue;
                }
            },
        };
        debug!("[ID{}]TCP连接已建立：{}", id, addr);

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            state.active_connection.fetch_add(1, Ordering::SeqCst);
            handle_connection(&mut stream, id, &state).await;
            state.active_connection.fetch_sub(1, Ordering::SeqCst);
        });
        id += 1;
    }
    Ok(())
}

/// 管理控制台：`stop`、`status`、`help`
async fn console(state: Arc<ServerState>, shutdown: Arc<Notify>) {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        match reader.read_line(&mut input).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        match input.trim() {
            "stop" => {
                println!("停机指令已激活，服务器将停止接受新连接...");
                shutdown.notify_one();
                break;
            }
            "help" => {
                println!("== Portal Router Help ==");
                println!("stop   - 发出停机信号");
                println!("status - 查看当前服务器运行状态");
                println!("help   - 显示此帮助信息");
                println!("========================");
            }
            "status" => {
                let sessions = match state.controller.store().count() {
                    Ok(n) => n.to_string(),
                    Err(e) => format!("不可用（{}）", e),
                };
                println!("== Portal Router 状态 ==");
                println!("当前活跃连接数: {}", state.active_connection.load(Ordering::SeqCst));
                println!("当前会话数: {}", sessions);
                println!("========================");
            }
            "" => {}
            cmd => println!("无效的命令：{}", cmd),
        }
    }
}

/// 定期清理已超时的会话
async fn purge_sessions(state: Arc<ServerState>) {
    let mut interval = time::interval(Duration::from_secs(state.config.session_gc_interval_seconds()));
    // interval 的第一次 tick 立即完成
    interval.tick().await;
    loop {
        interval.tick().await;
        let controller = Arc::clone(&state.controller);
        let result = tokio::task::spawn_blocking(move || {
            let policy = *controller.timeout().policy();
            controller.store().purge_expired(&policy, Utc::now().timestamp())
        })
        .await;
        match result {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!("清理了{}个过期会话", n),
            Ok(Err(e)) => warn!("清理过期会话失败：{}", e),
            Err(e) => error!("会话清理任务异常：{}", e),
        }
    }
}

/// 读取完整的请求：先读到请求头结束，再按 `Content-Length` 读完请求体
async fn read_request(stream: &mut TcpStream, id: u128, max_body: usize) -> Result<Option<Request>, Exception> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 4096];

    let head_len = loop {
        if let Some(end) = header_end(&buffer) {
            break end;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            error!("[ID{}]请求头超过{}字节", id, MAX_HEADER_BYTES);
            return Err(Exception::MalformedRequest);
        }
        match time::timeout(READ_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(0)) if buffer.is_empty() => return Ok(None),
            Ok(Ok(0)) => return Err(Exception::MalformedRequest),
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                error!("[ID{}]读取TCPStream时遇到错误: {}", id, e);
                return Ok(None);
            }
            Err(_) => {
                warn!("[ID{}]读取请求超时", id);
                return Ok(None);
            }
        }
    };

    let request = Request::try_from(&buffer, id)?;
    let content_length = request.content_length();
    if content_length > max_body {
        warn!("[ID{}]请求体{}字节超过上限{}字节", id, content_length, max_body);
        return Err(Exception::PayloadTooLarge);
    }
    if buffer.len() >= head_len + content_length {
        return Ok(Some(request));
    }

    while buffer.len() < head_len + content_length {
        match time::timeout(READ_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                error!("[ID{}]读取请求体时遇到错误: {}", id, e);
                return Ok(None);
            }
            Err(_) => {
                warn!("[ID{}]读取请求体超时", id);
                return Ok(None);
            }
        }
    }
    Request::try_from(&buffer, id).map(Some)
}

/// # 连接处理器
///
/// 读取解析请求，交给前端控制器分发，然后构建并发送响应。
async fn handle_connection(stream: &mut TcpStream, id: u128, state: &ServerState) {
    let start_time = Instant::now();

    let request = match read_request(stream, id, state.config.max_body_size()).await {
        Ok(Some(r)) => r,
        Ok(None) => return,
        Err(e) => {
            warn!("[ID{}]请求无法处理：{}", id, e);
            let response = Response::from_exception(e);
            let _ = stream.write_all(&response.as_bytes()).await;
            let _ = stream.flush().await;
            return;
        }
    };
    debug!("[ID{}]成功解析HTTP请求", id);

    let (request, response) = if request.method() == HttpRequestMethod::Options {
        (request, Response::options())
    } else {
        // 文件系统查询与处理器进程都是阻塞操作
        let controller = Arc::clone(&state.controller);
        let cache = Arc::clone(&state.cache);
        let config = Arc::clone(&state.config);
        let result = tokio::task::spawn_blocking(move || {
            let dispatch = controller.dispatch(&request, id, Utc::now().timestamp());
            let response = Response::from_dispatch(dispatch, &request, id, &cache, &config);
            (request, response)
        })
        .await;
        match result {
            Ok(pair) => pair,
            Err(e) => {
                error!("[ID{}]分发任务异常：{}", id, e);
                let response = Response::from_status_code(500, None);
                let _ = stream.write_all(&response.as_bytes()).await;
                return;
            }
        }
    };

    debug!(
        "[ID{}]HTTP响应构建完成，服务端用时{}ms。",
        id,
        start_time.elapsed().as_millis()
    );

    info!(
        "[ID{}] {}, {}, {}, {}, {}, {}, ",
        id,
        request.version(),
        request.target(),
        request.method(),
        response.status_code(),
        response.information(),
        request.user_agent(),
    );

    let response_bytes = response.as_bytes();
    debug!("[ID{}]发送响应，长度: {}", id, response_bytes.len());
    if let Err(e) = stream.write_all(&response_bytes).await {
        error!("[ID{}]发送响应失败: {}", id, e);
        return;
    }
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}
