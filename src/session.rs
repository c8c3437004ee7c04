// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 会话存储适配模块
//!
//! 会话状态由外部持久化，前端控制器只通过 [`SessionStore`] 读写它。
//! 提供两种实现：
//! - [`MemorySessionStore`]：进程内哈希表，单实例部署与测试使用。
//! - [`FileSessionStore`]：每个会话一个 JSON 文件，进程重启后会话仍然有效，
//!   文件损坏时读取返回 [`Exception::SessionUnreadable`]。
//!
//! 同一会话 id 的并发请求对 `last_activity_at` 采用后写者胜出。

use log::{debug, error, warn};
use serde_derive::{Deserialize, Serialize};

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use crate::{exception::Exception, timeout::TimeoutPolicy};

/// 持久化的会话状态，时间均为 Unix 秒
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub principal_id: Option<String>,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.principal_id.is_some()
    }
}

pub trait SessionStore: Send + Sync {
    fn get(&self, session_id: &str) -> Result<Option<SessionState>, Exception>;

    /// 刷新 `last_activity_at`，会话不存在时什么也不做
    fn touch(&self, session_id: &str, now: i64) -> Result<(), Exception>;

    /// 销毁会话，之后对该 id 的读取不再带有已认证主体
    fn invalidate(&self, session_id: &str) -> Result<(), Exception>;

    /// 登录成功后建立新会话
    fn establish(&self, session_id: &str, principal_id: &str, now: i64) -> Result<SessionState, Exception>;

    /// 清理已经超时的会话，返回清理数量
    fn purge_expired(&self, policy: &TimeoutPolicy, now: i64) -> Result<usize, Exception>;

    fn count(&self) -> Result<usize, Exception>;
}

/// 会话 id 只允许 1-128 个 `[A-Za-z0-9-_,]` 字符
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b',')
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 会话 Cookie：`HttpOnly`、`SameSite=Lax`，HTTPS 下追加 `Secure`
pub fn session_cookie(name: &str, session_id: &str, secure: bool) -> String {
    let mut cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", name, session_id);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn expired_session_cookie(name: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{}=; Path=/; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Lax",
        name
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("会话存储锁被污染，恢复并继续");
            poisoned.into_inner()
        }
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入一条会话记录，测试与数据迁移使用
    pub fn insert(&self, state: SessionState) {
        lock(&self.sessions).insert(state.session_id.clone(), state);
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, session_id: &str) -> Result<Option<SessionState>, Exception> {
        Ok(lock(&self.sessions).get(session_id).cloned())
    }

    fn touch(&self, session_id: &str, now: i64) -> Result<(), Exception> {
        if let Some(state) = lock(&self.sessions).get_mut(session_id) {
            state.last_activity_at = now;
        }
        Ok(())
    }

    fn invalidate(&self, session_id: &str) -> Result<(), Exception> {
        lock(&self.sessions).remove(session_id);
        Ok(())
    }

    fn establish(&self, session_id: &str, principal_id: &str, now: i64) -> Result<SessionState, Exception> {
        let state = SessionState {
            session_id: session_id.to_string(),
            created_at: now,
            last_activity_at: now,
            principal_id: Some(principal_id.to_string()),
        };
        self.insert(state.clone());
        Ok(state)
    }

    fn purge_expired(&self, policy: &TimeoutPolicy, now: i64) -> Result<usize, Exception> {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, s| policy.expiry_reason(s, now).is_none());
        Ok(before - sessions.len())
    }

    fn count(&self) -> Result<usize, Exception> {
        Ok(lock(&self.sessions).len())
    }
}

/// 每个会话一个 `sess_<id>.json` 文件
pub struct FileSessionStore {
    dir: PathBuf,
    // 串行化同进程内的读改写
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Exception> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            error!("无法创建会话目录{}：{}", dir.display(), e);
            Exception::SessionUnreadable
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn file_for(&self, session_id: &str) -> Result<PathBuf, Exception> {
        if !is_valid_session_id(session_id) {
            warn!("非法的会话id：{:?}", session_id);
            return Err(Exception::SessionUnreadable);
        }
        Ok(self.dir.join(format!("sess_{}.json", session_id)))
    }

    fn read(&self, path: &PathBuf) -> Result<Option<SessionState>, Exception> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                error!("读取会话文件{}失败：{}", path.display(), e);
                return Err(Exception::SessionUnreadable);
            }
        };
        serde_json::from_str(&text).map(Some).map_err(|e| {
            warn!("会话文件{}已损坏：{}", path.display(), e);
            Exception::SessionUnreadable
        })
    }

    fn write(&self, path: &PathBuf, state: &SessionState) -> Result<(), Exception> {
        let json = serde_json::to_vec(state).map_err(|_| Exception::SessionUnreadable)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| {
                error!("写入会话文件{}失败：{}", path.display(), e);
                Exception::SessionUnreadable
            })
    }

    fn session_files(&self) -> Result<Vec<PathBuf>, Exception> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            error!("无法列出会话目录{}：{}", self.dir.display(), e);
            Exception::SessionUnreadable
        })?;
        Ok(entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with("sess_") && n.ends_with(".json"))
            })
            .collect())
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, session_id: &str) -> Result<Option<SessionState>, Exception> {
        let path = self.file_for(session_id)?;
        self.read(&path)
    }

    fn touch(&self, session_id: &str, now: i64) -> Result<(), Exception> {
        let path = self.file_for(session_id)?;
        let _guard = lock(&self.write_lock);
        match self.read(&path)? {
            Some(mut state) => {
                state.last_activity_at = now;
                self.write(&path, &state)
            }
            None => Ok(()),
        }
    }

    fn invalidate(&self, session_id: &str) -> Result<(), Exception> {
        let path = self.file_for(session_id)?;
        let _guard = lock(&self.write_lock);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("删除会话文件{}失败：{}", path.display(), e);
                Err(Exception::SessionUnreadable)
            }
        }
    }

    fn establish(&self, session_id: &str, principal_id: &str, now: i64) -> Result<SessionState, Exception> {
        let path = self.file_for(session_id)?;
        let state = SessionState {
            session_id: session_id.to_string(),
            created_at: now,
            last_activity_at: now,
            principal_id: Some(principal_id.to_string()),
        };
        let _guard = lock(&self.write_lock);
        self.write(&path, &state)?;
        Ok(state)
    }

    fn purge_expired(&self, policy: &TimeoutPolicy, now: i64) -> Result<usize, Exception> {
        let _guard = lock(&self.write_lock);
        let mut purged = 0;
        for path in self.session_files()? {
            let expired = match self.read(&path) {
                Ok(Some(state)) => policy.expiry_reason(&state, now).is_some(),
                Ok(None) => false,
                // 损坏的文件永远无法通过校验，一并清理
                Err(_) => true,
            };
            if expired && fs::remove_file(&path).is_ok() {
                purged += 1;
            }
        }
        debug!("会话目录清理完成，共清理{}个", purged);
        Ok(purged)
    }

    fn count(&self) -> Result<usize, Exception> {
        Ok(self.session_files()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy() -> TimeoutPolicy {
        TimeoutPolicy {
            idle_timeout_seconds: 600,
            absolute_timeout_seconds: 3600,
            warning_threshold_seconds: 60,
        }
    }

    #[test]
    fn test_session_id_validation() {
        assert!(is_valid_session_id("abc123-_,"));
        assert!(is_valid_session_id(&new_session_id()));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../etc/passwd"));
        assert!(!is_valid_session_id(&"a".repeat(129)));
    }

    #[test]
    fn test_cookie_attributes() {
        assert_eq!(
            session_cookie("PHPSESSID", "abc", false),
            "PHPSESSID=abc; Path=/; HttpOnly; SameSite=Lax"
        );
        assert!(session_cookie("__Host-PHPSESSID", "abc", true).ends_with("; Secure"));
        assert!(expired_session_cookie("PHPSESSID", false).contains("Max-Age=0"));
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemorySessionStore::new();
        assert_eq!(store.get("s1").unwrap(), None);
        store.establish("s1", "student-7", 100).unwrap();
        store.touch("s1", 150).unwrap();
        let state = store.get("s1").unwrap().unwrap();
        assert_eq!(state.created_at, 100);
        assert_eq!(state.last_activity_at, 150);
        assert!(state.is_authenticated());
        store.invalidate("s1").unwrap();
        assert_eq!(store.get("s1").unwrap(), None);
        store.touch("s1", 200).unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_memory_store_purge() {
        let store = MemorySessionStore::new();
        store.establish("fresh", "a", 1000).unwrap();
        store.establish("idle", "b", 1000 - 601).unwrap();
        store.insert(SessionState {
            session_id: "old".to_string(),
            created_at: 1000 - 3600,
            last_activity_at: 999,
            principal_id: Some("c".to_string()),
        });
        assert_eq!(store.purge_expired(&policy(), 1000).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.get("fresh").unwrap().is_some());
    }

    #[test]
    fn test_file_store_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::open(dir.path().join("sessions")).unwrap();
        store.establish("s1", "admin-1", 100).unwrap();
        store.touch("s1", 130).unwrap();

        let reopened = FileSessionStore::open(dir.path().join("sessions")).unwrap();
        let state = reopened.get("s1").unwrap().unwrap();
        assert_eq!(state.last_activity_at, 130);
        assert_eq!(state.principal_id.as_deref(), Some("admin-1"));
        assert_eq!(reopened.count().unwrap(), 1);

        reopened.invalidate("s1").unwrap();
        assert_eq!(store.get("s1").unwrap(), None);
        reopened.invalidate("s1").unwrap();
    }

    #[test]
    fn test_file_store_corrupted_file_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("sess_bad.json"), b"{not json").unwrap();
        assert_eq!(store.get("bad").unwrap_err(), Exception::SessionUnreadable);
        assert_eq!(store.touch("bad", 1).unwrap_err(), Exception::SessionUnreadable);
    }

    #[test]
    fn test_file_store_rejects_invalid_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::open(dir.path()).unwrap();
        assert_eq!(store.get("../x").unwrap_err(), Exception::SessionUnreadable);
    }

    #[test]
    fn test_file_store_purge_removes_expired_and_corrupted() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::open(dir.path()).unwrap();
        store.establish("live", "a", 1000).unwrap();
        store.establish("stale", "b", 100).unwrap();
        fs::write(dir.path().join("sess_broken.json"), b"").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();
        assert_eq!(store.purge_expired(&policy(), 1000).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
