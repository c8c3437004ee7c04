use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use log::debug;
use lru::LruCache;

/// 静态资源缓存项，保存未压缩的原始内容
#[derive(Clone)]
struct CacheEntry {
    content: Bytes,
    modified_time: SystemTime,
}

/// 静态资源的 LRU 缓存，以磁盘路径为键，修改时间变化即失效
pub struct FileCache {
    cache: LruCache<PathBuf, CacheEntry>,
    max_file_size: u64,
}

impl FileCache {
    /// 容量为 0 时按 1 处理
    pub fn from_capacity(capacity: usize, max_file_size: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            max_file_size,
        }
    }

    pub fn push(&mut self, path: &Path, bytes: Bytes, modified_time: SystemTime) {
        if !self.should_cache(bytes.len() as u64) {
            debug!("文件{}过大({} bytes)，跳过缓存", path.display(), bytes.len());
            return;
        }
        let entry = CacheEntry {
            content: bytes,
            modified_time,
        };
        self.cache.put(path.to_path_buf(), entry);
    }

    pub fn should_cache(&self, file_size: u64) -> bool {
        file_size <= self.max_file_size
    }

    /// 查询有效缓存；文件已被修改时移除旧条目
    pub fn find(&mut self, path: &Path, current_modified_time: SystemTime) -> Option<Bytes> {
        let stale = match self.cache.get(path) {
            Some(entry) if entry.modified_time == current_modified_time => {
                return Some(entry.content.clone())
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.cache.pop(path);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}
