//! 版本登记表的键值存储
//!
//! 键为 `/` 分隔的路径。所有后端都提供原子的 compare-and-swap，
//! `expected == None` 表示仅在键不存在时创建。

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// 超过该时长的锁文件视为崩溃副本遗留，可被清除
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// 存储错误
#[derive(Debug, Error)]
pub enum KvError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("operation timed out")]
    Timeout,

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// 键值存储后端
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// `prefix` 下的全部键（含子路径），已排序
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// 当前值等于 `expected` 时写入 `new`，返回是否写入

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError>;
}

/// 进程内存储，仅在单副本内原子
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let data = self.data.read().await;
        let mut keys: Vec<_> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError> {
        let mut data = self.data.write().await;
        let current = data.get(key).map(Vec::as_slice);

        let matches = match (expected, current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == cur,
            _ => false,
        };
        if matches {
            data.insert(key.to_string(), new.to_vec());
        }
        Ok(matches)
    }
}

/// 目录存储，可由挂载同一卷的多个副本共享
///
/// 仅在不存在时创建：先写完临时文件，再 `link(2)` 到目标（目标已存在则失败）。
/// 替换：持有 `O_EXCL` 锁文件，最后原子 rename，读者不会看到半写的值。
/// 锁文件超过 `STALE_LOCK_AGE` 未释放即视为遗留并清除。
#[derive(Debug, Clone)]
pub struct FsKv {
    root: PathBuf,
}

impl FsKv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(part) if !is_internal_name(part)));
        if !valid {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn write_temp(&self, target: &Path, value: &[u8]) -> Result<PathBuf, KvError> {
        let parent = target
            .parent()
            .ok_or_else(|| KvError::Backend("key has no parent directory".into()))?;
        tokio::fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&temp, value).await?;
        Ok(temp)
    }

    async fn lock(&self, target: &Path) -> Result<LockFile, KvError> {
        let file_name = target
            .file_name()
            .ok_or_else(|| KvError::Backend("key has no file name".into()))?;
        let lock_path = target.with_file_name(format!(".{}.lock", file_name.to_string_lossy()));

        let deadline = tokio::time::Instant::now() + LOCK_ACQUIRE_TIMEOUT;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => return Ok(LockFile(lock_path)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&lock_path).await {
                        warn!(path = %lock_path.display(), "Removing stale lock file");
                        match tokio::fs::remove_file(&lock_path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(KvError::Timeout);
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// 临时文件和锁文件以 `.` 开头，登记表的键段不会
fn is_internal_name(part: &std::ffi::OsStr) -> bool {
    part.to_string_lossy().starts_with('.')
}

async fn is_stale(lock_path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(lock_path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// drop 时删除锁文件
struct LockFile(PathBuf);

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), error = %e, "failed to remove lock file");
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, KvError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KvBackend for FsKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        read_optional(&self.path_for(key)?).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut keys = Vec::new();
        // 从前缀中最深的目录开始遍历
        let start = match prefix.rfind('/') {
            Some(i) => self.path_for(&prefix[..i])?,
            None => self.root.clone(),
        };
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if is_internal_name(&entry.file_name()) {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError> {
        let target = self.path_for(key)?;

        let Some(expected) = expected else {
            let temp = self.write_temp(&target, new).await?;
            let linked = tokio::fs::hard_link(&temp, &target).await;
            let _ = tokio::fs::remove_file(&temp).await;
            return match linked {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let _lock = self.lock(&target).await?;
        match read_optional(&target).await? {
            Some(current) if current == expected => {}
            _ => return Ok(false),
        }

        let temp = self.write_temp(&target, new).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise_cas(kv: &dyn KvBackend) {
        assert!(kv.cas("apis/a/b", None, b"one").await.unwrap());
        assert!(!kv.cas("apis/a/b", None, b"two").await.unwrap());
        assert_eq!(kv.get("apis/a/b").await.unwrap(), Some(b"one".to_vec()));

        assert!(!kv.cas("apis/a/b", Some(&b"stale"[..]), b"three").await.unwrap());
        assert!(kv.cas("apis/a/b", Some(&b"one"[..]), b"four").await.unwrap());
        assert_eq!(kv.get("apis/a/b").await.unwrap(), Some(b"four".to_vec()));

        assert!(!kv.cas("apis/missing", Some(&b"x"[..]), b"y").await.unwrap());
        assert_eq!(kv.get("apis/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cas_semantics() {
        exercise_cas(&MemoryKv::new()).await;
    }

    #[tokio::test]
    async fn fs_cas_semantics() {
        let dir = TempDir::new().unwrap();
        exercise_cas(&FsKv::new(dir.path())).await;
    }

    #[tokio::test]
    async fn fs_list_skips_internal_files() {
        let dir = TempDir::new().unwrap();
        let kv = FsKv::new(dir.path());

        for (key, value) in [
            ("apis/alice/hello/versions/1.0", b"a"),
            ("apis/alice/hello/versions/0.9", b"b"),
            ("apis/bob/other/versions/1", b"c"),
        ] {
            assert!(kv.cas(key, None, value).await.unwrap());
        }
        std::fs::write(
            dir.path().join("apis/alice/hello/versions/.stray.tmp"),
            b"partial",
        )
        .unwrap();

        let keys = kv.list("apis/alice/hello/versions/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "apis/alice/hello/versions/0.9",
                "apis/alice/hello/versions/1.0"
            ]
        );
    }

    #[tokio::test]
    async fn fs_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let kv = FsKv::new(dir.path());

        assert!(matches!(
            kv.get("../outside").await,
            Err(KvError::InvalidKey(_))
        ));
        assert!(matches!(
            kv.cas("", None, b"x").await,
            Err(KvError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn fs_swap_clears_stale_lock() {
        let dir = TempDir::new().unwrap();
        let kv = FsKv::new(dir.path());
        assert!(kv.cas("apis/a/b", None, b"one").await.unwrap());

        let lock_path = dir.path().join("apis/a/.b.lock");
        let lock = std::fs::File::create(&lock_path).unwrap();
        lock.set_modified(std::time::SystemTime::now() - Duration::from_secs(120))
            .unwrap();
        drop(lock);

        assert!(kv.cas("apis/a/b", Some(&b"one"[..]), b"two").await.unwrap());
        assert_eq!(kv.get("apis/a/b").await.unwrap(), Some(b"two".to_vec()));
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn fs_swap_waits_for_live_lock() {
        let dir = TempDir::new().unwrap();
        let kv = FsKv::new(dir.path());
        assert!(kv.cas("apis/a/b", None, b"one").await.unwrap());

        std::fs::write(dir.path().join("apis/a/.b.lock"), b"").unwrap();
        assert!(matches!(
            kv.cas("apis/a/b", Some(&b"one"[..]), b"two").await,
            Err(KvError::Timeout)
        ));
    }

    #[tokio::test]
    async fn concurrent_create_has_single_winner() {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(FsKv::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.cas("apis/race/key", None, &[i]).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
