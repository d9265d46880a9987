//! 上传解压
//!
//! 上传内容按块写入磁盘（不整体驻留内存）并检查大小上限，
//! 随后在阻塞线程中按 tar 或 tar.gz 解压到临时构建目录。

use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::{pin_mut, Stream, StreamExt};
use tempfile::{NamedTempFile, TempDir};
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::domain::image::is_path_token;
use crate::domain::namespace::Namespace;
use crate::error::{DeployError, DeployResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// 请求级临时目录，drop 时删除
#[derive(Debug)]
pub struct ContextDir {
    dir: TempDir,
}

impl ContextDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// 上传解压器
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    max_bytes: u64,
    temp_root: Option<PathBuf>,
}

impl ArchiveExtractor {
    pub fn new(max_bytes: u64, temp_root: Option<PathBuf>) -> Self {
        Self {
            max_bytes,
            temp_root,
        }
    }

    /// 创建空的临时目录，名称为 `<namespace>__<name>` 加随机后缀
    ///
    /// `name` 来自请求，必须先通过校验才能进入文件系统路径
    pub fn workspace(&self, namespace: &Namespace, name: &str) -> DeployResult<ContextDir> {
        if !is_path_token(name) {
            return Err(DeployError::validation(format!("invalid API name '{}'", name)));
        }
        let prefix = format!("{}__{}.", namespace, name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }?;
        debug!(path = %dir.path().display(), "created context directory");
        Ok(ContextDir { dir })
    }

    /// 声明长度超限时直接拒绝，此时尚未创建任何目录
    pub fn check_declared_len(&self, declared_len: Option<u64>) -> DeployResult<()> {
        match declared_len {
            Some(len) if len > self.max_bytes => Err(self.too_large()),
            _ => Ok(()),
        }
    }

    /// 将 `body` 落盘并解压到新的临时目录
    pub async fn extract<S>(
        &self,
        namespace: &Namespace,
        name: &str,
        declared_len: Option<u64>,
        body: S,
    ) -> DeployResult<ContextDir>
    where
        S: Stream<Item = std::io::Result<Bytes>>,
    {
        self.check_declared_len(declared_len)?;

        let context = self.workspace(namespace, name)?;
        let spool = tempfile::Builder::new()
            .prefix(".upload")
            .tempfile_in(context.path().parent().unwrap_or_else(|| context.path()))?;

        let received = self.spool(&spool, body).await?;
        debug!(bytes = received, "upload spooled");

        let dest = context.path().to_owned();
        let entries = spawn_blocking(move || unpack(&spool, &dest))
            .await
            .map_err(|e| DeployError::internal(format!("extract task failed: {}", e)))??;

        info!(
            namespace = %namespace,
            path = %context.path().display(),
            entries,
            bytes = received,
            "archive extracted"
        );
        Ok(context)
    }

    async fn spool<S>(&self, spool: &NamedTempFile, body: S) -> DeployResult<u64>
    where
        S: Stream<Item = std::io::Result<Bytes>>,
    {
        let mut file = tokio::fs::File::from_std(spool.as_file().try_clone()?);
        let mut received: u64 = 0;

        pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| DeployError::validation(format!("failed to read upload: {}", e)))?;
            received += chunk.len() as u64;
            if received > self.max_bytes {
                return Err(self.too_large());
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if received == 0 {
            return Err(DeployError::validation("uploaded archive is empty"));
        }
        Ok(received)
    }

    fn too_large(&self) -> DeployError {
        DeployError::too_large(format!(
            "upload exceeds the {} byte limit",
            self.max_bytes
        ))
    }
}

/// 只解压普通文件和目录，其他类型的条目跳过
fn unpack(spool: &NamedTempFile, dest: &Path) -> DeployResult<usize> {
    let mut file = spool.reopen()?;
    let mut magic = [0u8; 2];
    let is_gzip = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    unpack_entries(tar::Archive::new(reader), dest)
}

fn unpack_entries<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> DeployResult<usize> {
    let malformed = |e: std::io::Error| DeployError::validation(format!("malformed archive: {}", e));

    let mut count = 0;
    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            debug!(entry_type = ?kind, "skipping archive entry");
            continue;
        }

        let path = entry.path().map_err(malformed)?.into_owned();
        if !entry.unpack_in(dest).map_err(malformed)? {
            return Err(DeployError::validation(format!(
                "archive entry '{}' escapes the build context",
                path.display()
            )));
        }
        count += 1;
    }

    if count == 0 {
        return Err(DeployError::validation("archive contains no files"));
    }
    Ok(count)
}
