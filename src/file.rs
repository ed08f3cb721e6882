use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{Cache, ProxyError, Result};

const TEMP_POSTFIX: &str = ".download";
const MAX_EXTENSION_LENGTH: usize = 4;

/// Implements [`Cache`] on top of a [`tokio::fs::File`].
///
/// Bytes land in `<path>.download` until [`Cache::complete`] renames the file
/// to its final path.
pub struct FileCache {
    file: Mutex<CacheFile>,
    available: AtomicU64,
    completed: AtomicBool,
}

struct CacheFile {
    handle: File,
    path: PathBuf,
    closed: bool,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("available", &self.available.load(Ordering::Acquire))
            .field("completed", &self.completed.load(Ordering::Acquire))
            .finish()
    }
}

impl FileCache {
    /// Opens the cache whose completed form lives at `path`.
    ///
    /// An existing file at `path` yields a completed cache; otherwise bytes
    /// already persisted in the temporary file are resumed.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<FileCache> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let completed = fs::try_exists(&path).await?;
        let (handle, path) = if completed {
            (File::open(&path).await?, path)
        } else {
            let temp = temp_path(&path);
            let handle = OpenOptions::new().read(true).append(true).create(true).open(&temp).await?;
            (handle, temp)
        };
        let available = handle.metadata().await?.len();

        Ok(FileCache {
            file: Mutex::new(CacheFile { handle, path, closed: false }),
            available: AtomicU64::new(available),
            completed: AtomicBool::new(completed),
        })
    }

    /// Path of the file currently backing the cache.
    pub async fn path(&self) -> PathBuf {
        self.file.lock().await.path.clone()
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn available(&self) -> Result<u64> {
        Ok(self.available.load(Ordering::Acquire))
    }

    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let available = self.available.load(Ordering::Acquire);
        if offset >= available {
            return Ok(0);
        }
        let n = std::cmp::min(
            buf.len(),
            usize::try_from(available - offset).unwrap_or(usize::MAX),
        );

        let mut file = self.file.lock().await;
        file.handle.seek(SeekFrom::Start(offset)).await?;
        file.handle.read_exact(&mut buf[..n]).await?;
        Ok(n)
    }

    async fn append(&self, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        if self.completed.load(Ordering::Acquire) {
            return Err(ProxyError::Cache(format!("error appending to completed cache {}", file.path.display())));
        }
        if file.closed {
            return Err(ProxyError::Cache(format!("error appending to closed cache {}", file.path.display())));
        }
        file.handle.write_all(data).await?;
        // the counter may only cover bytes that reached the file
        file.handle.flush().await?;
        self.available.fetch_add(data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        if self.completed.load(Ordering::Acquire) {
            return Ok(());
        }
        file.handle.flush().await?;
        file.handle.sync_all().await?;

        let completed_path = completed_path(&file.path);
        fs::rename(&file.path, &completed_path).await?;
        file.handle = File::open(&completed_path).await?;
        file.path = completed_path;
        self.completed.store(true, Ordering::Release);
        tracing::debug!(path = %file.path.display(), "cache completed");
        Ok(())
    }

    async fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        if file.closed {
            return Ok(());
        }
        file.closed = true;
        if !self.completed.load(Ordering::Acquire) {
            file.handle.flush().await?;
            file.handle.sync_all().await?;
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_POSTFIX);
    PathBuf::from(name)
}

fn completed_path(path: &Path) -> PathBuf {
    let name = path.to_string_lossy();
    PathBuf::from(name.strip_suffix(TEMP_POSTFIX).unwrap_or(&name).to_string())
}

/// Cache file name for an upstream URL: a blake3 digest of the URL followed
/// by the URL's extension when it looks like one.
pub fn cache_file_name(url: &str) -> String {
    let digest = blake3::hash(url.as_bytes()).to_hex();
    match url_extension(url) {
        Some(extension) => format!("{digest}.{extension}"),
        None => digest.to_string(),
    }
}

fn url_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let file_name = parsed.path_segments()?.last()?.to_string();
    let (_, extension) = file_name.rsplit_once('.')?;
    let valid = !extension.is_empty()
        && extension.len() <= MAX_EXTENSION_LENGTH
        && extension.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| extension.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path().join("video.mp4")).await.unwrap();
        assert_eq!(0, cache.available().await.unwrap());
        assert!(cache.path().await.ends_with("video.mp4.download"));

        cache.append(b"Hello world ").await.unwrap();
        cache.append(b"this is a file").await.unwrap();
        assert_eq!(26, cache.available().await.unwrap());

        let mut buf = [0u8; 5];
        assert_eq!(5, cache.read(&mut buf, 6).await.unwrap());
        assert_eq!(b"world", &buf);

        let mut buf = [0u8; 64];
        assert_eq!(14, cache.read(&mut buf, 12).await.unwrap());
        assert_eq!(b"this is a file", &buf[..14]);
        assert_eq!(0, cache.read(&mut buf, 26).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_renames_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let cache = FileCache::open(&path).await.unwrap();
        cache.append(b"0123456789").await.unwrap();
        cache.complete().await.unwrap();

        assert!(cache.is_completed().await);
        assert_eq!(path, cache.path().await);
        assert!(path.exists());
        assert!(!dir.path().join("video.mp4.download").exists());
        assert_matches!(cache.append(b"x").await, Err(ProxyError::Cache(_)));

        let mut buf = [0u8; 4];
        assert_eq!(4, cache.read(&mut buf, 2).await.unwrap());
        assert_eq!(b"2345", &buf);
    }

    #[tokio::test]
    async fn test_reopen_completed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.bin");
        std::fs::write(&path, b"complete content").unwrap();

        let cache = FileCache::open(&path).await.unwrap();
        assert!(cache.is_completed().await);
        assert_eq!(16, cache.available().await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_partial_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("partial.bin");
        {
            let cache = FileCache::open(&path).await.unwrap();
            cache.append(b"first").await.unwrap();
            cache.close().await.unwrap();
        }
        let cache = FileCache::open(&path).await.unwrap();
        assert!(!cache.is_completed().await);
        assert_eq!(5, cache.available().await.unwrap());
        cache.append(b"second").await.unwrap();

        let mut buf = [0u8; 11];
        assert_eq!(11, cache.read(&mut buf, 0).await.unwrap());
        assert_eq!(b"firstsecond", &buf);
    }

    #[tokio::test]
    async fn test_closed_cache_stays_readable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path().join("closed.bin")).await.unwrap();
        cache.append(b"abc").await.unwrap();
        cache.close().await.unwrap();
        cache.close().await.unwrap();

        assert_matches!(cache.append(b"d").await, Err(ProxyError::Cache(_)));
        let mut buf = [0u8; 3];
        assert_eq!(3, cache.read(&mut buf, 0).await.unwrap());
    }

    #[test]
    fn test_cache_file_name() {
        let name = cache_file_name("https://example.com/media/video.mp4?token=1");
        assert!(name.ends_with(".mp4"));
        assert_eq!(64 + 4, name.len());

        let name = cache_file_name("https://example.com/stream");
        assert_eq!(64, name.len());

        let name = cache_file_name("https://example.com/archive.tar.gzipped");
        assert!(!name.contains('.'));

        assert_ne!(cache_file_name("https://a.com/x.mp4"), cache_file_name("https://b.com/x.mp4"));
    }
}
