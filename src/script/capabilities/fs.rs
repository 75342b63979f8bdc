use crate::error::{Error, Result};
use crate::expr::Value;
use crate::hash::hex_digest;
use crate::script::capability::{Capability, StepCall};
use crate::script::progress::Level;
use crate::sync::KeyedLocks;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

static DOWNLOAD_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn download_client() -> &'static reqwest::Client {
    DOWNLOAD_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(concat!("appforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

fn invalid(capability: &str, reason: impl Into<String>) -> Error {
    Error::InvalidArgument {
        capability: capability.to_string(),
        reason: reason.into(),
    }
}

fn path_value(path: &Path) -> Value {
    Value::from(path.to_string_lossy().into_owned())
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::Filesystem(format!("Failed to create '{}': {}", parent.display(), e))
        })?;
    }
    Ok(())
}

/// Remove a symlink or file at `path` so a new link can take its place.
/// Real directories are left alone and reported.
async fn clear_link_target(path: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() || meta.is_file() => {
            tokio::fs::remove_file(path).await?;
            Ok(())
        }
        Ok(_) => Err(Error::Filesystem(format!(
            "'{}' already exists and is a directory",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
async fn make_link(src: &Path, dest: &Path) -> Result<()> {
    tokio::fs::symlink(src, dest).await?;
    Ok(())
}

#[cfg(windows)]
async fn make_link(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        tokio::fs::symlink_dir(src, dest).await?;
    } else {
        tokio::fs::symlink_file(src, dest).await?;
    }
    Ok(())
}

/// Last path segment of the URL, used when no file name is given.
fn file_name_from_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string)
        .unwrap_or_else(|| "download".to_string())
}

/// Cache entries being filled right now, keyed by entry path.
static CACHE_LOCKS: OnceLock<KeyedLocks> = OnceLock::new();

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// A sibling of `dest` no other download writes to.
fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    dest.with_file_name(format!(".{}.{}-{}.part", name, std::process::id(), seq))
}

/// Stream `url` into `dest` through a temporary file renamed on success.
/// The temporary file is removed on every failure.
async fn download_to(url: &url::Url, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
    ensure_parent(dest).await?;
    let partial = partial_path(dest);
    let result = stream_into(url, &partial, cancel).await;
    let result = match result {
        Ok(written) => tokio::fs::rename(&partial, dest)
            .await
            .map(|_| written)
            .map_err(Error::from),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    result
}

async fn stream_into(url: &url::Url, partial: &Path, cancel: &CancellationToken) -> Result<u64> {
    let response = download_client()
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?;
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(partial).await?;
    let mut written = 0u64;

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => return Err(Error::Cancelled(url.to_string())),
        };
        match chunk {
            Some(chunk) => {
                let bytes = chunk?;
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            None => break,
        }
    }
    file.flush().await?;
    Ok(written)
}

/// Fill the cache entry for `url` unless it is already there. Returns the
/// bytes downloaded, or `None` on a cache hit. Concurrent callers for the
/// same entry wait for the first one and then hit the cache.
async fn fetch_into_cache(
    url: &url::Url,
    entry: &Path,
    cancel: &CancellationToken,
) -> Result<Option<u64>> {
    let locks = CACHE_LOCKS.get_or_init(KeyedLocks::new);
    let _guard = locks.lock(&entry.to_string_lossy()).await;
    if entry.is_file() {
        return Ok(None);
    }
    download_to(url, entry, cancel).await.map(Some)
}

/// `fs.download`: fetch `url` to `path` (a file, or a directory ending in
/// `/`). With `cache: true` the file lands in the shared cache keyed by the
/// URL hash and `path` becomes a link to it.
pub struct FsDownload;

#[async_trait]
impl Capability for FsDownload {
    fn name(&self) -> &'static str {
        "fs.download"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let raw_url = call.required_str("url")?;
        let url = url::Url::parse(&raw_url)
            .map_err(|e| invalid(self.name(), format!("invalid url '{}': {}", raw_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(self.name(), format!("unsupported scheme '{}'", url.scheme())));
        }

        let file_name = file_name_from_url(&url);
        let dest = match call.str_param("path")? {
            Some(path) if path.ends_with('/') || call.ctx.resolve_path(&path).is_dir() => {
                call.ctx.resolve_path(&path).join(&file_name)
            }
            Some(path) => call.ctx.resolve_path(&path),
            None => call.ctx.cwd.join(&file_name),
        };
        let use_cache = call.bool_param("cache", false)?;

        let cached = if use_cache {
            let cache_dir = call.services.config.cache_dir();
            let entry = cache_dir.join(format!("{}-{}", hex_digest(raw_url.as_bytes()), file_name));
            if !entry.is_file() {
                call.emit(Level::Info, format!("Downloading {}", url));
            }
            match fetch_into_cache(&url, &entry, call.cancel).await? {
                Some(bytes) => tracing::info!(url = %url, bytes, "Downloaded into cache"),
                None => call.emit(Level::Info, format!("Using cached {}", file_name)),
            }
            ensure_parent(&dest).await?;
            clear_link_target(&dest).await?;
            make_link(&entry, &dest).await?;
            Some(entry)
        } else {
            call.emit(Level::Info, format!("Downloading {}", url));
            let bytes = download_to(&url, &dest, call.cancel).await?;
            tracing::info!(url = %url, bytes, "Downloaded");
            None
        };

        Ok(Value::object([
            ("path", path_value(&dest)),
            ("url", Value::from(raw_url)),
            ("cached", cached.as_deref().map(path_value).unwrap_or(Value::Null)),
        ]))
    }
}

/// `fs.write`: write `text`, or `json` pretty-printed, to `path`.
pub struct FsWrite;

#[async_trait]
impl Capability for FsWrite {
    fn name(&self) -> &'static str {
        "fs.write"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let path = call.ctx.resolve_path(&call.required_str("path")?);
        let content = match (call.param("text"), call.param("json")) {
            (Value::Undefined, Value::Undefined) => {
                return Err(invalid(self.name(), "one of `text` or `json` is required"))
            }
            (text, Value::Undefined) => text.to_display_string(),
            (_, json) => serde_json::to_string_pretty(&json.to_json())?,
        };

        ensure_parent(&path).await?;
        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|e| Error::Filesystem(format!("Failed to write '{}': {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "File written");
        Ok(Value::object([("path", path_value(&path))]))
    }
}

/// `fs.link`: symlink `src` at `dest`, replacing an existing link or file.
///
/// Used to share one dependency environment between applications.
pub struct FsLink;

#[async_trait]
impl Capability for FsLink {
    fn name(&self) -> &'static str {
        "fs.link"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let src: PathBuf = call.ctx.resolve_path(&call.required_str("src")?);
        let dest: PathBuf = call.ctx.resolve_path(&call.required_str("dest")?);
        if !src.exists() {
            return Err(invalid(
                self.name(),
                format!("source '{}' does not exist", src.display()),
            ));
        }

        ensure_parent(&dest).await?;
        clear_link_target(&dest).await?;
        make_link(&src, &dest).await?;
        call.emit(Level::Debug, format!("{} -> {}", dest.display(), src.display()));
        Ok(Value::object([("src", path_value(&src)), ("dest", path_value(&dest))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_file_name_from_url() {
        let url = url::Url::parse("https://huggingface.co/x/y/resolve/main/model.safetensors?download=true").unwrap();
        assert_eq!(file_name_from_url(&url), "model.safetensors");
        let bare = url::Url::parse("https://example.com/").unwrap();
        assert_eq!(file_name_from_url(&bare), "download");
    }

    #[tokio::test]
    async fn test_clear_link_target_refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("models");
        std::fs::create_dir(&sub).unwrap();
        assert!(clear_link_target(&sub).await.is_err());

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        clear_link_target(&file).await.unwrap();
        assert!(!file.exists());
        clear_link_target(&file).await.unwrap();
    }

    /// Serves `body` in two halves with a pause between them and counts
    /// the requests it answers.
    async fn slow_server(body: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut request = [0u8; 1024];
                    let _ = socket.read(&mut request).await;
                    let head = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    );
                    let (first, second) = body.split_at(body.len() / 2);
                    socket.write_all(head.as_bytes()).await.unwrap();
                    socket.write_all(first).await.unwrap();
                    socket.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    socket.write_all(second).await.unwrap();
                    socket.shutdown().await.unwrap();
                });
            }
        });
        (format!("http://{}/weights.bin", addr), hits)
    }

    #[tokio::test]
    async fn test_concurrent_cached_downloads_share_one_fetch() {
        let body: &'static [u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let (raw, hits) = slow_server(body).await;
        let url = url::Url::parse(&raw).unwrap();
        let cache = tempfile::tempdir().unwrap();
        let entry = cache.path().join("abc-weights.bin");
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            fetch_into_cache(&url, &entry, &cancel),
            fetch_into_cache(&url, &entry, &cancel)
        );
        let results = [first.unwrap(), second.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert!(results.contains(&Some(body.len() as u64)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&entry).unwrap(), body);

        let leftovers: Vec<_> = std::fs::read_dir(cache.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                    .await;
            }
        });
        let url = url::Url::parse(&format!("http://{}/model.ckpt", addr)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.ckpt");

        assert!(download_to(&url, &dest, &CancellationToken::new()).await.is_err());
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
