//! Provider HTTP transport + durable scalar timestamp stores.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use memsync_core::{format_timestamp, parse_timestamp, TimestampError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "memsync-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Skips TLS certificate and hostname verification. Legacy endpoints only.
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            user_agent: None,
            accept_invalid_certs: false,
        }
    }
}

/// Response of one provider call. Never persisted.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    /// Status line plus response headers, one per line.
    pub header: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status}")]
    HttpStatus { status: u16, header: String },
}

impl FetchError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn header(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { header, .. } => Some(header.as_str()),
            _ => None,
        }
    }
}

/// Single-shot form POST client: one network call per request, no retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(0);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if config.accept_invalid_certs {
            warn!("TLS certificate verification disabled for provider requests");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    /// POSTs `form` as `application/x-www-form-urlencoded`. Anything but 200 is a failure.
    pub async fn post_form(
        &self,
        run_id: Uuid,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<RawResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self
                .client
                .post(url)
                .form(form)
                .send()
                .await
                .map_err(|err| self.classify(err))?;

            let status = resp.status();
            let header = render_header(&resp);
            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    header,
                });
            }

            let body = resp.text().await.map_err(|err| self.classify(err))?;
            Ok(RawResponse {
                status,
                header,
                body,
            })
        }
        .instrument(span)
        .await
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Request(err)
        }
    }
}

fn render_header(resp: &reqwest::Response) -> String {
    let mut lines = vec![format!("{:?} {}", resp.version(), resp.status())];
    for (name, value) in resp.headers() {
        lines.push(format!(
            "{}: {}",
            name,
            value.to_str().unwrap_or("<non-ascii>")
        ));
    }
    lines.join("\n")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Malformed(#[from] TimestampError),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable single-value timestamp slot: the sync checkpoint and the
/// notification cooldown gate both sit behind this interface.
#[async_trait]
pub trait TimestampStore: Send + Sync {
    async fn load(&self) -> Result<Option<NaiveDateTime>, StoreError>;
    async fn store(&self, value: NaiveDateTime) -> Result<(), StoreError>;
}

/// Timestamp kept as text in a scratch file, replaced via temp-file + rename.
#[derive(Debug, Clone)]
pub struct FileTimestampStore {
    path: PathBuf,
}

impl FileTimestampStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, action: &str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            context: format!("{action} {}", self.path.display()),
            source,
        }
    }
}

#[async_trait]
impl TimestampStore for FileTimestampStore {
    async fn load(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error("reading", err)),
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_timestamp(text)?))
    }

    async fn store(&self, value: NaiveDateTime) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| self.io_error("creating directory for", err))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| self.io_error("opening temp file for", err))?;
        let text = format_timestamp(value);
        file.write_all(text.as_bytes())
            .await
            .map_err(|err| self.io_error("writing temp file for", err))?;
        file.flush()
            .await
            .map_err(|err| self.io_error("flushing temp file for", err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error("atomically replacing", err));
        }
        Ok(())
    }
}

/// In-process store; records every write in order.
#[derive(Debug, Default)]
pub struct MemoryTimestampStore {
    value: Mutex<Option<NaiveDateTime>>,
    writes: Mutex<Vec<NaiveDateTime>>,
}

impl MemoryTimestampStore {
    pub fn new(initial: Option<NaiveDateTime>) -> Self {
        Self {
            value: Mutex::new(initial),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Option<NaiveDateTime> {
        *self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn writes(&self) -> Vec<NaiveDateTime> {
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TimestampStore for MemoryTimestampStore {
    async fn load(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        Ok(self.current())
    }

    async fn store(&self, value: NaiveDateTime) -> Result<(), StoreError> {
        *self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(value);
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn ts(value: &str) -> NaiveDateTime {
        parse_timestamp(value).expect("ts")
    }

    /// Serves exactly one request with `response` and hands back the raw request text.
    async fn one_shot_server(response: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if request_complete(&buf) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}/gw/reports/member1.5"), handle)
    }

    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..split]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        buf.len() >= split + 4 + length
    }

    #[tokio::test]
    async fn post_form_returns_body_on_200() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 18\r\nConnection: close\r\n\r\n\"MEMBER_ID\"\n\"123\"\n",
        )
        .await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("memsync-test".into()),
            ..Default::default()
        })
        .expect("client");

        let form = [
            ("account_id", "acct".to_string()),
            ("changed_after", "2024-01-01 00:00:00".to_string()),
        ];
        let resp = fetcher
            .post_form(Uuid::new_v4(), &url, &form)
            .await
            .expect("response");

        assert_eq!(resp.status, StatusCode::OK);
        assert!(resp.body.starts_with("\"MEMBER_ID\"\n\"123\""));
        assert!(resp.header.contains("content-type: text/plain"));

        let request = server.await.expect("server");
        assert!(request.starts_with("POST /gw/reports/member1.5"));
        assert!(request
            .to_ascii_lowercase()
            .contains("content-type: application/x-www-form-urlencoded"));
        assert!(request.contains("account_id=acct&changed_after=2024-01-01+00%3A00%3A00"));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .expect("client");

        let err = fetcher
            .post_form(
                Uuid::new_v4(),
                &format!("http://{addr}/gw/reports/member1.5"),
                &[("account_id", "acct".to_string())],
            )
            .await
            .expect_err("no response must time out");

        assert!(matches!(err, FetchError::Timeout(timeout) if timeout == Duration::from_millis(100)));
        assert_eq!(err.status_code(), None);
        server.abort();
    }

    #[tokio::test]
    async fn non_200_status_is_surfaced_with_header() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 403 Forbidden\r\nX-Reason: bad authorization\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");

        let err = fetcher
            .post_form(Uuid::new_v4(), &url, &[("account_id", "acct".to_string())])
            .await
            .expect_err("403 must fail");
        assert_eq!(err.status_code(), Some(403));
        assert!(err.header().unwrap_or_default().contains("x-reason: bad authorization"));
        server.await.expect("server");
    }

    #[tokio::test]
    async fn file_store_treats_missing_file_as_absent() {
        let dir = tempdir().expect("tempdir");
        let store = FileTimestampStore::new(dir.path().join("gate"));
        assert_eq!(store.load().await.expect("load"), None);
    }

    #[tokio::test]
    async fn file_store_replaces_value_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = FileTimestampStore::new(dir.path().join("nested").join("gate"));

        store.store(ts("2024-01-01 00:10:00")).await.expect("first");
        store.store(ts("2024-01-01 00:20:00")).await.expect("second");

        assert_eq!(
            store.load().await.expect("load"),
            Some(ts("2024-01-01 00:20:00"))
        );
        let leftovers = std::fs::read_dir(dir.path().join("nested"))
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_store_rejects_garbage() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("gate");
        std::fs::write(&path, "1700000000").expect("write");
        let store = FileTimestampStore::new(path);
        assert!(matches!(store.load().await, Err(StoreError::Malformed(_))));
    }

    #[tokio::test]
    async fn memory_store_records_writes_in_order() {
        let store = MemoryTimestampStore::new(None);
        store.store(ts("2024-01-02 00:00:00")).await.expect("store");
        store.store(ts("2024-01-03 00:00:00")).await.expect("store");
        assert_eq!(store.current(), Some(ts("2024-01-03 00:00:00")));
        assert_eq!(store.writes().len(), 2);
    }
}
