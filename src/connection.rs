use crate::error::{MirrorError, RemoteResult, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

/// Location beneath the configured remote root, one segment per crawl level
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RemotePath {
    segments: Vec<String>,
}

impl RemotePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        segments
            .into_iter()
            .fold(Self::root(), |path, segment| path.child(segment.as_ref()))
    }

    /// Append one listed entry. Servers may answer NLST with `dir/name`; only the
    /// final component is kept so a segment never carries a separator.
    pub fn child(&self, name: &str) -> Self {
        let name = name.trim_end_matches('/');
        let name = name.rsplit('/').next().unwrap_or(name);
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Absolute remote directory string for `CWD`
    pub fn under(&self, remote_root: &str) -> String {
        let root = remote_root.trim_end_matches('/');
        if self.segments.is_empty() {
            return root.to_string();
        }
        format!("{}/{}", root, self.segments.join("/"))
    }

    /// Mirror path beneath the local root
    pub fn local(&self, local_root: &Path) -> PathBuf {
        self.segments
            .iter()
            .fold(local_root.to_path_buf(), |path, segment| path.join(segment))
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

/// One authenticated conversation with the remote host
#[async_trait]
pub trait RemoteSession: Send {
    async fn change_dir(&mut self, path: &str) -> RemoteResult<()>;

    /// Bare entry names of the current directory
    async fn list_names(&mut self) -> RemoteResult<Vec<String>>;

    /// Long-format listing lines of the current directory
    async fn list_detailed(&mut self) -> RemoteResult<Vec<String>>;

    /// Stream `file` from the current directory into `sink`, returning the byte count
    async fn retrieve(
        &mut self,
        file: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RemoteResult<u64>;

    /// Best-effort logout; never fails
    async fn close(&mut self);
}

/// Opens sessions. A single attempt, no retry.
#[async_trait]
pub trait Connector: Send + Sync {
    fn endpoint(&self) -> String;

    async fn open(&self) -> RemoteResult<Box<dyn RemoteSession>>;
}

/// Hands out a fresh session per logical operation, retrying the login itself.
///
/// Sessions are never pooled: the archive silently drops idle connections and a
/// stale pooled session fails in ways indistinguishable from real errors.
#[derive(Clone)]
pub struct ConnectionProvider {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
}

impl ConnectionProvider {
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        Self { connector, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub async fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        let endpoint = self.connector.endpoint();
        let mut backoff = self.policy.backoff();
        let mut attempt = 1;

        loop {
            match self.connector.open().await {
                Ok(session) => {
                    debug!(operation = "connect", target = %endpoint, attempt, "session opened");
                    return Ok(session);
                }
                Err(error) if self.policy.allows(attempt + 1) => {
                    let delay = backoff.next_delay();
                    warn!(
                        operation = "connect",
                        target = %endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    warn!(
                        operation = "connect",
                        target = %endpoint,
                        attempt,
                        error = %error,
                        "giving up on connection"
                    );
                    return Err(MirrorError::Connection {
                        host: endpoint,
                        attempts: attempt,
                        source: error,
                    });
                }
            }
        }
    }
}
