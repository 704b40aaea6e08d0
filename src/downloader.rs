use crate::connection::{ConnectionProvider, RemotePath};
use crate::context::{RunContext, RunCounters};
use crate::crawler::LeafHandler;
use crate::error::{MirrorError, RemoteError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of in-flight temporaries; a file carrying it is never a finished mirror entry
pub const PARTIAL_SUFFIX: &str = ".part";

/// Sibling temporary that `path` is written through
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Local target already present; nothing was requested
    Skipped,
    Downloaded { bytes: u64, attempts: u32 },
}

/// Mirrors single remote files with retry and no-partial-file guarantees
pub struct ResilientDownloader {
    context: RunContext,
    connections: ConnectionProvider,
    policy: RetryPolicy,
    remote_root: String,
    local_root: PathBuf,
}

impl ResilientDownloader {
    pub fn new(
        context: RunContext,
        connections: ConnectionProvider,
        policy: RetryPolicy,
        remote_root: impl Into<String>,
        local_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            context,
            connections,
            policy,
            remote_root: remote_root.into(),
            local_root: local_root.into(),
        }
    }

    pub fn local_path(&self, remote: &RemotePath) -> PathBuf {
        remote.local(&self.local_root)
    }

    /// Fetch `remote` to `local`.
    ///
    /// On return the target is either complete or absent. An existing target is
    /// left alone without touching the network.
    pub async fn fetch(&self, remote: &RemotePath, local: &Path) -> Result<FetchOutcome> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(local).await? {
            debug!(operation = "fetch", target = %remote, path = %local.display(), "already mirrored");
            return Ok(FetchOutcome::Skipped);
        }

        let name = remote.file_name().ok_or_else(|| {
            MirrorError::Remote(RemoteError::Protocol {
                target: remote.to_string(),
                details: "remote path has no file name".to_string(),
            })
        })?;
        let directory = remote.parent().under(&self.remote_root);
        let temp = partial_path(local);
        let mut backoff = self.policy.backoff();
        let mut attempt = 1;

        loop {
            let result = self.attempt(&directory, name, &temp).await;
            let error = match result {
                Ok(bytes) => match tokio::fs::rename(&temp, local).await {
                    Ok(()) => {
                        info!(operation = "fetch", target = %remote, bytes, attempt, "downloaded");
                        return Ok(FetchOutcome::Downloaded {
                            bytes,
                            attempts: attempt,
                        });
                    }
                    Err(error) => {
                        remove_partial(&temp).await;
                        return Err(error.into());
                    }
                },
                Err(error) => error,
            };

            remove_partial(&temp).await;

            if !is_retryable(&error) {
                warn!(operation = "fetch", target = %remote, attempt, error = %error, "permanent failure");
                return Err(error);
            }
            if !self.policy.allows(attempt + 1) {
                warn!(operation = "fetch", target = %remote, attempt, error = %error, "retries exhausted");
                return Err(error);
            }

            let delay = backoff.next_delay();
            warn!(
                operation = "fetch",
                target = %remote,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One session: connect, change directory, stream into `temp`, close
    async fn attempt(&self, directory: &str, name: &str, temp: &Path) -> Result<u64> {
        let mut session = self.connections.connect().await?;

        let transfer = async {
            session.change_dir(directory).await?;
            let mut file =
                tokio::fs::File::create(temp)
                    .await
                    .map_err(|source| RemoteError::LocalIo {
                        path: temp.to_path_buf(),
                        source,
                    })?;
            let bytes = session.retrieve(name, &mut file).await?;
            file.sync_all().await.map_err(|source| RemoteError::LocalIo {
                path: temp.to_path_buf(),
                source,
            })?;
            Ok::<u64, RemoteError>(bytes)
        }
        .await;

        session.close().await;

        transfer.map_err(|error| match error {
            RemoteError::LocalIo { source, .. } => MirrorError::Remote(RemoteError::LocalIo {
                path: temp.to_path_buf(),
                source,
            }),
            other => MirrorError::Remote(other),
        })
    }
}

/// Connection exhaustion was already retried by the provider
fn is_retryable(error: &MirrorError) -> bool {
    match error {
        MirrorError::Remote(remote) => remote.is_transient(),
        _ => false,
    }
}

async fn remove_partial(temp: &Path) {
    match tokio::fs::remove_file(temp).await {
        Ok(()) => debug!(path = %temp.display(), "removed partial download"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %temp.display(), error = %error, "could not remove partial download"),
    }
}

#[async_trait]
impl LeafHandler for ResilientDownloader {
    async fn handle(&self, file: &RemotePath) -> Result<()> {
        let local = self.local_path(file);
        match self.fetch(file, &local).await? {
            FetchOutcome::Skipped => RunCounters::bump(&self.context.counters().download_skips),
            FetchOutcome::Downloaded { .. } => RunCounters::bump(&self.context.counters().downloads),
        }
        Ok(())
    }
}
