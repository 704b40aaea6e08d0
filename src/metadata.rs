use crate::config::MetadataConfig;
use crate::context::RunContext;
use crate::downloader::partial_path;
use crate::error::{MirrorError, Result};
use crate::mirror::MirrorScan;
use crate::retry::RetryPolicy;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, warn};

/// Cap for the doubling delay between metadata retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Client for the archive's project metadata API
pub struct ArchiveApiClient {
    client: Client,
    api_base: String,
    policy: RetryPolicy,
}

impl ArchiveApiClient {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(format!("mzid-mirror/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            policy: RetryPolicy::new(
                config.retry_attempts,
                Duration::from_millis(config.retry_delay_ms),
                MAX_RETRY_DELAY,
            ),
        })
    }

    pub fn url_for(&self, accession: &str) -> String {
        format!("{}{}", self.api_base, accession)
    }

    /// Metadata for `accession`; `None` when the API does not know it
    pub async fn fetch(&self, accession: &str) -> Result<Option<serde_json::Value>> {
        let url = self.url_for(accession);
        let mut backoff = self.policy.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(Some(response.json().await?));
                }
                Ok(response) if response.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(response) => {
                    let retryable = response.status().is_server_error();
                    let error = status_error(&url, &response);
                    if !retryable {
                        return Err(error);
                    }
                    error
                }
                Err(error) if is_retryable(&error) => MirrorError::Http(error),
                Err(error) => return Err(error.into()),
            };

            if !self.policy.allows(attempt + 1) {
                return Err(error);
            }
            let delay = backoff.wait().await;
            warn!(
                operation = "metadata",
                target = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "metadata request failed, retrying"
            );
        }
    }
}

fn status_error(url: &str, response: &Response) -> MirrorError {
    MirrorError::HttpStatus {
        url: url.to_string(),
        status: response.status().as_u16(),
    }
}

/// Network failures worth another attempt; malformed URLs and bodies are not
fn is_retryable(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetadataStats {
    /// Collection directories in the mirror
    pub found: usize,
    pub fetched: usize,
    /// Collections that already had a metadata file
    pub skipped: usize,
    pub not_found: usize,
    pub failed: usize,
}

/// Stores the archive's metadata next to each mirrored collection
pub struct MetadataCollector {
    context: RunContext,
    client: ArchiveApiClient,
    root: PathBuf,
    file_name: String,
    accession_prefix: String,
    request_interval: Duration,
}

impl MetadataCollector {
    pub fn new(context: RunContext) -> Result<Self> {
        let config = &context.config().metadata;
        let client = ArchiveApiClient::new(config)?;
        Ok(Self {
            root: context.config().mirror.root.clone(),
            file_name: config.file_name.clone(),
            accession_prefix: config.accession_prefix.clone(),
            request_interval: Duration::from_millis(config.request_interval_ms),
            client,
            context,
        })
    }

    pub async fn run(&self) -> Result<MetadataStats> {
        let span = self.context.stage_span("metadata");
        self.collect().instrument(span).await
    }

    async fn collect(&self) -> Result<MetadataStats> {
        let mut stats = MetadataStats::default();

        for directory in MirrorScan::new(&self.root).directories().await? {
            let Some(accession) = directory
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .filter(|name| name.starts_with(&self.accession_prefix))
            else {
                continue;
            };
            stats.found += 1;

            let target = directory.join(&self.file_name);
            if tokio::fs::try_exists(&target).await? {
                debug!(collection = %accession, "metadata already present");
                stats.skipped += 1;
                continue;
            }

            sleep(self.request_interval).await;
            match self.client.fetch(&accession).await {
                Ok(Some(metadata)) => {
                    write_json(&target, &metadata).await?;
                    info!(collection = %accession, path = %target.display(), "metadata saved");
                    stats.fetched += 1;
                }
                Ok(None) => {
                    warn!(collection = %accession, "collection not found in archive API");
                    stats.not_found += 1;
                }
                Err(error) => {
                    error!(
                        operation = "metadata",
                        target = %self.client.url_for(&accession),
                        error = %error,
                        "metadata fetch failed"
                    );
                    stats.failed += 1;
                }
            }
        }

        info!(
            found = stats.found,
            fetched = stats.fetched,
            skipped = stats.skipped,
            not_found = stats.not_found,
            failed = stats.failed,
            "metadata collection finished"
        );
        Ok(stats)
    }
}

/// Pretty-printed JSON written through a temporary and renamed into place
async fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let temp = partial_path(path);
    let content = serde_json::to_vec_pretty(value)?;
    let written = async {
        tokio::fs::write(&temp, &content).await?;
        tokio::fs::rename(&temp, path).await
    }
    .await;
    if let Err(error) = written {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(error.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_base_and_accession() {
        let client = ArchiveApiClient::new(&MetadataConfig::default()).unwrap();
        assert_eq!(
            client.url_for("PXD000001"),
            "https://www.ebi.ac.uk/pride/ws/archive/v2/projects/PXD000001"
        );
    }

    #[tokio::test]
    async fn test_write_json_leaves_no_temporary() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("pride_metadata.json");
        write_json(&target, &serde_json::json!({"accession": "PXD1"}))
            .await
            .unwrap();

        let text = std::fs::read_to_string(&target).unwrap();
        assert!(text.contains("\"accession\": \"PXD1\""));
        assert!(!partial_path(&target).exists());
    }
}
