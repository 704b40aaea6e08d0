use crate::connection::{ConnectionProvider, RemotePath};
use crate::context::{RunContext, RunCounters};
use crate::error::{MirrorError, Result};
use crate::leaf_selector::LeafSelector;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, debug, info, warn};

/// Abstract "list children" capability the walk runs over
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    /// Entry names directly beneath `path`
    async fn list_names(&self, path: &RemotePath) -> Result<Vec<String>>;

    /// Long-format listing lines of `path`
    async fn list_detailed(&self, path: &RemotePath) -> Result<Vec<String>>;
}

/// Lists over the network, one fresh session per listing
pub struct SessionDirectoryProvider {
    connections: ConnectionProvider,
    remote_root: String,
}

impl SessionDirectoryProvider {
    pub fn new(connections: ConnectionProvider, remote_root: impl Into<String>) -> Self {
        Self {
            connections,
            remote_root: remote_root.into(),
        }
    }

    async fn list(&self, path: &RemotePath, detailed: bool) -> Result<Vec<String>> {
        let mut session = self.connections.connect().await?;
        let directory = path.under(&self.remote_root);
        let listing = async {
            session.change_dir(&directory).await?;
            if detailed {
                session.list_detailed().await
            } else {
                session.list_names().await
            }
        }
        .await;
        session.close().await;
        Ok(listing?)
    }
}

#[async_trait]
impl DirectoryProvider for SessionDirectoryProvider {
    async fn list_names(&self, path: &RemotePath) -> Result<Vec<String>> {
        self.list(path, false).await
    }

    async fn list_detailed(&self, path: &RemotePath) -> Result<Vec<String>> {
        self.list(path, true).await
    }
}

/// Receives every selected leaf file as the walk reaches it
#[async_trait]
pub trait LeafHandler: Send + Sync {
    async fn handle(&self, file: &RemotePath) -> Result<()>;
}

/// Optional restriction of the walk to one branch per level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlScope {
    pub period: Option<String>,
    pub sub_period: Option<String>,
    pub collection: Option<String>,
}

impl CrawlScope {
    fn admits(filter: &Option<String>, name: &str) -> bool {
        filter.as_deref().is_none_or(|wanted| wanted == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlStats {
    pub periods: usize,
    pub sub_periods: usize,
    pub collections: usize,
    pub selected_files: usize,
    pub handled_files: usize,
    pub failed_files: usize,
    pub empty_listings: usize,
    pub failed_branches: usize,
}

/// The crawl levels beneath the root, in descent order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Periods,
    SubPeriods,
    Collections,
    Leaves,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Periods => "list_periods",
            Stage::SubPeriods => "list_sub_periods",
            Stage::Collections => "list_collections",
            Stage::Leaves => "list_collection_files",
        }
    }
}

/// Four-stage walk: periods, sub-periods, collections, then leaf selection
pub struct RemoteDirectoryCrawler {
    context: RunContext,
    directories: Arc<dyn DirectoryProvider>,
    selector: LeafSelector,
    scope: CrawlScope,
}

impl RemoteDirectoryCrawler {
    pub fn new(
        context: RunContext,
        directories: Arc<dyn DirectoryProvider>,
        selector: LeafSelector,
    ) -> Self {
        Self {
            context,
            directories,
            selector,
            scope: CrawlScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: CrawlScope) -> Self {
        self.scope = scope;
        self
    }

    /// Walk the whole tree, handing selected files to `handler`.
    ///
    /// Only a failure to list the root is returned; deeper failures abort their
    /// own branch and are counted in the stats.
    pub async fn crawl(&self, handler: &dyn LeafHandler) -> Result<CrawlStats> {
        let span = self.context.stage_span("crawl");
        self.walk(handler).instrument(span).await
    }

    async fn walk(&self, handler: &dyn LeafHandler) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();
        let root = RemotePath::root();

        let periods = match self.directories.list_names(&root).await {
            Ok(names) => names,
            Err(error) if is_no_entries(&error) => {
                info!(operation = Stage::Periods.name(), target = %root, "no entries at root");
                return Ok(stats);
            }
            Err(error) => return Err(error),
        };
        RunCounters::bump(&self.context.counters().listings);

        for period in entry_names(&periods) {
            if !CrawlScope::admits(&self.scope.period, period) {
                continue;
            }
            stats.periods += 1;
            let period_path = root.child(period);
            let Some(sub_periods) = self
                .list_stage(Stage::SubPeriods, &period_path, &mut stats)
                .await
            else {
                continue;
            };

            for sub_period in entry_names(&sub_periods) {
                if !CrawlScope::admits(&self.scope.sub_period, sub_period) {
                    continue;
                }
                stats.sub_periods += 1;
                let sub_period_path = period_path.child(sub_period);
                let Some(collections) = self
                    .list_stage(Stage::Collections, &sub_period_path, &mut stats)
                    .await
                else {
                    continue;
                };

                for collection in entry_names(&collections) {
                    if !CrawlScope::admits(&self.scope.collection, collection) {
                        continue;
                    }
                    stats.collections += 1;
                    let collection_path = sub_period_path.child(collection);
                    self.visit_collection(&collection_path, handler, &mut stats)
                        .await;
                }
            }
        }

        info!(
            periods = stats.periods,
            collections = stats.collections,
            selected = stats.selected_files,
            failed_branches = stats.failed_branches,
            "crawl finished"
        );
        Ok(stats)
    }

    async fn visit_collection(
        &self,
        collection: &RemotePath,
        handler: &dyn LeafHandler,
        stats: &mut CrawlStats,
    ) {
        let Some(listing) = self.list_stage(Stage::Leaves, collection, stats).await else {
            return;
        };

        let selected = self.selector.select(&listing);
        if selected.is_empty() {
            debug!(target = %collection, "no matching files in collection");
            return;
        }
        stats.selected_files += selected.len();

        for name in selected {
            let file = collection.child(&name);
            match handler.handle(&file).await {
                Ok(()) => stats.handled_files += 1,
                Err(error) => {
                    stats.failed_files += 1;
                    RunCounters::bump(&self.context.counters().remote_failures);
                    warn!(operation = "fetch", target = %file, error = %error, "file failed");
                }
            }
        }
    }

    /// List one level. `None` means the branch is abandoned; an empty listing
    /// comes back as an empty vector.
    async fn list_stage(
        &self,
        stage: Stage,
        path: &RemotePath,
        stats: &mut CrawlStats,
    ) -> Option<Vec<String>> {
        let result = match stage {
            Stage::Leaves => self.directories.list_detailed(path).await,
            _ => self.directories.list_names(path).await,
        };
        RunCounters::bump(&self.context.counters().listings);

        match result {
            Ok(entries) => Some(entries),
            Err(error) if is_no_entries(&error) => {
                stats.empty_listings += 1;
                RunCounters::bump(&self.context.counters().empty_listings);
                info!(operation = stage.name(), target = %path, "no entries");
                Some(Vec::new())
            }
            Err(error) => {
                stats.failed_branches += 1;
                RunCounters::bump(&self.context.counters().remote_failures);
                warn!(operation = stage.name(), target = %path, error = %error, "listing failed, skipping branch");
                None
            }
        }
    }
}

fn is_no_entries(error: &MirrorError) -> bool {
    matches!(error, MirrorError::Remote(remote) if remote.is_no_entries())
}

/// Bare names as listed, without `.`/`..` or path prefixes
fn entry_names(listing: &[String]) -> impl Iterator<Item = &str> {
    listing
        .iter()
        .map(|entry| entry.trim_end_matches('/'))
        .map(|entry| entry.rsplit('/').next().unwrap_or(entry))
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}
