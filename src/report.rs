use crate::context::{RunContext, RunCounters};
use crate::downloader::is_partial;
use crate::error::{MirrorError, Result};
use crate::extractor::is_archive;
use crate::human_size::format_size;
use crate::ledger::{self, LedgerAppender, LedgerColumns, LedgerRow, SchemaVerdict};
use crate::libxml2::LibXml2Wrapper;
use crate::marker::MarkerScanner;
use crate::mirror::{MirrorScan, collection_directory};
use chrono::NaiveDate;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{Instrument, debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportStats {
    /// Candidate files seen in the mirror
    pub scanned: usize,
    pub appended: usize,
    pub already_present: usize,
    /// Ledger files, archives, metadata and download temporaries
    pub ignored: usize,
    pub unreadable: usize,
}

/// Facts computed for one mirrored file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFacts {
    pub size: u64,
    pub contains_marker: bool,
    pub parseable: bool,
    pub schema_version: Option<String>,
    pub error_message: Option<String>,
}

/// Collection name and period date from `.../<year>/<month>/<collection>`.
///
/// Two-digit years are taken as 20xx. The date is `None` when either segment
/// is not numeric or out of range.
pub fn project_and_date(directory: &Path) -> (String, Option<NaiveDate>) {
    let parts: Vec<String> = directory
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .filter(|part| !part.is_empty() && part != "/")
        .collect();

    let Some(project) = parts.last().cloned() else {
        return (directory.display().to_string(), None);
    };
    if parts.len() < 3 {
        return (project, None);
    }

    let month = parts[parts.len() - 2].parse::<u32>().ok();
    let year = parts[parts.len() - 3].parse::<i32>().ok();
    let date = match (year, month) {
        (Some(year), Some(month)) => {
            let year = if year < 100 { year + 2000 } else { year };
            NaiveDate::from_ymd_opt(year, month, 1)
        }
        _ => None,
    };
    (project, date)
}

/// Compute the ledger facts of `path`. Blocking; memory stays bounded.
pub fn analyze_file(path: &Path, scanner: &MarkerScanner, schema_name: &str) -> std::io::Result<FileFacts> {
    let size = std::fs::metadata(path)?.len();

    let contains_marker = match scanner.file_contains(path) {
        Ok(found) => found,
        Err(error) => {
            warn!(path = %path.display(), error = %error, "marker scan failed");
            false
        }
    };

    let parse = match LibXml2Wrapper::new().check_well_formed(path) {
        Ok(result) => result,
        Err(error) => Err(error.to_string()),
    };

    let (parseable, schema_version, error_message) = match parse {
        Ok(()) => {
            let version = crate::schema_location::RootElement::read_from(path)
                .ok()
                .flatten()
                .and_then(|root| root.declared_version(schema_name));
            (true, version, None)
        }
        Err(message) => (false, None, Some(message)),
    };

    Ok(FileFacts {
        size,
        contains_marker,
        parseable,
        schema_version,
        error_message,
    })
}

/// Builds and incrementally extends the analysis ledger from the mirror
pub struct ReportBuilder {
    context: RunContext,
    root: PathBuf,
    ledger_path: PathBuf,
    subset_path: PathBuf,
    metadata_file: String,
    columns: LedgerColumns,
    scanner: MarkerScanner,
    schema_name: String,
}

impl ReportBuilder {
    pub fn new(context: RunContext) -> Self {
        let config = context.config();
        Self {
            root: config.mirror.root.clone(),
            ledger_path: config.ledger_path(),
            subset_path: config.subset_path(),
            metadata_file: config.metadata.file_name.clone(),
            columns: LedgerColumns::for_marker(&config.report.marker),
            scanner: MarkerScanner::new(&config.report.marker, config.report.chunk_size),
            schema_name: config.validation.schema_name.clone(),
            context,
        }
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    pub fn subset_path(&self) -> &Path {
        &self.subset_path
    }

    fn is_ignored(&self, path: &Path) -> bool {
        path == self.ledger_path
            || path == self.subset_path
            || is_archive(path)
            || is_partial(path)
            || path
                .file_name()
                .is_some_and(|name| name == self.metadata_file.as_str())
    }

    /// Append a row for every mirrored file not yet in the ledger.
    ///
    /// Each row is flushed before the next file is read, so an interrupted
    /// run loses at most the file in flight.
    pub async fn build_or_update(&self) -> Result<ReportStats> {
        let span = self.context.stage_span("report");
        self.build().instrument(span).await
    }

    async fn build(&self) -> Result<ReportStats> {
        let mut stats = ReportStats::default();
        let mut existing = ledger::load_keys(&self.ledger_path)?;
        info!(path = %self.ledger_path.display(), rows = existing.len(), "loaded existing ledger");

        let files = MirrorScan::new(&self.root).files().await?;
        let mut appender: Option<LedgerAppender> = None;

        for path in files {
            if self.is_ignored(&path) {
                stats.ignored += 1;
                continue;
            }
            stats.scanned += 1;

            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let (project, date) = project_and_date(&collection_directory(&self.root, &path));

            if existing.contains(&(project.clone(), file_name.clone())) {
                debug!(project = %project, file = %file_name, "already in ledger");
                stats.already_present += 1;
                continue;
            }

            info!(path = %path.display(), "analyzing");
            let scanner = self.scanner.clone();
            let schema_name = self.schema_name.clone();
            let target = path.clone();
            let facts = tokio::task::spawn_blocking(move || analyze_file(&target, &scanner, &schema_name))
                .await
                .map_err(|e| MirrorError::Concurrency {
                    details: format!("analysis task failed: {}", e),
                })?;

            let facts = match facts {
                Ok(facts) => facts,
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "cannot read mirrored file");
                    stats.unreadable += 1;
                    continue;
                }
            };

            let row = LedgerRow {
                project,
                date: date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default(),
                file_name,
                file_size: format_size(facts.size),
                contains_marker: facts.contains_marker,
                parseable: facts.parseable,
                schema_version: facts.schema_version.unwrap_or_default(),
                schema_valid: SchemaVerdict::Unknown,
                error_message: facts.error_message.unwrap_or_default(),
            };

            if appender.is_none() {
                appender = Some(LedgerAppender::open(&self.ledger_path, &self.columns)?);
            }
            if let Some(appender) = appender.as_mut() {
                appender.append(&row)?;
            }
            existing.insert(row.key());
            stats.appended += 1;
            RunCounters::bump(&self.context.counters().ledger_rows);
        }

        info!(
            appended = stats.appended,
            already_present = stats.already_present,
            unreadable = stats.unreadable,
            "ledger updated"
        );
        Ok(stats)
    }

    /// Rebuild the subset file from the rows carrying the marker
    pub async fn regenerate_subset(&self) -> Result<usize> {
        if !tokio::fs::try_exists(&self.ledger_path).await? {
            warn!(path = %self.ledger_path.display(), "ledger not found, subset not generated");
            return Ok(0);
        }

        let rows = ledger::read_rows(&self.ledger_path)?;
        let count = ledger::write_subset(
            &self.subset_path,
            &self.columns,
            rows.iter().filter(|row| row.contains_marker),
        )?;
        info!(path = %self.subset_path.display(), rows = count, "subset regenerated");
        Ok(count)
    }
}
