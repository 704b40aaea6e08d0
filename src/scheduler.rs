use crate::context::{RunContext, RunCounters};
use crate::error::{MirrorError, Result};
use crate::ledger::{LedgerColumns, LedgerKey, LedgerRow, PersistedLedger, SchemaVerdict};
use crate::mirror::{MirrorScan, collection_directory};
use crate::worker::{SchemaValidator, ValidationOutcome, ValidationReport, looks_like_exhaustion};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{Instrument, debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Rows passing the filter
    pub considered: usize,
    pub validated: usize,
    pub valid: usize,
    pub invalid: usize,
    pub timed_out: usize,
    pub exhausted: usize,
    pub skipped_unparseable: usize,
    pub skipped_terminal: usize,
    pub missing_files: usize,
    /// Stopped early after a resource exhaustion
    pub halted: bool,
}

impl SchedulerStats {
    fn record(&mut self, verdict: SchemaVerdict) {
        self.validated += 1;
        match verdict {
            SchemaVerdict::Valid => self.valid += 1,
            SchemaVerdict::Invalid => self.invalid += 1,
            SchemaVerdict::TimedOut => self.timed_out += 1,
            SchemaVerdict::OutOfMemory => self.exhausted += 1,
            SchemaVerdict::Unknown => {}
        }
    }
}

/// (collection, file name) to mirrored path, built from one scan
pub type FileIndex = HashMap<LedgerKey, PathBuf>;

pub async fn build_file_index(root: &Path) -> Result<FileIndex> {
    let mut index = FileIndex::new();
    for path in MirrorScan::new(root).files().await? {
        let project = collection_directory(root, &path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let file_name = path.file_name().map(|name| name.to_string_lossy().into_owned());
        if let (Some(project), Some(file_name)) = (project, file_name) {
            index.entry((project, file_name)).or_insert(path);
        }
    }
    Ok(index)
}

/// Write the validator's answer into `row`. Returns true when the answer
/// signals resource exhaustion.
pub fn apply_report(row: &mut LedgerRow, report: ValidationReport, timeout: Duration) -> bool {
    if let Some(version) = report.schema_version {
        row.schema_version = version;
    }

    let (verdict, message) = match report.outcome {
        ValidationOutcome::Valid => (SchemaVerdict::Valid, String::new()),
        ValidationOutcome::Invalid(messages) => (SchemaVerdict::Invalid, messages.join("; ")),
        ValidationOutcome::UnsupportedSchema(message) => (SchemaVerdict::Invalid, message),
        ValidationOutcome::Timeout => (
            SchemaVerdict::TimedOut,
            format!("Validation timed out after {}s", timeout.as_secs()),
        ),
        ValidationOutcome::ResourceExhausted(details) => {
            (SchemaVerdict::OutOfMemory, format!("Subprocess killed: {}", details))
        }
        ValidationOutcome::Error(message) if looks_like_exhaustion(&message) => {
            (SchemaVerdict::OutOfMemory, format!("Memory/process error: {}", message))
        }
        ValidationOutcome::Error(message) => {
            (SchemaVerdict::Invalid, format!("Schema validation error: {}", message))
        }
    };

    row.schema_valid = verdict;
    row.error_message = message;
    verdict == SchemaVerdict::OutOfMemory
}

/// Drives the validator over ledger rows, smallest file first
pub struct ValidationScheduler {
    context: RunContext,
    validator: Arc<dyn SchemaValidator>,
    root: PathBuf,
    columns: LedgerColumns,
    timeout: Duration,
    halt_on_exhaustion: bool,
    retry_exhausted: bool,
    index: OnceCell<FileIndex>,
}

impl ValidationScheduler {
    pub fn new(context: RunContext, validator: Arc<dyn SchemaValidator>) -> Self {
        let config = context.config();
        Self {
            root: config.mirror.root.clone(),
            columns: LedgerColumns::for_marker(&config.report.marker),
            timeout: config.validation_timeout(),
            halt_on_exhaustion: config.validation.halt_on_exhaustion,
            retry_exhausted: config.validation.retry_exhausted,
            index: OnceCell::new(),
            validator,
            context,
        }
    }

    async fn file_index(&self) -> Result<&FileIndex> {
        self.index
            .get_or_try_init(|| async {
                let index = build_file_index(&self.root).await?;
                info!(files = index.len(), "indexed mirror for validation");
                Ok::<_, MirrorError>(index)
            })
            .await
    }

    /// Validate the rows of `ledger_path` accepted by `filter`, persisting the
    /// ledger after every row.
    pub async fn run<F>(&self, ledger_path: &Path, filter: F) -> Result<SchedulerStats>
    where
        F: Fn(&LedgerRow) -> bool,
    {
        let span = self.context.stage_span("validate");
        self.run_inner(ledger_path, &filter).instrument(span).await
    }

    async fn run_inner(&self, ledger_path: &Path, filter: &dyn Fn(&LedgerRow) -> bool) -> Result<SchedulerStats> {
        let mut stats = SchedulerStats::default();
        if !tokio::fs::try_exists(ledger_path).await? {
            warn!(path = %ledger_path.display(), "ledger not found, nothing to validate");
            return Ok(stats);
        }

        let mut ledger = PersistedLedger::load(ledger_path, &self.columns)?;
        let mut order: Vec<usize> = (0..ledger.len())
            .filter(|&index| filter(&ledger.rows()[index]))
            .collect();
        // Unparseable sizes sort last; ties keep ledger order
        order.sort_by_key(|&index| {
            let size = ledger.rows()[index].size_bytes();
            (size.is_none(), size.unwrap_or(0))
        });
        stats.considered = order.len();
        info!(path = %ledger_path.display(), rows = order.len(), "validating schemas");

        let index = self.file_index().await?;
        let total = order.len();

        for (position, row_index) in order.into_iter().enumerate() {
            let mut row = ledger.rows()[row_index].clone();
            if !row.parseable {
                stats.skipped_unparseable += 1;
                continue;
            }
            if row.schema_valid.is_terminal(self.retry_exhausted) {
                debug!(file = %row.file_name, "already validated");
                stats.skipped_terminal += 1;
                continue;
            }
            let Some(path) = index.get(&row.key()) else {
                warn!(project = %row.project, file = %row.file_name, "mirrored file not found");
                stats.missing_files += 1;
                continue;
            };

            info!(
                operation = "validate",
                progress = %format!("{}/{}", position + 1, total),
                path = %path.display(),
                "validating schema"
            );
            let report = self.validator.validate(path, self.timeout).await?;
            let exhausted = apply_report(&mut row, report, self.timeout);
            let verdict = row.schema_valid;
            ledger.update(row_index, row)?;
            stats.record(verdict);
            RunCounters::bump(&self.context.counters().validations);

            if exhausted && self.halt_on_exhaustion {
                error!(
                    path = %path.display(),
                    "validator ran out of resources, stopping: larger files are likely to fail the same way"
                );
                stats.halted = true;
                break;
            }
        }

        info!(
            validated = stats.validated,
            valid = stats.valid,
            invalid = stats.invalid,
            halted = stats.halted,
            "schema validation finished"
        );
        Ok(stats)
    }
}
