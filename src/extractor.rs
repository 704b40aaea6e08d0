use crate::context::{RunContext, RunCounters};
use crate::downloader::partial_path;
use crate::error::{MirrorError, Result};
use crate::mirror::MirrorScan;
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{Instrument, debug, error, info, warn};

/// Container formats the extractor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Gzip,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".gz") || name.ends_with(".gzip") {
            Some(ArchiveKind::Gzip)
        } else {
            None
        }
    }
}

pub fn is_archive(path: &Path) -> bool {
    ArchiveKind::detect(path).is_some()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionFailure {
    pub archive: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionReport {
    /// Files written by this run
    pub extracted: Vec<PathBuf>,
    pub failures: Vec<ExtractionFailure>,
    /// Extracted files that do not carry the expected suffix
    pub anomalies: Vec<PathBuf>,
    /// Archives whose output was already present
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum ArchiveOutcome {
    Extracted(Vec<PathBuf>),
    AlreadyExtracted,
}

/// Expands compressed containers in place across the mirror
pub struct ArchiveExtractor {
    context: RunContext,
    root: PathBuf,
    expected_suffix: String,
}

impl ArchiveExtractor {
    pub fn new(context: RunContext, root: impl Into<PathBuf>, expected_suffix: &str) -> Self {
        Self {
            context,
            root: root.into(),
            expected_suffix: expected_suffix.to_lowercase(),
        }
    }

    pub async fn run(&self) -> Result<ExtractionReport> {
        let span = self.context.stage_span("extract");
        self.extract_all().instrument(span).await
    }

    async fn extract_all(&self) -> Result<ExtractionReport> {
        let mut report = ExtractionReport::default();
        let files = MirrorScan::new(&self.root).files().await?;

        for archive in files {
            let Some(kind) = ArchiveKind::detect(&archive) else {
                continue;
            };
            debug!(path = %archive.display(), ?kind, "found archive");

            let path = archive.clone();
            let outcome = tokio::task::spawn_blocking(move || match kind {
                ArchiveKind::Zip => extract_zip(&path),
                ArchiveKind::Gzip => extract_gzip(&path),
            })
            .await
            .map_err(|e| MirrorError::Concurrency {
                details: format!("extraction task failed: {}", e),
            })?;

            match outcome {
                Ok(ArchiveOutcome::Extracted(paths)) => {
                    info!(path = %archive.display(), files = paths.len(), "extracted");
                    for path in paths {
                        RunCounters::bump(&self.context.counters().extractions);
                        if !self.has_expected_suffix(&path) {
                            report.anomalies.push(path.clone());
                        }
                        report.extracted.push(path);
                    }
                }
                Ok(ArchiveOutcome::AlreadyExtracted) => {
                    debug!(path = %archive.display(), "already extracted");
                    report.skipped.push(archive);
                }
                Err(reason) => {
                    error!(operation = "extract", path = %archive.display(), error = %reason, "extraction failed");
                    report.failures.push(ExtractionFailure { archive, reason });
                }
            }
        }

        for anomaly in &report.anomalies {
            warn!(path = %anomaly.display(), expected = %self.expected_suffix, "extracted file has unexpected type");
        }
        info!(
            extracted = report.extracted.len(),
            failures = report.failures.len(),
            anomalies = report.anomalies.len(),
            skipped = report.skipped.len(),
            "extraction finished"
        );
        Ok(report)
    }

    fn has_expected_suffix(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.to_lowercase().ends_with(&self.expected_suffix))
    }
}

/// Copy `reader` into `target` through a temporary that is renamed on success
fn write_through_partial<R: io::Read>(reader: &mut R, target: &Path) -> io::Result<()> {
    let temp = partial_path(target);
    let result = (|| {
        let mut out = File::create(&temp)?;
        io::copy(reader, &mut out)?;
        out.sync_all()?;
        fs::rename(&temp, target)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Verify every member's checksum, then extract next to the archive
fn extract_zip(path: &Path) -> std::result::Result<ArchiveOutcome, String> {
    let directory = path.parent().unwrap_or(Path::new("."));
    let file = File::open(path).map_err(|e| format!("cannot open: {}", e))?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| format!("bad zip file: {}", e))?;

    // Integrity pass: reading each member to the end checks its CRC
    let mut members = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|e| format!("bad zip member #{}: {}", index, e))?;
        let name = member.name().to_string();
        let relative = member
            .enclosed_name()
            .ok_or_else(|| format!("unsafe member path: {}", name))?;
        if !member.is_dir() {
            io::copy(&mut member, &mut io::sink())
                .map_err(|e| format!("zip file is corrupted at {}: {}", name, e))?;
        }
        members.push((index, directory.join(relative), member.is_dir()));
    }

    let files: Vec<&(usize, PathBuf, bool)> =
        members.iter().filter(|(_, _, is_dir)| !is_dir).collect();
    if !files.is_empty() && files.iter().all(|(_, target, _)| target.exists()) {
        return Ok(ArchiveOutcome::AlreadyExtracted);
    }

    let mut extracted = Vec::new();
    for (index, target, is_dir) in &members {
        if *is_dir {
            fs::create_dir_all(target).map_err(|e| format!("cannot create {}: {}", target.display(), e))?;
            continue;
        }
        if target.exists() {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
        }
        let mut member = archive
            .by_index(*index)
            .map_err(|e| format!("bad zip member #{}: {}", index, e))?;
        write_through_partial(&mut member, target)
            .map_err(|e| format!("cannot extract {}: {}", target.display(), e))?;
        extracted.push(target.clone());
    }

    Ok(ArchiveOutcome::Extracted(extracted))
}

/// Decompress `x.gz` / `x.gzip` to `x`
fn extract_gzip(path: &Path) -> std::result::Result<ArchiveOutcome, String> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| "archive name is not valid UTF-8".to_string())?;
    let suffix_len = if name.to_lowercase().ends_with(".gzip") { 5 } else { 3 };
    let stem = &name[..name.len() - suffix_len];
    if stem.is_empty() {
        return Err("archive name has no stem".to_string());
    }
    let output = path.with_file_name(stem);

    if output.exists() {
        return Ok(ArchiveOutcome::AlreadyExtracted);
    }

    let file = File::open(path).map_err(|e| format!("cannot open: {}", e))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    write_through_partial(&mut decoder, &output).map_err(|e| format!("bad gzip file: {}", e))?;

    Ok(ArchiveOutcome::Extracted(vec![output]))
}
