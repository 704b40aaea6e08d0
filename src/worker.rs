//! Schema validation in a short-lived worker process.
//!
//! libxml2 keeps memory proportional to the documents it has seen, so each
//! validation runs in a fresh `validate-worker` child that exits afterwards.
//! The parent enforces the timeout and reaps the exit status to tell a clean
//! answer from an abnormal death.

use crate::error::{MirrorError, Result};
use crate::libxml2::{LibXml2Wrapper, ValidationResult};
use crate::schema_location::{RootElement, schema_file_name, version_from_schema_file};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Violations kept per invalid document
pub const MAX_REPORTED_ERRORS: usize = 20;

/// Hidden subcommand the parent invokes
pub const WORKER_SUBCOMMAND: &str = "validate-worker";

/// Result of one validation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Valid,
    /// Messages describing why the document failed
    Invalid(Vec<String>),
    /// Declared schema file is not in the schema directory
    UnsupportedSchema(String),
    Timeout,
    /// Worker died before answering
    ResourceExhausted(String),
    Error(String),
}

/// What the worker prints on stdout, as one JSON line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub schema_version: Option<String>,
    pub outcome: ValidationOutcome,
}

impl ValidationReport {
    fn new(schema_version: Option<String>, outcome: ValidationOutcome) -> Self {
        Self {
            schema_version,
            outcome,
        }
    }
}

#[async_trait]
pub trait SchemaValidator: Send + Sync {
    /// Validate one file. `Err` is reserved for failures of the validation
    /// machinery itself; document problems are outcomes.
    async fn validate(&self, file: &Path, timeout: Duration) -> Result<ValidationReport>;
}

/// Messages that indicate the process ran out of memory or was killed
pub fn looks_like_exhaustion(message: &str) -> bool {
    const SIGNATURES: [&str; 6] = ["kill", "memory", "oom", "signal 9", "cannot allocate", "worker"];
    let message = message.to_lowercase();
    SIGNATURES.iter().any(|signature| message.contains(signature))
}

/// Program and leading arguments that start a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, leading_args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            leading_args: leading_args.into_iter().map(Into::into).collect(),
        }
    }

    /// This executable's own `validate-worker` subcommand
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, [WORKER_SUBCOMMAND]))
    }
}

/// Runs every validation in its own child process
#[derive(Debug, Clone)]
pub struct ProcessValidator {
    command: WorkerCommand,
    schema_dir: PathBuf,
    schema_name: String,
}

impl ProcessValidator {
    pub fn new(command: WorkerCommand, schema_dir: impl Into<PathBuf>, schema_name: impl Into<String>) -> Self {
        Self {
            command,
            schema_dir: schema_dir.into(),
            schema_name: schema_name.into(),
        }
    }

    fn build_command(&self, file: &Path) -> Command {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.leading_args)
            .arg("--schema-dir")
            .arg(&self.schema_dir)
            .arg("--schema-name")
            .arg(&self.schema_name)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("worker exited with status {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("worker killed by signal {}", signal);
        }
    }
    "worker terminated abnormally".to_string()
}

/// Last non-empty stdout line decoded as a report
fn parse_report(stdout: &[u8]) -> Option<ValidationReport> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str(line).ok())
}

#[async_trait]
impl SchemaValidator for ProcessValidator {
    async fn validate(&self, file: &Path, timeout: Duration) -> Result<ValidationReport> {
        let mut child = self.build_command(file).spawn().map_err(|error| MirrorError::Worker {
            details: format!(
                "cannot start worker {}: {}",
                self.command.program.display(),
                error
            ),
        })?;
        debug!(path = %file.display(), pid = ?child.id(), "worker started");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let finished = tokio::time::timeout(timeout, async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let read_out = async {
                match stdout.as_mut() {
                    Some(pipe) => pipe.read_to_end(&mut out).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let read_err = async {
                match stderr.as_mut() {
                    Some(pipe) => pipe.read_to_end(&mut err).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let (read_out, read_err) = tokio::join!(read_out, read_err);
            let status = child.wait().await;
            (read_out.and(read_err), status, out, err)
        })
        .await;

        let (reads, status, out, err) = match finished {
            Ok(finished) => finished,
            Err(_) => {
                warn!(path = %file.display(), timeout_secs = timeout.as_secs(), "worker timed out, terminating");
                if let Err(error) = child.kill().await {
                    warn!(error = %error, "failed to terminate worker");
                }
                return Ok(ValidationReport::new(None, ValidationOutcome::Timeout));
            }
        };

        let status = status?;
        let stderr_tail = String::from_utf8_lossy(&err)
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(str::to_string);

        if !status.success() {
            let mut details = describe_exit(&status);
            if let Some(tail) = stderr_tail {
                details = format!("{}: {}", details, tail);
            }
            warn!(path = %file.display(), details = %details, "worker terminated abnormally");
            return Ok(ValidationReport::new(None, ValidationOutcome::ResourceExhausted(details)));
        }

        match (reads, parse_report(&out)) {
            (Ok(()), Some(report)) => Ok(report),
            (reads, _) => {
                let details = match reads {
                    Err(error) => format!("worker channel broken: {}", error),
                    Ok(()) => "worker sent no response".to_string(),
                };
                warn!(path = %file.display(), details = %details, "worker terminated abnormally");
                Ok(ValidationReport::new(None, ValidationOutcome::ResourceExhausted(details)))
            }
        }
    }
}

/// The worker side: validate `file` against its declared schema from `schema_dir`.
///
/// Only the root element is read to find the schema; the whole document is
/// parsed only once the schema is known to be supported.
pub fn run_worker(schema_dir: &Path, schema_name: &str, file: &Path) -> ValidationReport {
    let root = match RootElement::read_from(file) {
        Ok(Some(root)) => root,
        Ok(None) => {
            return ValidationReport::new(None, ValidationOutcome::Error("No root element found".to_string()));
        }
        Err(error) => {
            return ValidationReport::new(None, ValidationOutcome::Error(format!("Cannot read document: {}", error)));
        }
    };

    let location = match root.schema_location() {
        Ok(location) => location,
        Err(error) => {
            return ValidationReport::new(None, ValidationOutcome::Invalid(vec![error.to_string()]));
        }
    };

    let schema_file = schema_file_name(&location);
    let version = version_from_schema_file(schema_file, schema_name).map(str::to_string);
    let schema_path = schema_dir.join(schema_file);
    if version.is_none() || !schema_path.is_file() {
        return ValidationReport::new(
            version,
            ValidationOutcome::UnsupportedSchema(format!("Unsupported schema: {}", schema_file)),
        );
    }

    let wrapper = LibXml2Wrapper::new();
    let schema = match wrapper.parse_schema_file(&schema_path) {
        Ok(schema) => schema,
        Err(error) => return ValidationReport::new(version, ValidationOutcome::Error(error.to_string())),
    };
    let document = match wrapper.parse_document(file) {
        Ok(document) => document,
        Err(error) => return ValidationReport::new(version, ValidationOutcome::Error(error.to_string())),
    };

    let outcome = match wrapper.validate_document(&schema, &document, MAX_REPORTED_ERRORS) {
        Ok(ValidationResult::Valid) => ValidationOutcome::Valid,
        Ok(ValidationResult::Invalid { errors, .. }) => {
            let mut messages = Vec::with_capacity(errors.len() + 1);
            messages.push(format!("XML is invalid. First {} errors:", MAX_REPORTED_ERRORS));
            messages.extend(errors.iter().map(ToString::to_string));
            ValidationOutcome::Invalid(messages)
        }
        Ok(ValidationResult::InternalError { code }) => {
            ValidationOutcome::Error(format!("libxml2 internal error {}", code))
        }
        Err(error) => ValidationOutcome::Error(error.to_string()),
    };
    ValidationReport::new(version, outcome)
}
