use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use mzid_mirror::connection::{Connector, RemotePath, RemoteSession};
use mzid_mirror::crawler::{DirectoryProvider, LeafHandler};
use mzid_mirror::error::{MirrorError, RemoteError, RemoteResult, Result};
use mzid_mirror::worker::{SchemaValidator, ValidationOutcome, ValidationReport};

/// Failure injected into the next retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Send this many bytes, then reset the connection
    DropAfter(usize),
    /// Refuse the transfer with this FTP reply code
    Reply(u16),
}

#[derive(Default)]
struct ArchiveState {
    directories: HashMap<String, Vec<String>>,
    files: HashMap<String, Vec<u8>>,
    faults: VecDeque<Fault>,
    connect_failures: u32,
    opens: u32,
    retrievals: u32,
    closes: u32,
}

/// In-memory remote archive handing out scripted sessions
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ArchiveState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `content` as `directory/name`, listing it in `directory`
    pub fn with_file(self, directory: &str, name: &str, content: &[u8]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state
                .directories
                .entry(directory.to_string())
                .or_default()
                .push(format!("-rw-r--r--    1 ftp      ftp      {:>8} Jan 01  2024 {}", content.len(), name));
            state.files.insert(format!("{}/{}", directory, name), content.to_vec());
        }
        self
    }

    /// List subdirectory `name` inside `parent`
    pub fn with_directory(self, parent: &str, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .directories
            .entry(parent.to_string())
            .or_default()
            .push(format!("drwxr-xr-x    2 ftp      ftp          4096 Jan 01  2024 {}", name));
        self
    }

    pub fn with_fault(self, fault: Fault) -> Self {
        self.state.lock().unwrap().faults.push_back(fault);
        self
    }

    pub fn with_connect_failures(self, failures: u32) -> Self {
        self.state.lock().unwrap().connect_failures = failures;
        self
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().unwrap().opens
    }

    pub fn retrievals(&self) -> u32 {
        self.state.lock().unwrap().retrievals
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn endpoint(&self) -> String {
        "fake.archive:21".to_string()
    }

    async fn open(&self) -> RemoteResult<Box<dyn RemoteSession>> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RemoteError::Connection {
                target: self.endpoint(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
            cwd: String::new(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<ArchiveState>>,
    cwd: String,
}

impl FakeSession {
    fn listing(&self) -> RemoteResult<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .directories
            .get(&self.cwd)
            .cloned()
            .ok_or_else(|| RemoteError::NoEntries {
                target: self.cwd.clone(),
            })
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn change_dir(&mut self, path: &str) -> RemoteResult<()> {
        self.cwd = path.to_string();
        Ok(())
    }

    async fn list_names(&mut self) -> RemoteResult<Vec<String>> {
        Ok(self
            .listing()?
            .iter()
            .filter_map(|line| line.rsplit(' ').next().map(str::to_string))
            .collect())
    }

    async fn list_detailed(&mut self) -> RemoteResult<Vec<String>> {
        self.listing()
    }

    async fn retrieve(
        &mut self,
        file: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RemoteResult<u64> {
        let target = format!("{}/{}", self.cwd, file);
        let (content, fault) = {
            let mut state = self.state.lock().unwrap();
            state.retrievals += 1;
            let fault = state.faults.pop_front();
            (state.files.get(&target).cloned(), fault)
        };

        let Some(content) = content else {
            return Err(RemoteError::Reply {
                target,
                code: 550,
                message: "No such file or directory".to_string(),
            });
        };
        let write_error = |source| RemoteError::LocalIo {
            path: Path::new(file).to_path_buf(),
            source,
        };

        match fault {
            Some(Fault::Reply(code)) => Err(RemoteError::Reply {
                target,
                code,
                message: "scripted failure".to_string(),
            }),
            Some(Fault::DropAfter(bytes)) => {
                sink.write_all(&content[..bytes.min(content.len())])
                    .await
                    .map_err(write_error)?;
                sink.flush().await.map_err(write_error)?;
                Err(RemoteError::Connection {
                    target,
                    source: io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"),
                })
            }
            None => {
                sink.write_all(&content).await.map_err(write_error)?;
                sink.flush().await.map_err(write_error)?;
                Ok(content.len() as u64)
            }
        }
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}

/// Directory tree for exercising the walk without any session
#[derive(Default)]
pub struct FakeDirectoryProvider {
    names: HashMap<String, Vec<String>>,
    detailed: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeDirectoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(mut self, path: &str, entries: &[&str]) -> Self {
        self.names
            .insert(path.to_string(), entries.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn with_leaf(mut self, path: &str, lines: &[&str]) -> Self {
        self.detailed
            .insert(path.to_string(), lines.iter().map(|l| l.to_string()).collect());
        self
    }

    /// Listing `path` fails with a connection error
    pub fn with_failure(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn lookup(&self, map: &HashMap<String, Vec<String>>, path: &RemotePath) -> Result<Vec<String>> {
        let key = path.to_string();
        self.calls.lock().unwrap().push(key.clone());
        if self.failing.contains(&key) {
            return Err(MirrorError::Remote(RemoteError::Connection {
                target: key,
                source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
            }));
        }
        map.get(&key)
            .cloned()
            .ok_or(MirrorError::Remote(RemoteError::NoEntries { target: key }))
    }
}

#[async_trait]
impl DirectoryProvider for FakeDirectoryProvider {
    async fn list_names(&self, path: &RemotePath) -> Result<Vec<String>> {
        self.lookup(&self.names, path)
    }

    async fn list_detailed(&self, path: &RemotePath) -> Result<Vec<String>> {
        self.lookup(&self.detailed, path)
    }
}

/// Records every leaf handed to it; names in `failing` return an error
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<String>>,
    failing: HashSet<String>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeafHandler for RecordingHandler {
    async fn handle(&self, file: &RemotePath) -> Result<()> {
        self.seen.lock().unwrap().push(file.to_string());
        if file.file_name().is_some_and(|name| self.failing.contains(name)) {
            return Err(MirrorError::Remote(RemoteError::Reply {
                target: file.to_string(),
                code: 550,
                message: "Permission denied".to_string(),
            }));
        }
        Ok(())
    }
}

/// Answers from a table keyed by file name and records the call order
#[derive(Default)]
pub struct FakeValidator {
    outcomes: HashMap<String, ValidationOutcome>,
    calls: Mutex<Vec<String>>,
}

impl FakeValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, file_name: &str, outcome: ValidationOutcome) -> Self {
        self.outcomes.insert(file_name.to_string(), outcome);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaValidator for FakeValidator {
    async fn validate(&self, file: &Path, _timeout: Duration) -> Result<ValidationReport> {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(name.clone());
        Ok(ValidationReport {
            schema_version: Some("1.2.0".to_string()),
            outcome: self.outcomes.get(&name).cloned().unwrap_or(ValidationOutcome::Valid),
        })
    }
}
