use std::path::{Path, PathBuf};

use mzid_mirror::config::{Config, RetryConfig};
use mzid_mirror::context::RunContext;
use mzid_mirror::ledger::{LedgerRow, SchemaVerdict};

/// Marker used throughout the fixtures
pub const MARKER: &str = "MS:1002511";

/// Configuration pointing at `root` with millisecond retry delays
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.mirror.root = root.to_path_buf();
    config.remote.root = "pride/data/archive".to_string();
    let fast = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    };
    config.connection = fast.clone();
    config.download = fast;
    config
}

pub fn test_context(root: &Path) -> RunContext {
    RunContext::new(test_config(root))
}

/// A small mzIdentML document, optionally carrying the marker
pub fn mzid_document(with_marker: bool, version: &str) -> String {
    let accession = if with_marker { MARKER } else { "MS:1001143" };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MzIdentML id="test" version="{version}"
    xmlns="http://psidev.info/psi/pi/mzIdentML/1.2"
    xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
    xsi:schemaLocation="http://psidev.info/psi/pi/mzIdentML/1.2 https://www.psidev.info/files/mzIdentML{version}.xsd">
  <AnalysisSoftwareList>
    <cvParam accession="{accession}" name="test"/>
  </AnalysisSoftwareList>
</MzIdentML>
"#
    )
}

/// Write `content` at `<root>/<collection_dir>/<name>`, creating directories
pub fn write_mirror_file(root: &Path, collection_dir: &str, name: &str, content: &str) -> PathBuf {
    let directory = root.join(collection_dir);
    std::fs::create_dir_all(&directory).unwrap();
    let path = directory.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Parseable, not yet validated row
pub fn ledger_row(project: &str, file_name: &str, file_size: &str) -> LedgerRow {
    LedgerRow {
        project: project.to_string(),
        date: "2024-03-01".to_string(),
        file_name: file_name.to_string(),
        file_size: file_size.to_string(),
        contains_marker: false,
        parseable: true,
        schema_version: "1.2.0".to_string(),
        schema_valid: SchemaVerdict::Unknown,
        error_message: String::new(),
    }
}
