//! The analysis ledger: a CSV file with one row per (project, file name).
//!
//! The report stage only appends. The validation stage rewrites rows in place
//! through [`PersistedLedger`], which swaps in a complete new file atomically
//! after every change.

use crate::downloader::partial_path;
use crate::error::{MirrorError, Result};
use crate::human_size::parse_size;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const TRUE: &str = "True";
pub const FALSE: &str = "False";

/// Number of columns in every ledger row
pub const COLUMN_COUNT: usize = 9;

/// Unique identity of a row
pub type LedgerKey = (String, String);

/// Column names; the marker column is derived from the configured marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerColumns {
    marker_column: String,
}

impl LedgerColumns {
    /// `MS:1002511` becomes `contains_MS1002511`
    pub fn for_marker(marker: &str) -> Self {
        let cleaned: String = marker.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        Self {
            marker_column: format!("contains_{}", cleaned),
        }
    }

    pub fn marker_column(&self) -> &str {
        &self.marker_column
    }

    pub fn header(&self) -> [&str; COLUMN_COUNT] {
        [
            "project",
            "date",
            "file_name",
            "file_size",
            &self.marker_column,
            "parseable",
            "schema_version",
            "schema_valid",
            "error_message",
        ]
    }
}

/// Schema validity of one row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaVerdict {
    /// Not validated yet
    #[default]
    Unknown,
    Valid,
    Invalid,
    TimedOut,
    OutOfMemory,
}

impl SchemaVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVerdict::Unknown => "",
            SchemaVerdict::Valid => TRUE,
            SchemaVerdict::Invalid => FALSE,
            SchemaVerdict::TimedOut => "timed out",
            SchemaVerdict::OutOfMemory => "out of memory",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" => SchemaVerdict::Unknown,
            v if v.eq_ignore_ascii_case(TRUE) => SchemaVerdict::Valid,
            v if v.eq_ignore_ascii_case(FALSE) => SchemaVerdict::Invalid,
            "timed out" => SchemaVerdict::TimedOut,
            "out of memory" => SchemaVerdict::OutOfMemory,
            _ => SchemaVerdict::Unknown,
        }
    }

    /// Whether the row is finished; exhaustion verdicts reopen when `retry_exhausted` is set
    pub fn is_terminal(&self, retry_exhausted: bool) -> bool {
        match self {
            SchemaVerdict::Unknown => false,
            SchemaVerdict::Valid | SchemaVerdict::Invalid => true,
            SchemaVerdict::TimedOut | SchemaVerdict::OutOfMemory => !retry_exhausted,
        }
    }
}

fn encode_bool(value: bool) -> &'static str {
    if value { TRUE } else { FALSE }
}

fn decode_bool(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case(TRUE) || value == "1"
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedgerRow {
    pub project: String,
    /// `YYYY-MM-01` or empty
    pub date: String,
    pub file_name: String,
    /// Human-readable, e.g. `1.5 KB`
    pub file_size: String,
    pub contains_marker: bool,
    pub parseable: bool,
    pub schema_version: String,
    pub schema_valid: SchemaVerdict,
    pub error_message: String,
}

impl LedgerRow {
    pub fn key(&self) -> LedgerKey {
        (self.project.clone(), self.file_name.clone())
    }

    /// Decoded size for ordering; `None` when the stored text is not a size
    pub fn size_bytes(&self) -> Option<u64> {
        parse_size(&self.file_size)
    }

    pub fn to_record(&self) -> [&str; COLUMN_COUNT] {
        [
            &self.project,
            &self.date,
            &self.file_name,
            &self.file_size,
            encode_bool(self.contains_marker),
            encode_bool(self.parseable),
            &self.schema_version,
            self.schema_valid.as_str(),
            &self.error_message,
        ]
    }

    pub fn from_record(record: &csv::StringRecord) -> Option<Self> {
        if record.len() < COLUMN_COUNT {
            return None;
        }
        Some(Self {
            project: record[0].to_string(),
            date: record[1].to_string(),
            file_name: record[2].to_string(),
            file_size: record[3].to_string(),
            contains_marker: decode_bool(&record[4]),
            parseable: decode_bool(&record[5]),
            schema_version: record[6].to_string(),
            schema_valid: SchemaVerdict::parse(&record[7]),
            error_message: record[8].to_string(),
        })
    }
}

fn ledger_error(path: &Path, details: impl Into<String>) -> MirrorError {
    MirrorError::Ledger {
        path: path.to_path_buf(),
        details: details.into(),
    }
}

/// Header and rows of an existing ledger; a missing file reads as empty
/// Byte length of `file` up to and including its last newline
fn terminated_length(file: &mut File) -> std::io::Result<u64> {
    let mut end = file.seek(SeekFrom::End(0))?;
    let mut chunk = [0u8; 8192];
    while end > 0 {
        let start = end.saturating_sub(chunk.len() as u64);
        let len = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk[..len])?;
        if let Some(newline) = chunk[..len].iter().rposition(|&byte| byte == b'\n') {
            return Ok(start + newline as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// A parsed ledger file and the length of its intact prefix
struct ParsedLedger {
    header: Option<Vec<String>>,
    rows: Vec<LedgerRow>,
    /// Bytes up to the end of the last complete row
    intact: u64,
    total: u64,
}

impl ParsedLedger {
    fn is_torn(&self) -> bool {
        self.intact < self.total
    }
}

/// Parse an existing ledger.
///
/// Rows are written one at a time, so a crash can leave the final row
/// unterminated or short. That row is dropped; a short row anywhere else is an
/// error.
fn parse_ledger(path: &Path) -> Result<ParsedLedger> {
    let mut file = File::open(path)?;
    let total = file.metadata()?.len();
    let terminated = terminated_length(&mut file)?;
    file.seek(SeekFrom::Start(0))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file.take(terminated));

    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if header.is_empty() || header.iter().all(String::is_empty) {
        return Ok(ParsedLedger {
            header: None,
            rows: Vec::new(),
            intact: 0,
            total,
        });
    }
    if header.len() != COLUMN_COUNT {
        return Err(ledger_error(
            path,
            format!("expected {} columns, found {}", COLUMN_COUNT, header.len()),
        ));
    }

    let mut records = Vec::new();
    let mut record = csv::StringRecord::new();
    loop {
        let start = reader.position().byte();
        if !reader.read_record(&mut record)? {
            break;
        }
        records.push((start, record.clone()));
    }

    let mut rows = Vec::with_capacity(records.len());
    let mut intact = terminated;
    let last = records.len().saturating_sub(1);
    for (index, (start, record)) in records.iter().enumerate() {
        match LedgerRow::from_record(record) {
            Some(row) => rows.push(row),
            None if index == last => intact = *start,
            None => {
                return Err(ledger_error(path, format!("row {} is truncated", index + 2)));
            }
        }
    }

    Ok(ParsedLedger {
        header: Some(header),
        rows,
        intact,
        total,
    })
}

pub fn read_ledger(path: &Path) -> Result<(Option<Vec<String>>, Vec<LedgerRow>)> {
    if !path.exists() {
        return Ok((None, Vec::new()));
    }

    let parsed = parse_ledger(path)?;
    if parsed.is_torn() {
        warn!(
            path = %path.display(),
            dropped_bytes = parsed.total - parsed.intact,
            "ignoring incomplete final ledger row"
        );
    }
    Ok((parsed.header, parsed.rows))
}

pub fn read_rows(path: &Path) -> Result<Vec<LedgerRow>> {
    Ok(read_ledger(path)?.1)
}

/// Keys already present, so the report stage can skip them
pub fn load_keys(path: &Path) -> Result<HashSet<LedgerKey>> {
    Ok(read_rows(path)?.iter().map(LedgerRow::key).collect())
}

fn encode_record<I, S>(fields: I, path: &Path) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(fields)?;
    writer
        .into_inner()
        .map_err(|error| ledger_error(path, error.to_string()))
}

/// Write `content` to a sibling temporary, sync it and rename it over `path`
fn replace_file(path: &Path, content: &[u8]) -> Result<()> {
    let temp = partial_path(path);
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    };
    write().map_err(|error| {
        let _ = fs::remove_file(&temp);
        MirrorError::Io(error)
    })
}

/// Appends rows one at a time, flushing each before returning
pub struct LedgerAppender {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl LedgerAppender {
    /// Open for appending; a new or empty file gets the header first.
    ///
    /// An incomplete final row left by an interrupted append is cut off, so
    /// the next row starts on a fresh line.
    pub fn open(path: &Path, columns: &LedgerColumns) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut needs_header = true;
        if path.exists() {
            let parsed = parse_ledger(path)?;
            if parsed.is_torn() {
                warn!(
                    path = %path.display(),
                    dropped_bytes = parsed.total - parsed.intact,
                    "truncating incomplete final ledger row"
                );
                OpenOptions::new().write(true).open(path)?.set_len(parsed.intact)?;
            }
            needs_header = parsed.intact == 0;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(columns.header())?;
            writer.flush()?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn append(&mut self, row: &LedgerRow) -> Result<()> {
        self.writer.write_record(row.to_record())?;
        self.writer
            .flush()
            .map_err(|error| ledger_error(&self.path, error.to_string()))
    }
}

/// Whole ledger held in memory with each row's encoding cached.
///
/// [`PersistedLedger::update`] re-encodes only the changed row and then
/// replaces the file atomically, so a crash leaves either the old or the new
/// ledger, never a torn one.
#[derive(Debug)]
pub struct PersistedLedger {
    path: PathBuf,
    header: Vec<u8>,
    rows: Vec<LedgerRow>,
    encoded: Vec<Vec<u8>>,
}

impl PersistedLedger {
    pub fn load(path: &Path, columns: &LedgerColumns) -> Result<Self> {
        let (header, rows) = read_ledger(path)?;
        let header = match header {
            Some(existing) => encode_record(&existing, path)?,
            None => encode_record(columns.header(), path)?,
        };
        let encoded = rows
            .iter()
            .map(|row| encode_record(row.to_record(), path))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            rows,
            encoded,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[LedgerRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Replace row `index` and persist the whole ledger
    pub fn update(&mut self, index: usize, row: LedgerRow) -> Result<()> {
        if index >= self.rows.len() {
            return Err(ledger_error(
                &self.path,
                format!("row index {} out of range", index),
            ));
        }
        self.encoded[index] = encode_record(row.to_record(), &self.path)?;
        self.rows[index] = row;
        self.persist()
    }

    pub fn persist(&self) -> Result<()> {
        let size = self.header.len() + self.encoded.iter().map(Vec::len).sum::<usize>();
        let mut content = Vec::with_capacity(size);
        content.extend_from_slice(&self.header);
        for line in &self.encoded {
            content.extend_from_slice(line);
        }
        replace_file(&self.path, &content)
    }
}

/// Regenerate a derived ledger from scratch: delete, then write `rows`
pub fn write_subset<'a, I>(path: &Path, columns: &LedgerColumns, rows: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a LedgerRow>,
{
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }

    let mut content = encode_record(columns.header(), path)?;
    let mut count = 0;
    for row in rows {
        content.extend_from_slice(&encode_record(row.to_record(), path)?);
        count += 1;
    }
    replace_file(path, &content)?;
    Ok(count)
}
