//! # mzid-mirror Library
//!
//! Mirrors mzIdentML files from a remote archive over FTP and keeps a
//! resumable CSV ledger describing each mirrored file: size, content marker,
//! well-formedness, declared schema version and schema validity.
//!
//! Stages run in order, each idempotent so an interrupted run can simply be
//! restarted: crawl and download, extract archives, build the ledger, validate.

pub mod cli;
pub mod config;
pub mod connection;
pub mod context;
pub mod crawler;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod ftp;
pub mod human_size;
pub mod leaf_selector;
pub mod ledger;
pub mod libxml2;
pub mod logging;
pub mod marker;
pub mod metadata;
pub mod mirror;
pub mod output;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod schema_location;
pub mod worker;

pub use cli::{Cli, Command, VerbosityLevel};
pub use config::{Config, ConfigManager};
pub use connection::{ConnectionProvider, Connector, RemotePath, RemoteSession};
pub use context::{RunContext, RunCounters};
pub use crawler::{CrawlScope, CrawlStats, DirectoryProvider, LeafHandler, RemoteDirectoryCrawler};
pub use downloader::{FetchOutcome, ResilientDownloader};
pub use error::{LibXml2Error, MirrorError, RemoteError, Result};
pub use extractor::{ArchiveExtractor, ExtractionReport};
pub use ftp::FtpConnector;
pub use leaf_selector::{LeafSelector, SelectionPolicy};
pub use ledger::{LedgerRow, PersistedLedger, SchemaVerdict};
pub use libxml2::{LibXml2Wrapper, ValidationResult};
pub use metadata::{MetadataCollector, MetadataStats};
pub use output::Output;
pub use report::{ReportBuilder, ReportStats};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerStats, ValidationScheduler};
pub use worker::{ProcessValidator, SchemaValidator, ValidationOutcome, ValidationReport};
