use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use mzid_mirror::cli::{Cli, Command, CrawlArgs, ValidateArgs};
use mzid_mirror::config::ConfigManager;
use mzid_mirror::connection::ConnectionProvider;
use mzid_mirror::context::RunContext;
use mzid_mirror::crawler::{CrawlScope, RemoteDirectoryCrawler, SessionDirectoryProvider};
use mzid_mirror::downloader::ResilientDownloader;
use mzid_mirror::extractor::ArchiveExtractor;
use mzid_mirror::ftp::FtpConnector;
use mzid_mirror::leaf_selector::LeafSelector;
use mzid_mirror::logging;
use mzid_mirror::metadata::MetadataCollector;
use mzid_mirror::output::Output;
use mzid_mirror::report::ReportBuilder;
use mzid_mirror::scheduler::ValidationScheduler;
use mzid_mirror::worker::{self, ProcessValidator, WorkerCommand};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // The worker answers on stdout only, so it skips logging and config entirely
    if let Command::ValidateWorker(args) = &cli.command {
        let report = worker::run_worker(&args.schema_dir, &args.schema_name, &args.file);
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    logging::init(cli.verbose, cli.quiet)?;
    let config = ConfigManager::load_config(&cli)
        .await
        .context("load configuration")?;
    let context = RunContext::new(config);
    let output = Output::new(cli.verbosity());

    match &cli.command {
        Command::Crawl(args) => crawl(&context, args, &output).await?,
        Command::Extract => extract(&context, &output).await?,
        Command::Metadata => metadata(&context, &output).await?,
        Command::Report => report(&context, &output).await?,
        Command::Validate(args) => validate(&context, args, &output).await?,
        Command::Run(args) => {
            crawl(&context, args, &output).await?;
            extract(&context, &output).await?;
            report(&context, &output).await?;
            validate(&context, &ValidateArgs::default(), &output).await?;
        }
        Command::ValidateWorker(_) => {}
    }

    print!("{}", output.format_counters(&context.counters().snapshot()));
    Ok(())
}

async fn crawl(context: &RunContext, args: &CrawlArgs, output: &Output) -> Result<()> {
    let config = context.config();
    let started = Instant::now();

    let connector = Arc::new(FtpConnector::from_config(&config.remote));
    let connections = ConnectionProvider::new(connector, config.connection.policy());
    let directories = Arc::new(SessionDirectoryProvider::new(
        connections.clone(),
        config.remote.root.clone(),
    ));
    let selector = LeafSelector::new(
        &config.crawl.target_marker,
        &config.crawl.excluded_suffixes,
        config.crawl.selection,
    );
    let downloader = ResilientDownloader::new(
        context.clone(),
        connections,
        config.download.policy(),
        config.remote.root.clone(),
        config.mirror.root.clone(),
    );
    let scope = CrawlScope {
        period: args.period.clone(),
        sub_period: args.sub_period.clone(),
        collection: args.collection.clone(),
    };

    info!(
        host = %config.remote.host,
        root = %config.remote.root,
        mirror = %config.mirror.root.display(),
        "starting crawl"
    );
    let stats = RemoteDirectoryCrawler::new(context.clone(), directories, selector)
        .with_scope(scope)
        .crawl(&downloader)
        .await
        .context("crawl remote archive")?;

    print!("{}", output.format_crawl(&stats, started.elapsed()));
    Ok(())
}

async fn extract(context: &RunContext, output: &Output) -> Result<()> {
    let config = context.config();
    let started = Instant::now();
    let report = ArchiveExtractor::new(
        context.clone(),
        config.mirror.root.clone(),
        &config.extract.expected_suffix,
    )
    .run()
    .await
    .context("extract archives")?;

    print!("{}", output.format_extraction(&report, started.elapsed()));
    Ok(())
}

async fn metadata(context: &RunContext, output: &Output) -> Result<()> {
    let started = Instant::now();
    let stats = MetadataCollector::new(context.clone())
        .context("create metadata client")?
        .run()
        .await
        .context("collect metadata")?;

    print!("{}", output.format_metadata(&stats, started.elapsed()));
    Ok(())
}

async fn report(context: &RunContext, output: &Output) -> Result<()> {
    let started = Instant::now();
    let builder = ReportBuilder::new(context.clone());
    let stats = builder
        .build_or_update()
        .await
        .with_context(|| format!("update ledger {}", builder.ledger_path().display()))?;
    let subset_rows = builder
        .regenerate_subset()
        .await
        .with_context(|| format!("regenerate {}", builder.subset_path().display()))?;

    print!("{}", output.format_report(&stats, subset_rows, started.elapsed()));
    Ok(())
}

/// The subset file first (every row), then the main ledger without the marker rows
async fn validate(context: &RunContext, args: &ValidateArgs, output: &Output) -> Result<()> {
    let config = context.config();
    let validator = ProcessValidator::new(
        WorkerCommand::current_exe().context("locate validation worker")?,
        config.validation.schema_dir.clone(),
        config.validation.schema_name.clone(),
    );
    let scheduler = ValidationScheduler::new(context.clone(), Arc::new(validator));

    if !args.main_only {
        let started = Instant::now();
        let path = config.subset_path();
        let stats = scheduler
            .run(&path, |_| true)
            .await
            .with_context(|| format!("validate {}", path.display()))?;
        print!("{}", output.format_validation("subset", &stats, started.elapsed()));
        if stats.halted {
            return Ok(());
        }
    }

    if !args.subset_only {
        let started = Instant::now();
        let path = config.ledger_path();
        let stats = scheduler
            .run(&path, |row| !row.contains_marker)
            .await
            .with_context(|| format!("validate {}", path.display()))?;
        print!("{}", output.format_validation("main", &stats, started.elapsed()));
    }
    Ok(())
}
