//! Stage summaries for the terminal.

use std::time::Duration;

use crate::cli::VerbosityLevel;
use crate::context::CounterSnapshot;
use crate::crawler::CrawlStats;
use crate::extractor::ExtractionReport;
use crate::metadata::MetadataStats;
use crate::report::ReportStats;
use crate::scheduler::SchedulerStats;

/// Human-readable formatter for stage results
pub struct Output {
    verbosity: VerbosityLevel,
    show_colors: bool,
}

impl Output {
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            show_colors: atty::is(atty::Stream::Stdout),
        }
    }

    /// Formatter that never emits colour codes
    pub fn plain(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            show_colors: false,
        }
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    /// `label: value` line, coloured when the value is a problem count
    fn line(&self, label: &str, value: usize, color: Option<&str>) -> String {
        let label = format!("{}:", label);
        match color {
            Some(color) if value > 0 => format!("  {} {}\n", self.colorize(&label, color), value),
            _ => format!("  {} {}\n", label, value),
        }
    }

    fn heading(&self, title: &str, elapsed: Duration) -> String {
        format!("{} ({})\n", self.colorize(title, "1"), format_duration(elapsed))
    }

    pub fn format_crawl(&self, stats: &CrawlStats, elapsed: Duration) -> String {
        if self.verbosity == VerbosityLevel::Quiet {
            return if stats.failed_files + stats.failed_branches > 0 {
                format!(
                    "Crawl failures: {} files, {} branches\n",
                    stats.failed_files, stats.failed_branches
                )
            } else {
                String::new()
            };
        }

        let mut output = self.heading("Crawl Summary:", elapsed);
        output.push_str(&self.line("Collections", stats.collections, None));
        output.push_str(&self.line("Selected files", stats.selected_files, None));
        output.push_str(&self.line("Handled files", stats.handled_files, None));
        output.push_str(&self.line("Failed files", stats.failed_files, Some("31")));
        output.push_str(&self.line("Failed branches", stats.failed_branches, Some("31")));
        if self.verbosity >= VerbosityLevel::Verbose {
            output.push_str(&self.line("Periods", stats.periods, None));
            output.push_str(&self.line("Sub-periods", stats.sub_periods, None));
            output.push_str(&self.line("Empty listings", stats.empty_listings, Some("33")));
        }
        output
    }

    pub fn format_extraction(&self, report: &ExtractionReport, elapsed: Duration) -> String {
        let mut output = String::new();
        if self.verbosity != VerbosityLevel::Quiet {
            output.push_str(&self.heading("Extraction Summary:", elapsed));
            output.push_str(&self.line("Extracted", report.extracted.len(), None));
            output.push_str(&self.line("Already extracted", report.skipped.len(), None));
        }

        // Failures and anomalies need manual review, so they are always listed
        if !report.failures.is_empty() {
            output.push_str(&format!("{}\n", self.colorize("Extraction failures:", "31")));
            for failure in &report.failures {
                output.push_str(&format!("    {} - {}\n", failure.archive.display(), failure.reason));
            }
        }
        if !report.anomalies.is_empty() {
            output.push_str(&format!("{}\n", self.colorize("Unexpected file types:", "33")));
            for anomaly in &report.anomalies {
                output.push_str(&format!("    {}\n", anomaly.display()));
            }
        }
        output
    }

    pub fn format_metadata(&self, stats: &MetadataStats, elapsed: Duration) -> String {
        if self.verbosity == VerbosityLevel::Quiet {
            return if stats.failed > 0 {
                format!("Metadata failures: {}\n", stats.failed)
            } else {
                String::new()
            };
        }

        let mut output = self.heading("Metadata Summary:", elapsed);
        output.push_str(&self.line("Collections", stats.found, None));
        output.push_str(&self.line("Fetched", stats.fetched, None));
        output.push_str(&self.line("Already present", stats.skipped, None));
        output.push_str(&self.line("Not found", stats.not_found, Some("33")));
        output.push_str(&self.line("Failed", stats.failed, Some("31")));
        output
    }

    pub fn format_report(&self, stats: &ReportStats, subset_rows: usize, elapsed: Duration) -> String {
        if self.verbosity == VerbosityLevel::Quiet {
            return String::new();
        }

        let mut output = self.heading("Report Summary:", elapsed);
        output.push_str(&self.line("New rows", stats.appended, None));
        output.push_str(&self.line("Already in ledger", stats.already_present, None));
        output.push_str(&self.line("Unreadable", stats.unreadable, Some("33")));
        output.push_str(&self.line("Subset rows", subset_rows, None));
        if self.verbosity >= VerbosityLevel::Verbose {
            output.push_str(&self.line("Files scanned", stats.scanned, None));
            output.push_str(&self.line("Ignored", stats.ignored, None));
        }
        output
    }

    pub fn format_validation(&self, label: &str, stats: &SchedulerStats, elapsed: Duration) -> String {
        let mut output = String::new();
        if self.verbosity != VerbosityLevel::Quiet {
            output.push_str(&self.heading(&format!("Validation Summary ({}):", label), elapsed));
            output.push_str(&self.line("Rows considered", stats.considered, None));
            output.push_str(&self.line("Validated", stats.validated, None));
            output.push_str(&format!("  {} {}\n", self.colorize("Valid:", "32"), stats.valid));
            output.push_str(&self.line("Invalid", stats.invalid, Some("31")));
            output.push_str(&self.line("Timed out", stats.timed_out, Some("33")));
            output.push_str(&self.line("Out of memory", stats.exhausted, Some("31")));
            output.push_str(&self.line("Missing files", stats.missing_files, Some("33")));
            if self.verbosity >= VerbosityLevel::Verbose {
                output.push_str(&self.line("Skipped unparseable", stats.skipped_unparseable, None));
                output.push_str(&self.line("Skipped validated", stats.skipped_terminal, None));
            }
        }
        if stats.halted {
            output.push_str(&format!(
                "{}\n",
                self.colorize("Stopped after resource exhaustion; rerun to continue", "31")
            ));
        }
        output
    }

    /// Run-wide counters, shown in verbose mode only
    pub fn format_counters(&self, counters: &CounterSnapshot) -> String {
        if self.verbosity < VerbosityLevel::Verbose {
            return String::new();
        }
        let mut output = String::from("\nRun Counters:\n");
        output.push_str(&format!("  Listings: {} ({} empty)\n", counters.listings, counters.empty_listings));
        output.push_str(&format!("  Downloads: {} ({} skipped)\n", counters.downloads, counters.download_skips));
        output.push_str(&format!("  Remote failures: {}\n", counters.remote_failures));
        output.push_str(&format!("  Extractions: {}\n", counters.extractions));
        output.push_str(&format!("  Ledger rows: {}\n", counters.ledger_rows));
        output.push_str(&format!("  Validations: {}\n", counters.validations));
        output
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs_f64();
    if total_secs < 1.0 {
        format!("{:.0}ms", duration.as_millis())
    } else if total_secs < 60.0 {
        format!("{:.2}s", total_secs)
    } else {
        let mins = (total_secs / 60.0) as u64;
        let secs = total_secs % 60.0;
        format!("{}m{:.1}s", mins, secs)
    }
}
