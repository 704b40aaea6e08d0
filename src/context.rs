use crate::config::Config;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Span;

/// Counters accumulated over one run, shared by every stage
#[derive(Debug, Default)]
pub struct RunCounters {
    pub listings: AtomicU64,
    pub empty_listings: AtomicU64,
    pub downloads: AtomicU64,
    pub download_skips: AtomicU64,
    pub remote_failures: AtomicU64,
    pub extractions: AtomicU64,
    pub ledger_rows: AtomicU64,
    pub validations: AtomicU64,
}

/// Point-in-time copy of [`RunCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub listings: u64,
    pub empty_listings: u64,
    pub downloads: u64,
    pub download_skips: u64,
    pub remote_failures: u64,
    pub extractions: u64,
    pub ledger_rows: u64,
    pub validations: u64,
}

impl RunCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            listings: self.listings.load(Ordering::Relaxed),
            empty_listings: self.empty_listings.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            download_skips: self.download_skips.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            extractions: self.extractions.load(Ordering::Relaxed),
            ledger_rows: self.ledger_rows.load(Ordering::Relaxed),
            validations: self.validations.load(Ordering::Relaxed),
        }
    }
}

/// Everything a stage needs from its surroundings: configuration, counters and
/// the span its log records nest under.
#[derive(Debug, Clone)]
pub struct RunContext {
    config: Arc<Config>,
    counters: Arc<RunCounters>,
    span: Span,
}

impl RunContext {
    pub fn new(config: Config) -> Self {
        let span = tracing::info_span!("run", mirror = %config.mirror.root.display());
        Self {
            config: Arc::new(config),
            counters: Arc::new(RunCounters::default()),
            span,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    /// Child span for one stage
    pub fn stage_span(&self, stage: &'static str) -> Span {
        tracing::info_span!(parent: &self.span, "stage", name = stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_shared_between_clones() {
        let context = RunContext::new(Config::default());
        let clone = context.clone();

        RunCounters::bump(&clone.counters().downloads);
        RunCounters::bump(&context.counters().downloads);
        RunCounters::bump(&context.counters().ledger_rows);

        let snapshot = context.counters().snapshot();
        assert_eq!(snapshot.downloads, 2);
        assert_eq!(snapshot.ledger_rows, 1);
        assert_eq!(snapshot.validations, 0);
    }
}
