//! Feed synchronization: fetch, parse, watermark filter and dedup-insert for
//! every active source in a scope.
//!
//! Sources run through a bounded worker pool. Each one has its own time
//! budget and a failure in one never stops the others; the run as a whole
//! carries a deadline after which remaining sources are deferred to the next
//! run. Results are collected from the stream, so aggregation needs no
//! shared mutable state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::db::{Database, OwnerScope, Source};
use crate::fetcher::{FetchFailure, FetchStrategy};
use crate::parser::{self, ParseError};
use crate::registry::SubscriptionRegistry;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Deadline for each individual fetch attempt
    pub fetch_timeout: Duration,
    /// Budget for one source, all attempts and inserts included
    pub source_timeout: Duration,
    /// Deadline for the whole run
    pub run_timeout: Duration,
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout(),
            source_timeout: config.source_timeout(),
            run_timeout: config.run_timeout(),
            concurrency: config.concurrency(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceSyncError {
    #[error(transparent)]
    Fetch(#[from] FetchFailure),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("Source timed out after {0:?}")]
    Timeout(Duration),
    #[error("Run deadline reached before this source was processed")]
    Deadline,
}

/// A failure attributable to one source.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceError {
    pub source_id: i64,
    pub source_name: String,
    pub message: String,
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.source_name, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub new_count: usize,
    pub sources_processed: usize,
    pub errors: Vec<SourceError>,
}

struct SourceOutcome {
    source: Source,
    inserted: usize,
    result: Result<(), SourceSyncError>,
}

pub struct SyncOrchestrator {
    db: Arc<Database>,
    registry: Arc<SubscriptionRegistry>,
    fetcher: Arc<FetchStrategy>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<SubscriptionRegistry>,
        fetcher: Arc<FetchStrategy>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            db,
            registry,
            fetcher,
            settings,
        }
    }

    pub fn fetcher(&self) -> &FetchStrategy {
        &self.fetcher
    }

    /// Sync every active source in `scope`. Only a failure to list the
    /// sources fails the run; per-source failures land in the report.
    pub async fn run_sync(&self, scope: &OwnerScope) -> anyhow::Result<SyncReport> {
        let sources = self.registry.list(scope, true).await?;
        let deadline = Instant::now() + self.settings.run_timeout;
        info!(owner = %scope, sources = sources.len(), "Starting sync");

        let outcomes: Vec<SourceOutcome> = stream::iter(sources)
            .map(|source| self.sync_source_bounded(source, deadline))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut report = SyncReport::default();
        for outcome in outcomes {
            if !matches!(outcome.result, Err(SourceSyncError::Deadline)) {
                report.sources_processed += 1;
            }
            report.new_count += outcome.inserted;
            if let Err(e) = outcome.result {
                error!(
                    owner = %scope,
                    source_id = outcome.source.id,
                    url = %outcome.source.url,
                    error = %e,
                    "Source sync failed"
                );
                report.errors.push(SourceError {
                    source_id: outcome.source.id,
                    source_name: outcome.source.name.clone(),
                    message: e.to_string(),
                });
            }
        }
        report.errors.sort_by_key(|e| e.source_id);

        info!(
            owner = %scope,
            new = report.new_count,
            processed = report.sources_processed,
            failed = report.errors.len(),
            "Sync complete"
        );
        Ok(report)
    }

    async fn sync_source_bounded(&self, source: Source, deadline: Instant) -> SourceOutcome {
        let now = Instant::now();
        if now >= deadline {
            return SourceOutcome {
                source,
                inserted: 0,
                result: Err(SourceSyncError::Deadline),
            };
        }

        let budget = self.settings.source_timeout.min(deadline - now);
        let inserted = AtomicUsize::new(0);
        let result = match tokio::time::timeout(budget, self.sync_source(&source, &inserted)).await
        {
            Ok(result) => result,
            Err(_) => Err(SourceSyncError::Timeout(budget)),
        };

        SourceOutcome {
            source,
            inserted: inserted.load(Ordering::Relaxed),
            result,
        }
    }

    /// Fetch, parse, drop entries at or before the watermark, then insert the
    /// rest in feed order. `inserted` counts rows as they are committed so a
    /// timeout still reports them.
    async fn sync_source(
        &self,
        source: &Source,
        inserted: &AtomicUsize,
    ) -> Result<(), SourceSyncError> {
        let body = self
            .fetcher
            .fetch(&source.url, self.settings.fetch_timeout)
            .await?;
        let entries = parser::parse(&body, source.id)?;
        let watermark = self.db.source_watermark(source.id).await?;
        let scope = source.scope();

        let candidates: Vec<_> = entries
            .into_iter()
            .filter(|entry| match watermark {
                Some(mark) => entry.published_at.timestamp_millis() > mark,
                None => true,
            })
            .collect();

        for entry in &candidates {
            if self.db.insert_entry_if_absent(&scope, source.id, entry).await? {
                inserted.fetch_add(1, Ordering::Relaxed);
            }
        }

        info!(
            source_id = source.id,
            name = %source.name,
            candidates = candidates.len(),
            inserted = inserted.load(Ordering::Relaxed),
            "Source synced"
        );
        Ok(())
    }
}

/// Sync the shared scope now, then every `interval_minutes`.
pub async fn start_background_sync(orchestrator: Arc<SyncOrchestrator>, interval_minutes: u64) {
    if interval_minutes == 0 {
        info!("Scheduled sync disabled");
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        info!("Starting scheduled shared sync");
        if let Err(e) = orchestrator.run_sync(&OwnerScope::Shared).await {
            warn!(error = %e, "Scheduled sync failed");
        }
    }
}
