//! Pipeline runner — wires tracker, extractor, transformer, loader, and
//! anonymizer into one sequential batch run and produces the run summary
//! the orchestrator consumes.
//!
//! Batches (one API page each) are processed strictly in timestamp order;
//! the watermark advances to the maximum committed timestamp of a batch
//! only after that batch is durably loaded. Cancellation is cooperative,
//! checked between aggregates, never inside a partially-committed
//! transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::anonymize::Anonymizer;
use crate::api::client::ApiClient;
use crate::api::types::RawTransaction;
use crate::config::Config;
use crate::error::PipelineError;
use crate::extract::Extractor;
use crate::load::{AggregateOutcome, Loader};
use crate::sync_state::SyncStateTracker;
use crate::transform::{TransformWarning, Transformer};

/// Why a record appears in the summary's issue list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Validation,
    Referential,
    UnknownStatus,
    UnknownPaymentType,
    AmountMismatch,
    DroppedLocation,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordIssue {
    pub transaction_id: Option<String>,
    pub kind: IssueKind,
    pub detail: String,
}

/// Contract surface consumed by the orchestrator and logging layer.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub fetched: u64,
    pub loaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub mirrored: u64,
    /// Gross and VAT-exclusive totals over loaded transactions. The net
    /// figure is derived at report time; it is never stored.
    pub gross_amount: Decimal,
    pub net_amount: Decimal,
    pub final_watermark: Option<DateTime<Utc>>,
    pub issues: Vec<RecordIssue>,
}

impl RunSummary {
    fn record(&mut self, id: Option<&str>, kind: IssueKind, detail: impl Into<String>) {
        self.issues.push(RecordIssue {
            transaction_id: id.map(str::to_string),
            kind,
            detail: detail.into(),
        });
    }
}

/// Run-level failure carrying whatever partial summary was built before
/// the run terminated.
#[derive(Debug)]
pub struct RunFailure {
    pub error: PipelineError,
    pub summary: RunSummary,
}

pub struct Pipeline {
    config: Config,
    pool: PgPool,
}

impl Pipeline {
    pub fn new(config: Config, pool: PgPool) -> Self {
        Self { config, pool }
    }

    /// Execute one full run: lock, extract, transform, load, anonymize,
    /// unlock. Per-record problems are absorbed into the summary;
    /// anything returned as `Err` terminated the run.
    pub async fn run(&self, cancel: &AtomicBool) -> Result<RunSummary, RunFailure> {
        let mut summary = RunSummary::default();

        let mut tracker = match SyncStateTracker::acquire(&self.pool).await {
            Ok(t) => t,
            Err(error) => return Err(RunFailure { error, summary }),
        };

        let outcome = self.run_locked(&mut tracker, cancel, &mut summary).await;
        let released = tracker.release().await;

        match outcome.and(released) {
            Ok(()) => Ok(summary),
            Err(error) => Err(RunFailure { error, summary }),
        }
    }

    async fn run_locked(
        &self,
        tracker: &mut SyncStateTracker,
        cancel: &AtomicBool,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let mut watermark = tracker.read().await?;
        if let Some(start) = &self.config.sync.start_watermark {
            let ts = DateTime::parse_from_rfc3339(start)
                .map_err(|e| PipelineError::Config(format!("invalid start_watermark: {}", e)))?
                .with_timezone(&Utc);
            info!(start = %ts, "using explicit start watermark for backfill");
            watermark.last_transaction_time = Some(ts);
            watermark.last_cursor = None;
        }
        summary.final_watermark = watermark.last_transaction_time;

        let client = ApiClient::new(&self.config.api, &self.config.sync)?;
        let extractor = Extractor::new(client, &self.config.sync);
        let transformer = Transformer::new(self.config.sync.line_item_tolerance);
        let loader = Loader::new(self.pool.clone());

        let mut pages = extractor.pages(&watermark);
        let mut cancelled = false;

        while let Some(page) = pages.next_page().await? {
            summary.fetched += page.len() as u64;
            let mut batch_max: Option<DateTime<Utc>> = None;

            for raw in &page {
                if cancel.load(Ordering::Relaxed) {
                    warn!("cancellation requested, stopping after committed work");
                    cancelled = true;
                    break;
                }
                let disposition = self.process_record(&transformer, &loader, raw).await?;
                apply_disposition(disposition, summary, &mut batch_max);
            }

            // Never advanced speculatively: only past fully loaded pages
            if let Some((max_ts, cursor)) = commit_point(cancelled, batch_max, pages.last_cursor())
            {
                tracker.commit(max_ts, cursor.as_deref()).await?;
                summary.final_watermark = Some(max_ts);
            }
            if cancelled {
                break;
            }
        }

        // Second pass over committed primary rows only
        let anonymizer = Anonymizer::new(self.pool.clone(), &self.config.anonymize);
        summary.mirrored = anonymizer.run(cancel).await?;

        info!(
            fetched = summary.fetched,
            loaded = summary.loaded,
            skipped = summary.skipped,
            failed = summary.failed,
            mirrored = summary.mirrored,
            "run finished"
        );
        Ok(())
    }

    async fn process_record(
        &self,
        transformer: &Transformer,
        loader: &Loader,
        raw: &RawTransaction,
    ) -> Result<RecordDisposition, PipelineError> {
        let normalized = match transformer.transform(raw) {
            Ok(n) => n,
            Err(e) => {
                // Skipped, not retried; the page keeps going
                return Ok(RecordDisposition::Skipped {
                    id: raw.summary.id.clone(),
                    detail: e.to_string(),
                });
            }
        };

        let id = normalized.aggregate.transaction.id.clone();
        let warnings = normalized
            .warnings
            .iter()
            .map(|warning| match warning {
                TransformWarning::UnknownStatus(v) => {
                    (IssueKind::UnknownStatus, format!("status `{}`", v))
                }
                TransformWarning::UnknownPaymentType(v) => {
                    (IssueKind::UnknownPaymentType, format!("payment_type `{}`", v))
                }
                TransformWarning::AmountMismatch { product, detail } => (
                    IssueKind::AmountMismatch,
                    format!("{}: {}", product, detail),
                ),
                TransformWarning::DroppedLocation(detail) => {
                    (IssueKind::DroppedLocation, detail.clone())
                }
            })
            .collect();

        match loader.load_aggregate(&normalized.aggregate).await? {
            AggregateOutcome::Loaded => {
                let t = &normalized.aggregate.transaction;
                Ok(RecordDisposition::Loaded {
                    id,
                    timestamp: t.timestamp,
                    gross: t.amount,
                    net: t.net_amount(),
                    warnings,
                })
            }
            AggregateOutcome::Failed(reason) => Ok(RecordDisposition::Failed {
                id,
                reason,
                warnings,
            }),
        }
    }
}

/// What became of one record, separated from the I/O that produced it so
/// the page bookkeeping below stays testable.
#[derive(Debug)]
enum RecordDisposition {
    Loaded {
        id: String,
        timestamp: DateTime<Utc>,
        gross: Decimal,
        net: Decimal,
        warnings: Vec<(IssueKind, String)>,
    },
    Skipped {
        id: Option<String>,
        detail: String,
    },
    Failed {
        id: String,
        reason: String,
        warnings: Vec<(IssueKind, String)>,
    },
}

/// Fold one record's disposition into the summary and the page's
/// candidate watermark. Only loaded records advance `batch_max`; skips
/// and failures leave it untouched so their timestamps can never be
/// committed past.
fn apply_disposition(
    disposition: RecordDisposition,
    summary: &mut RunSummary,
    batch_max: &mut Option<DateTime<Utc>>,
) {
    match disposition {
        RecordDisposition::Loaded {
            id,
            timestamp,
            gross,
            net,
            warnings,
        } => {
            for (kind, detail) in warnings {
                summary.record(Some(id.as_str()), kind, detail);
            }
            summary.loaded += 1;
            summary.gross_amount += gross;
            summary.net_amount += net;
            *batch_max = Some(batch_max.map_or(timestamp, |m| m.max(timestamp)));
        }
        RecordDisposition::Skipped { id, detail } => {
            summary.skipped += 1;
            summary.record(id.as_deref(), IssueKind::Validation, detail);
        }
        RecordDisposition::Failed {
            id,
            reason,
            warnings,
        } => {
            for (kind, detail) in warnings {
                summary.record(Some(id.as_str()), kind, detail);
            }
            summary.failed += 1;
            summary.record(Some(id.as_str()), IssueKind::Referential, reason);
        }
    }
}

/// Watermark advancement for one page. An interrupted page never
/// commits: the page cursor points past records that were fetched but
/// not yet loaded, so persisting any of it would drop them on the next
/// run. The loader is idempotent, so refetching the loaded prefix is
/// harmless.
fn commit_point(
    cancelled: bool,
    batch_max: Option<DateTime<Utc>>,
    next_cursor: Option<&str>,
) -> Option<(DateTime<Utc>, Option<String>)> {
    if cancelled {
        return None;
    }
    batch_max.map(|ts| (ts, next_cursor.map(str::to_string)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn interrupted_page_leaves_the_watermark_unmoved() {
        // A prefix of the page loaded, then cancellation hit: nothing is
        // committed, so the next run refetches from the old watermark
        // instead of resuming past records it never loaded.
        assert_eq!(commit_point(true, Some(ts(14)), Some("cursor=abc")), None);
        assert_eq!(commit_point(true, None, Some("cursor=abc")), None);
    }

    #[test]
    fn completed_page_commits_max_timestamp_and_cursor() {
        assert_eq!(
            commit_point(false, Some(ts(14)), Some("cursor=abc")),
            Some((ts(14), Some("cursor=abc".to_string())))
        );
        // Page with nothing loaded advances nothing
        assert_eq!(commit_point(false, None, Some("cursor=abc")), None);
    }

    #[test]
    fn failures_inside_a_page_do_not_hold_back_loaded_records() {
        let mut summary = RunSummary::default();
        let mut batch_max = None;

        apply_disposition(
            RecordDisposition::Loaded {
                id: "T1".into(),
                timestamp: ts(10),
                gross: Decimal::new(1190, 2),
                net: Decimal::new(1000, 2),
                warnings: vec![],
            },
            &mut summary,
            &mut batch_max,
        );
        apply_disposition(
            RecordDisposition::Skipped {
                id: Some("T2".into()),
                detail: "invalid field `amount`: missing".into(),
            },
            &mut summary,
            &mut batch_max,
        );
        apply_disposition(
            RecordDisposition::Failed {
                id: "T3".into(),
                reason: "unresolved product reference".into(),
                warnings: vec![],
            },
            &mut summary,
            &mut batch_max,
        );
        apply_disposition(
            RecordDisposition::Loaded {
                id: "T4".into(),
                timestamp: ts(13),
                gross: Decimal::new(500, 2),
                net: Decimal::new(420, 2),
                warnings: vec![(IssueKind::UnknownStatus, "status `ODD`".into())],
            },
            &mut summary,
            &mut batch_max,
        );

        assert_eq!(summary.loaded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        // Amount totals accumulate over loaded records only
        assert_eq!(summary.gross_amount, Decimal::new(1690, 2));
        assert_eq!(summary.net_amount, Decimal::new(1420, 2));
        // The candidate watermark tracks loaded records only
        assert_eq!(batch_max, Some(ts(13)));

        let kinds: Vec<_> = summary.issues.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IssueKind::Validation,
                IssueKind::Referential,
                IssueKind::UnknownStatus
            ]
        );
        assert_eq!(summary.issues[1].transaction_id.as_deref(), Some("T3"));
    }

    #[test]
    fn summary_serializes_for_the_orchestrator() {
        let mut summary = RunSummary::default();
        summary.fetched = 3;
        summary.loaded = 2;
        summary.skipped = 1;
        summary.record(Some("T9"), IssueKind::Validation, "invalid field `amount`: missing");

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["fetched"], 3);
        assert_eq!(json["issues"][0]["kind"], "validation");
        assert_eq!(json["issues"][0]["transaction_id"], "T9");
    }
}
