//! Extractor — paged fetch of raw transactions newer than the watermark.
//!
//! Produces pages strictly newer than the watermark, ordered by
//! transaction timestamp ascending, so watermark advancement stays
//! monotonic and safe under partial failure. Each summary gets a
//! follow-up detail fetch for products/location/tax fields before it is
//! handed to the transformer. Retry/backoff lives in the API client;
//! exhaustion there aborts the run with the watermark unmoved, giving
//! at-least-once delivery.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::api::client::ApiClient;
use crate::api::types::{RawTransaction, TransactionDetail, TransactionSummary};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::sync_state::Watermark;

pub struct Extractor {
    client: ApiClient,
    page_size: u32,
    max_pages: u32,
}

impl Extractor {
    pub fn new(client: ApiClient, sync: &SyncConfig) -> Self {
        Self {
            client,
            page_size: sync.page_size,
            max_pages: sync.max_pages,
        }
    }

    /// Lazy, finite, restartable page sequence starting just past the
    /// watermark.
    pub fn pages<'a>(&'a self, watermark: &Watermark) -> PageStream<'a> {
        PageStream {
            extractor: self,
            oldest_time: watermark
                .last_transaction_time
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            floor: watermark.last_transaction_time,
            cursor: watermark.last_cursor.clone(),
            pages_fetched: 0,
            done: false,
        }
    }
}

/// Cursor over the remote history pages.
pub struct PageStream<'a> {
    extractor: &'a Extractor,
    oldest_time: Option<String>,
    floor: Option<DateTime<Utc>>,
    cursor: Option<String>,
    pages_fetched: u32,
    done: bool,
}

impl PageStream<'_> {
    /// Fetch the next page of detailed raw transactions, or `None` when
    /// the API reports no further pages or `max_pages` is reached.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawTransaction>>> {
        loop {
            if self.done || self.pages_fetched >= self.extractor.max_pages {
                return Ok(None);
            }

            let page = self
                .extractor
                .client
                .fetch_history_page(
                    self.oldest_time.as_deref(),
                    self.cursor.as_deref(),
                    self.extractor.page_size,
                )
                .await?;
            self.pages_fetched += 1;

            self.cursor = page.next_cursor();
            if self.cursor.is_none() {
                self.done = true;
            }

            let summaries = order_and_filter(page.items, self.floor);
            debug!(
                page = self.pages_fetched,
                records = summaries.len(),
                has_next = !self.done,
                "history page fetched"
            );

            if summaries.is_empty() {
                if self.done {
                    return Ok(None);
                }
                // Fully-filtered page; keep walking the cursor chain
                continue;
            }

            let mut raw = Vec::with_capacity(summaries.len());
            for summary in summaries {
                let detail = match summary.id.as_deref() {
                    Some(id) => self.extractor.client.fetch_transaction_detail(id).await?,
                    None => {
                        // Transformer records the missing id as a skip
                        warn!("history record without id, deferring to validation");
                        TransactionDetail::default()
                    }
                };
                raw.push(RawTransaction { summary, detail });
            }
            return Ok(Some(raw));
        }
    }

    /// Cursor of the page most recently fetched, persisted alongside the
    /// watermark so the next run resumes without rewinding.
    pub fn last_cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }
}

/// Order summaries by timestamp ascending and drop anything at or below
/// the watermark. Records with unparseable timestamps are kept (sorted
/// last) so the transformer can record them as validation failures.
fn order_and_filter(
    items: Vec<TransactionSummary>,
    floor: Option<DateTime<Utc>>,
) -> Vec<TransactionSummary> {
    let mut keyed: Vec<(Option<DateTime<Utc>>, TransactionSummary)> = items
        .into_iter()
        .map(|s| {
            let ts = s
                .timestamp
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc));
            (ts, s)
        })
        .filter(|(ts, _)| match (ts, floor) {
            (Some(ts), Some(floor)) => *ts > floor,
            _ => true,
        })
        .collect();

    keyed.sort_by_key(|entry| entry.0.unwrap_or(DateTime::<Utc>::MAX_UTC));
    keyed.into_iter().map(|(_, s)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn summary(id: &str, ts: &str) -> TransactionSummary {
        serde_json::from_value(json!({ "id": id, "timestamp": ts })).unwrap()
    }

    #[test]
    fn orders_ascending_and_drops_at_or_below_watermark() {
        let floor = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let items = vec![
            summary("late", "2024-03-01T14:00:00Z"),
            summary("at-floor", "2024-03-01T12:00:00Z"),
            summary("early", "2024-03-01T13:00:00Z"),
            summary("old", "2024-02-28T09:00:00Z"),
        ];
        let kept = order_and_filter(items, Some(floor));
        let ids: Vec<_> = kept.iter().map(|s| s.id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn unparseable_timestamps_are_kept_for_validation() {
        let items = vec![
            summary("good", "2024-03-01T13:00:00Z"),
            summary("bad", "yesterday-ish"),
        ];
        let kept = order_and_filter(items, None);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id.as_deref(), Some("good"));
        assert_eq!(kept[1].id.as_deref(), Some("bad"));
    }
}
