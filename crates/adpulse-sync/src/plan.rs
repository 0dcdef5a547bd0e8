//! Turns aggregation output into ordered, de-duplicated upsert batches.

use std::collections::{BTreeMap, BTreeSet};

use adpulse_core::{BucketKey, CampaignDay, DealRecord, MetricBucket};
use adpulse_storage::{MetricStore, StoreError, UpsertBatch};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePlan {
    /// Deals, then campaign days, then buckets.
    pub batches: Vec<UpsertBatch>,
    pub retired: Vec<BucketKey>,
    /// `(company_id, card_id)` of deal rows whose card is gone upstream.
    pub retired_deals: Vec<(Uuid, String)>,
}

impl WritePlan {
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(UpsertBatch::len).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| matches!(b, UpsertBatch::MetricBuckets(_)))
            .map(UpsertBatch::len)
            .sum()
    }

    /// Schedules deletion of every existing key the new buckets no longer cover.
    pub fn retire_missing(&mut self, existing: &[BucketKey]) {
        let produced: BTreeSet<BucketKey> = self
            .batches
            .iter()
            .filter_map(|b| match b {
                UpsertBatch::MetricBuckets(rows) => Some(rows.iter().map(MetricBucket::key)),
                _ => None,
            })
            .flatten()
            .collect();
        self.retired = existing
            .iter()
            .filter(|key| !produced.contains(*key))
            .cloned()
            .collect();
    }

    /// Schedules deletion of every stored deal row the planned deals no longer cover.
    pub fn retire_missing_deals(&mut self, stored: &[DealRecord]) {
        let planned: BTreeSet<(Uuid, String)> = self
            .batches
            .iter()
            .filter_map(|b| match b {
                UpsertBatch::Deals(rows) => Some(rows.iter().map(DealRecord::natural_key)),
                _ => None,
            })
            .flatten()
            .collect();
        self.retired_deals = stored
            .iter()
            .map(DealRecord::natural_key)
            .filter(|key| !planned.contains(key))
            .collect();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub rows: usize,
    pub batches: usize,
    pub retired: usize,
    pub retired_deals: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct WritePlanner {
    batch_size: usize,
}

impl Default for WritePlanner {
    fn default() -> Self {
        Self::new(500)
    }
}

fn chunked<T: Clone>(rows: Vec<T>, size: usize, wrap: fn(Vec<T>) -> UpsertBatch) -> Vec<UpsertBatch> {
    rows.chunks(size).map(|chunk| wrap(chunk.to_vec())).collect()
}

impl WritePlanner {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Rows sharing a natural key collapse to the last one given.
    pub fn plan(
        &self,
        deals: Vec<DealRecord>,
        days: Vec<CampaignDay>,
        buckets: Vec<MetricBucket>,
    ) -> WritePlan {
        let deals: BTreeMap<_, _> = deals.into_iter().map(|d| (d.natural_key(), d)).collect();
        let days: BTreeMap<_, _> = days.into_iter().map(|d| (d.natural_key(), d)).collect();
        let buckets: BTreeMap<_, _> = buckets.into_iter().map(|b| (b.key(), b)).collect();

        let mut batches = chunked(
            deals.into_values().collect(),
            self.batch_size,
            UpsertBatch::Deals,
        );
        batches.extend(chunked(
            days.into_values().collect(),
            self.batch_size,
            UpsertBatch::CampaignDays,
        ));
        batches.extend(chunked(
            buckets.into_values().collect(),
            self.batch_size,
            UpsertBatch::MetricBuckets,
        ));

        WritePlan {
            batches,
            ..WritePlan::default()
        }
    }

    /// Applies the plan in order. The first failing batch aborts the rest;
    /// batches already written stay written. Deletions run only once every
    /// batch has landed.
    pub async fn execute(
        &self,
        store: &dyn MetricStore,
        plan: &WritePlan,
    ) -> Result<WriteReport, StoreError> {
        let mut report = WriteReport::default();
        for (index, batch) in plan.batches.iter().enumerate() {
            match store.upsert(batch).await {
                Ok(rows) => {
                    debug!(table = batch.table(), rows, "upserted batch");
                    report.rows += rows;
                    report.batches += 1;
                }
                Err(err) => {
                    warn!(
                        table = batch.table(),
                        batch = index,
                        remaining = plan.batches.len() - index - 1,
                        error = %err,
                        "batch failed; aborting remaining writes"
                    );
                    return Err(err);
                }
            }
        }
        if !plan.retired_deals.is_empty() {
            report.retired_deals = store.delete_deals(&plan.retired_deals).await?;
        }
        if !plan.retired.is_empty() {
            report.retired = store.delete_buckets(&plan.retired).await?;
        }
        Ok(report)
    }
}
