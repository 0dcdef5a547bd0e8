use std::collections::{BTreeMap, BTreeSet};

use adpulse_core::{
    BucketKey, CampaignDay, DateRange, DealRecord, Integration, MetricBucket, SourceKind,
    SyncOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{MetricStore, StoreError, UpsertBatch};

#[derive(Debug, Default)]
struct MemoryState {
    companies: BTreeSet<Uuid>,
    integrations: Vec<Integration>,
    buckets: BTreeMap<BucketKey, MetricBucket>,
    deals: BTreeMap<(Uuid, String), DealRecord>,
    campaign_days: BTreeMap<(Uuid, String, NaiveDate), CampaignDay>,
    outcomes: Vec<SyncOutcome>,
    upsert_calls: usize,
    fail_upserts_after: Option<usize>,
}

/// In-process store keyed by the same natural keys as the SQL schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_company(&self, company_id: Uuid) {
        self.state.lock().await.companies.insert(company_id);
    }

    pub async fn add_integration(&self, integration: Integration) {
        let mut state = self.state.lock().await;
        state.companies.insert(integration.company_id);
        state.integrations.retain(|i| i.id != integration.id);
        state.integrations.push(integration);
    }

    /// Every upsert after the first `calls` successful ones is rejected.
    pub async fn fail_upserts_after(&self, calls: usize) {
        self.state.lock().await.fail_upserts_after = Some(calls);
    }

    pub async fn buckets(&self) -> Vec<MetricBucket> {
        self.state.lock().await.buckets.values().cloned().collect()
    }

    pub async fn deals(&self) -> Vec<DealRecord> {
        self.state.lock().await.deals.values().cloned().collect()
    }

    pub async fn campaign_days(&self) -> Vec<CampaignDay> {
        self.state.lock().await.campaign_days.values().cloned().collect()
    }

    pub async fn outcomes(&self) -> Vec<SyncOutcome> {
        self.state.lock().await.outcomes.clone()
    }

    pub async fn integration(&self, id: Uuid) -> Option<Integration> {
        self.state
            .lock()
            .await
            .integrations
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn company_exists(&self, company_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.companies.contains(&company_id))
    }

    async fn active_integrations(&self, company_id: Uuid) -> Result<Vec<Integration>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .integrations
            .iter()
            .filter(|i| i.company_id == company_id && i.active)
            .cloned()
            .collect())
    }

    async fn active_company_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock().await;
        let ids: BTreeSet<Uuid> = state
            .integrations
            .iter()
            .filter(|i| i.active)
            .map(|i| i.company_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn integration_for_pipeline(
        &self,
        pipeline_id: &str,
    ) -> Result<Option<Integration>, StoreError> {
        let state = self.state.lock().await;
        let owners: Vec<&Integration> = state
            .integrations
            .iter()
            .filter(|i| i.source == SourceKind::Crm && i.pipeline_id.as_deref() == Some(pipeline_id))
            .collect();
        Ok(owners
            .iter()
            .find(|i| i.active)
            .or(owners.first())
            .map(|i| (*i).clone()))
    }

    async fn upsert(&self, batch: &UpsertBatch) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(limit) = state.fail_upserts_after {
            if state.upsert_calls >= limit {
                return Err(StoreError::Rejected(format!(
                    "injected failure on {} batch",
                    batch.table()
                )));
            }
        }
        state.upsert_calls += 1;

        match batch {
            UpsertBatch::Deals(rows) => {
                for row in rows {
                    state.deals.insert(row.natural_key(), row.clone());
                }
            }
            UpsertBatch::CampaignDays(rows) => {
                for row in rows {
                    state.campaign_days.insert(row.natural_key(), row.clone());
                }
            }
            UpsertBatch::MetricBuckets(rows) => {
                for row in rows {
                    state.buckets.insert(row.key(), row.clone());
                }
            }
        }
        Ok(batch.len())
    }

    async fn bucket_keys(
        &self,
        company_id: Uuid,
        source: SourceKind,
        window: Option<DateRange>,
    ) -> Result<Vec<BucketKey>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .buckets
            .keys()
            .filter(|k| k.company_id == company_id && k.source == source)
            .filter(|k| window.is_none_or(|w| w.contains(k.date)))
            .cloned()
            .collect())
    }

    async fn delete_buckets(&self, keys: &[BucketKey]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter(|key| state.buckets.remove(*key).is_some())
            .count())
    }

    async fn deals_for_company(
        &self,
        company_id: Uuid,
        source: SourceKind,
    ) -> Result<Vec<DealRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .deals
            .values()
            .filter(|d| d.company_id == company_id && d.source == source)
            .cloned()
            .collect())
    }

    async fn delete_deal(&self, company_id: Uuid, card_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .deals
            .remove(&(company_id, card_id.to_string()))
            .is_some())
    }

    async fn delete_deals(&self, keys: &[(Uuid, String)]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter(|key| state.deals.remove(*key).is_some())
            .count())
    }

    async fn mark_synced(&self, integration_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(integration) = state.integrations.iter_mut().find(|i| i.id == integration_id) {
            integration.last_sync_at = Some(at);
        }
        Ok(())
    }

    async fn record_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        self.state.lock().await.outcomes.push(outcome.clone());
        Ok(())
    }
}
