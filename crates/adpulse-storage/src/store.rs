use adpulse_core::{
    BucketKey, CampaignDay, DateRange, DealRecord, Integration, MetricBucket, SourceKind,
    SyncOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// One upsert statement's worth of rows, all of one kind.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertBatch {
    Deals(Vec<DealRecord>),
    CampaignDays(Vec<CampaignDay>),
    MetricBuckets(Vec<MetricBucket>),
}

impl UpsertBatch {
    pub fn table(&self) -> &'static str {
        match self {
            UpsertBatch::Deals(_) => "deals",
            UpsertBatch::CampaignDays(_) => "campaign_days",
            UpsertBatch::MetricBuckets(_) => "metric_buckets",
        }
    }

    /// Natural key used as the `ON CONFLICT` target.
    pub fn conflict_target(&self) -> &'static [&'static str] {
        match self {
            UpsertBatch::Deals(_) => &["company_id", "card_id"],
            UpsertBatch::CampaignDays(_) => &["company_id", "campaign_id", "date"],
            UpsertBatch::MetricBuckets(_) => &["company_id", "date", "source", "label"],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UpsertBatch::Deals(rows) => rows.len(),
            UpsertBatch::CampaignDays(rows) => rows.len(),
            UpsertBatch::MetricBuckets(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage collaborator. Every `upsert` must be atomic per row on its conflict target.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn company_exists(&self, company_id: Uuid) -> Result<bool, StoreError>;

    async fn active_integrations(&self, company_id: Uuid) -> Result<Vec<Integration>, StoreError>;

    /// Companies with at least one active integration.
    async fn active_company_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    /// CRM integration owning `pipeline_id`. An active one wins over inactive ones.
    async fn integration_for_pipeline(
        &self,
        pipeline_id: &str,
    ) -> Result<Option<Integration>, StoreError>;

    async fn upsert(&self, batch: &UpsertBatch) -> Result<usize, StoreError>;

    async fn bucket_keys(
        &self,
        company_id: Uuid,
        source: SourceKind,
        window: Option<DateRange>,
    ) -> Result<Vec<BucketKey>, StoreError>;

    async fn delete_buckets(&self, keys: &[BucketKey]) -> Result<usize, StoreError>;

    async fn deals_for_company(
        &self,
        company_id: Uuid,
        source: SourceKind,
    ) -> Result<Vec<DealRecord>, StoreError>;

    async fn delete_deal(&self, company_id: Uuid, card_id: &str) -> Result<bool, StoreError>;

    /// Deletes deal rows by `(company_id, card_id)`; returns how many existed.
    async fn delete_deals(&self, keys: &[(Uuid, String)]) -> Result<usize, StoreError>;

    async fn mark_synced(&self, integration_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn record_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError>;
}
