use adpulse_core::{
    BucketKey, ClassifiedDeal, DateRange, DealRecord, Integration, IntegrationSettings,
    SourceKind, SyncOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::warn;
use uuid::Uuid;

use crate::store::{MetricStore, StoreError, UpsertBatch};

const INTEGRATION_COLUMNS: &str = "id, company_id, source, credentials, account_id, pipeline_id, active, settings, last_sync_at";

/// `MetricStore` over Postgres. Each upsert batch runs in its own transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn corrupt(table: &'static str) -> impl Fn(String) -> StoreError {
    move |message| StoreError::Corrupt { table, message }
}

fn integration_from_row(row: &PgRow) -> Result<Integration, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let source: String = row.try_get("source")?;
    let settings_json: serde_json::Value = row.try_get("settings")?;
    let settings = IntegrationSettings::from_json(&settings_json).unwrap_or_else(|err| {
        warn!(integration_id = %id, error = %err, "ignoring unparsable integration settings");
        IntegrationSettings::default()
    });
    Ok(Integration {
        id,
        company_id: row.try_get("company_id")?,
        source: source.parse().map_err(corrupt("integrations"))?,
        credentials: row.try_get("credentials")?,
        account_id: row.try_get("account_id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        active: row.try_get("active")?,
        settings,
        last_sync_at: row.try_get("last_sync_at")?,
    })
}

fn deal_from_row(row: &PgRow) -> Result<DealRecord, StoreError> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("status")?;
    let channel: String = row.try_get("channel")?;
    let categories: Json<Vec<String>> = row.try_get("categories")?;
    let labels: Json<Vec<String>> = row.try_get("labels")?;
    Ok(DealRecord {
        company_id: row.try_get("company_id")?,
        source: source.parse().map_err(corrupt("deals"))?,
        synced_at: row.try_get("synced_at")?,
        deal: ClassifiedDeal {
            card_id: row.try_get("card_id")?,
            title: row.try_get("title")?,
            phase_id: row.try_get("phase_id")?,
            phase_name: row.try_get("phase_name")?,
            status: status.parse().map_err(corrupt("deals"))?,
            amount: row.try_get("amount")?,
            product: row.try_get("product")?,
            categories: categories.0,
            channel: channel.parse().map_err(corrupt("deals"))?,
            seller: row.try_get("seller")?,
            loss_reason: row.try_get("loss_reason")?,
            labels: labels.0,
            created_date: row.try_get("created_date")?,
            effective_date: row.try_get("effective_date")?,
        },
    })
}

fn upsert_query(batch: &UpsertBatch) -> QueryBuilder<'_, Postgres> {
    let conflict = batch.conflict_target().join(", ");
    match batch {
        UpsertBatch::Deals(rows) => {
            let mut qb = QueryBuilder::new(
                "INSERT INTO deals (company_id, card_id, source, title, phase_id, phase_name, status, amount, product, categories, channel, seller, loss_reason, labels, created_date, effective_date, synced_at) ",
            );
            qb.push_values(rows, |mut b, row| {
                let deal = &row.deal;
                b.push_bind(row.company_id)
                    .push_bind(deal.card_id.clone())
                    .push_bind(row.source.as_str())
                    .push_bind(deal.title.clone())
                    .push_bind(deal.phase_id.clone())
                    .push_bind(deal.phase_name.clone())
                    .push_bind(deal.status.as_str())
                    .push_bind(deal.amount)
                    .push_bind(deal.product.clone())
                    .push_bind(Json(deal.categories.clone()))
                    .push_bind(deal.channel.as_str())
                    .push_bind(deal.seller.clone())
                    .push_bind(deal.loss_reason.clone())
                    .push_bind(Json(deal.labels.clone()))
                    .push_bind(deal.created_date)
                    .push_bind(deal.effective_date)
                    .push_bind(row.synced_at);
            });
            qb.push(format!(
                " ON CONFLICT ({conflict}) DO UPDATE SET \
                 source = EXCLUDED.source, title = EXCLUDED.title, phase_id = EXCLUDED.phase_id, \
                 phase_name = EXCLUDED.phase_name, status = EXCLUDED.status, amount = EXCLUDED.amount, \
                 product = EXCLUDED.product, categories = EXCLUDED.categories, channel = EXCLUDED.channel, \
                 seller = EXCLUDED.seller, loss_reason = EXCLUDED.loss_reason, labels = EXCLUDED.labels, \
                 created_date = EXCLUDED.created_date, effective_date = EXCLUDED.effective_date, \
                 synced_at = EXCLUDED.synced_at"
            ));
            qb
        }
        UpsertBatch::CampaignDays(rows) => {
            let mut qb = QueryBuilder::new(
                "INSERT INTO campaign_days (company_id, campaign_id, date, campaign_name, spend, impressions, clicks, reach, leads, categories, updated_at) ",
            );
            qb.push_values(rows, |mut b, row| {
                b.push_bind(row.company_id)
                    .push_bind(row.campaign_id.clone())
                    .push_bind(row.date)
                    .push_bind(row.campaign_name.clone())
                    .push_bind(row.spend)
                    .push_bind(row.impressions)
                    .push_bind(row.clicks)
                    .push_bind(row.reach)
                    .push_bind(row.leads)
                    .push_bind(Json(row.categories.clone()))
                    .push("NOW()");
            });
            qb.push(format!(
                " ON CONFLICT ({conflict}) DO UPDATE SET \
                 campaign_name = EXCLUDED.campaign_name, spend = EXCLUDED.spend, \
                 impressions = EXCLUDED.impressions, clicks = EXCLUDED.clicks, reach = EXCLUDED.reach, \
                 leads = EXCLUDED.leads, categories = EXCLUDED.categories, updated_at = NOW()"
            ));
            qb
        }
        UpsertBatch::MetricBuckets(rows) => {
            let mut qb = QueryBuilder::new(
                "INSERT INTO metric_buckets (company_id, date, source, label, created, qualified, converted, lost, won_amount, spend, impressions, clicks, reach, leads, conversion_rate, updated_at) ",
            );
            qb.push_values(rows, |mut b, row| {
                b.push_bind(row.company_id)
                    .push_bind(row.date)
                    .push_bind(row.source.as_str())
                    .push_bind(row.label.clone())
                    .push_bind(row.created)
                    .push_bind(row.qualified)
                    .push_bind(row.converted)
                    .push_bind(row.lost)
                    .push_bind(row.won_amount)
                    .push_bind(row.spend)
                    .push_bind(row.impressions)
                    .push_bind(row.clicks)
                    .push_bind(row.reach)
                    .push_bind(row.leads)
                    .push_bind(row.conversion_rate())
                    .push("NOW()");
            });
            qb.push(format!(
                " ON CONFLICT ({conflict}) DO UPDATE SET \
                 created = EXCLUDED.created, qualified = EXCLUDED.qualified, \
                 converted = EXCLUDED.converted, lost = EXCLUDED.lost, won_amount = EXCLUDED.won_amount, \
                 spend = EXCLUDED.spend, impressions = EXCLUDED.impressions, clicks = EXCLUDED.clicks, \
                 reach = EXCLUDED.reach, leads = EXCLUDED.leads, \
                 conversion_rate = EXCLUDED.conversion_rate, updated_at = NOW()"
            ));
            qb
        }
    }
}

#[async_trait]
impl MetricStore for PgStore {
    async fn company_exists(&self, company_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM companies WHERE id = $1) AS present")
            .bind(company_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn active_integrations(&self, company_id: Uuid) -> Result<Vec<Integration>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE company_id = $1 AND active ORDER BY source"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(integration_from_row).collect()
    }

    async fn active_company_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT company_id
              FROM integrations
             WHERE active
             ORDER BY company_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("company_id").map_err(StoreError::from))
            .collect()
    }

    async fn integration_for_pipeline(
        &self,
        pipeline_id: &str,
    ) -> Result<Option<Integration>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE source = 'crm' AND pipeline_id = $1 ORDER BY active DESC, created_at DESC LIMIT 1"
        ))
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(integration_from_row).transpose()
    }

    async fn upsert(&self, batch: &UpsertBatch) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut query = upsert_query(batch);
        query.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(batch.len())
    }

    async fn bucket_keys(
        &self,
        company_id: Uuid,
        source: SourceKind,
        window: Option<DateRange>,
    ) -> Result<Vec<BucketKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT company_id, date, source, label
              FROM metric_buckets
             WHERE company_id = $1
               AND source = $2
               AND ($3::date IS NULL OR date >= $3)
               AND ($4::date IS NULL OR date <= $4)
            "#,
        )
        .bind(company_id)
        .bind(source.as_str())
        .bind(window.map(|w| w.since))
        .bind(window.map(|w| w.until))
        .fetch_all(&self.pool)
        .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.try_get("source")?;
            keys.push(BucketKey {
                company_id: row.try_get("company_id")?,
                date: row.try_get("date")?,
                source: source.parse().map_err(corrupt("metric_buckets"))?,
                label: row.try_get("label")?,
            });
        }
        Ok(keys)
    }

    async fn delete_buckets(&self, keys: &[BucketKey]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for key in keys {
            let result = sqlx::query(
                r#"
                DELETE FROM metric_buckets
                 WHERE company_id = $1 AND date = $2 AND source = $3 AND label = $4
                "#,
            )
            .bind(key.company_id)
            .bind(key.date)
            .bind(key.source.as_str())
            .bind(&key.label)
            .execute(&mut *tx)
            .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted as usize)
    }

    async fn deals_for_company(
        &self,
        company_id: Uuid,
        source: SourceKind,
    ) -> Result<Vec<DealRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT company_id, card_id, source, title, phase_id, phase_name, status, amount,
                   product, categories, channel, seller, loss_reason, labels,
                   created_date, effective_date, synced_at
              FROM deals
             WHERE company_id = $1 AND source = $2
             ORDER BY card_id
            "#,
        )
        .bind(company_id)
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deal_from_row).collect()
    }

    async fn delete_deal(&self, company_id: Uuid, card_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM deals WHERE company_id = $1 AND card_id = $2")
            .bind(company_id)
            .bind(card_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_deals(&self, keys: &[(Uuid, String)]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for (company_id, card_id) in keys {
            let result = sqlx::query("DELETE FROM deals WHERE company_id = $1 AND card_id = $2")
                .bind(company_id)
                .bind(card_id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted as usize)
    }

    async fn mark_synced(&self, integration_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE integrations SET last_sync_at = $2 WHERE id = $1")
            .bind(integration_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_outcomes
                (id, company_id, source, status, message, record_count, duration_ms, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(outcome.id)
        .bind(outcome.company_id)
        .bind(outcome.source.as_str())
        .bind(outcome.status.as_str())
        .bind(&outcome.message)
        .bind(outcome.record_count)
        .bind(outcome.duration_ms)
        .bind(outcome.started_at)
        .bind(outcome.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
