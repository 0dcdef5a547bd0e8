//! Incremental path for single-card CRM events.

use adpulse_adapters::{active_categories, CardNode};
use adpulse_core::{ClassifiedDeal, DealRecord, Integration, SourceKind, SyncOutcome};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::aggregate::aggregate_deals;
use crate::orchestrator::{Orchestrator, SourceError, SourceReport, SyncError};

pub const CARD_DELETE_ACTION: &str = "card.delete";

/// `{ action, data: { card } }` as posted by the CRM.
#[derive(Debug, Clone, Deserialize)]
pub struct CardEvent {
    pub action: String,
    pub data: CardEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardEventData {
    pub card: CardNode,
}

impl CardEvent {
    pub fn from_json(value: JsonValue) -> Result<Self, SyncError> {
        serde_json::from_value(value).map_err(|err| SyncError::InvalidEvent(err.to_string()))
    }

    pub fn is_delete(&self) -> bool {
        self.action == CARD_DELETE_ACTION
    }
}

impl Orchestrator {
    /// Applies one card event and recomputes the owning company's CRM buckets.
    /// Returns `None` when the owning integration is inactive. Runs under the
    /// company's CRM gate, so it never interleaves with a full CRM sync.
    pub async fn handle_card_event(
        &self,
        event: CardEvent,
    ) -> Result<Option<SyncOutcome>, SyncError> {
        let pipeline_id = event
            .data
            .card
            .pipeline_id()
            .ok_or_else(|| SyncError::InvalidEvent("card carries no pipe id".to_string()))?;
        let integration = self
            .store
            .integration_for_pipeline(&pipeline_id)
            .await?
            .ok_or(SyncError::UnknownPipeline(pipeline_id))?;

        if !integration.active {
            info!(
                integration_id = %integration.id,
                action = %event.action,
                "ignoring card event for inactive integration"
            );
            return Ok(None);
        }

        let outcome = self
            .run_recorded(&integration, false, self.apply_card_event(&integration, event))
            .await;
        Ok(Some(outcome))
    }

    async fn apply_card_event(
        &self,
        integration: &Integration,
        event: CardEvent,
    ) -> Result<SourceReport, SourceError> {
        let company_id = integration.company_id;
        let settings = &integration.settings;
        let _gate = self.lock_crm(company_id).await;

        if event.is_delete() {
            let card_id = event.data.card.id();
            let removed = self.store.delete_deal(company_id, &card_id).await?;
            debug!(%card_id, removed, "deleted card");
        } else {
            let card = event.data.card.into_raw_card();
            let tags = self.tags.tag_card(&card, settings);
            let deal = self.classifier.classify(&card, &tags, settings);
            debug!(card_id = %deal.card_id, status = deal.status.as_str(), "classified card");
            let record = DealRecord {
                company_id,
                source: SourceKind::Crm,
                deal,
                synced_at: Utc::now(),
            };
            let plan = self.planner.plan(vec![record], Vec::new(), Vec::new());
            self.planner.execute(self.store.as_ref(), &plan).await?;
        }

        let deals: Vec<ClassifiedDeal> = self
            .store
            .deals_for_company(company_id, SourceKind::Crm)
            .await?
            .into_iter()
            .map(|record| record.deal)
            .collect();
        let active = active_categories(deals.iter().map(|d| d.categories.as_slice()));
        let buckets = aggregate_deals(company_id, &deals, &active);

        let mut plan = self.planner.plan(Vec::new(), Vec::new(), buckets);
        let existing = self
            .store
            .bucket_keys(company_id, SourceKind::Crm, None)
            .await?;
        plan.retire_missing(&existing);
        let report = self.planner.execute(self.store.as_ref(), &plan).await?;

        Ok(SourceReport {
            records: 1,
            pages: 0,
            buckets: plan.bucket_count(),
            retired: report.retired,
            removed_deals: 0,
            truncated: false,
        })
    }
}
