//! Per-company sync runs: resolve integrations, run each source pipeline in
//! isolation and record exactly one outcome per source.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use adpulse_adapters::{
    active_categories, AdapterError, AdsFetcherConfig, AdsInsightFetcher, ApiTransport,
    CrmCardFetcher, CrmFetcherConfig, DealClassifier, RuleSet, TagExtractor,
};
use adpulse_core::{
    ClassifiedDeal, DateRange, DealRecord, Integration, SourceKind, SyncOutcome, SyncStatus,
};
use adpulse_storage::{HttpFetcher, MetricStore, StoreError};
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{aggregate_ad_rows, aggregate_deals, campaign_days};
use crate::config::SyncConfig;
use crate::plan::{WritePlan, WritePlanner};
use crate::vault::{CredentialError, CredentialVault, PlaintextVault};

/// Failure of one source pipeline. Always captured into a `SyncOutcome`.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] CredentialError),
    #[error("integration has no {0} configured")]
    MissingIdentifier(&'static str),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] AdapterError),
    #[error("storage write failed: {0}")]
    Store(#[from] StoreError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl SourceError {
    pub fn is_credential_error(&self) -> bool {
        match self {
            SourceError::Credentials(_) => true,
            SourceError::Upstream(err) => err.is_credential_error(),
            _ => false,
        }
    }
}

/// Errors that reach the caller of a sync.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("company {0} not found")]
    CompanyNotFound(Uuid),
    #[error("no integration owns pipeline {0}")]
    UnknownPipeline(String),
    #[error("invalid card event: {0}")]
    InvalidEvent(String),
    #[error("since {since} is after until {until}")]
    InvalidWindow { since: NaiveDate, until: NaiveDate },
    #[error("storage lookup failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SourceReport {
    pub records: usize,
    pub pages: usize,
    pub buckets: usize,
    pub retired: usize,
    pub removed_deals: usize,
    pub truncated: bool,
}

impl SourceReport {
    fn message(&self) -> String {
        let mut message = format!("synced {} records into {} buckets", self.records, self.buckets);
        if self.pages > 0 {
            message.push_str(&format!(" from {} pages", self.pages));
        }
        if self.retired > 0 {
            message.push_str(&format!(", retired {} stale buckets", self.retired));
        }
        if self.removed_deals > 0 {
            message.push_str(&format!(", removed {} deleted cards", self.removed_deals));
        }
        if self.truncated {
            message.push_str("; page cap reached, results truncated");
        }
        message
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanySyncReport {
    pub company_id: Uuid,
    pub window: DateRange,
    pub outcomes: Vec<SyncOutcome>,
}

impl CompanySyncReport {
    pub fn has_errors(&self) -> bool {
        self.outcomes.iter().any(|o| o.status == SyncStatus::Error)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub ads: AdsFetcherConfig,
    pub crm: CrmFetcherConfig,
    pub write_batch_size: usize,
    pub source_timeout: Duration,
    pub ads_lookback_days: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            ads: AdsFetcherConfig::default(),
            crm: CrmFetcherConfig::default(),
            write_batch_size: 500,
            source_timeout: Duration::from_secs(600),
            ads_lookback_days: 30,
        }
    }
}

impl From<&SyncConfig> for OrchestratorSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            ads: config.ads_fetcher_config(),
            crm: config.crm_fetcher_config(),
            write_batch_size: config.write_batch_size,
            source_timeout: config.source_timeout(),
            ads_lookback_days: config.ads_lookback_days,
        }
    }
}

/// Holds no per-run state; one instance serves concurrent company syncs.
pub struct Orchestrator {
    pub(crate) store: Arc<dyn MetricStore>,
    vault: Arc<dyn CredentialVault>,
    ads: AdsInsightFetcher,
    crm: CrmCardFetcher,
    pub(crate) classifier: DealClassifier,
    pub(crate) tags: TagExtractor,
    pub(crate) planner: WritePlanner,
    source_timeout: Duration,
    ads_lookback_days: u32,
    crm_gates: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MetricStore>,
        vault: Arc<dyn CredentialVault>,
        transport: Arc<dyn ApiTransport>,
        rules: Arc<RuleSet>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            vault,
            ads: AdsInsightFetcher::new(transport.clone(), settings.ads),
            crm: CrmCardFetcher::new(transport, settings.crm),
            classifier: DealClassifier::new(rules.clone()),
            tags: TagExtractor::new(rules),
            planner: WritePlanner::new(settings.write_batch_size),
            source_timeout: settings.source_timeout,
            ads_lookback_days: settings.ads_lookback_days,
            crm_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: HTTP transport, configured rules, plaintext credentials.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn MetricStore>) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let rules = config.load_rules().context("loading classification rules")?;
        Ok(Self::new(
            store,
            Arc::new(PlaintextVault),
            Arc::new(http),
            Arc::new(rules),
            OrchestratorSettings::from(config),
        ))
    }

    pub fn store(&self) -> &Arc<dyn MetricStore> {
        &self.store
    }

    pub fn default_window(&self) -> DateRange {
        DateRange::trailing(Utc::now().date_naive(), self.ads_lookback_days)
    }

    /// Caller-supplied bounds with gaps filled in: `until` defaults to today,
    /// `since` to the lookback start. `None` when neither bound is given.
    pub fn resolve_window(
        &self,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<Option<DateRange>, SyncError> {
        if since.is_none() && until.is_none() {
            return Ok(None);
        }
        let until = until.unwrap_or_else(|| Utc::now().date_naive());
        let since = since.unwrap_or(self.default_window().since);
        DateRange::new(since, until)
            .map(Some)
            .ok_or(SyncError::InvalidWindow { since, until })
    }

    /// Serializes CRM writes per company. Full syncs and card events both
    /// recompute and retire CRM buckets from stored deals.
    pub(crate) async fn lock_crm(&self, company_id: Uuid) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.crm_gates.lock().await;
            gates.entry(company_id).or_default().clone()
        };
        gate.lock_owned().await
    }

    /// Syncs every active integration of one company. Source failures become
    /// error outcomes; only company-level problems are returned as `Err`.
    pub async fn sync_company(
        &self,
        company_id: Uuid,
        window: Option<DateRange>,
    ) -> Result<CompanySyncReport, SyncError> {
        if !self.store.company_exists(company_id).await? {
            return Err(SyncError::CompanyNotFound(company_id));
        }
        let window = window.unwrap_or_else(|| self.default_window());
        let integrations = self.store.active_integrations(company_id).await?;

        let ads = integrations.iter().find(|i| i.source == SourceKind::Ads);
        let crm = integrations.iter().find(|i| i.source == SourceKind::Crm);
        for integration in ads.iter().chain(crm.iter()) {
            info!(%company_id, source = %integration.source, state = "pending", "source queued");
        }

        let ads_run = async {
            match ads {
                Some(integration) => Some(
                    self.run_recorded(integration, true, self.sync_ads(integration, window))
                        .await,
                ),
                None => None,
            }
        };
        let crm_run = async {
            match crm {
                Some(integration) => {
                    Some(self.run_recorded(integration, true, self.sync_crm(integration)).await)
                }
                None => None,
            }
        };
        let (ads_outcome, crm_outcome) = tokio::join!(ads_run, crm_run);

        let outcomes: Vec<SyncOutcome> = ads_outcome.into_iter().chain(crm_outcome).collect();
        if outcomes.is_empty() {
            info!(%company_id, "company has no active integrations");
        }
        Ok(CompanySyncReport {
            company_id,
            window,
            outcomes,
        })
    }

    /// Syncs each company with an active integration, one after another.
    /// A company that fails to sync is logged and skipped.
    pub async fn sync_all_active_companies(&self) -> Result<Vec<CompanySyncReport>, SyncError> {
        let company_ids = self.store.active_company_ids().await?;
        info!(companies = company_ids.len(), "starting sync of active companies");

        let mut reports = Vec::with_capacity(company_ids.len());
        for company_id in company_ids {
            match self.sync_company(company_id, None).await {
                Ok(report) => reports.push(report),
                Err(err) => error!(%company_id, error = %err, "company sync failed"),
            }
        }
        Ok(reports)
    }

    /// Runs one source pipeline under the source timeout and records its outcome.
    pub(crate) async fn run_recorded<F>(
        &self,
        integration: &Integration,
        stamp_last_sync: bool,
        pipeline: F,
    ) -> SyncOutcome
    where
        F: Future<Output = Result<SourceReport, SourceError>>,
    {
        let company_id = integration.company_id;
        let source = integration.source;
        let span = info_span!("source_sync", %company_id, %source);

        async {
            let started_at = Utc::now();
            let clock = Instant::now();
            info!(state = "running", "source sync started");

            let result = match tokio::time::timeout(self.source_timeout, pipeline).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(self.source_timeout)),
            };
            let finished_at = Utc::now();

            let (status, message, record_count) = match result {
                Ok(report) => {
                    info!(
                        state = "success",
                        records = report.records,
                        buckets = report.buckets,
                        truncated = report.truncated,
                        "source sync finished"
                    );
                    if stamp_last_sync {
                        if let Err(err) = self.store.mark_synced(integration.id, finished_at).await {
                            warn!(error = %err, "failed to stamp last sync time");
                        }
                    }
                    (SyncStatus::Success, report.message(), report.records as i64)
                }
                Err(err) => {
                    error!(
                        state = "error",
                        credential = err.is_credential_error(),
                        error = %err,
                        "source sync failed"
                    );
                    (SyncStatus::Error, err.to_string(), 0)
                }
            };

            let outcome = SyncOutcome {
                id: Uuid::new_v4(),
                company_id,
                source,
                status,
                message,
                record_count,
                duration_ms: clock.elapsed().as_millis() as i64,
                started_at,
                finished_at,
            };
            if let Err(err) = self.store.record_outcome(&outcome).await {
                warn!(error = %err, "failed to record sync outcome");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn write(&self, plan: &WritePlan) -> Result<(usize, usize), SourceError> {
        let report = self.planner.execute(self.store.as_ref(), plan).await?;
        Ok((plan.bucket_count(), report.retired))
    }

    async fn sync_ads(
        &self,
        integration: &Integration,
        window: DateRange,
    ) -> Result<SourceReport, SourceError> {
        let account_id = integration
            .account_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(SourceError::MissingIdentifier("ad account id"))?;
        let token = self.vault.reveal(integration)?;
        let company_id = integration.company_id;

        let fetched = self.ads.fetch_daily(account_id, &token, window).await?;
        let days = campaign_days(company_id, &fetched.rows, &self.tags);
        let active = active_categories(days.iter().map(|d| d.categories.as_slice()));
        let buckets = aggregate_ad_rows(company_id, &days, &active);

        let mut plan = self.planner.plan(Vec::new(), days, buckets);
        if !fetched.truncated {
            let existing = self
                .store
                .bucket_keys(company_id, SourceKind::Ads, Some(window))
                .await?;
            plan.retire_missing(&existing);
        }
        let (buckets, retired) = self.write(&plan).await?;

        Ok(SourceReport {
            records: fetched.rows.len(),
            pages: fetched.pages,
            buckets,
            retired,
            removed_deals: 0,
            truncated: fetched.truncated,
        })
    }

    async fn sync_crm(&self, integration: &Integration) -> Result<SourceReport, SourceError> {
        let pipeline_id = integration
            .pipeline_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(SourceError::MissingIdentifier("pipeline id"))?;
        let token = self.vault.reveal(integration)?;
        let company_id = integration.company_id;
        let settings = &integration.settings;

        let fetched = self.crm.fetch_pipeline(pipeline_id, &token).await?;
        let deals: Vec<ClassifiedDeal> = fetched
            .cards
            .iter()
            .map(|card| {
                let tags = self.tags.tag_card(card, settings);
                self.classifier.classify(card, &tags, settings)
            })
            .collect();

        let _gate = self.lock_crm(company_id).await;
        let stored = self
            .store
            .deals_for_company(company_id, SourceKind::Crm)
            .await?;

        // A capped fetch misses the oldest cards; count them from their stored rows instead.
        let mut basis = deals.clone();
        if fetched.truncated {
            let fetched_ids: HashSet<&str> = deals.iter().map(|d| d.card_id.as_str()).collect();
            basis.extend(
                stored
                    .iter()
                    .filter(|r| !fetched_ids.contains(r.deal.card_id.as_str()))
                    .map(|r| r.deal.clone()),
            );
        }
        let active = active_categories(basis.iter().map(|d| d.categories.as_slice()));
        let buckets = aggregate_deals(company_id, &basis, &active);

        let synced_at = Utc::now();
        let records: Vec<DealRecord> = deals
            .into_iter()
            .map(|deal| DealRecord {
                company_id,
                source: SourceKind::Crm,
                deal,
                synced_at,
            })
            .collect();
        let record_count = records.len();

        let mut plan = self.planner.plan(records, Vec::new(), buckets);
        if !fetched.truncated {
            plan.retire_missing_deals(&stored);
            let existing = self
                .store
                .bucket_keys(company_id, SourceKind::Crm, None)
                .await?;
            plan.retire_missing(&existing);
        }
        let report = self.planner.execute(self.store.as_ref(), &plan).await?;

        Ok(SourceReport {
            records: record_count,
            pages: fetched.pages,
            buckets: plan.bucket_count(),
            retired: report.retired,
            removed_deals: report.retired_deals,
            truncated: fetched.truncated,
        })
    }
}
