//! Core domain model for adpulse: integrations, upstream records, classified deals and metric buckets.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-core";

/// Label of the aggregate bucket that every record contributes to.
pub const ALL_LABEL: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Ads,
    Crm,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Ads => "ads",
            SourceKind::Crm => "crm",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ads" | "meta_ads" | "meta" => Ok(SourceKind::Ads),
            "crm" | "pipefy" => Ok(SourceKind::Crm),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// Inclusive calendar window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl DateRange {
    /// Returns `None` when `since` is after `until`.
    pub fn new(since: NaiveDate, until: NaiveDate) -> Option<Self> {
        (since <= until).then_some(Self { since, until })
    }

    /// Window ending at `today` and reaching `lookback_days` back.
    pub fn trailing(today: NaiveDate, lookback_days: u32) -> Self {
        let since = today - chrono::Duration::days(i64::from(lookback_days));
        Self { since, until: today }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.since <= date && date <= self.until
    }
}

/// Per-integration overrides stored as free-form JSON next to the credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IntegrationSettings {
    pub won_phase_ids: Vec<String>,
    pub lost_phase_ids: Vec<String>,
    pub qualified_phase_ids: Vec<String>,
    pub won_phase_names: Vec<String>,
    pub lost_phase_names: Vec<String>,
    pub qualified_phase_names: Vec<String>,
    pub value_field: Option<String>,
    pub loss_reason_field: Option<String>,
    pub closing_date_field: Option<String>,
    pub product_field: Option<String>,
    pub seller_field: Option<String>,
}

impl IntegrationSettings {
    /// Lenient decode: unknown keys are ignored, missing keys take defaults.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    pub company_id: Uuid,
    pub source: SourceKind,
    /// Stored credential blob; revealed through a credential vault before use.
    pub credentials: Option<String>,
    pub account_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub active: bool,
    pub settings: IntegrationSettings,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// One campaign on one calendar day, as reported by the ads API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAdRow {
    pub campaign_id: String,
    pub campaign_name: String,
    pub date: NaiveDate,
    pub spend: f64,
    pub impressions: i64,
    pub clicks: i64,
    pub reach: i64,
    pub leads: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField {
    pub name: String,
    pub value: Option<String>,
}

/// A pipeline card as retrieved from the CRM, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCard {
    pub id: String,
    pub title: String,
    pub phase: Option<PhaseRef>,
    pub labels: Vec<String>,
    pub fields: Vec<CustomField>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub assignees: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    New,
    Qualified,
    Won,
    Lost,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::New => "new",
            DealStatus::Qualified => "qualified",
            DealStatus::Won => "won",
            DealStatus::Lost => "lost",
        }
    }
}

impl FromStr for DealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(DealStatus::New),
            "qualified" => Ok(DealStatus::Qualified),
            "won" => Ok(DealStatus::Won),
            "lost" => Ok(DealStatus::Lost),
            other => Err(format!("unknown deal status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    PaidAds,
    Organic,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::PaidAds => "paid_ads",
            Channel::Organic => "organic",
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paid_ads" => Ok(Channel::PaidAds),
            "organic" => Ok(Channel::Organic),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// A card with its derived status, money value, category tags and bucketing dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedDeal {
    pub card_id: String,
    pub title: String,
    pub phase_id: Option<String>,
    pub phase_name: Option<String>,
    pub status: DealStatus,
    /// `None` when the value field is absent or unparsable; distinct from a zero-value deal.
    pub amount: Option<f64>,
    pub product: Option<String>,
    pub categories: Vec<String>,
    pub channel: Channel,
    pub seller: Option<String>,
    pub loss_reason: Option<String>,
    pub labels: Vec<String>,
    pub created_date: Option<NaiveDate>,
    /// Day the current status is attributed to.
    pub effective_date: Option<NaiveDate>,
}

/// Persisted detail row for one deal, keyed by `(company_id, card_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub company_id: Uuid,
    pub source: SourceKind,
    pub deal: ClassifiedDeal,
    pub synced_at: DateTime<Utc>,
}

impl DealRecord {
    pub fn natural_key(&self) -> (Uuid, String) {
        (self.company_id, self.deal.card_id.clone())
    }
}

/// Persisted campaign-day row, keyed by `(company_id, campaign_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignDay {
    pub company_id: Uuid,
    pub campaign_id: String,
    pub campaign_name: String,
    pub date: NaiveDate,
    pub spend: f64,
    pub impressions: i64,
    pub clicks: i64,
    pub reach: i64,
    pub leads: i64,
    pub categories: Vec<String>,
}

impl CampaignDay {
    pub fn natural_key(&self) -> (Uuid, String, NaiveDate) {
        (self.company_id, self.campaign_id.clone(), self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub company_id: Uuid,
    pub date: NaiveDate,
    pub source: SourceKind,
    pub label: String,
}

/// Aggregated metrics for one `(company, date, source, label)`.
///
/// CRM buckets fill the counters, ads buckets fill the sums; the other half stays zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBucket {
    pub company_id: Uuid,
    pub date: NaiveDate,
    pub source: SourceKind,
    pub label: String,
    pub created: i64,
    pub qualified: i64,
    pub converted: i64,
    pub lost: i64,
    pub won_amount: f64,
    pub spend: f64,
    pub impressions: i64,
    pub clicks: i64,
    pub reach: i64,
    pub leads: i64,
}

impl MetricBucket {
    pub fn empty(key: BucketKey) -> Self {
        Self {
            company_id: key.company_id,
            date: key.date,
            source: key.source,
            label: key.label,
            created: 0,
            qualified: 0,
            converted: 0,
            lost: 0,
            won_amount: 0.0,
            spend: 0.0,
            impressions: 0,
            clicks: 0,
            reach: 0,
            leads: 0,
        }
    }

    pub fn key(&self) -> BucketKey {
        BucketKey {
            company_id: self.company_id,
            date: self.date,
            source: self.source,
            label: self.label.clone(),
        }
    }

    /// `converted / created * 100`, or 0 when nothing was created.
    pub fn conversion_rate(&self) -> f64 {
        ratio(self.converted as f64, self.created as f64) * 100.0
    }

    pub fn ctr(&self) -> f64 {
        ratio(self.clicks as f64, self.impressions as f64) * 100.0
    }

    pub fn cpc(&self) -> f64 {
        ratio(self.spend, self.clicks as f64)
    }

    pub fn cost_per_lead(&self) -> f64 {
        ratio(self.spend, self.leads as f64)
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

/// Append-only audit record, one per source per sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub id: Uuid,
    pub company_id: Uuid,
    pub source: SourceKind,
    pub status: SyncStatus,
    pub message: String,
    pub record_count: i64,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
