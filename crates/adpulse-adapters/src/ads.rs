//! Paginated client for the ads insights API.

use std::sync::Arc;

use adpulse_core::{DateRange, RawAdRow};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{AdapterError, ApiTransport};

pub const DEFAULT_ADS_API_BASE: &str = "https://graph.facebook.com/v19.0";
pub const INSIGHT_FIELDS: &str =
    "campaign_id,campaign_name,spend,impressions,clicks,reach,actions,date_start";

/// Every delivery status, so paused, archived and deleted campaigns still report history.
pub const ALL_EFFECTIVE_STATUSES: [&str; 8] = [
    "ACTIVE",
    "PAUSED",
    "ARCHIVED",
    "DELETED",
    "CAMPAIGN_PAUSED",
    "ADSET_PAUSED",
    "IN_PROCESS",
    "WITH_ISSUES",
];

/// Lead action types checked in order; the first present one wins outright.
pub const LEAD_ACTION_PRIORITY: [&str; 3] =
    ["lead", "onsite_conversion.lead_grouped", "leadgen_grouped"];

const NON_LEAD_AGGREGATES: [&str; 1] = ["offsite_complete_registration_add_meta_leads"];

#[derive(Debug, Clone)]
pub struct AdsFetcherConfig {
    pub api_base: String,
    pub page_limit: u32,
    pub max_pages: usize,
}

impl Default for AdsFetcherConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_ADS_API_BASE.to_string(),
            page_limit: 500,
            max_pages: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdsFetch {
    pub rows: Vec<RawAdRow>,
    pub pages: usize,
    /// True when the page cap stopped pagination while a next cursor was still available.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdAction {
    pub action_type: String,
    pub value: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    fn as_f64(&self) -> f64 {
        match self {
            Numeric::Number(n) => *n,
            Numeric::Text(s) => s.trim().parse().unwrap_or(0.0),
        }
    }

    fn as_i64(&self) -> i64 {
        match self {
            Numeric::Number(n) => *n as i64,
            Numeric::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .or_else(|_| s.parse::<f64>().map(|v| v as i64))
                    .unwrap_or(0)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct InsightsPage {
    #[serde(default)]
    data: Vec<InsightRow>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsightRow {
    campaign_id: Option<String>,
    #[serde(default)]
    campaign_name: String,
    spend: Option<Numeric>,
    impressions: Option<Numeric>,
    clicks: Option<Numeric>,
    reach: Option<Numeric>,
    #[serde(default)]
    actions: Vec<RawAction>,
    date_start: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    action_type: String,
    value: Numeric,
}

/// Lead count by fixed priority; falls back to the largest remaining lead-like action.
pub fn extract_leads(actions: &[AdAction]) -> i64 {
    for wanted in LEAD_ACTION_PRIORITY {
        if let Some(action) = actions.iter().find(|a| a.action_type == wanted) {
            return action.value;
        }
    }
    actions
        .iter()
        .filter(|a| {
            a.action_type.contains("lead")
                && !a.action_type.contains("grouped")
                && !NON_LEAD_AGGREGATES.contains(&a.action_type.as_str())
        })
        .map(|a| a.value)
        .max()
        .unwrap_or(0)
}

fn normalize_row(raw: InsightRow) -> Option<RawAdRow> {
    let date = raw
        .date_start
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());
    let (Some(campaign_id), Some(date)) = (raw.campaign_id, date) else {
        debug!(campaign = %raw.campaign_name, "skipping insight row without campaign id or date");
        return None;
    };
    let actions: Vec<AdAction> = raw
        .actions
        .iter()
        .map(|a| AdAction {
            action_type: a.action_type.clone(),
            value: a.value.as_i64(),
        })
        .collect();
    Some(RawAdRow {
        campaign_id,
        campaign_name: raw.campaign_name,
        date,
        spend: raw.spend.as_ref().map_or(0.0, Numeric::as_f64),
        impressions: raw.impressions.as_ref().map_or(0, Numeric::as_i64),
        clicks: raw.clicks.as_ref().map_or(0, Numeric::as_i64),
        reach: raw.reach.as_ref().map_or(0, Numeric::as_i64),
        leads: extract_leads(&actions),
    })
}

fn account_path(account_id: &str) -> String {
    let id = account_id.trim();
    if id.starts_with("act_") {
        id.to_string()
    } else {
        format!("act_{id}")
    }
}

/// Stateless insights fetcher; safe to share across concurrent company syncs.
pub struct AdsInsightFetcher {
    transport: Arc<dyn ApiTransport>,
    config: AdsFetcherConfig,
}

impl AdsInsightFetcher {
    pub fn new(transport: Arc<dyn ApiTransport>, config: AdsFetcherConfig) -> Self {
        Self { transport, config }
    }

    pub fn insights_url(
        &self,
        account_id: &str,
        token: &str,
        range: DateRange,
    ) -> Result<String, AdapterError> {
        if range.since > range.until {
            return Err(AdapterError::InvalidRequest(format!(
                "since {} is after until {}",
                range.since, range.until
            )));
        }
        let time_range = json!({
            "since": range.since.format("%Y-%m-%d").to_string(),
            "until": range.until.format("%Y-%m-%d").to_string(),
        })
        .to_string();
        let filtering = json!([{
            "field": "campaign.effective_status",
            "operator": "IN",
            "value": ALL_EFFECTIVE_STATUSES,
        }])
        .to_string();
        let limit = self.config.page_limit.to_string();
        let query = serde_urlencoded::to_string([
            ("access_token", token),
            ("time_range", time_range.as_str()),
            ("fields", INSIGHT_FIELDS),
            ("level", "campaign"),
            ("time_increment", "1"),
            ("limit", limit.as_str()),
            ("filtering", filtering.as_str()),
        ])
        .map_err(|err| AdapterError::InvalidRequest(err.to_string()))?;
        Ok(format!(
            "{}/{}/insights?{query}",
            self.config.api_base.trim_end_matches('/'),
            account_path(account_id)
        ))
    }

    /// Every daily campaign row in `range`, following `paging.next` up to the page cap.
    pub async fn fetch_daily(
        &self,
        account_id: &str,
        token: &str,
        range: DateRange,
    ) -> Result<AdsFetch, AdapterError> {
        let mut next = Some(self.insights_url(account_id, token, range)?);
        let mut rows = Vec::new();
        let mut pages = 0usize;
        let mut truncated = false;

        while let Some(url) = next.take() {
            if pages >= self.config.max_pages {
                truncated = true;
                warn!(
                    account = %account_path(account_id),
                    pages,
                    rows = rows.len(),
                    "ads insights page cap reached; results are incomplete"
                );
                break;
            }

            let value = self.transport.get_json(&url).await?;
            let page: InsightsPage =
                serde_json::from_value(value).map_err(|err| AdapterError::Decode {
                    api: "ads insights",
                    message: err.to_string(),
                })?;
            pages += 1;

            rows.extend(page.data.into_iter().filter_map(normalize_row));
            next = page
                .paging
                .and_then(|p| p.next)
                .filter(|n| !n.trim().is_empty());
        }

        info!(
            account = %account_path(account_id),
            pages,
            rows = rows.len(),
            truncated,
            "fetched ads insights"
        );
        Ok(AdsFetch {
            rows,
            pages,
            truncated,
        })
    }
}
