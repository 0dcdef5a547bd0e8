//! Daily per-label bucketing of classified deals and campaign days.

use std::collections::{BTreeMap, BTreeSet};

use adpulse_adapters::TagExtractor;
use adpulse_core::{
    BucketKey, CampaignDay, ClassifiedDeal, DealStatus, MetricBucket, RawAdRow, SourceKind,
    ALL_LABEL,
};
use chrono::NaiveDate;
use uuid::Uuid;

struct Buckets {
    company_id: Uuid,
    source: SourceKind,
    rows: BTreeMap<(NaiveDate, String), MetricBucket>,
}

impl Buckets {
    fn new(company_id: Uuid, source: SourceKind) -> Self {
        Self {
            company_id,
            source,
            rows: BTreeMap::new(),
        }
    }

    fn at(&mut self, date: NaiveDate, label: &str) -> &mut MetricBucket {
        let (company_id, source) = (self.company_id, self.source);
        self.rows
            .entry((date, label.to_string()))
            .or_insert_with(|| {
                MetricBucket::empty(BucketKey {
                    company_id,
                    date,
                    source,
                    label: label.to_string(),
                })
            })
    }

    /// Sorted by (date, label).
    fn into_vec(self) -> Vec<MetricBucket> {
        self.rows.into_values().collect()
    }
}

/// The aggregate label followed by every active category the record matched.
fn labels_for<'a>(categories: &'a [String], active: &'a BTreeSet<String>) -> Vec<&'a str> {
    std::iter::once(ALL_LABEL)
        .chain(
            categories
                .iter()
                .filter(|c| active.contains(*c))
                .map(String::as_str),
        )
        .collect()
}

/// CRM buckets: creations on the creation day, status events on the effective day.
pub fn aggregate_deals(
    company_id: Uuid,
    deals: &[ClassifiedDeal],
    active: &BTreeSet<String>,
) -> Vec<MetricBucket> {
    let mut buckets = Buckets::new(company_id, SourceKind::Crm);

    for deal in deals {
        let labels = labels_for(&deal.categories, active);

        if let Some(created) = deal.created_date {
            for label in &labels {
                buckets.at(created, label).created += 1;
            }
        }

        let Some(effective) = deal.effective_date else {
            continue;
        };
        for label in &labels {
            let bucket = buckets.at(effective, label);
            match deal.status {
                DealStatus::New => {}
                DealStatus::Qualified => bucket.qualified += 1,
                DealStatus::Won => {
                    bucket.converted += 1;
                    bucket.won_amount += deal.amount.unwrap_or(0.0);
                }
                DealStatus::Lost => bucket.lost += 1,
            }
        }
    }

    buckets.into_vec()
}

/// One tagged campaign day per (campaign, date); a repeated row replaces the earlier one.
pub fn campaign_days(company_id: Uuid, rows: &[RawAdRow], tags: &TagExtractor) -> Vec<CampaignDay> {
    let mut days: BTreeMap<(String, NaiveDate), CampaignDay> = BTreeMap::new();
    for row in rows {
        days.insert(
            (row.campaign_id.clone(), row.date),
            CampaignDay {
                company_id,
                campaign_id: row.campaign_id.clone(),
                campaign_name: row.campaign_name.clone(),
                date: row.date,
                spend: row.spend,
                impressions: row.impressions,
                clicks: row.clicks,
                reach: row.reach,
                leads: row.leads,
                categories: tags.tag_campaign(&row.campaign_name),
            },
        );
    }
    days.into_values().collect()
}

/// Ads buckets: sums per (date, label). Every row counts toward the aggregate label.
pub fn aggregate_ad_rows(
    company_id: Uuid,
    days: &[CampaignDay],
    active: &BTreeSet<String>,
) -> Vec<MetricBucket> {
    let mut buckets = Buckets::new(company_id, SourceKind::Ads);

    for day in days {
        for label in labels_for(&day.categories, active) {
            let bucket = buckets.at(day.date, label);
            bucket.spend += day.spend;
            bucket.impressions += day.impressions;
            bucket.clicks += day.clicks;
            bucket.reach += day.reach;
            bucket.leads += day.leads;
        }
    }

    buckets.into_vec()
}
