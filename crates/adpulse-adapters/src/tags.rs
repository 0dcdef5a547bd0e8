use std::collections::BTreeSet;
use std::sync::Arc;

use adpulse_core::{Channel, IntegrationSettings, RawCard};

use crate::rules::{lookup_field, RuleSet};
use crate::text::{contains_term, normalize_text};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardTags {
    /// Matched category ids in rule order.
    pub categories: Vec<String>,
    pub channel: Channel,
}

/// Derives category and channel tags from labels, fields and campaign names.
#[derive(Debug, Clone)]
pub struct TagExtractor {
    rules: Arc<RuleSet>,
}

impl TagExtractor {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    /// Category ids, in rule order, whose keywords occur in any of `texts`.
    pub fn categories_in<'a, I>(&self, texts: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let normalized: Vec<String> = texts.into_iter().map(normalize_text).collect();
        self.rules
            .categories
            .iter()
            .filter(|category| {
                category
                    .keywords
                    .iter()
                    .any(|kw| normalized.iter().any(|text| contains_term(text, kw)))
            })
            .map(|category| category.id.clone())
            .collect()
    }

    pub fn tag_campaign(&self, campaign_name: &str) -> Vec<String> {
        self.categories_in([campaign_name])
    }

    pub fn tag_card(&self, card: &RawCard, settings: &IntegrationSettings) -> CardTags {
        let product = lookup_field(
            &card.fields,
            settings.product_field.as_deref(),
            &self.rules.fields.product,
        );
        let texts = card
            .labels
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(card.title.as_str()))
            .chain(product);

        CardTags {
            categories: self.categories_in(texts),
            channel: self.channel_for(card),
        }
    }

    fn channel_for(&self, card: &RawCard) -> Channel {
        let channels = &self.rules.channels;
        let paid_label = card.labels.iter().any(|label| {
            let label = normalize_text(label);
            channels.paid_tokens.iter().any(|t| contains_term(&label, t))
        });
        if paid_label {
            return Channel::PaidAds;
        }

        let paid_utm = card.fields.iter().any(|field| {
            let name = normalize_text(&field.name);
            if !channels.utm_fields.iter().any(|f| name.contains(f.as_str())) {
                return false;
            }
            let value = field.value.as_deref().map(normalize_text).unwrap_or_default();
            channels.paid_utm_values.iter().any(|v| contains_term(&value, v))
        });
        if paid_utm {
            Channel::PaidAds
        } else {
            Channel::Organic
        }
    }
}

/// Union of every category matched by any record; only these get per-category buckets.
pub fn active_categories<'a, I>(tagged: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    tagged.into_iter().flatten().cloned().collect()
}
