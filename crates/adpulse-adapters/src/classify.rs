use std::sync::Arc;

use adpulse_core::{ClassifiedDeal, DealStatus, IntegrationSettings, PhaseRef, RawCard};
use chrono::NaiveDate;

use crate::rules::{lookup_field, RuleSet};
use crate::tags::CardTags;
use crate::text::{normalize_text, parse_flexible_date, parse_money};

/// Pure mapping from a card's current phase and fields to a classified deal.
#[derive(Debug, Clone)]
pub struct DealClassifier {
    rules: Arc<RuleSet>,
}

fn id_listed(ids: &[String], phase_id: &str) -> bool {
    ids.iter().any(|id| id.trim() == phase_id)
}

fn name_listed(names: &[String], phase_name: &str) -> bool {
    names.iter().any(|name| normalize_text(name) == phase_name)
}

fn keyword_hit(keywords: &[String], phase_name: &str) -> bool {
    keywords
        .iter()
        .any(|kw| !kw.is_empty() && phase_name.contains(kw.as_str()))
}

impl DealClassifier {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    /// Ids first, then explicit names, then keywords; lost before won before qualified at each step.
    pub fn status_for(&self, phase: Option<&PhaseRef>, settings: &IntegrationSettings) -> DealStatus {
        let Some(phase) = phase else {
            return DealStatus::New;
        };
        let phase_id = phase.id.trim();
        let phase_name = normalize_text(&phase.name);

        let by_id = [
            (&settings.lost_phase_ids, DealStatus::Lost),
            (&settings.won_phase_ids, DealStatus::Won),
            (&settings.qualified_phase_ids, DealStatus::Qualified),
        ];
        if let Some((_, status)) = by_id.iter().find(|(ids, _)| id_listed(ids, phase_id)) {
            return *status;
        }

        let by_name = [
            (&settings.lost_phase_names, DealStatus::Lost),
            (&settings.won_phase_names, DealStatus::Won),
            (&settings.qualified_phase_names, DealStatus::Qualified),
        ];
        if let Some((_, status)) = by_name
            .iter()
            .find(|(names, _)| name_listed(names, &phase_name))
        {
            return *status;
        }

        let keywords = &self.rules.phases;
        if keyword_hit(&keywords.lost, &phase_name) {
            DealStatus::Lost
        } else if keyword_hit(&keywords.won, &phase_name) {
            DealStatus::Won
        } else if keyword_hit(&keywords.qualified, &phase_name) {
            DealStatus::Qualified
        } else {
            DealStatus::New
        }
    }

    fn closing_date(&self, card: &RawCard, settings: &IntegrationSettings) -> Option<NaiveDate> {
        lookup_field(
            &card.fields,
            settings.closing_date_field.as_deref(),
            &self.rules.fields.closing_date,
        )
        .and_then(parse_flexible_date)
    }

    /// Day a status is attributed to. Closing events fall back through the
    /// closing-date field, finish, update and creation timestamps.
    pub fn effective_date(
        &self,
        card: &RawCard,
        status: DealStatus,
        settings: &IntegrationSettings,
    ) -> Option<NaiveDate> {
        let created = card.created_at.map(|t| t.date_naive());
        let updated = card.updated_at.map(|t| t.date_naive());
        match status {
            DealStatus::Won | DealStatus::Lost => self
                .closing_date(card, settings)
                .or_else(|| card.finished_at.map(|t| t.date_naive()))
                .or(updated)
                .or(created),
            DealStatus::Qualified => updated.or(created),
            DealStatus::New => created,
        }
    }

    pub fn classify(
        &self,
        card: &RawCard,
        tags: &CardTags,
        settings: &IntegrationSettings,
    ) -> ClassifiedDeal {
        let fields = &self.rules.fields;
        let status = self.status_for(card.phase.as_ref(), settings);

        let amount = lookup_field(&card.fields, settings.value_field.as_deref(), &fields.amount)
            .and_then(parse_money);
        let product = tags.categories.first().cloned().or_else(|| {
            lookup_field(&card.fields, settings.product_field.as_deref(), &fields.product)
                .map(normalize_text)
                .filter(|p| !p.is_empty())
        });
        let seller = lookup_field(&card.fields, settings.seller_field.as_deref(), &fields.seller)
            .map(str::to_string)
            .or_else(|| card.assignees.first().cloned());
        let loss_reason = match status {
            DealStatus::Lost => lookup_field(
                &card.fields,
                settings.loss_reason_field.as_deref(),
                &fields.loss_reason,
            )
            .map(str::to_string),
            _ => None,
        };

        ClassifiedDeal {
            card_id: card.id.clone(),
            title: card.title.clone(),
            phase_id: card.phase.as_ref().map(|p| p.id.clone()),
            phase_name: card.phase.as_ref().map(|p| p.name.clone()),
            status,
            amount,
            product,
            categories: tags.categories.clone(),
            channel: tags.channel,
            seller,
            loss_reason,
            labels: card.labels.clone(),
            created_date: card.created_at.map(|t| t.date_naive()),
            effective_date: self.effective_date(card, status, settings),
        }
    }
}
