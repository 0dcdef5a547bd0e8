use std::path::Path;

use adpulse_core::CustomField;
use anyhow::Context;
use serde::Deserialize;

use crate::text::normalize_text;
use crate::AdapterError;

const DEFAULT_RULES: &str = include_str!("../rules/default.yaml");

/// Keyword and field-name lists driving classification and tagging.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSet {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    pub categories: Vec<CategoryRule>,
    #[serde(default)]
    pub phases: PhaseKeywords,
    #[serde(default)]
    pub channels: ChannelRules,
    #[serde(default)]
    pub fields: FieldCandidates,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRule {
    pub id: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseKeywords {
    #[serde(default)]
    pub lost: Vec<String>,
    #[serde(default)]
    pub won: Vec<String>,
    #[serde(default)]
    pub qualified: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelRules {
    #[serde(default)]
    pub paid_tokens: Vec<String>,
    #[serde(default)]
    pub utm_fields: Vec<String>,
    #[serde(default)]
    pub paid_utm_values: Vec<String>,
}

/// Candidate custom-field names per logical attribute, in priority order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldCandidates {
    #[serde(default)]
    pub amount: Vec<String>,
    #[serde(default)]
    pub product: Vec<String>,
    #[serde(default)]
    pub seller: Vec<String>,
    #[serde(default)]
    pub closing_date: Vec<String>,
    #[serde(default)]
    pub loss_reason: Vec<String>,
}

impl RuleSet {
    pub fn builtin() -> Result<Self, AdapterError> {
        Self::from_yaml_str(DEFAULT_RULES)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, AdapterError> {
        let rules: RuleSet =
            serde_yaml::from_str(text).map_err(|err| AdapterError::Rules(err.to_string()))?;
        Ok(rules.normalized())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn normalized(mut self) -> Self {
        for category in &mut self.categories {
            category.id = category.id.trim().to_string();
            normalize_all(&mut category.keywords);
        }
        self.categories.retain(|c| !c.id.is_empty());
        for list in [
            &mut self.phases.lost,
            &mut self.phases.won,
            &mut self.phases.qualified,
            &mut self.channels.paid_tokens,
            &mut self.channels.utm_fields,
            &mut self.channels.paid_utm_values,
            &mut self.fields.amount,
            &mut self.fields.product,
            &mut self.fields.seller,
            &mut self.fields.closing_date,
            &mut self.fields.loss_reason,
        ] {
            normalize_all(list);
        }
        self
    }
}

fn normalize_all(list: &mut Vec<String>) {
    *list = list
        .iter()
        .map(|s| normalize_text(s))
        .filter(|s| !s.is_empty())
        .collect();
}

/// Value of the first non-empty custom field matching, in order, the explicit
/// override name and then each candidate (normalized substring match on the field name).
pub fn lookup_field<'a>(
    fields: &'a [CustomField],
    explicit: Option<&str>,
    candidates: &[String],
) -> Option<&'a str> {
    let explicit = explicit.map(normalize_text).filter(|s| !s.is_empty());
    let names: Vec<String> = fields.iter().map(|f| normalize_text(&f.name)).collect();
    let value_at = move |idx: usize| {
        fields[idx]
            .value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(explicit) = &explicit {
        if let Some(value) = (0..fields.len())
            .filter(|&i| names[i] == *explicit)
            .find_map(&value_at)
        {
            return Some(value);
        }
    }

    explicit
        .iter()
        .chain(candidates.iter())
        .find_map(|candidate| {
            (0..fields.len())
                .filter(|&i| names[i].contains(candidate.as_str()))
                .find_map(&value_at)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: Option<&str>) -> CustomField {
        CustomField {
            name: name.to_string(),
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn builtin_rules_parse_and_normalize() {
        let rules = RuleSet::builtin().unwrap();
        assert_eq!(rules.categories.first().map(|c| c.id.as_str()), Some("condominial"));
        assert!(rules.phases.qualified.contains(&"cotacao".to_string()));
        assert!(rules.channels.paid_tokens.contains(&"meta ads".to_string()));
        assert!(rules.fields.amount.iter().all(|c| c == &normalize_text(c)));
    }

    #[test]
    fn yaml_keywords_are_folded_on_load() {
        let rules = RuleSet::from_yaml_str(
            "version: 1\nphases:\n  won: ['Apólice Emitida']\ncategories:\n  - id: ' vida '\n    keywords: ['Seguro de VIDA']\n",
        )
        .unwrap();
        assert_eq!(rules.phases.won, vec!["apolice emitida".to_string()]);
        assert_eq!(rules.categories[0].id, "vida");
        assert_eq!(rules.categories[0].keywords, vec!["seguro de vida".to_string()]);
    }

    #[test]
    fn malformed_rules_are_reported() {
        assert!(matches!(
            RuleSet::from_yaml_str("categories: 12"),
            Err(AdapterError::Rules(_))
        ));
    }

    #[test]
    fn field_lookup_follows_priority_and_skips_blanks() {
        let fields = vec![
            field("Valor", Some("100,00")),
            field("Valor do Prêmio", Some("  ")),
            field("Valor total", Some("2.000,00")),
        ];
        let candidates = vec!["valor do premio".to_string(), "valor total".to_string()];
        assert_eq!(lookup_field(&fields, None, &candidates), Some("2.000,00"));
        assert_eq!(lookup_field(&fields, Some("valor"), &candidates), Some("100,00"));
        assert_eq!(lookup_field(&fields, Some("Inexistente"), &candidates), Some("2.000,00"));
        assert_eq!(lookup_field(&[], None, &candidates), None);
    }
}
