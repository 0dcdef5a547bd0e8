//! GraphQL client for the CRM pipeline API.

use std::collections::HashSet;
use std::sync::Arc;

use adpulse_core::{CustomField, PhaseRef, RawCard};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::text::parse_timestamp;
use crate::{AdapterError, ApiTransport};

pub const DEFAULT_CRM_API_URL: &str = "https://api.pipefy.com/graphql";

const PIPE_QUERY: &str = "query Pipe($pipeId: ID!) { \
pipe(id: $pipeId) { id name phases { id name cards_count } labels { id name } } }";

const CARDS_QUERY: &str = "query Cards($pipeId: ID!, $last: Int!, $before: String) { \
allCards(pipeId: $pipeId, last: $last, before: $before) { \
pageInfo { hasPreviousPage startCursor } \
edges { node { id title createdAt updated_at finished_at \
current_phase { id name } labels { id name } assignees { name } fields { name value } } } } }";

#[derive(Debug, Clone)]
pub struct CrmFetcherConfig {
    pub api_url: String,
    pub page_size: u32,
    pub max_pages: usize,
}

impl Default for CrmFetcherConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_CRM_API_URL.to_string(),
            page_size: 50,
            max_pages: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseInfo {
    pub id: String,
    pub name: String,
    pub cards_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrmFetch {
    pub phases: Vec<PhaseInfo>,
    pub labels: Vec<LabelInfo>,
    /// Newest first; unique by id.
    pub cards: Vec<RawCard>,
    pub pages: usize,
    pub truncated: bool,
}

/// Ids arrive as strings from the API and as numbers from webhooks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FlexibleId {
    Text(String),
    Number(i64),
}

impl FlexibleId {
    fn into_string(self) -> String {
        match self {
            FlexibleId::Text(s) => s,
            FlexibleId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NamedNode {
    id: Option<FlexibleId>,
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldNode {
    name: Option<String>,
    value: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct PipeRef {
    id: FlexibleId,
}

/// One card as delivered by the card query or a webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct CardNode {
    id: FlexibleId,
    title: Option<String>,
    #[serde(alias = "createdAt")]
    created_at: Option<String>,
    #[serde(alias = "updatedAt")]
    updated_at: Option<String>,
    #[serde(alias = "finishedAt")]
    finished_at: Option<String>,
    #[serde(alias = "currentPhase", alias = "phase")]
    current_phase: Option<NamedNode>,
    labels: Option<Vec<NamedNode>>,
    assignees: Option<Vec<NamedNode>>,
    fields: Option<Vec<FieldNode>>,
    pipe: Option<PipeRef>,
}

fn field_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        JsonValue::Array(items) => {
            let parts: Vec<String> = items.into_iter().filter_map(field_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        other => Some(other.to_string()),
    }
}

impl CardNode {
    pub fn id(&self) -> String {
        self.id.clone().into_string()
    }

    pub fn pipeline_id(&self) -> Option<String> {
        self.pipe.as_ref().map(|p| p.id.clone().into_string())
    }

    pub fn into_raw_card(self) -> RawCard {
        let phase = self.current_phase.and_then(|p| {
            Some(PhaseRef {
                id: p.id?.into_string(),
                name: p.name.unwrap_or_default(),
            })
        });
        RawCard {
            id: self.id.into_string(),
            title: self.title.unwrap_or_default(),
            phase,
            labels: self
                .labels
                .unwrap_or_default()
                .into_iter()
                .filter_map(|l| l.name)
                .collect(),
            fields: self
                .fields
                .unwrap_or_default()
                .into_iter()
                .filter_map(|f| {
                    Some(CustomField {
                        name: f.name?,
                        value: f.value.and_then(field_text),
                    })
                })
                .collect(),
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            updated_at: self.updated_at.as_deref().and_then(parse_timestamp),
            finished_at: self.finished_at.as_deref().and_then(parse_timestamp),
            assignees: self
                .assignees
                .unwrap_or_default()
                .into_iter()
                .filter_map(|a| a.name)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PipeData {
    pipe: Option<PipeNode>,
}

#[derive(Debug, Deserialize)]
struct PipeNode {
    phases: Option<Vec<PhaseNode>>,
    labels: Option<Vec<NamedNode>>,
}

#[derive(Debug, Deserialize)]
struct PhaseNode {
    id: FlexibleId,
    name: Option<String>,
    cards_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CardsData {
    #[serde(rename = "allCards")]
    all_cards: Option<CardConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardConnection {
    page_info: PageInfo,
    #[serde(default)]
    edges: Vec<CardEdge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_previous_page: bool,
    start_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CardEdge {
    node: CardNode,
}

fn decode<T: serde::de::DeserializeOwned>(value: JsonValue) -> Result<T, AdapterError> {
    serde_json::from_value(value).map_err(|err| AdapterError::Decode {
        api: "crm",
        message: err.to_string(),
    })
}

/// Stateless pipeline fetcher; safe to share across concurrent company syncs.
pub struct CrmCardFetcher {
    transport: Arc<dyn ApiTransport>,
    config: CrmFetcherConfig,
}

impl CrmCardFetcher {
    pub fn new(transport: Arc<dyn ApiTransport>, config: CrmFetcherConfig) -> Self {
        Self { transport, config }
    }

    /// Runs one GraphQL operation and returns its `data` member. Any entry in
    /// `errors` fails the whole call, even when partial data came back.
    async fn graphql(
        &self,
        token: &str,
        query: &str,
        variables: JsonValue,
    ) -> Result<JsonValue, AdapterError> {
        let body = json!({ "query": query, "variables": variables });
        let mut response = self
            .transport
            .post_json(&self.config.api_url, token, &body)
            .await?;

        if let Some(errors) = response.get("errors").and_then(JsonValue::as_array) {
            if !errors.is_empty() {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.get("message")
                            .and_then(JsonValue::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| e.to_string())
                    })
                    .collect();
                return Err(AdapterError::GraphQl(messages.join("; ")));
            }
        }

        match response.get_mut("data").map(JsonValue::take) {
            Some(data) if !data.is_null() => Ok(data),
            _ => Err(AdapterError::Decode {
                api: "crm",
                message: "response has no data".to_string(),
            }),
        }
    }

    async fn fetch_metadata(
        &self,
        pipeline_id: &str,
        token: &str,
    ) -> Result<(Vec<PhaseInfo>, Vec<LabelInfo>), AdapterError> {
        let data: PipeData = decode(
            self.graphql(token, PIPE_QUERY, json!({ "pipeId": pipeline_id }))
                .await?,
        )?;
        let pipe = data.pipe.ok_or_else(|| AdapterError::Decode {
            api: "crm",
            message: format!("pipe {pipeline_id} not found"),
        })?;

        let phases = pipe
            .phases
            .unwrap_or_default()
            .into_iter()
            .map(|p| PhaseInfo {
                id: p.id.into_string(),
                name: p.name.unwrap_or_default(),
                cards_count: p.cards_count.unwrap_or(0),
            })
            .collect();
        let labels = pipe
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|l| {
                Some(LabelInfo {
                    id: l.id?.into_string(),
                    name: l.name.unwrap_or_default(),
                })
            })
            .collect();
        Ok((phases, labels))
    }

    /// Phase and label metadata plus every card in the pipeline, walking
    /// backward from the newest card so a capped run keeps the most recent ones.
    pub async fn fetch_pipeline(
        &self,
        pipeline_id: &str,
        token: &str,
    ) -> Result<CrmFetch, AdapterError> {
        let (phases, labels) = self.fetch_metadata(pipeline_id, token).await?;

        let mut cards = Vec::new();
        let mut seen = HashSet::new();
        let mut before: Option<String> = None;
        let mut pages = 0usize;
        let mut truncated = false;

        loop {
            if pages >= self.config.max_pages {
                truncated = true;
                warn!(
                    pipeline_id,
                    pages,
                    cards = cards.len(),
                    "crm page cap reached; oldest cards were not retrieved"
                );
                break;
            }

            let variables = json!({
                "pipeId": pipeline_id,
                "last": self.config.page_size,
                "before": before,
            });
            let data: CardsData = decode(self.graphql(token, CARDS_QUERY, variables).await?)?;
            let connection = data.all_cards.ok_or_else(|| AdapterError::Decode {
                api: "crm",
                message: "allCards missing from response".to_string(),
            })?;
            pages += 1;

            let mut page_cards: Vec<RawCard> = connection
                .edges
                .into_iter()
                .map(|edge| edge.node.into_raw_card())
                .collect();
            // Pages list oldest to newest; keep the whole result newest first.
            page_cards.reverse();
            for card in page_cards {
                if seen.insert(card.id.clone()) {
                    cards.push(card);
                } else {
                    debug!(card_id = %card.id, "dropping duplicate card across pages");
                }
            }

            match connection.page_info.start_cursor {
                Some(cursor) if connection.page_info.has_previous_page => before = Some(cursor),
                _ => break,
            }
        }

        info!(
            pipeline_id,
            pages,
            cards = cards.len(),
            truncated,
            "fetched crm cards"
        );
        Ok(CrmFetch {
            phases,
            labels,
            cards,
            pages,
            truncated,
        })
    }
}
