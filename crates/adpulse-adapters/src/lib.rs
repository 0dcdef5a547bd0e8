//! Upstream fetchers and the per-record classification used by the sync pipeline.

use adpulse_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod ads;
pub mod classify;
pub mod crm;
pub mod rules;
pub mod tags;
pub mod testing;
pub mod text;

pub use ads::{extract_leads, AdAction, AdsFetch, AdsFetcherConfig, AdsInsightFetcher};
pub use classify::DealClassifier;
pub use crm::{CardNode, CrmCardFetcher, CrmFetch, CrmFetcherConfig, LabelInfo, PhaseInfo};
pub use rules::{lookup_field, RuleSet};
pub use tags::{active_categories, CardTags, TagExtractor};

pub const CRATE_NAME: &str = "adpulse-adapters";

/// JSON request seam between the fetchers and the network.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError>;

    async fn post_json(
        &self,
        url: &str,
        bearer: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError>;
}

#[async_trait]
impl ApiTransport for HttpFetcher {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        HttpFetcher::get_json(self, url).await
    }

    async fn post_json(
        &self,
        url: &str,
        bearer: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        HttpFetcher::post_json(self, url, bearer, body).await
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("graphql errors: {0}")]
    GraphQl(String),
    #[error("unexpected {api} payload: {message}")]
    Decode { api: &'static str, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid rule set: {0}")]
    Rules(String),
}

impl AdapterError {
    /// Rejected credentials, as opposed to an upstream outage or a bad payload.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, AdapterError::Fetch(err) if err.is_unauthorized())
    }
}
