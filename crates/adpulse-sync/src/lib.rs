//! Aggregation, write planning and orchestration of ads and CRM syncs.

pub mod aggregate;
pub mod config;
pub mod orchestrator;
pub mod plan;
pub mod scheduler;
pub mod vault;
pub mod webhook;

pub use aggregate::{aggregate_ad_rows, aggregate_deals, campaign_days};
pub use config::SyncConfig;
pub use orchestrator::{
    CompanySyncReport, Orchestrator, OrchestratorSettings, SourceError, SyncError,
};
pub use plan::{WritePlan, WritePlanner, WriteReport};
pub use scheduler::{build_scheduler, maybe_build_scheduler};
pub use vault::{CredentialError, CredentialVault, PlaintextVault};
pub use webhook::{CardEvent, CardEventData, CARD_DELETE_ACTION};

pub const CRATE_NAME: &str = "adpulse-sync";
