//! HTTP transport and the storage boundary for adpulse.

mod http;
mod memory;
mod postgres;
mod store;

pub use http::{
    classify_reqwest_error, classify_status, redact_url, BackoffPolicy, FetchError,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{MetricStore, StoreError, UpsertBatch};

pub const CRATE_NAME: &str = "adpulse-storage";
