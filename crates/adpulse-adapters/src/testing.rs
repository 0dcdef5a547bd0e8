//! Network-free `ApiTransport` for tests and dry runs.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use adpulse_storage::FetchError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::ApiTransport;

type Reply = Result<JsonValue, FetchError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub url: String,
    pub body: Option<JsonValue>,
}

/// Replays canned replies in order, per URL prefix. The first route whose
/// prefix matches the request URL answers it; an exhausted route replies 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<(String, VecDeque<Reply>)>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    /// Single catch-all route.
    pub fn new(replies: Vec<Reply>) -> Self {
        Self::default().with_route("", replies)
    }

    pub fn with_route(self, prefix: &str, replies: Vec<Reply>) -> Self {
        lock(&self.routes).push((prefix.to_string(), replies.into()));
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    fn reply(&self, url: &str, body: Option<&JsonValue>) -> Reply {
        lock(&self.requests).push(RecordedRequest {
            url: url.to_string(),
            body: body.cloned(),
        });
        lock(&self.routes)
            .iter_mut()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .and_then(|(_, replies)| replies.pop_front())
            .unwrap_or_else(|| {
                Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                    body: "no scripted reply".to_string(),
                })
            })
    }
}

#[async_trait]
impl ApiTransport for ScriptedTransport {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        self.reply(url, None)
    }

    async fn post_json(
        &self,
        url: &str,
        _bearer: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        self.reply(url, Some(body))
    }
}
