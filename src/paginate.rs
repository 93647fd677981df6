//! Cursor pagination over "next token" style list endpoints.
//!
//! ```text
//! Start ──► FetchPage ──ok──► MorePages? ──yes──► (pace) ──► FetchPage
//!              │  ▲                  │
//!   429/503/504│  │backoff           no
//!              ▼  │                  ▼
//!           RetryPage              Done
//! ```
//!
//! The first request carries the window filters; continuation requests
//! carry only the sticky parameters plus the token. Fetching stops at the
//! first of: no token, `max_pages` pages, or `max_records` records (which
//! may cut the last page short). When the query carries an `accept` filter,
//! rejected entries are skipped before they count toward `max_records`.

use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::PipelineResult;
use crate::region::Region;
use crate::retry::{with_retry, RetryPolicy, Sleeper};
use crate::signer::QueryParams;
use crate::transport::{ApiCall, Transport};

/// What to fetch and how the response is shaped.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub region: Region,
    pub path: String,
    /// Sent on every page.
    pub sticky: QueryParams,
    /// Sent on the first page only.
    pub first_page: QueryParams,
    /// Payload key holding the page's record array.
    pub records_key: String,
    /// Key of the continuation token in the payload or `pagination` object.
    pub token_key: String,
    /// Query parameter that carries the token on continuation requests.
    pub token_param: String,
    /// Stage label for errors.
    pub stage: String,
    /// Entries failing this check are dropped and never count as records.
    pub accept: Option<fn(&Value) -> bool>,
}

impl PageQuery {
    pub fn new(region: Region, path: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            region,
            path: path.into(),
            sticky: QueryParams::new(),
            first_page: QueryParams::new(),
            records_key: "Orders".to_string(),
            token_key: "NextToken".to_string(),
            token_param: "NextToken".to_string(),
            stage: stage.into(),
            accept: None,
        }
    }

    pub fn sticky(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sticky.insert(key.into(), Some(value.into()));
        self
    }

    pub fn first_page(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.first_page.insert(key.into(), Some(value.into()));
        self
    }

    pub fn records_key(mut self, key: impl Into<String>) -> Self {
        self.records_key = key.into();
        self
    }

    pub fn accept(mut self, check: fn(&Value) -> bool) -> Self {
        self.accept = Some(check);
        self
    }

    /// Token read from and sent back under the same name.
    pub fn token(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.token_param = key.clone();
        self.token_key = key;
        self
    }

    fn params_for(&self, token: Option<&str>) -> QueryParams {
        let mut params = self.sticky.clone();
        match token {
            None => params.extend(self.first_page.clone()),
            Some(token) => {
                params.insert(self.token_param.clone(), Some(token.to_string()));
            }
        }
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub max_pages: usize,
    pub max_records: usize,
    pub pacing: Duration,
    pub policy: RetryPolicy,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_pages: 50,
            max_records: 5000,
            pacing: Duration::from_millis(150),
            policy: RetryPolicy::list(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub records: Vec<Value>,
    pub pages: usize,
    pub diagnostics: Map<String, Value>,
}

/// Walk every page of `query` within `limits`.
pub async fn fetch_all(
    transport: &Transport,
    sleeper: &dyn Sleeper,
    run_id: &str,
    query: &PageQuery,
    limits: FetchLimits,
) -> PipelineResult<FetchOutcome> {
    let max_pages = limits.max_pages.max(1);
    let mut records: Vec<Value> = Vec::new();
    let mut pages = 0usize;
    let mut skipped = 0usize;
    let mut token: Option<String> = None;

    loop {
        let call = ApiCall::get(query.path.as_str()).with_query(query.params_for(token.as_deref()));
        let call = &call;
        let result = with_retry(limits.policy, sleeper, &query.stage, run_id, || {
            transport.request_checked(query.region, call)
        })
        .await?;

        pages += 1;
        let batch = result.records(&query.records_key);
        let batch_len = batch.len();
        let room = limits.max_records.saturating_sub(records.len());
        let mut kept = 0usize;
        for record in batch {
            if kept == room {
                break;
            }
            if query.accept.is_some_and(|check| !check(&record)) {
                skipped += 1;
                continue;
            }
            records.push(record);
            kept += 1;
        }
        token = result.next_token(&query.token_key);

        info!(
            run_id,
            stage = %query.stage,
            page = pages,
            records_in_batch = batch_len,
            total_records = records.len(),
            has_next_token = token.is_some(),
            "fetched page"
        );

        if token.is_none() || pages >= max_pages || records.len() >= limits.max_records {
            break;
        }
        sleeper.sleep(limits.pacing).await;
    }

    let mut diagnostics = Map::new();
    diagnostics.insert("pages_fetched".into(), json!(pages));
    diagnostics.insert("records_raw".into(), json!(records.len() + skipped));
    diagnostics.insert("records_skipped".into(), json!(skipped));
    diagnostics.insert("truncated".into(), json!(token.is_some()));

    Ok(FetchOutcome {
        records,
        pages,
        diagnostics,
    })
}
