//! Typed pipeline errors.
//!
//! Every failure that can leave the acquisition pipeline is a
//! [`PipelineError`]. Retry loops inspect [`PipelineError::retryable`]
//! instead of re-classifying errors after the fact, and the trigger layer
//! serializes any error with [`PipelineError::to_json`] so a failed run
//! still produces a flat, deterministic response object.

use serde_json::{json, Map, Value};
use thiserror::Error;

/// HTTP statuses that the fetch engine treats as transient.
pub const RETRYABLE_STATUSES: [u16; 3] = [429, 503, 504];

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No refresh secret (or client credential) configured for a region.
    #[error("missing credential for scope {scope}; checked: {}", checked.join(", "))]
    MissingCredential { scope: String, checked: Vec<String> },

    /// The refresh-token exchange did not return a usable access token.
    #[error("token exchange failed ({status}): {message}")]
    AuthExchange { status: u16, message: String },

    /// A vendor API call came back non-2xx (or never completed, status 0).
    #[error("{message}")]
    ApiRequest {
        message: String,
        status: u16,
        stage: String,
        run_id: String,
        debug: Map<String, Value>,
    },

    /// A marketplace id that is not in the scope's lookup table.
    #[error("unknown marketplace id: {marketplace_id}")]
    UnknownDimension { marketplace_id: String },

    /// Row-level insert failures reported by the sink.
    #[error("sink write to {table} failed with {} row error(s)", errors.len())]
    SinkWrite { table: String, errors: Vec<Value> },

    /// A detail (order items) lookup failed mid-aggregation.
    #[error("order items fetch failed for {order_id} ({dimension}): {source}")]
    DetailFetch {
        order_id: String,
        dimension: String,
        partial: Value,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// True only for API errors whose status is in [`RETRYABLE_STATUSES`].
    pub fn retryable(&self) -> bool {
        match self {
            Self::ApiRequest { status, .. } => RETRYABLE_STATUSES.contains(status),
            _ => false,
        }
    }

    /// HTTP-ish status for the response object (0 when not applicable).
    pub fn status(&self) -> u16 {
        match self {
            Self::ApiRequest { status, .. } | Self::AuthExchange { status, .. } => *status,
            Self::DetailFetch { source, .. } => source.status(),
            _ => 0,
        }
    }

    /// Pipeline stage the error belongs to.
    pub fn stage(&self) -> &str {
        match self {
            Self::MissingCredential { .. } | Self::AuthExchange { .. } => "auth",
            Self::ApiRequest { stage, .. } => stage,
            Self::UnknownDimension { .. } => "aggregate",
            Self::SinkWrite { .. } | Self::Storage(_) => "sink",
            Self::DetailFetch { .. } => "order_items",
            Self::Config(_) => "config",
        }
    }

    /// Flatten into the `{ok, status, stage, run_id, error, debug}` shape.
    ///
    /// `run_id` is taken from the error when it carries one, otherwise the
    /// caller's id is used.
    pub fn to_json(&self, run_id: &str) -> Value {
        let mut debug = Map::new();
        let mut id = run_id.to_string();

        match self {
            Self::ApiRequest {
                debug: d,
                run_id: r,
                ..
            } => {
                debug = d.clone();
                if !r.is_empty() {
                    id = r.clone();
                }
            }
            Self::MissingCredential { checked, .. } => {
                debug.insert("checked".into(), json!(checked));
            }
            Self::SinkWrite { table, errors } => {
                debug.insert("table".into(), json!(table));
                debug.insert("errors".into(), Value::Array(errors.clone()));
            }
            Self::DetailFetch {
                order_id,
                dimension,
                partial,
                source,
            } => {
                debug.insert("order_id".into(), json!(order_id));
                debug.insert("country".into(), json!(dimension));
                debug.insert("partial_breakdown".into(), partial.clone());
                let inner = source.to_json(run_id);
                if let Some(inner_id) = inner.get("run_id").and_then(Value::as_str) {
                    id = inner_id.to_string();
                }
                debug.insert("cause".into(), inner);
            }
            _ => {}
        }

        json!({
            "ok": false,
            "status": self.status(),
            "stage": self.stage(),
            "run_id": id,
            "error": self.to_string(),
            "debug": Value::Object(debug),
        })
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
