//! Authenticated calls to the regional vendor API hosts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::ApiConfig;
use crate::credentials::CredentialProvider;
use crate::error::PipelineResult;
use crate::http_client::{HttpClient, HttpMethod, HttpRequest};
use crate::normalize::{normalize, ApiResult};
use crate::region::Region;
use crate::signer::{QueryParams, Signer, UnsignedRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
}

impl RequestBody {
    fn encode(&self) -> (Vec<u8>, Option<&'static str>) {
        match self {
            Self::Empty => (Vec::new(), None),
            Self::Json(value) => (value.to_string().into_bytes(), Some("application/json")),
        }
    }
}

/// One vendor API call, before credentials are attached.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub method: HttpMethod,
    pub path: String,
    pub query: QueryParams,
    pub body: RequestBody,
    pub headers: BTreeMap<String, String>,
}

impl ApiCall {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self {
            method,
            path,
            query: QueryParams::new(),
            body: RequestBody::Empty,
            headers: BTreeMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn with_query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), Some(value.into()));
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

pub struct Transport {
    http: Arc<dyn HttpClient>,
    credentials: Arc<CredentialProvider>,
    signer: Signer,
    user_agent: String,
    timeout: Duration,
}

impl Transport {
    pub fn new(
        http: Arc<dyn HttpClient>,
        credentials: Arc<CredentialProvider>,
        api: &ApiConfig,
    ) -> Self {
        Self {
            http,
            credentials,
            signer: Signer::new(api.signing_service.clone()),
            user_agent: api.user_agent.clone(),
            timeout: Duration::from_secs(api.timeout_secs),
        }
    }

    /// Issue `call` against `region`. Never fails: network and credential
    /// problems come back as `ok=false, status=0`.
    pub async fn request(&self, region: Region, call: &ApiCall) -> ApiResult {
        match self.request_checked(region, call).await {
            Ok(result) => result,
            Err(err) => {
                let mut debug = base_debug(region, call);
                debug.insert("credential_error".into(), err.to_json(""));
                ApiResult::failed(err.to_string(), debug)
            }
        }
    }

    /// Like [`Transport::request`], but credential failures surface as
    /// typed errors.
    pub async fn request_checked(&self, region: Region, call: &ApiCall) -> PipelineResult<ApiResult> {
        let (access_token, token_debug) = self.credentials.access_token(region).await?;
        let signing = self.credentials.secrets().signing_credentials(region)?;

        let now = Utc::now();
        let host = region.host();
        let (body, content_type) = call.body.encode();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host.to_string());
        headers.insert(
            "x-amz-date".to_string(),
            now.format("%Y%m%dT%H%M%SZ").to_string(),
        );
        headers.insert("x-amz-access-token".to_string(), access_token);
        headers.insert("user-agent".to_string(), self.user_agent.clone());
        if let Some(ct) = content_type {
            headers.insert("content-type".to_string(), ct.to_string());
        }
        for (name, value) in &call.headers {
            headers.insert(name.trim().to_ascii_lowercase(), value.clone());
        }

        let signed = self.signer.sign(
            &UnsignedRequest {
                method: call.method.as_str(),
                host,
                path: &call.path,
                query: &call.query,
                headers: &headers,
                body: &body,
            },
            &signing,
            region.signing_region(),
            now,
        );

        let url = if signed.canonical_query.is_empty() {
            format!("https://{}{}", host, signed.path)
        } else {
            format!("https://{}{}?{}", host, signed.path, signed.canonical_query)
        };

        let mut request = HttpRequest::new(call.method, url)
            .with_body(signed.body)
            .with_timeout(self.timeout);
        request.headers = signed.headers;

        let mut debug = base_debug(region, call);
        debug.insert(
            "lwa".into(),
            serde_json::to_value(&token_debug).unwrap_or(Value::Null),
        );

        match self.http.execute(request).await {
            Ok(response) => {
                debug.insert("status_code".into(), json!(response.status));
                debug.insert(
                    "request_id".into(),
                    json!(response
                        .header("x-amzn-requestid")
                        .or_else(|| response.header("x-amz-request-id"))),
                );
                debug.insert(
                    "rid".into(),
                    json!(response
                        .header("x-amz-rid")
                        .or_else(|| response.header("x-amzn-rid"))),
                );
                debug!(
                    region = %region,
                    method = %call.method,
                    path = %call.path,
                    status = response.status,
                    "vendor api call"
                );
                Ok(normalize(response.status, &response.body, debug))
            }
            Err(err) => {
                debug.insert("status_code".into(), json!(0));
                Ok(ApiResult::failed(err.message, debug))
            }
        }
    }
}

fn base_debug(region: Region, call: &ApiCall) -> Map<String, Value> {
    let query: Map<String, Value> = call
        .query
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), json!(v))))
        .collect();
    let mut debug = Map::new();
    debug.insert("region".into(), json!(region.as_str()));
    debug.insert("host".into(), json!(region.host()));
    debug.insert("signing_region".into(), json!(region.signing_region()));
    debug.insert("method".into(), json!(call.method.as_str()));
    debug.insert("path".into(), json!(call.path));
    debug.insert("query".into(), Value::Object(query));
    debug.insert("status_code".into(), Value::Null);
    debug.insert("request_id".into(), Value::Null);
    debug.insert("rid".into(), Value::Null);
    debug
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Secrets;
    use crate::error::PipelineError;
    use crate::http_client::{HttpResponse, ScriptedHttpClient};

    pub(crate) const TOKEN_PATH: &str = "/auth/o2/token";

    pub(crate) fn test_secrets() -> Secrets {
        Secrets::from_lookup(|name| match name {
            "LWA_CLIENT_ID" => Some("cid".to_string()),
            "LWA_CLIENT_SECRET" => Some("csecret".to_string()),
            "LWA_REFRESH_TOKEN" => Some("refresh".to_string()),
            "AWS_ACCESS_KEY_ID" => Some("AKIDEXAMPLE".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("secret".to_string()),
            _ => None,
        })
    }

    /// Transport over a scripted client with one token exchange queued.
    pub(crate) fn scripted_transport(secrets: Secrets) -> (Arc<ScriptedHttpClient>, Transport) {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(
            HttpMethod::Post,
            TOKEN_PATH,
            200,
            json!({"access_token": "Atza|test", "expires_in": 3600}),
        );
        let api = ApiConfig::default();
        let credentials = Arc::new(CredentialProvider::new(http.clone(), secrets, &api));
        let transport = Transport::new(http.clone(), credentials, &api);
        (http, transport)
    }

    #[tokio::test]
    async fn test_signed_request_shape() {
        let (http, transport) = scripted_transport(test_secrets());
        http.push(
            HttpMethod::Get,
            "/orders/v0/orders",
            Ok(HttpResponse::new(200, r#"{"payload":{"Orders":[]}}"#)
                .with_header("x-amzn-RequestId", "req-1")),
        );

        let call = ApiCall::get("orders/v0/orders")
            .with_param("PageSize", "10")
            .with_param("MarketplaceIds", "A1PA6795UKMFR9")
            .with_header("X-Custom", "yes");
        let result = transport.request(Region::Eu, &call).await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.debug["request_id"], "req-1");
        assert_eq!(result.debug["signing_region"], "eu-west-1");
        assert_eq!(result.debug["lwa"]["cached"], false);

        let sent = http.requests_to("/orders/v0/orders").remove(0);
        assert_eq!(
            sent.url,
            "https://sellingpartnerapi-eu.amazon.com/orders/v0/orders?MarketplaceIds=A1PA6795UKMFR9&PageSize=10"
        );
        assert_eq!(sent.headers["x-amz-access-token"], "Atza|test");
        assert_eq!(sent.headers["x-custom"], "yes");
        assert!(!sent.headers.contains_key("content-type"));
        let auth = &sent.headers["authorization"];
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("/eu-west-1/execute-api/aws4_request"));
        assert!(auth.contains("x-amz-access-token"));
    }

    #[tokio::test]
    async fn test_json_body_sets_content_type() {
        let (http, transport) = scripted_transport(test_secrets());
        http.push_json(HttpMethod::Post, "/x", 200, json!({}));
        let call = ApiCall::new(HttpMethod::Post, "/x").with_json(json!({"a": 1}));
        transport.request(Region::Na, &call).await;
        let sent = http.requests_to("/x").remove(0);
        assert_eq!(sent.headers["content-type"], "application/json");
        assert_eq!(sent.body, br#"{"a":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_network_failure_is_status_zero() {
        let (_http, transport) = scripted_transport(test_secrets());
        let result = transport.request(Region::Na, &ApiCall::get("/nothing")).await;
        assert!(!result.ok);
        assert_eq!(result.status, 0);
        assert!(result.debug.contains_key("exception"));
    }

    #[tokio::test]
    async fn test_credential_failure_checked_vs_raw() {
        let (_http, transport) = scripted_transport(Secrets::default());
        let call = ApiCall::get("/orders/v0/orders");

        let raw = transport.request(Region::Na, &call).await;
        assert!(!raw.ok);
        assert_eq!(raw.status, 0);
        assert_eq!(raw.debug["credential_error"]["stage"], "auth");

        let checked = transport.request_checked(Region::Na, &call).await;
        assert!(matches!(checked, Err(PipelineError::MissingCredential { .. })));
    }
}
