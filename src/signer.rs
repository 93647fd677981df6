//! AWS Signature Version 4 request signing.
//!
//! The vendor API authenticates every call with SigV4 on top of the bearer
//! access token. Canonicalization here has to be bit-exact: the server
//! recomputes the same signature and rejects the call (401/403) on any
//! mismatch.
//!
//! ```text
//! canonical request = METHOD \n PATH \n QUERY \n HEADERS \n SIGNED_HEADERS \n PAYLOAD_HASH
//! string to sign    = AWS4-HMAC-SHA256 \n TIMESTAMP \n SCOPE \n hex(sha256(canonical request))
//! signature         = hex(hmac(kSigning, string to sign))
//! ```
//!
//! Uses only `hmac`, `sha2` and `hex`; the signer is a pure function of its
//! inputs and the supplied timestamp.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Service name in the credential scope for the vendor API.
pub const DEFAULT_SERVICE: &str = "execute-api";

/// Query parameters; `None` values are dropped during canonicalization.
pub type QueryParams = BTreeMap<String, Option<String>>;

/// Build [`QueryParams`] from string pairs.
pub fn query_params<I, K, V>(pairs: I) -> QueryParams
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), Some(v.into())))
        .collect()
}

/// Long-lived signing key pair.
#[derive(Clone)]
pub struct SigningCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Request parts covered by the signature.
#[derive(Debug, Clone, Copy)]
pub struct UnsignedRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a QueryParams,
    pub headers: &'a BTreeMap<String, String>,
    pub body: &'a [u8],
}

/// A request ready to send. Built per call; the embedded timestamp makes
/// it invalid to replay later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: String,
    pub path: String,
    pub canonical_query: String,
    /// Lower-cased header set including `authorization`.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub payload_hash: String,
}

#[derive(Debug, Clone)]
pub struct Signer {
    service: String,
}

impl Default for Signer {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl Signer {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Sign `req` for `signing_region` at instant `now`.
    ///
    /// `host` and `x-amz-date` are added to the signed header set when the
    /// caller did not provide them, as is `x-amz-security-token` when the
    /// credentials carry a session token.
    pub fn sign(
        &self,
        req: &UnsignedRequest<'_>,
        creds: &SigningCredentials,
        signing_region: &str,
        now: DateTime<Utc>,
    ) -> SignedRequest {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let method = req.method.to_ascii_uppercase();

        let mut headers = canonicalize_header_map(req.headers);
        headers
            .entry("host".to_string())
            .or_insert_with(|| req.host.to_string());
        headers
            .entry("x-amz-date".to_string())
            .or_insert_with(|| amz_date.clone());
        if let Some(token) = &creds.session_token {
            headers
                .entry("x-amz-security-token".to_string())
                .or_insert_with(|| token.clone());
        }

        let canonical_query = canonical_query_string(req.query);
        let (canonical_headers, signed_headers) = canonical_headers(&headers);
        let payload_hash = hex_sha256(req.body);

        let canonical_request = [
            method.as_str(),
            req.path,
            canonical_query.as_str(),
            canonical_headers.as_str(),
            signed_headers.as_str(),
            payload_hash.as_str(),
        ]
        .join("\n");

        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, signing_region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &creds.secret_access_key,
            &date_stamp,
            signing_region,
            &self.service,
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, creds.access_key_id, credential_scope, signed_headers, signature
        );
        headers.insert("authorization".to_string(), authorization);

        SignedRequest {
            method,
            path: req.path.to_string(),
            canonical_query,
            headers,
            body: req.body.to_vec(),
            payload_hash,
        }
    }
}

/// Sorted `key=value` pairs joined with `&`, both sides percent-encoded.
pub fn canonical_query_string(query: &QueryParams) -> String {
    // BTreeMap iteration is already sorted by key.
    query
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| format!("{}={}", uri_encode(k), uri_encode(v))))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonicalize_header_map(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.trim().to_ascii_lowercase(),
                v.split_whitespace().collect::<Vec<_>>().join(" "),
            )
        })
        .collect()
}

/// Returns `(canonical_headers, signed_headers)`.
///
/// Names are lower-cased and values whitespace-collapsed before sorting.
pub fn canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let cleaned = canonicalize_header_map(headers);
    let canonical: String = cleaned
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed = cleaned.keys().map(String::as_str).collect::<Vec<_>>().join(";");
    (canonical, signed)
}

/// Lower-case hex SHA-256, used for the payload hash and the hashed
/// canonical request.
pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Signing key for one day, region and service: the secret is folded
/// through `date_stamp`, `region`, `service` and the `aws4_request`
/// terminator, each step keyed by the previous digest.
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let seed = format!("AWS4{}", secret_key).into_bytes();
    [date_stamp, region, service, "aws4_request"]
        .iter()
        .fold(seed, |key, part| hmac_sha256(&key, part.as_bytes()))
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

/// Percent-encodes every byte outside `A-Z a-z 0-9 - _ . ~` as `%XX`
/// (upper-case hex). Used for query keys, query values and path segments,
/// so a space is always `%20`.
pub fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if is_unreserved(byte) {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push_str(&format!("{:02X}", byte));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    fn example_creds() -> SigningCredentials {
        SigningCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: SECRET.to_string(),
            session_token: None,
        }
    }

    #[test]
    fn test_canonical_query_sorted() {
        let mut query = QueryParams::new();
        query.insert("b".into(), Some("2".into()));
        query.insert("a".into(), Some("1".into()));
        assert_eq!(canonical_query_string(&query), "a=1&b=2");
    }

    #[test]
    fn test_canonical_query_drops_none_and_encodes() {
        let mut query = QueryParams::new();
        query.insert("MarketplaceIds".into(), Some("A1,B2".into()));
        query.insert("NextToken".into(), None);
        query.insert("CreatedAfter".into(), Some("2024-01-01T00:00:00Z".into()));
        query.insert("q".into(), Some("a b~c".into()));
        assert_eq!(
            canonical_query_string(&query),
            "CreatedAfter=2024-01-01T00%3A00%3A00Z&MarketplaceIds=A1%2CB2&q=a%20b~c"
        );
    }

    #[test]
    fn test_canonical_headers_lowercase_collapse_sort() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Amz-Date".to_string(), "20150830T123600Z".to_string());
        headers.insert("Host".to_string(), "example.amazonaws.com".to_string());
        headers.insert("My-Header".to_string(), "  a   b \t c ".to_string());
        let (canonical, signed) = canonical_headers(&headers);
        assert_eq!(
            canonical,
            "host:example.amazonaws.com\nmy-header:a b c\nx-amz-date:20150830T123600Z\n"
        );
        assert_eq!(signed, "host;my-header;x-amz-date");
    }

    #[test]
    fn test_empty_payload_hash() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_derive_signing_key_known_vector() {
        let key = derive_signing_key(SECRET, "20120215", "us-east-1", "iam");
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_get_vanilla_signature() {
        let query = QueryParams::new();
        let headers = BTreeMap::new();
        let req = UnsignedRequest {
            method: "GET",
            host: "example.amazonaws.com",
            path: "/",
            query: &query,
            headers: &headers,
            body: b"",
        };
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let signed = Signer::new("service").sign(&req, &example_creds(), "us-east-1", now);

        assert_eq!(
            signed.headers["authorization"],
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
        assert_eq!(signed.headers["x-amz-date"], "20150830T123600Z");
        assert_eq!(signed.headers["host"], "example.amazonaws.com");
    }

    #[test]
    fn test_sign_is_deterministic() {
        let query = query_params([("PageSize", "100"), ("MarketplaceIds", "ATVPDKIKX0DER")]);
        let mut headers = BTreeMap::new();
        headers.insert("x-amz-access-token".to_string(), "Atza|token".to_string());
        headers.insert("user-agent".to_string(), "mpull/0.1".to_string());
        let body = br#"{"a":1}"#;
        let req = UnsignedRequest {
            method: "post",
            host: "sellingpartnerapi-na.amazon.com",
            path: "/orders/v0/orders",
            query: &query,
            headers: &headers,
            body,
        };
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let signer = Signer::default();

        let first = signer.sign(&req, &example_creds(), "us-east-1", now);
        let second = signer.sign(&req, &example_creds(), "us-east-1", now);
        assert_eq!(first, second);
        assert_eq!(first.method, "POST");
        assert_eq!(first.payload_hash, hex_sha256(body));
        assert!(first.headers["authorization"].contains(
            "SignedHeaders=host;user-agent;x-amz-access-token;x-amz-date"
        ));

        let later = signer.sign(&req, &example_creds(), "us-east-1", now + chrono::Duration::seconds(1));
        assert_ne!(first.headers["authorization"], later.headers["authorization"]);
    }

    #[test]
    fn test_session_token_is_signed() {
        let query = QueryParams::new();
        let headers = BTreeMap::new();
        let req = UnsignedRequest {
            method: "GET",
            host: "example.amazonaws.com",
            path: "/",
            query: &query,
            headers: &headers,
            body: b"",
        };
        let mut creds = example_creds();
        creds.session_token = Some("session".to_string());
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let signed = Signer::new("service").sign(&req, &creds, "us-east-1", now);
        assert_eq!(signed.headers["x-amz-security-token"], "session");
        assert!(signed.headers["authorization"]
            .contains("SignedHeaders=host;x-amz-date;x-amz-security-token"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", example_creds());
        assert!(!rendered.contains(SECRET));
        assert!(rendered.contains("AKIDEXAMPLE"));
    }
}
