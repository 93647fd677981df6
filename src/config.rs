use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::region::{Region, GENERIC_REFRESH_SLOT};
use crate::signer::SigningCredentials;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/marketpull.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_token_timeout_secs")]
    pub token_timeout_secs: u64,
    #[serde(default = "default_signing_service")]
    pub signing_service: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            token_url: default_token_url(),
            token_timeout_secs: default_token_timeout_secs(),
            signing_service: default_signing_service(),
        }
    }
}

fn default_user_agent() -> String {
    format!("marketpull/{}", env!("CARGO_PKG_VERSION"))
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_token_url() -> String {
    "https://api.amazon.com/auth/o2/token".to_string()
}
fn default_token_timeout_secs() -> u64 {
    30
}
fn default_signing_service() -> String {
    crate::signer::DEFAULT_SERVICE.to_string()
}

/// Which timestamp pair bounds the order window on the first page.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    Created,
    LastUpdated,
}

impl FilterMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::LastUpdated => "LastUpdated",
        }
    }

    /// Query keys for the window start and end.
    pub const fn window_keys(self) -> (&'static str, &'static str) {
        match self {
            Self::Created => ("CreatedAfter", "CreatedBefore"),
            Self::LastUpdated => ("LastUpdatedAfter", "LastUpdatedBefore"),
        }
    }
}

impl std::str::FromStr for FilterMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "lastupdated" | "last_updated" => Ok(Self::LastUpdated),
            other => Err(PipelineError::Config(format!(
                "unknown filter mode: '{}'. Must be Created or LastUpdated.",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_orders")]
    pub max_orders: usize,
    #[serde(default = "default_page_pacing_ms")]
    pub page_pacing_ms: u64,
    #[serde(default = "default_item_pacing_ms")]
    pub item_pacing_ms: u64,
    #[serde(default = "default_primary_channel")]
    pub primary_channel: String,
    #[serde(default)]
    pub filter_mode: FilterMode,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            max_orders: default_max_orders(),
            page_pacing_ms: default_page_pacing_ms(),
            item_pacing_ms: default_item_pacing_ms(),
            primary_channel: default_primary_channel(),
            filter_mode: FilterMode::default(),
        }
    }
}

fn default_page_size() -> u32 {
    100
}
fn default_max_pages() -> usize {
    50
}
fn default_max_orders() -> usize {
    5000
}
fn default_page_pacing_ms() -> u64 {
    150
}
fn default_item_pacing_ms() -> u64 {
    80
}
fn default_primary_channel() -> String {
    "Amazon".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default = "default_orders_raw")]
    pub orders_raw: String,
    #[serde(default = "default_orders_daily_agg")]
    pub orders_daily_agg: String,
    #[serde(default = "default_order_items_raw")]
    pub order_items_raw: String,
    #[serde(default = "default_sales_asin_daily")]
    pub sales_asin_daily: String,
    #[serde(default = "default_inventory_fba")]
    pub inventory_fba: String,
    #[serde(default = "default_inventory_awd")]
    pub inventory_awd: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            orders_raw: default_orders_raw(),
            orders_daily_agg: default_orders_daily_agg(),
            order_items_raw: default_order_items_raw(),
            sales_asin_daily: default_sales_asin_daily(),
            inventory_fba: default_inventory_fba(),
            inventory_awd: default_inventory_awd(),
        }
    }
}

fn default_orders_raw() -> String {
    "orders_raw".to_string()
}
fn default_orders_daily_agg() -> String {
    "orders_daily_agg".to_string()
}
fn default_order_items_raw() -> String {
    "order_items_raw".to_string()
}
fn default_sales_asin_daily() -> String {
    "sales_asin_daily".to_string()
}
fn default_inventory_fba() -> String {
    "inventory_fba_asin".to_string()
}
fn default_inventory_awd() -> String {
    "inventory_awd_asin".to_string()
}

impl SinkConfig {
    pub fn all_tables(&self) -> [&str; 6] {
        [
            &self.orders_raw,
            &self.orders_daily_agg,
            &self.order_items_raw,
            &self.sales_asin_daily,
            &self.inventory_fba,
            &self.inventory_awd,
        ]
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Like [`load_config`], falling back to defaults when the file does not exist.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

fn validate(config: &Config) -> Result<()> {
    // Validate fetch
    if !(1..=100).contains(&config.fetch.page_size) {
        anyhow::bail!("fetch.page_size must be in [1, 100]");
    }
    if config.fetch.max_pages < 1 {
        anyhow::bail!("fetch.max_pages must be >= 1");
    }
    if config.fetch.max_orders < 1 {
        anyhow::bail!("fetch.max_orders must be >= 1");
    }
    if config.fetch.primary_channel.trim().is_empty() {
        anyhow::bail!("fetch.primary_channel must not be empty");
    }

    // Validate api
    if config.api.timeout_secs == 0 || config.api.token_timeout_secs == 0 {
        anyhow::bail!("api timeouts must be > 0");
    }
    if config.api.signing_service.trim().is_empty() {
        anyhow::bail!("api.signing_service must not be empty");
    }

    // Validate sink table names
    for table in config.sink.all_tables() {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!(
                "Invalid sink table name: '{}'. Use letters, digits and underscores.",
                table
            );
        }
    }

    Ok(())
}

pub const LWA_CLIENT_ID: &str = "LWA_CLIENT_ID";
pub const LWA_CLIENT_SECRET: &str = "LWA_CLIENT_SECRET";
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// Credentials read from the process environment. Never from the TOML file.
#[derive(Clone, Default)]
pub struct Secrets {
    pub lwa_client_id: Option<String>,
    pub lwa_client_secret: Option<String>,
    /// Refresh tokens by environment slot name.
    pub refresh_tokens: BTreeMap<String, String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("lwa_client_id", &self.lwa_client_id.is_some())
            .field("lwa_client_secret", &self.lwa_client_secret.is_some())
            .field("refresh_slots", &self.refresh_tokens.keys().collect::<Vec<_>>())
            .field("aws_access_key_id", &self.aws_access_key_id.is_some())
            .field("aws_secret_access_key", &self.aws_secret_access_key.is_some())
            .field("aws_session_token", &self.aws_session_token.is_some())
            .finish()
    }
}

fn refresh_slot_names() -> Vec<&'static str> {
    let mut slots: Vec<&'static str> = Region::ALL
        .iter()
        .map(|r| r.refresh_slots()[0])
        .collect();
    slots.push(GENERIC_REFRESH_SLOT);
    slots
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name → value lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let refresh_tokens = refresh_slot_names()
            .into_iter()
            .filter_map(|slot| get(slot).map(|v| (slot.to_string(), v)))
            .collect();

        Self {
            lwa_client_id: get(LWA_CLIENT_ID),
            lwa_client_secret: get(LWA_CLIENT_SECRET),
            refresh_tokens,
            aws_access_key_id: get(AWS_ACCESS_KEY_ID),
            aws_secret_access_key: get(AWS_SECRET_ACCESS_KEY),
            aws_session_token: get(AWS_SESSION_TOKEN),
        }
    }

    /// First populated refresh slot for `region`, as `(slot, token)`.
    pub fn refresh_token_for(&self, region: Region) -> Result<(&str, &str), PipelineError> {
        let slots = region.refresh_slots();
        slots
            .iter()
            .find_map(|slot| {
                self.refresh_tokens
                    .get(*slot)
                    .map(|token| (*slot, token.as_str()))
            })
            .ok_or_else(|| PipelineError::MissingCredential {
                scope: region.as_str().to_string(),
                checked: slots.iter().map(|s| s.to_string()).collect(),
            })
    }

    /// `(client_id, client_secret)` for the token exchange.
    pub fn client_credentials(&self, region: Region) -> Result<(&str, &str), PipelineError> {
        match (&self.lwa_client_id, &self.lwa_client_secret) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => Err(PipelineError::MissingCredential {
                scope: region.as_str().to_string(),
                checked: vec![LWA_CLIENT_ID.to_string(), LWA_CLIENT_SECRET.to_string()],
            }),
        }
    }

    pub fn signing_credentials(&self, region: Region) -> Result<SigningCredentials, PipelineError> {
        match (&self.aws_access_key_id, &self.aws_secret_access_key) {
            (Some(id), Some(secret)) => Ok(SigningCredentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
                session_token: self.aws_session_token.clone(),
            }),
            _ => Err(PipelineError::MissingCredential {
                scope: region.as_str().to_string(),
                checked: vec![
                    AWS_ACCESS_KEY_ID.to_string(),
                    AWS_SECRET_ACCESS_KEY.to_string(),
                ],
            }),
        }
    }

    /// Presence map for `mpull env`. Values are never included.
    pub fn readiness(&self) -> Value {
        let mut present = Map::new();
        present.insert(LWA_CLIENT_ID.into(), json!(self.lwa_client_id.is_some()));
        present.insert(
            LWA_CLIENT_SECRET.into(),
            json!(self.lwa_client_secret.is_some()),
        );
        for slot in refresh_slot_names() {
            present.insert(slot.into(), json!(self.refresh_tokens.contains_key(slot)));
        }
        present.insert(
            AWS_ACCESS_KEY_ID.into(),
            json!(self.aws_access_key_id.is_some()),
        );
        present.insert(
            AWS_SECRET_ACCESS_KEY.into(),
            json!(self.aws_secret_access_key.is_some()),
        );
        present.insert(
            AWS_SESSION_TOKEN.into(),
            json!(self.aws_session_token.is_some()),
        );

        let refresh_ready = !self.refresh_tokens.is_empty();
        let missing: Vec<&str> = [
            LWA_CLIENT_ID,
            LWA_CLIENT_SECRET,
            AWS_ACCESS_KEY_ID,
            AWS_SECRET_ACCESS_KEY,
        ]
        .into_iter()
        .filter(|k| present.get(*k) != Some(&Value::Bool(true)))
        .chain((!refresh_ready).then_some(GENERIC_REFRESH_SLOT))
        .collect();

        json!({
            "ok": missing.is_empty(),
            "present": present,
            "LWA_REFRESH_TOKEN_READY": refresh_ready,
            "missing": missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn secrets(pairs: &[(&str, &str)]) -> Secrets {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Secrets::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.fetch.page_size, 100);
        assert_eq!(config.fetch.max_pages, 50);
        assert_eq!(config.fetch.max_orders, 5000);
        assert_eq!(config.fetch.page_pacing_ms, 150);
        assert_eq!(config.fetch.item_pacing_ms, 80);
        assert_eq!(config.fetch.primary_channel, "Amazon");
        assert_eq!(config.fetch.filter_mode, FilterMode::Created);
        assert_eq!(config.api.timeout_secs, 60);
        assert_eq!(config.api.token_timeout_secs, 30);
        assert_eq!(config.api.signing_service, "execute-api");
        assert_eq!(config.sink.orders_daily_agg, "orders_daily_agg");
    }

    #[test]
    fn test_load_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mpull.toml");
        std::fs::write(
            &path,
            r#"
[db]
path = "./x.sqlite"

[fetch]
page_size = 20
filter_mode = "LastUpdated"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.db.path, PathBuf::from("./x.sqlite"));
        assert_eq!(config.fetch.page_size, 20);
        assert_eq!(config.fetch.max_pages, 50);
        assert_eq!(config.fetch.filter_mode, FilterMode::LastUpdated);
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mpull.toml");
        std::fs::write(&path, "[fetch]\npage_size = 500\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mpull.toml");
        std::fs::write(&path, "[sink]\norders_raw = \"orders; drop\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_or_default(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.fetch.page_size, 100);
    }

    #[test]
    fn test_refresh_slot_priority() {
        let s = secrets(&[
            ("LWA_REFRESH_TOKEN_EU", "eu-token"),
            ("LWA_REFRESH_TOKEN", "generic"),
        ]);
        assert_eq!(s.refresh_token_for(Region::Eu).unwrap(), ("LWA_REFRESH_TOKEN_EU", "eu-token"));
        assert_eq!(s.refresh_token_for(Region::Na).unwrap(), ("LWA_REFRESH_TOKEN", "generic"));
    }

    #[test]
    fn test_missing_refresh_lists_checked_slots() {
        let s = secrets(&[("LWA_REFRESH_TOKEN_NA", "")]);
        match s.refresh_token_for(Region::Na) {
            Err(PipelineError::MissingCredential { scope, checked }) => {
                assert_eq!(scope, "NA");
                assert_eq!(checked, vec!["LWA_REFRESH_TOKEN_NA", "LWA_REFRESH_TOKEN"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_readiness_never_prints_values() {
        let s = secrets(&[
            ("LWA_CLIENT_ID", "client-abc"),
            ("LWA_CLIENT_SECRET", "shh"),
            ("LWA_REFRESH_TOKEN_FE", "fe"),
        ]);
        let r = s.readiness();
        assert_eq!(r["ok"], false);
        assert_eq!(r["LWA_REFRESH_TOKEN_READY"], true);
        assert_eq!(r["present"]["LWA_REFRESH_TOKEN_FE"], true);
        assert_eq!(r["missing"], json!(["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"]));
        let rendered = r.to_string();
        assert!(!rendered.contains("client-abc"));
        assert!(!rendered.contains("shh"));
        assert!(!format!("{:?}", s).contains("shh"));
    }
}
