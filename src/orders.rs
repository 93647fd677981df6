//! Order and order-item fetching.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::aggregate::DetailFetcher;
use crate::config::{FetchConfig, FilterMode};
use crate::error::PipelineResult;
use crate::paginate::{fetch_all, FetchLimits, PageQuery};
use crate::region::{Region, Scope};
use crate::retry::{RetryPolicy, Sleeper};
use crate::signer::uri_encode;
use crate::transport::Transport;
use crate::window::day_window_utc;

pub const ORDERS_PATH: &str = "/orders/v0/orders";

/// Page cap for one order's item list.
const MAX_ITEM_PAGES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub marketplace_id: String,
    pub status: String,
    pub sales_channel: String,
    pub raw: Value,
}

impl OrderRecord {
    /// Parse one entry of `Orders`. Entries without an order id or
    /// marketplace id are dropped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let order_id = non_empty(value.get("AmazonOrderId"))?;
        let marketplace_id = non_empty(value.get("MarketplaceId"))?;
        Some(Self {
            order_id,
            marketplace_id,
            status: non_empty(value.get("OrderStatus")).unwrap_or_default(),
            sales_channel: non_empty(value.get("SalesChannel")).unwrap_or_default(),
            raw: value.clone(),
        })
    }

    /// Whether `value` carries both ids [`OrderRecord::from_value`] needs.
    pub fn is_complete(value: &Value) -> bool {
        non_empty(value.get("AmazonOrderId")).is_some()
            && non_empty(value.get("MarketplaceId")).is_some()
    }

    /// Natural key used for count deduplication.
    pub fn key(&self) -> (&str, &str) {
        (&self.order_id, &self.marketplace_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItem {
    pub order_id: String,
    pub asin: Option<String>,
    pub seller_sku: Option<String>,
    pub quantity_ordered: i64,
    pub quantity_cancelled: i64,
    pub raw: Value,
}

impl OrderItem {
    pub fn from_value(order_id: &str, value: &Value) -> Self {
        Self {
            order_id: order_id.to_string(),
            asin: non_empty(value.get("ASIN")),
            seller_sku: non_empty(value.get("SellerSKU")),
            quantity_ordered: int_field(value.get("QuantityOrdered")),
            quantity_cancelled: int_field(value.get("QuantityCancelled")),
            raw: value.clone(),
        }
    }

    /// Net units: ordered minus cancelled, floored at zero.
    pub fn units(&self) -> u64 {
        self.quantity_ordered
            .saturating_sub(self.quantity_cancelled)
            .max(0) as u64
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer from a number or numeric string; anything else is 0.
fn int_field(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// UTC bounds of one reporting day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub snapshot_date: NaiveDate,
    pub timezone: String,
    pub start_utc: String,
    pub end_utc: String,
}

impl TimeWindow {
    /// Local-midnight window of `snapshot_date` in the scope's timezone,
    /// with optional overrides for either bound.
    pub fn for_day(
        scope: Scope,
        snapshot_date: NaiveDate,
        start_override: Option<String>,
        end_override: Option<String>,
    ) -> PipelineResult<Self> {
        let tz = scope.timezone();
        let (start, end) = day_window_utc(tz, snapshot_date)?;
        Ok(Self {
            snapshot_date,
            timezone: tz.name().to_string(),
            start_utc: start_override.unwrap_or(start),
            end_utc: end_override.unwrap_or(end),
        })
    }
}

/// The list-orders query for `scope` over `window`. Incomplete orders are
/// filtered out while paging, so `max_orders` caps usable orders only.
pub fn orders_query(scope: Scope, window: &TimeWindow, fetch: &FetchConfig) -> PageQuery {
    let (after_key, before_key) = fetch.filter_mode.window_keys();
    PageQuery::new(scope.region(), ORDERS_PATH, "orders_list")
        .sticky("MarketplaceIds", scope.marketplace_ids().join(","))
        .sticky("PageSize", fetch.page_size.to_string())
        .first_page(after_key, window.start_utc.clone())
        .first_page(before_key, window.end_utc.clone())
        .records_key("Orders")
        .token("NextToken")
        .accept(OrderRecord::is_complete)
}

#[derive(Debug, Clone)]
pub struct OrdersFetch {
    pub orders: Vec<OrderRecord>,
    pub diagnostics: Map<String, Value>,
}

/// Fetch every order of `scope` inside `window`.
pub async fn fetch_orders(
    transport: &Transport,
    sleeper: &dyn Sleeper,
    run_id: &str,
    scope: Scope,
    window: &TimeWindow,
    fetch: &FetchConfig,
    debug: bool,
) -> PipelineResult<OrdersFetch> {
    info!(
        run_id,
        scope = %scope,
        start = %window.start_utc,
        end = %window.end_utc,
        "fetching orders"
    );

    let query = orders_query(scope, window, fetch);
    let limits = FetchLimits {
        max_pages: fetch.max_pages,
        max_records: fetch.max_orders,
        pacing: Duration::from_millis(fetch.page_pacing_ms),
        policy: RetryPolicy::list(),
    };
    let outcome = fetch_all(transport, sleeper, run_id, &query, limits).await?;

    let orders: Vec<OrderRecord> = outcome
        .records
        .iter()
        .filter_map(OrderRecord::from_value)
        .collect();

    let diagnostics = order_diagnostics(
        run_id,
        scope,
        window,
        fetch.filter_mode,
        &outcome.diagnostics,
        &orders,
        debug,
    );

    Ok(OrdersFetch {
        orders,
        diagnostics,
    })
}

fn order_diagnostics(
    run_id: &str,
    scope: Scope,
    window: &TimeWindow,
    filter_mode: FilterMode,
    page_diagnostics: &Map<String, Value>,
    orders: &[OrderRecord],
    debug: bool,
) -> Map<String, Value> {
    let unique: BTreeSet<(&str, &str)> = orders.iter().map(OrderRecord::key).collect();

    let mut diag = Map::new();
    diag.insert("run_id".into(), json!(run_id));
    diag.insert("timezone".into(), json!(window.timezone));
    diag.insert("window_start_utc".into(), json!(window.start_utc));
    diag.insert("window_end_utc".into(), json!(window.end_utc));
    diag.insert("filter_mode".into(), json!(filter_mode.as_str()));
    for (k, v) in page_diagnostics {
        diag.insert(k.clone(), v.clone());
    }
    diag.insert("records_parsed".into(), json!(orders.len()));
    diag.insert("records_dedup".into(), json!(unique.len()));

    if debug {
        let mut by_dimension: BTreeMap<&str, u64> = BTreeMap::new();
        for (_, marketplace_id) in &unique {
            *by_dimension
                .entry(scope.country_or_unknown(marketplace_id))
                .or_default() += 1;
        }
        let mut status_breakdown: BTreeMap<&str, u64> = BTreeMap::new();
        for order in orders {
            let status = order.status.trim();
            let status = if status.is_empty() { "UNKNOWN" } else { status };
            *status_breakdown.entry(status).or_default() += 1;
        }
        diag.insert("by_dimension".into(), json!(by_dimension));
        diag.insert("status_breakdown".into(), json!(status_breakdown));
    }
    diag
}

/// Every item of one order, following `NextToken`.
pub async fn fetch_order_items(
    transport: &Transport,
    sleeper: &dyn Sleeper,
    run_id: &str,
    region: Region,
    order_id: &str,
    pacing: Duration,
) -> PipelineResult<Vec<OrderItem>> {
    let query = PageQuery::new(
        region,
        format!("{}/{}/orderItems", ORDERS_PATH, uri_encode(order_id)),
        "order_items",
    )
    .records_key("OrderItems")
    .token("NextToken");
    let limits = FetchLimits {
        max_pages: MAX_ITEM_PAGES,
        max_records: usize::MAX,
        pacing,
        policy: RetryPolicy::list(),
    };
    let outcome = fetch_all(transport, sleeper, run_id, &query, limits).await?;
    Ok(outcome
        .records
        .iter()
        .map(|v| OrderItem::from_value(order_id, v))
        .collect())
}

/// [`DetailFetcher`] backed by the live order-items endpoint.
pub struct ApiDetailFetcher<'a> {
    pub transport: &'a Transport,
    pub sleeper: &'a dyn Sleeper,
    pub run_id: &'a str,
    pub region: Region,
    pub pacing: Duration,
}

#[async_trait]
impl DetailFetcher for ApiDetailFetcher<'_> {
    async fn order_items(&self, order: &OrderRecord) -> PipelineResult<Vec<OrderItem>> {
        fetch_order_items(
            self.transport,
            self.sleeper,
            self.run_id,
            self.region,
            &order.order_id,
            self.pacing,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpMethod;
    use crate::retry::RecordingSleeper;
    use crate::transport::tests::{scripted_transport, test_secrets};

    fn order(id: &str, mp: &str, status: &str) -> Value {
        json!({"AmazonOrderId": id, "MarketplaceId": mp, "OrderStatus": status, "SalesChannel": "Amazon.de"})
    }

    #[test]
    fn test_order_parsing_skips_incomplete() {
        assert!(OrderRecord::from_value(&json!({"AmazonOrderId": "1"})).is_none());
        assert!(OrderRecord::from_value(&json!({"MarketplaceId": "A"})).is_none());
        let rec = OrderRecord::from_value(&json!({"AmazonOrderId": "1", "MarketplaceId": "A"})).unwrap();
        assert_eq!(rec.status, "");
        assert_eq!(rec.sales_channel, "");
    }

    #[test]
    fn test_item_units() {
        let item = OrderItem::from_value(
            "1",
            &json!({"ASIN": "B0", "QuantityOrdered": 3, "QuantityCancelled": "1"}),
        );
        assert_eq!(item.units(), 2);
        let over = OrderItem::from_value("1", &json!({"QuantityOrdered": 1, "QuantityCancelled": 4}));
        assert_eq!(over.units(), 0);
        let junk = OrderItem::from_value("1", &json!({"QuantityOrdered": "many"}));
        assert_eq!(junk.units(), 0);
        assert_eq!(junk.asin, None);
    }

    #[test]
    fn test_item_units_saturate_on_extreme_quantities() {
        let item = OrderItem::from_value(
            "1",
            &json!({"QuantityOrdered": i64::MIN, "QuantityCancelled": i64::MAX}),
        );
        assert_eq!(item.units(), 0);
        let item = OrderItem::from_value(
            "1",
            &json!({"QuantityOrdered": i64::MAX, "QuantityCancelled": i64::MIN}),
        );
        assert_eq!(item.units(), i64::MAX as u64);
    }

    #[test]
    fn test_orders_query_filter_modes() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let window = TimeWindow::for_day(Scope::Eu, day, None, None).unwrap();
        assert_eq!(window.timezone, "Europe/Berlin");

        let mut fetch = FetchConfig::default();
        let q = orders_query(Scope::Eu, &window, &fetch);
        assert_eq!(q.region, Region::Eu);
        assert_eq!(
            q.first_page["CreatedAfter"].as_deref(),
            Some("2024-01-14T23:00:00Z")
        );
        assert!(q.sticky["MarketplaceIds"]
            .as_deref()
            .unwrap()
            .starts_with("A1PA6795UKMFR9,A13V1IB3VIYZZH"));

        fetch.filter_mode = FilterMode::LastUpdated;
        let q = orders_query(Scope::Eu, &window, &fetch);
        assert!(q.first_page.contains_key("LastUpdatedBefore"));
        assert!(!q.first_page.contains_key("CreatedAfter"));
    }

    #[test]
    fn test_window_overrides() {
        let day = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        let window = TimeWindow::for_day(
            Scope::Na,
            day,
            Some("2024-07-04T00:00:00Z".into()),
            None,
        )
        .unwrap();
        assert_eq!(window.start_utc, "2024-07-04T00:00:00Z");
        assert_eq!(window.end_utc, "2024-07-05T07:00:00Z");
    }

    #[tokio::test]
    async fn test_fetch_orders_diagnostics() {
        let (http, transport) = scripted_transport(test_secrets());
        http.push_json(
            HttpMethod::Get,
            ORDERS_PATH,
            200,
            json!({"payload": {"Orders": [
                order("1", "A1PA6795UKMFR9", "Shipped"),
                order("2", "A13V1IB3VIYZZH", "Canceled"),
                {"AmazonOrderId": "broken"}
            ], "NextToken": "n"}}),
        )
        .push_json(
            HttpMethod::Get,
            ORDERS_PATH,
            200,
            json!({"payload": {"Orders": [order("1", "A1PA6795UKMFR9", "Shipped")]}}),
        );
        let sleeper = RecordingSleeper::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let window = TimeWindow::for_day(Scope::Eu, day, None, None).unwrap();

        let fetched = fetch_orders(
            &transport,
            &sleeper,
            "run-1",
            Scope::Eu,
            &window,
            &FetchConfig::default(),
            true,
        )
        .await
        .unwrap();

        assert_eq!(fetched.orders.len(), 3);
        let d = &fetched.diagnostics;
        assert_eq!(d["pages_fetched"], 2);
        assert_eq!(d["records_raw"], 4);
        assert_eq!(d["records_dedup"], 2);
        assert_eq!(d["filter_mode"], "Created");
        assert_eq!(d["window_start_utc"], "2024-01-14T23:00:00Z");
        assert_eq!(d["by_dimension"]["DE"], 1);
        assert_eq!(d["by_dimension"]["FR"], 1);
        assert_eq!(d["status_breakdown"]["Shipped"], 2);
    }

    #[tokio::test]
    async fn test_item_pages_are_followed() {
        let (http, transport) = scripted_transport(test_secrets());
        let path = "/orders/v0/orders/111-2/orderItems";
        http.push_json(
            HttpMethod::Get,
            path,
            200,
            json!({"payload": {"OrderItems": [{"ASIN": "B1", "QuantityOrdered": 1}], "NextToken": "p2"}}),
        )
        .push_json(
            HttpMethod::Get,
            path,
            200,
            json!({"payload": {"OrderItems": [{"ASIN": "B2", "QuantityOrdered": 2}]}}),
        );
        let sleeper = RecordingSleeper::new();

        let items = fetch_order_items(
            &transport,
            &sleeper,
            "run",
            Region::Eu,
            "111-2",
            Duration::ZERO,
        )
        .await
        .unwrap();
        let asins: Vec<_> = items.iter().filter_map(|i| i.asin.as_deref()).collect();
        assert_eq!(asins, vec!["B1", "B2"]);
        assert!(http.requests_to(path)[1].query().unwrap().contains("NextToken=p2"));
    }

    #[tokio::test]
    async fn test_item_path_encodes_order_id() {
        let (http, transport) = scripted_transport(test_secrets());
        let path = "/orders/v0/orders/111%2F2%203/orderItems";
        http.push_json(
            HttpMethod::Get,
            path,
            200,
            json!({"payload": {"OrderItems": [{"ASIN": "B1", "QuantityOrdered": 1}]}}),
        );
        let sleeper = RecordingSleeper::new();

        let items = fetch_order_items(
            &transport,
            &sleeper,
            "run",
            Region::Eu,
            "111/2 3",
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].order_id, "111/2 3");
        let sent = &http.requests_to(path)[0];
        assert_eq!(
            sent.url,
            "https://sellingpartnerapi-eu.amazon.com/orders/v0/orders/111%2F2%203/orderItems"
        );
    }

    #[tokio::test]
    async fn test_order_cap_counts_complete_orders_only() {
        let (http, transport) = scripted_transport(test_secrets());
        http.push_json(
            HttpMethod::Get,
            ORDERS_PATH,
            200,
            json!({"payload": {"Orders": [
                {"AmazonOrderId": "no-marketplace"},
                order("1", "A1PA6795UKMFR9", "Shipped"),
                {"MarketplaceId": "A1PA6795UKMFR9"},
                order("2", "A1PA6795UKMFR9", "Shipped"),
                order("3", "A1PA6795UKMFR9", "Shipped")
            ], "NextToken": "n"}}),
        );
        let sleeper = RecordingSleeper::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let window = TimeWindow::for_day(Scope::Eu, day, None, None).unwrap();
        let fetch = FetchConfig {
            max_orders: 2,
            ..FetchConfig::default()
        };

        let fetched = fetch_orders(&transport, &sleeper, "run", Scope::Eu, &window, &fetch, false)
            .await
            .unwrap();

        let ids: Vec<&str> = fetched.orders.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(fetched.diagnostics["records_skipped"], 2);
        assert_eq!(http.requests_to(ORDERS_PATH).len(), 1);
    }
}
