//! FBA and AWD inventory snapshots.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::PipelineResult;
use crate::paginate::{fetch_all, FetchLimits, PageQuery};
use crate::region::{region_for_pool, Region, Scope, AWD_POOL};
use crate::retry::{RetryPolicy, Sleeper};
use crate::transport::Transport;

pub const FBA_SUMMARIES_PATH: &str = "/fba/inventory/v1/summaries";
pub const AWD_INVENTORY_PATH: &str = "/awd/2024-05-09/inventory";

const INVENTORY_PACING: Duration = Duration::from_millis(100);
const MAX_INVENTORY_PAGES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FbaRow {
    pub pool: String,
    pub asin: Option<String>,
    pub marketplace_id: String,
    pub qty_available: i64,
    pub qty_inbound: i64,
    pub qty_reserved_total: i64,
    pub qty_reserved_customer_orders: i64,
    pub qty_reserved_effective: i64,
    pub raw_json: String,
}

impl FbaRow {
    pub fn from_summary(pool: &str, marketplace_id: &str, summary: &Value) -> Self {
        let details = summary.get("inventoryDetails").unwrap_or(&Value::Null);
        let reserved = details.get("reservedQuantity").unwrap_or(&Value::Null);

        let qty_reserved_total = int_at(reserved, "totalReservedQuantity");
        let qty_reserved_customer_orders = int_at(reserved, "pendingCustomerOrderQuantity");
        let qty_inbound = int_at(details, "inboundWorkingQuantity")
            + int_at(details, "inboundShippedQuantity")
            + int_at(details, "inboundReceivingQuantity");

        Self {
            pool: pool.to_string(),
            asin: summary.get("asin").and_then(Value::as_str).map(str::to_string),
            marketplace_id: marketplace_id.to_string(),
            qty_available: int_at(details, "fulfillableQuantity"),
            qty_inbound,
            qty_reserved_total,
            qty_reserved_customer_orders,
            qty_reserved_effective: (qty_reserved_total - qty_reserved_customer_orders).max(0),
            raw_json: summary.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwdRow {
    pub pool: String,
    pub asin: Option<String>,
    pub qty_available: i64,
    pub qty_inbound: i64,
    pub raw_json: String,
}

impl AwdRow {
    pub fn from_listing(listing: &Value) -> Self {
        Self {
            pool: AWD_POOL.to_string(),
            asin: listing.get("asin").and_then(Value::as_str).map(str::to_string),
            qty_available: int_at(listing, "availableQuantity"),
            qty_inbound: 0,
            raw_json: listing.to_string(),
        }
    }
}

fn int_at(value: &Value, key: &str) -> i64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn inventory_limits() -> FetchLimits {
    FetchLimits {
        max_pages: MAX_INVENTORY_PAGES,
        max_records: usize::MAX,
        pacing: INVENTORY_PACING,
        policy: RetryPolicy::summary(),
    }
}

/// FBA summaries for every pool of `scope`.
pub async fn fetch_fba(
    transport: &Transport,
    sleeper: &dyn Sleeper,
    run_id: &str,
    scope: Scope,
) -> PipelineResult<Vec<FbaRow>> {
    let pools = scope.inventory_pools();
    info!(
        run_id,
        scope = %scope,
        pools = ?pools.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
        "fetching fba inventory"
    );

    let mut rows = Vec::new();
    for (pool, marketplace_id) in pools {
        let query = PageQuery::new(region_for_pool(pool), FBA_SUMMARIES_PATH, "fba_summary")
            .sticky("details", "true")
            .sticky("granularityType", "Marketplace")
            .sticky("granularityId", *marketplace_id)
            .sticky("marketplaceIds", *marketplace_id)
            .records_key("inventorySummaries")
            .token("nextToken");
        let outcome = fetch_all(transport, sleeper, run_id, &query, inventory_limits()).await?;
        rows.extend(
            outcome
                .records
                .iter()
                .map(|s| FbaRow::from_summary(pool, marketplace_id, s)),
        );
    }
    Ok(rows)
}

/// AWD listing inventory. Only the NA scope has an AWD pool.
pub async fn fetch_awd(
    transport: &Transport,
    sleeper: &dyn Sleeper,
    run_id: &str,
    scope: Scope,
) -> PipelineResult<Vec<AwdRow>> {
    if scope != Scope::Na {
        return Ok(Vec::new());
    }
    info!(run_id, "fetching awd inventory");

    let query = PageQuery::new(Region::Na, AWD_INVENTORY_PATH, "awd_summary")
        .sticky("details", "SHOW")
        .sticky("maxResults", "100")
        .records_key("listingInventory")
        .token("nextToken");
    let outcome = fetch_all(transport, sleeper, run_id, &query, inventory_limits()).await?;
    Ok(outcome.records.iter().map(AwdRow::from_listing).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpMethod;
    use crate::retry::RecordingSleeper;
    use crate::transport::tests::{scripted_transport, test_secrets};
    use serde_json::json;

    #[test]
    fn test_reserved_math() {
        let summary = json!({
            "asin": "B0TEST",
            "inventoryDetails": {
                "fulfillableQuantity": 12,
                "inboundWorkingQuantity": 1,
                "inboundShippedQuantity": 2,
                "inboundReceivingQuantity": "3",
                "reservedQuantity": {
                    "totalReservedQuantity": 5,
                    "pendingCustomerOrderQuantity": 2
                }
            }
        });
        let row = FbaRow::from_summary("DE", "A1PA6795UKMFR9", &summary);
        assert_eq!(row.qty_available, 12);
        assert_eq!(row.qty_inbound, 6);
        assert_eq!(row.qty_reserved_total, 5);
        assert_eq!(row.qty_reserved_customer_orders, 2);
        assert_eq!(row.qty_reserved_effective, 3);

        let odd = json!({"inventoryDetails": {"reservedQuantity": {
            "totalReservedQuantity": 1, "pendingCustomerOrderQuantity": 4
        }}});
        let row = FbaRow::from_summary("UK", "A1F83G8C2ARO7P", &odd);
        assert_eq!(row.qty_reserved_effective, 0);
        assert_eq!(row.asin, None);
        assert_eq!(row.qty_available, 0);
    }

    #[tokio::test]
    async fn test_eu_scope_fetches_both_pools() {
        let (http, transport) = scripted_transport(test_secrets());
        http.push_json(
            HttpMethod::Get,
            FBA_SUMMARIES_PATH,
            200,
            json!({"payload": {"inventorySummaries": [{"asin": "B1"}]}, "pagination": {"nextToken": "n2"}}),
        )
        .push_json(
            HttpMethod::Get,
            FBA_SUMMARIES_PATH,
            200,
            json!({"payload": {"inventorySummaries": [{"asin": "B2"}]}}),
        )
        .push_json(
            HttpMethod::Get,
            FBA_SUMMARIES_PATH,
            200,
            json!({"payload": {"inventorySummaries": [{"asin": "B3"}]}}),
        );
        let sleeper = RecordingSleeper::new();

        let rows = fetch_fba(&transport, &sleeper, "run", Scope::Eu).await.unwrap();
        let pools: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.pool.as_str(), r.asin.as_deref().unwrap()))
            .collect();
        assert_eq!(pools, vec![("DE", "B1"), ("DE", "B2"), ("UK", "B3")]);

        let sent = http.requests_to(FBA_SUMMARIES_PATH);
        assert_eq!(sent.len(), 3);
        assert!(sent[0].url.starts_with("https://sellingpartnerapi-eu.amazon.com/"));
        assert!(sent[1].query().unwrap().contains("nextToken=n2"));
        assert!(sent[2].query().unwrap().contains("granularityId=A1F83G8C2ARO7P"));
    }

    #[tokio::test]
    async fn test_awd_is_na_only() {
        let (http, transport) = scripted_transport(test_secrets());
        let sleeper = RecordingSleeper::new();
        let rows = fetch_awd(&transport, &sleeper, "run", Scope::Eu).await.unwrap();
        assert!(rows.is_empty());
        assert!(http.requests_to(AWD_INVENTORY_PATH).is_empty());

        http.push_json(
            HttpMethod::Get,
            AWD_INVENTORY_PATH,
            200,
            json!({"listingInventory": [{"asin": "B7", "availableQuantity": 40, "totalQuantity": 55}]}),
        );
        let rows = fetch_awd(&transport, &sleeper, "run", Scope::Na).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pool, "US_AWD");
        assert_eq!(rows[0].qty_available, 40);
        assert_eq!(rows[0].qty_inbound, 0);
    }

    #[tokio::test]
    async fn test_inventory_uses_summary_retry_policy() {
        let (http, transport) = scripted_transport(test_secrets());
        for _ in 0..4 {
            http.push_json(HttpMethod::Get, FBA_SUMMARIES_PATH, 503, json!({}));
        }
        let sleeper = RecordingSleeper::new();
        let err = fetch_fba(&transport, &sleeper, "run", Scope::Uk).await.unwrap_err();
        assert_eq!(err.status(), 503);
        assert_eq!(err.stage(), "fba_summary");
        assert_eq!(http.requests_to(FBA_SUMMARIES_PATH).len(), 4);
        assert_eq!(sleeper.total(), Duration::from_millis(1000 + 2000 + 4000));
    }
}
