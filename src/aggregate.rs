//! Folds fetched orders and their items into rollups.
//!
//! Two reducers run over the same input stream:
//!
//! - **count reducers** (eligible orders, canceled, excluded, per-product
//!   order counts, order rows) see each `(order_id, marketplace_id)` once;
//! - **unit reducers** add the units of every item list actually returned,
//!   so an order that appears twice in the paged input contributes its
//!   units twice.
//!
//! All maps are `BTreeMap`s, so output order depends only on the input.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::error::{PipelineError, PipelineResult};
use crate::orders::{OrderItem, OrderRecord};
use crate::region::Scope;
use crate::retry::Sleeper;

/// Source of per-order detail lines.
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    async fn order_items(&self, order: &OrderRecord) -> PipelineResult<Vec<OrderItem>>;
}

#[derive(Debug, Clone)]
pub struct AggregatePolicy {
    /// Case-insensitive prefix a sales channel must start with to count.
    pub primary_channel: String,
    /// Annotate order rows with `_debug_units_sold` / `_debug_valid`.
    pub debug_items: bool,
    /// Pause between detail lookups.
    pub item_pacing: Duration,
}

impl Default for AggregatePolicy {
    fn default() -> Self {
        Self {
            primary_channel: "Amazon".to_string(),
            debug_items: false,
            item_pacing: Duration::from_millis(80),
        }
    }
}

impl AggregatePolicy {
    pub fn is_canceled(&self, order: &OrderRecord) -> bool {
        matches!(
            order.status.trim().to_ascii_lowercase().as_str(),
            "canceled" | "cancelled"
        )
    }

    /// Empty channels count as primary.
    pub fn is_non_primary(&self, order: &OrderRecord) -> bool {
        let channel = order.sales_channel.trim();
        !channel.is_empty()
            && !channel
                .to_ascii_lowercase()
                .starts_with(&self.primary_channel.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DimensionTotals {
    pub marketplace_id: String,
    pub orders_count: u64,
    pub units_sold: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AggregateSummary {
    pub orders_count: u64,
    pub units_sold: u64,
    pub canceled_orders: u64,
    pub excluded_non_primary: u64,
    pub breakdown: BTreeMap<String, DimensionTotals>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProductRollup {
    pub country: String,
    pub marketplace_id: String,
    pub asin: String,
    pub orders_count: u64,
    pub units_sold: u64,
    pub canceled_orders: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderRow {
    pub order_id: String,
    pub marketplace_id: String,
    pub country: String,
    pub order_status: String,
    pub units_sold: u64,
    pub raw_json: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ItemRow {
    pub order_id: String,
    pub asin: Option<String>,
    pub seller_sku: Option<String>,
    pub quantity_ordered: i64,
    pub item_status: String,
    pub raw_json: String,
    pub country: String,
    pub marketplace_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregateOutput {
    pub summary: AggregateSummary,
    pub order_rows: Vec<OrderRow>,
    pub item_rows: Vec<ItemRow>,
    pub product_rows: Vec<ProductRollup>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ProductCounts {
    orders_count: u64,
    units_sold: u64,
    canceled_orders: u64,
}

/// Incremental fold state. Feed it with [`Rollup::apply`] and read the
/// result with [`Rollup::finish`].
#[derive(Debug, Clone)]
pub struct Rollup {
    scope: Scope,
    policy: AggregatePolicy,
    summary: AggregateSummary,
    seen: BTreeSet<(String, String)>,
    products: BTreeMap<(String, String, String), ProductCounts>,
    order_rows: Vec<OrderRow>,
    item_rows: Vec<ItemRow>,
}

impl Rollup {
    /// Empty rollup with every marketplace of `scope` pre-seeded at zero.
    pub fn new(scope: Scope, policy: AggregatePolicy) -> Self {
        let breakdown = scope
            .marketplaces()
            .iter()
            .map(|(cc, mp)| {
                (
                    cc.to_string(),
                    DimensionTotals {
                        marketplace_id: mp.to_string(),
                        ..DimensionTotals::default()
                    },
                )
            })
            .collect();
        Self {
            scope,
            policy,
            summary: AggregateSummary {
                breakdown,
                ..AggregateSummary::default()
            },
            seen: BTreeSet::new(),
            products: BTreeMap::new(),
            order_rows: Vec::new(),
            item_rows: Vec::new(),
        }
    }

    pub fn summary(&self) -> &AggregateSummary {
        &self.summary
    }

    /// Fold one order occurrence and its detail lines.
    pub fn apply(&mut self, order: &OrderRecord, items: &[OrderItem]) {
        let country = self.scope.country_or_unknown(&order.marketplace_id).to_string();
        let canceled = self.policy.is_canceled(order);
        let non_primary = self.policy.is_non_primary(order);
        let eligible = !canceled && !non_primary;
        let first_sighting = self
            .seen
            .insert((order.order_id.clone(), order.marketplace_id.clone()));

        let mut order_units = 0u64;
        let mut per_asin: BTreeMap<&str, u64> = BTreeMap::new();
        for item in items {
            let units = item.units();
            if eligible {
                order_units += units;
            }
            if let Some(asin) = item.asin.as_deref() {
                *per_asin.entry(asin).or_default() += units;
            }
            self.item_rows.push(ItemRow {
                order_id: order.order_id.clone(),
                asin: item.asin.clone(),
                seller_sku: item.seller_sku.clone(),
                quantity_ordered: item.quantity_ordered,
                item_status: order.status.clone(),
                raw_json: item.raw.to_string(),
                country: country.clone(),
                marketplace_id: order.marketplace_id.clone(),
            });
        }

        if first_sighting {
            if canceled {
                self.summary.canceled_orders += 1;
            }
            if non_primary {
                self.summary.excluded_non_primary += 1;
            }
        }

        for (asin, units) in per_asin {
            let counts = self
                .products
                .entry((country.clone(), order.marketplace_id.clone(), asin.to_string()))
                .or_default();
            if canceled {
                if first_sighting {
                    counts.canceled_orders += 1;
                }
                continue;
            }
            if non_primary {
                continue;
            }
            if first_sighting {
                counts.orders_count += 1;
            }
            counts.units_sold += units;
        }

        if eligible {
            let bucket = self
                .summary
                .breakdown
                .entry(country.clone())
                .or_insert_with(|| DimensionTotals {
                    marketplace_id: order.marketplace_id.clone(),
                    ..DimensionTotals::default()
                });
            if first_sighting {
                self.summary.orders_count += 1;
                bucket.orders_count += 1;
            }
            self.summary.units_sold += order_units;
            bucket.units_sold += order_units;
        }

        if first_sighting {
            let mut raw = order.raw.clone();
            if self.policy.debug_items {
                if let Value::Object(map) = &mut raw {
                    map.insert("_debug_units_sold".into(), json!(order_units));
                    map.insert("_debug_valid".into(), json!(eligible));
                }
            }
            self.order_rows.push(OrderRow {
                order_id: order.order_id.clone(),
                marketplace_id: order.marketplace_id.clone(),
                country,
                order_status: order.status.clone(),
                units_sold: order_units,
                raw_json: raw.to_string(),
            });
        }
    }

    pub fn finish(self) -> AggregateOutput {
        let product_rows = self
            .products
            .into_iter()
            .map(|((country, marketplace_id, asin), c)| ProductRollup {
                country,
                marketplace_id,
                asin,
                orders_count: c.orders_count,
                units_sold: c.units_sold,
                canceled_orders: c.canceled_orders,
            })
            .collect();
        AggregateOutput {
            summary: self.summary,
            order_rows: self.order_rows,
            item_rows: self.item_rows,
            product_rows,
        }
    }
}

/// Fold already-fetched `(order, items)` pairs. Pure.
pub fn fold(scope: Scope, policy: &AggregatePolicy, input: &[(OrderRecord, Vec<OrderItem>)]) -> AggregateOutput {
    let mut rollup = Rollup::new(scope, policy.clone());
    for (order, items) in input {
        rollup.apply(order, items);
    }
    rollup.finish()
}

pub struct Aggregator<'a> {
    pub scope: Scope,
    pub policy: AggregatePolicy,
    pub sleeper: &'a dyn Sleeper,
    pub run_id: &'a str,
}

impl Aggregator<'_> {
    /// Look up each order's items through `details` and fold everything.
    ///
    /// A failed lookup aborts the whole run with [`PipelineError::DetailFetch`]
    /// carrying the partial breakdown accumulated so far.
    pub async fn run(
        &self,
        orders: &[OrderRecord],
        details: &dyn DetailFetcher,
    ) -> PipelineResult<AggregateOutput> {
        let mut rollup = Rollup::new(self.scope, self.policy.clone());
        let total = orders.len();

        for (i, order) in orders.iter().enumerate() {
            let items = match details.order_items(order).await {
                Ok(items) => items,
                Err(source) => {
                    let dimension = self.scope.country_or_unknown(&order.marketplace_id);
                    error!(
                        run_id = self.run_id,
                        order_id = %order.order_id,
                        dimension,
                        error = %source,
                        "order items fetch failed"
                    );
                    return Err(PipelineError::DetailFetch {
                        order_id: order.order_id.clone(),
                        dimension: dimension.to_string(),
                        partial: json!(rollup.summary().breakdown),
                        source: Box::new(source),
                    });
                }
            };
            rollup.apply(order, &items);

            if i % 10 == 0 {
                info!(run_id = self.run_id, processed = i + 1, total, "aggregation progress");
            }
            if i + 1 < total {
                self.sleeper.sleep(self.policy.item_pacing).await;
            }
        }

        Ok(rollup.finish())
    }
}
