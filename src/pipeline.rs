//! Run orchestration.
//!
//! A [`Pipeline`] owns the long-lived collaborators (transport with its
//! credential cache, sleeper, sink) and turns a trigger into one run:
//!
//! ```text
//! run_daily:     window ─► orders_list ─► order_items ─► aggregate ─► sink
//! run_inventory: fba_summary ─► awd_summary (NA) ─► sink
//! probe:         orders_list (small) ─► samples
//! ```
//!
//! Every run returns a [`RunReport`], successful or not. Failures are
//! flattened through [`PipelineError::to_json`] so the caller always gets
//! the same shape back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::{AggregateOutput, AggregatePolicy, Aggregator};
use crate::config::{Config, FilterMode, Secrets};
use crate::credentials::CredentialProvider;
use crate::error::{PipelineError, PipelineResult};
use crate::http_client::HttpClient;
use crate::inventory::{fetch_awd, fetch_fba, AwdRow, FbaRow};
use crate::orders::{fetch_orders, ApiDetailFetcher, TimeWindow};
use crate::region::Scope;
use crate::retry::Sleeper;
use crate::sink::{insert_with_fallback, Row, Sink};
use crate::transport::Transport;
use crate::window::{iso_z, yesterday_local};

pub const DRY_RUN_STATUS: &str = "DRY_RUN";

/// Flat result object for one run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunReport {
    pub ok: bool,
    /// HTTP-ish number, or a symbol such as `DRY_RUN`.
    pub status: Value,
    pub stage: String,
    pub run_id: String,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_date: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl RunReport {
    fn new(run_id: &str, scope: Scope, snapshot_date: Option<NaiveDate>) -> Self {
        Self {
            ok: true,
            status: json!(200),
            stage: "complete".to_string(),
            run_id: run_id.to_string(),
            scope: scope.to_string(),
            snapshot_date: snapshot_date.map(|d| d.to_string()),
            body: Map::new(),
        }
    }

    fn dry_run(run_id: &str, scope: Scope, snapshot_date: Option<NaiveDate>) -> Self {
        let mut report = Self::new(run_id, scope, snapshot_date);
        report.status = json!(DRY_RUN_STATUS);
        report.stage = "dry_run".to_string();
        report.insert("dry", json!(true));
        report
    }

    /// Report for a run that stopped on `err`.
    pub fn failed(
        err: &PipelineError,
        run_id: &str,
        scope: Scope,
        snapshot_date: Option<NaiveDate>,
    ) -> Self {
        let flat = err.to_json(run_id);
        let mut report = Self::new(
            flat["run_id"].as_str().unwrap_or(run_id),
            scope,
            snapshot_date,
        );
        report.ok = false;
        report.status = flat["status"].clone();
        report.stage = err.stage().to_string();
        report.insert("error", flat["error"].clone());
        report.insert("debug", flat["debug"].clone());
        report
    }

    fn insert(&mut self, key: &str, value: Value) {
        self.body.insert(key.to_string(), value);
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DailyOptions {
    /// Reporting day; defaults to yesterday in the scope's timezone.
    pub snapshot_date: Option<NaiveDate>,
    /// Plan only, no API calls.
    pub dry: bool,
    /// Fetch and aggregate but skip the sink.
    pub no_write: bool,
    pub debug_items: bool,
    pub start_override: Option<String>,
    pub end_override: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InventoryOptions {
    pub dry: bool,
    pub no_write: bool,
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub snapshot_date: Option<NaiveDate>,
    pub start_override: Option<String>,
    pub max_pages: usize,
    pub page_size: u32,
    pub samples: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            snapshot_date: None,
            start_override: None,
            max_pages: 1,
            page_size: 10,
            samples: 5,
        }
    }
}

pub struct Pipeline {
    config: Config,
    transport: Transport,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn Sink>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        transport: Transport,
        sleeper: Arc<dyn Sleeper>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            config,
            transport,
            sleeper,
            sink,
        }
    }

    /// Wire a pipeline from a raw HTTP client and secrets. The credential
    /// cache is created here and shared by every run of this pipeline.
    pub fn from_parts(
        config: Config,
        http: Arc<dyn HttpClient>,
        secrets: Secrets,
        sleeper: Arc<dyn Sleeper>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let credentials = Arc::new(CredentialProvider::new(http.clone(), secrets, &config.api));
        let transport = Transport::new(http, credentials, &config.api);
        Self::new(config, transport, sleeper, sink)
    }

    /// Orders for one reporting day: fetch, aggregate, load.
    pub async fn run_daily(&self, scope: Scope, opts: &DailyOptions) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let snapshot_date = opts
            .snapshot_date
            .unwrap_or_else(|| yesterday_local(scope.timezone(), Utc::now()));

        let window = match TimeWindow::for_day(
            scope,
            snapshot_date,
            opts.start_override.clone(),
            opts.end_override.clone(),
        ) {
            Ok(window) => window,
            Err(err) => return RunReport::failed(&err, &run_id, scope, Some(snapshot_date)),
        };

        if opts.dry {
            return self.plan_daily(&run_id, scope, &window);
        }

        info!(run_id = %run_id, scope = %scope, date = %snapshot_date, "daily run start");
        match self.daily_inner(&run_id, scope, &window, opts).await {
            Ok(report) => report,
            Err(err) => {
                error!(run_id = %run_id, stage = err.stage(), error = %err, "daily run failed");
                RunReport::failed(&err, &run_id, scope, Some(snapshot_date))
            }
        }
    }

    fn plan_daily(&self, run_id: &str, scope: Scope, window: &TimeWindow) -> RunReport {
        let fetch = &self.config.fetch;
        let mut report = RunReport::dry_run(run_id, scope, Some(window.snapshot_date));
        report.insert(
            "steps",
            json!([
                "Fetch orders list (paginated)",
                "Fetch order items for each order",
                "Aggregate orders, items and per-ASIN stats",
                "Write results to the sink (skipped in dry run)",
            ]),
        );
        report.insert(
            "params",
            json!({
                "filter_mode": fetch.filter_mode.as_str(),
                "max_pages": fetch.max_pages,
                "page_size": fetch.page_size,
                "max_orders": fetch.max_orders,
                "marketplace_ids": scope.marketplace_ids(),
                "window": window,
            }),
        );
        report
    }

    async fn daily_inner(
        &self,
        run_id: &str,
        scope: Scope,
        window: &TimeWindow,
        opts: &DailyOptions,
    ) -> PipelineResult<RunReport> {
        let fetch = &self.config.fetch;
        let fetched = fetch_orders(
            &self.transport,
            self.sleeper.as_ref(),
            run_id,
            scope,
            window,
            fetch,
            opts.debug_items,
        )
        .await?;

        let policy = AggregatePolicy {
            primary_channel: fetch.primary_channel.clone(),
            debug_items: opts.debug_items,
            item_pacing: Duration::from_millis(fetch.item_pacing_ms),
        };
        let aggregator = Aggregator {
            scope,
            policy,
            sleeper: self.sleeper.as_ref(),
            run_id,
        };
        let details = ApiDetailFetcher {
            transport: &self.transport,
            sleeper: self.sleeper.as_ref(),
            run_id,
            region: scope.region(),
            pacing: Duration::from_millis(fetch.item_pacing_ms),
        };
        let output = aggregator.run(&fetched.orders, &details).await?;

        let mut report = RunReport::new(run_id, scope, Some(window.snapshot_date));
        let summary = &output.summary;
        report.insert("orders_count", json!(summary.orders_count));
        report.insert("units_sold", json!(summary.units_sold));
        report.insert("canceled_orders", json!(summary.canceled_orders));
        report.insert("excluded_non_primary", json!(summary.excluded_non_primary));
        report.insert("breakdown", json!(summary.breakdown));
        report.insert("items_rows_count", json!(output.item_rows.len()));
        report.insert("asin_stats_count", json!(output.product_rows.len()));

        if opts.no_write {
            report.insert("sink", json!({"skipped": true}));
        } else {
            let rows = DailyRows::build(run_id, scope, window, fetch.filter_mode, &output);
            match self.write_daily(rows).await {
                Ok(sink) => report.insert("sink", sink),
                Err((sink, err)) => {
                    let failed = RunReport::failed(&err, run_id, scope, Some(window.snapshot_date));
                    report.ok = false;
                    report.status = failed.status;
                    report.stage = failed.stage;
                    report.insert("error", failed.body["error"].clone());
                    report.insert("sink", sink);
                }
            }
        }

        report.insert("time_window_debug", Value::Object(fetched.diagnostics));
        if opts.debug_items {
            let status_breakdown = fetched
                .orders
                .iter()
                .fold(Map::new(), |mut acc, order| {
                    let status = order.status.trim();
                    let key = if status.is_empty() { "UNKNOWN" } else { status };
                    let n = acc.get(key).and_then(Value::as_u64).unwrap_or(0);
                    acc.insert(key.to_string(), json!(n + 1));
                    acc
                });
            report.insert(
                "debug",
                json!({
                    "parsed_orders_len": fetched.orders.len(),
                    "parsed_status_breakdown": status_breakdown,
                }),
            );
        }

        info!(
            run_id,
            ok = report.ok,
            orders_count = summary.orders_count,
            units_sold = summary.units_sold,
            "daily run complete"
        );
        Ok(report)
    }

    /// Load the four daily tables. Only the primary rollup table is fatal;
    /// its failure is returned alongside the per-table results.
    async fn write_daily(&self, rows: DailyRows) -> Result<Value, (Value, PipelineError)> {
        let tables = &self.config.sink;
        let mut results = Map::new();
        let mut fatal = None;

        let steps = [
            ("orders_raw", &tables.orders_raw, rows.orders, true),
            ("orders_daily_agg", &tables.orders_daily_agg, rows.daily, false),
            ("order_items_raw", &tables.order_items_raw, rows.items, true),
            ("sales_asin_daily", &tables.sales_asin_daily, rows.products, true),
        ];
        for (key, table, rows, allow_drop) in steps {
            match insert_with_fallback(self.sink.as_ref(), table, rows, allow_drop).await {
                Ok(report) => {
                    if !report.is_ok() {
                        warn!(table = %table, errors = report.errors.len(), "sink rows rejected");
                        if !allow_drop && fatal.is_none() {
                            fatal = report.clone().into_result().err();
                        }
                    }
                    results.insert(key.to_string(), json!(report));
                }
                Err(err) => {
                    results.insert(key.to_string(), json!({"table": table, "error": err.to_string()}));
                    if !allow_drop && fatal.is_none() {
                        fatal = Some(err);
                    }
                }
            }
        }

        match fatal {
            Some(err) => Err((Value::Object(results), err)),
            None => Ok(Value::Object(results)),
        }
    }

    /// Current FBA (and, for NA, AWD) inventory snapshot.
    pub async fn run_inventory(&self, scope: Scope, opts: &InventoryOptions) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let snapshot_date = Utc::now().date_naive();

        if opts.dry {
            let pools: Vec<&str> = scope.inventory_pools().iter().map(|(p, _)| *p).collect();
            let mut report = RunReport::dry_run(&run_id, scope, Some(snapshot_date));
            report.insert(
                "steps",
                json!([
                    "Fetch FBA inventory summaries",
                    "Fetch AWD inventory (NA only)",
                    "Write inventory snapshots to the sink (skipped in dry run)",
                ]),
            );
            report.insert(
                "params",
                json!({
                    "pools": pools,
                    "awd": scope == Scope::Na,
                }),
            );
            return report;
        }

        info!(run_id = %run_id, scope = %scope, "inventory run start");
        match self.inventory_inner(&run_id, scope, snapshot_date, opts).await {
            Ok(report) => report,
            Err(err) => {
                error!(run_id = %run_id, stage = err.stage(), error = %err, "inventory run failed");
                RunReport::failed(&err, &run_id, scope, Some(snapshot_date))
            }
        }
    }

    async fn inventory_inner(
        &self,
        run_id: &str,
        scope: Scope,
        snapshot_date: NaiveDate,
        opts: &InventoryOptions,
    ) -> PipelineResult<RunReport> {
        let sleeper = self.sleeper.as_ref();
        let fba = fetch_fba(&self.transport, sleeper, run_id, scope).await?;
        let awd = fetch_awd(&self.transport, sleeper, run_id, scope).await?;

        let mut report = RunReport::new(run_id, scope, Some(snapshot_date));
        report.insert("fba_rows_count", json!(fba.len()));
        report.insert("awd_rows_count", json!(awd.len()));

        if opts.no_write {
            report.insert("sink", json!({"skipped": true}));
            return Ok(report);
        }

        let ingested_at = iso_z(Utc::now());
        let date = snapshot_date.to_string();
        let tables = &self.config.sink;
        let fba_rows = fba
            .iter()
            .map(|r| fba_row(run_id, &ingested_at, &date, r))
            .collect();
        let awd_rows = awd
            .iter()
            .map(|r| awd_row(run_id, &ingested_at, &date, r))
            .collect();

        let fba_report = insert_with_fallback(self.sink.as_ref(), &tables.inventory_fba, fba_rows, true).await?;
        let awd_report = insert_with_fallback(self.sink.as_ref(), &tables.inventory_awd, awd_rows, true).await?;
        report.insert(
            "sink",
            json!({
                "inventory_fba": fba_report,
                "inventory_awd": awd_report,
            }),
        );
        info!(run_id, fba = fba.len(), awd = awd.len(), "inventory run complete");
        Ok(report)
    }

    /// Read-only look at the first page(s) of orders. Never writes.
    pub async fn probe(&self, scope: Scope, opts: &ProbeOptions) -> RunReport {
        let run_id = format!("debug-{}", Uuid::new_v4());
        let snapshot_date = opts
            .snapshot_date
            .unwrap_or_else(|| Utc::now().date_naive());

        let window = match TimeWindow::for_day(scope, snapshot_date, opts.start_override.clone(), None) {
            Ok(window) => window,
            Err(err) => return RunReport::failed(&err, &run_id, scope, Some(snapshot_date)),
        };
        let mut fetch = self.config.fetch.clone();
        fetch.max_pages = opts.max_pages.max(1);
        fetch.page_size = opts.page_size.clamp(1, 100);

        let fetched = match fetch_orders(
            &self.transport,
            self.sleeper.as_ref(),
            &run_id,
            scope,
            &window,
            &fetch,
            true,
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(err) => return RunReport::failed(&err, &run_id, scope, Some(snapshot_date)),
        };

        let samples: Vec<Value> = fetched
            .orders
            .iter()
            .take(opts.samples)
            .map(|o| json!({"order_id": o.order_id, "status": o.status, "raw": o.raw}))
            .collect();

        let mut report = RunReport::new(&run_id, scope, Some(snapshot_date));
        report.stage = "probe".to_string();
        report.insert("orders_found", json!(fetched.orders.len()));
        report.insert("debug_info", Value::Object(fetched.diagnostics));
        report.insert("samples", json!(samples));
        report
    }
}

/// Sink rows for one daily run.
struct DailyRows {
    orders: Vec<Row>,
    daily: Vec<Row>,
    items: Vec<Row>,
    products: Vec<Row>,
}

impl DailyRows {
    fn build(
        run_id: &str,
        scope: Scope,
        window: &TimeWindow,
        filter_mode: FilterMode,
        output: &AggregateOutput,
    ) -> Self {
        let ingested_at = iso_z(Utc::now());
        let date = window.snapshot_date.to_string();
        let scope = scope.as_str();
        let summary = &output.summary;

        let orders = output
            .order_rows
            .iter()
            .map(|r| {
                row(json!({
                    "run_id": run_id,
                    "ingested_at": ingested_at,
                    "scope": scope,
                    "snapshot_date": date,
                    "order_id": r.order_id,
                    "marketplace_id": r.marketplace_id,
                    "country": r.country,
                    "order_status": r.order_status,
                    "units_sold": r.units_sold,
                    "raw_json": r.raw_json,
                }))
            })
            .collect();

        let daily = summary
            .breakdown
            .iter()
            .map(|(country, totals)| {
                row(json!({
                    "run_id": run_id,
                    "ingested_at": ingested_at,
                    "scope": scope,
                    "snapshot_date": date,
                    "country_code": country,
                    "marketplace_id": totals.marketplace_id,
                    "orders_count": totals.orders_count,
                    "units_sold": totals.units_sold,
                    "filter_mode": filter_mode.as_str(),
                    "excluded_canceled_orders": summary.canceled_orders,
                    "excluded_non_primary_orders": summary.excluded_non_primary,
                }))
            })
            .collect();

        let items = output
            .item_rows
            .iter()
            .map(|r| {
                row(json!({
                    "run_id": run_id,
                    "ingested_at": ingested_at,
                    "scope": scope,
                    "snapshot_date": date,
                    "order_id": r.order_id,
                    "asin": r.asin,
                    "seller_sku": r.seller_sku,
                    "quantity_ordered": r.quantity_ordered,
                    "item_status": r.item_status,
                    "raw_json": r.raw_json,
                    "country": r.country,
                    "marketplace_id": r.marketplace_id,
                }))
            })
            .collect();

        let products = output
            .product_rows
            .iter()
            .map(|r| {
                row(json!({
                    "run_id": run_id,
                    "ingested_at": ingested_at,
                    "scope": scope,
                    "snapshot_date": date,
                    "country": r.country,
                    "marketplace_id": r.marketplace_id,
                    "asin": r.asin,
                    "orders_count": r.orders_count,
                    "units_sold": r.units_sold,
                    "canceled_orders": r.canceled_orders,
                }))
            })
            .collect();

        Self {
            orders,
            daily,
            items,
            products,
        }
    }
}

fn fba_row(run_id: &str, ingested_at: &str, date: &str, r: &FbaRow) -> Row {
    row(json!({
        "run_id": run_id,
        "ingested_at": ingested_at,
        "snapshot_date": date,
        "inv_pool": r.pool,
        "asin": r.asin,
        "marketplace_id": r.marketplace_id,
        "qty_available": r.qty_available,
        "qty_inbound": r.qty_inbound,
        "qty_reserved_total": r.qty_reserved_total,
        "qty_reserved_customer_orders": r.qty_reserved_customer_orders,
        "qty_reserved_effective": r.qty_reserved_effective,
        "raw_json": r.raw_json,
    }))
}

fn awd_row(run_id: &str, ingested_at: &str, date: &str, r: &AwdRow) -> Row {
    row(json!({
        "run_id": run_id,
        "ingested_at": ingested_at,
        "snapshot_date": date,
        "inv_pool": r.pool,
        "asin": r.asin,
        "qty_available": r.qty_available,
        "qty_inbound": r.qty_inbound,
        "raw_json": r.raw_json,
    }))
}

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}
