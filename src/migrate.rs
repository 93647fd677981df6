use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;

use crate::config::{Config, SinkConfig};
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_tables(&pool, &config.sink).await?;
    pool.close().await;
    Ok(())
}

/// Create every warehouse table named in `sink`. Idempotent.
pub async fn create_tables(pool: &SqlitePool, sink: &SinkConfig) -> Result<()> {
    let statements = [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                run_id TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                scope TEXT NOT NULL,
                snapshot_date TEXT NOT NULL,
                order_id TEXT NOT NULL,
                marketplace_id TEXT NOT NULL,
                country TEXT NOT NULL,
                order_status TEXT,
                units_sold INTEGER NOT NULL DEFAULT 0,
                raw_json TEXT
            )
            "#,
            sink.orders_raw
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                run_id TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                scope TEXT NOT NULL,
                snapshot_date TEXT NOT NULL,
                country_code TEXT NOT NULL,
                marketplace_id TEXT NOT NULL,
                orders_count INTEGER NOT NULL,
                units_sold INTEGER NOT NULL,
                filter_mode TEXT NOT NULL,
                excluded_canceled_orders INTEGER NOT NULL DEFAULT 0,
                excluded_non_primary_orders INTEGER NOT NULL DEFAULT 0
            )
            "#,
            sink.orders_daily_agg
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                run_id TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                scope TEXT NOT NULL,
                snapshot_date TEXT NOT NULL,
                order_id TEXT NOT NULL,
                asin TEXT,
                seller_sku TEXT,
                quantity_ordered INTEGER NOT NULL DEFAULT 0,
                item_status TEXT,
                raw_json TEXT,
                country TEXT NOT NULL,
                marketplace_id TEXT NOT NULL
            )
            "#,
            sink.order_items_raw
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                run_id TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                scope TEXT NOT NULL,
                snapshot_date TEXT NOT NULL,
                country TEXT NOT NULL,
                marketplace_id TEXT NOT NULL,
                asin TEXT NOT NULL,
                orders_count INTEGER NOT NULL,
                units_sold INTEGER NOT NULL,
                canceled_orders INTEGER NOT NULL DEFAULT 0
            )
            "#,
            sink.sales_asin_daily
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                run_id TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                snapshot_date TEXT NOT NULL,
                inv_pool TEXT NOT NULL,
                asin TEXT,
                marketplace_id TEXT NOT NULL,
                qty_available INTEGER NOT NULL DEFAULT 0,
                qty_inbound INTEGER NOT NULL DEFAULT 0,
                qty_reserved_total INTEGER NOT NULL DEFAULT 0,
                qty_reserved_customer_orders INTEGER NOT NULL DEFAULT 0,
                qty_reserved_effective INTEGER NOT NULL DEFAULT 0,
                raw_json TEXT
            )
            "#,
            sink.inventory_fba
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                run_id TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                snapshot_date TEXT NOT NULL,
                inv_pool TEXT NOT NULL,
                asin TEXT,
                qty_available INTEGER NOT NULL DEFAULT 0,
                qty_inbound INTEGER NOT NULL DEFAULT 0,
                raw_json TEXT
            )
            "#,
            sink.inventory_awd
        ),
    ];

    for sql in &statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .context("creating warehouse table")?;
    }

    for table in [&sink.orders_daily_agg, &sink.sales_asin_daily] {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{}_snapshot\" ON \"{}\"(scope, snapshot_date)",
            table, table
        ))
        .execute(pool)
        .await?;
    }
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS \"idx_{}_order\" ON \"{}\"(order_id)",
        sink.orders_raw, sink.orders_raw
    ))
    .execute(pool)
    .await?;

    Ok(())
}
