//! # marketpull CLI (`mpull`)
//!
//! Thin trigger layer over the [`marketpull`] library. Every command prints
//! one JSON object on stdout; logs go to stderr.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mpull init` | Create the SQLite warehouse and its tables |
//! | `mpull env` | Report which credentials are configured (never their values) |
//! | `mpull orders --scope EU` | Daily orders run: fetch, aggregate, load |
//! | `mpull probe --scope NA` | Read-only look at the first page of orders |
//! | `mpull inventory --scope NA` | FBA (and AWD for NA) inventory snapshot |
//!
//! ## Examples
//!
//! ```bash
//! mpull --config ./config/mpull.toml init
//! mpull orders --scope EU --date 2024-01-15 --dry
//! LOG_FORMAT=json mpull inventory --scope NA
//! ```

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use marketpull::config::{self, Config, FilterMode, Secrets};
use marketpull::http_client::ReqwestHttpClient;
use marketpull::pipeline::{DailyOptions, InventoryOptions, Pipeline, ProbeOptions, RunReport};
use marketpull::region::Scope;
use marketpull::retry::TokioSleeper;
use marketpull::sink::{MemorySink, Sink, SqliteSink};
use marketpull::{db, migrate};

/// marketpull: signed, paginated marketplace order and inventory ingestion.
///
/// All commands accept `--config` pointing to a TOML file. A missing file
/// means built-in defaults. See `config/mpull.example.toml`.
#[derive(Parser)]
#[command(name = "mpull", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mpull.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the warehouse database and tables. Idempotent.
    Init,

    /// Show credential readiness as JSON.
    Env,

    /// Run the daily orders pipeline for one scope.
    Orders {
        /// EU, UK or NA (US/CA/MX/BR are accepted as NA).
        #[arg(long)]
        scope: String,

        /// Reporting day (YYYY-MM-DD). Defaults to yesterday in the scope's timezone.
        #[arg(long)]
        date: Option<String>,

        /// Print the plan without calling the API.
        #[arg(long)]
        dry: bool,

        /// Fetch and aggregate, but do not write to the warehouse.
        #[arg(long)]
        no_write: bool,

        /// Annotate raw order rows with per-order unit math.
        #[arg(long)]
        debug_items: bool,

        /// Override the window start (UTC, e.g. 2024-01-01T00:00:00Z).
        #[arg(long)]
        start: Option<String>,

        /// Override the window end (UTC).
        #[arg(long)]
        end: Option<String>,

        /// `Created` or `LastUpdated`.
        #[arg(long)]
        filter_mode: Option<String>,

        #[arg(long)]
        max_pages: Option<usize>,

        #[arg(long)]
        page_size: Option<u32>,

        #[arg(long)]
        max_orders: Option<usize>,
    },

    /// Read-only orders probe. Never writes.
    Probe {
        #[arg(long)]
        scope: String,

        /// Override the window start (UTC).
        #[arg(long)]
        start: Option<String>,

        #[arg(long, default_value_t = 1)]
        max_pages: usize,

        #[arg(long, default_value_t = 10)]
        page_size: u32,
    },

    /// Snapshot current inventory for one scope.
    Inventory {
        #[arg(long)]
        scope: String,

        #[arg(long)]
        dry: bool,

        #[arg(long)]
        no_write: bool,
    },
}

fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("marketpull=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn parse_scope(raw: &str) -> Result<Scope> {
    raw.parse::<Scope>().map_err(anyhow::Error::from)
}

fn parse_date(raw: Option<&str>) -> Result<Option<NaiveDate>> {
    raw.map(|d| {
        NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .with_context(|| format!("invalid --date '{}', expected YYYY-MM-DD", d))
    })
    .transpose()
}

/// Warehouse sink, or an in-memory one when nothing will be written.
async fn open_sink(cfg: &Config, writes: bool) -> Result<Arc<dyn Sink>> {
    if !writes {
        return Ok(Arc::new(MemorySink::new()));
    }
    let pool = db::connect(cfg).await?;
    migrate::create_tables(&pool, &cfg.sink).await?;
    Ok(Arc::new(SqliteSink::new(pool)))
}

fn build_pipeline(cfg: Config, sink: Arc<dyn Sink>) -> Pipeline {
    Pipeline::from_parts(
        cfg,
        Arc::new(ReqwestHttpClient::new()),
        Secrets::from_env(),
        Arc::new(TokioSleeper),
        sink,
    )
}

fn emit(report: &RunReport) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    Ok(report.ok)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut cfg = config::load_or_default(&cli.config)?;

    let ok = match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "ok": true,
                    "db": cfg.db.path.display().to_string(),
                    "tables": cfg.sink.all_tables(),
                }))?
            );
            true
        }
        Commands::Env => {
            let readiness = Secrets::from_env().readiness();
            println!("{}", serde_json::to_string_pretty(&readiness)?);
            true
        }
        Commands::Orders {
            scope,
            date,
            dry,
            no_write,
            debug_items,
            start,
            end,
            filter_mode,
            max_pages,
            page_size,
            max_orders,
        } => {
            let scope = parse_scope(&scope)?;
            if let Some(mode) = filter_mode {
                cfg.fetch.filter_mode = mode.parse::<FilterMode>()?;
            }
            if let Some(n) = max_pages {
                cfg.fetch.max_pages = n;
            }
            if let Some(n) = page_size {
                if !(1..=100).contains(&n) {
                    bail!("--page-size must be between 1 and 100, got {}", n);
                }
                cfg.fetch.page_size = n;
            }
            if let Some(n) = max_orders {
                cfg.fetch.max_orders = n;
            }
            let opts = DailyOptions {
                snapshot_date: parse_date(date.as_deref())?,
                dry,
                no_write,
                debug_items,
                start_override: start,
                end_override: end,
            };
            let sink = open_sink(&cfg, !dry && !no_write).await?;
            let report = build_pipeline(cfg, sink).run_daily(scope, &opts).await;
            emit(&report)?
        }
        Commands::Probe {
            scope,
            start,
            max_pages,
            page_size,
        } => {
            let scope = parse_scope(&scope)?;
            let opts = ProbeOptions {
                start_override: start,
                max_pages,
                page_size,
                ..ProbeOptions::default()
            };
            let sink = open_sink(&cfg, false).await?;
            let report = build_pipeline(cfg, sink).probe(scope, &opts).await;
            emit(&report)?
        }
        Commands::Inventory {
            scope,
            dry,
            no_write,
        } => {
            let scope = parse_scope(&scope)?;
            let sink = open_sink(&cfg, !dry && !no_write).await?;
            let report = build_pipeline(cfg, sink)
                .run_inventory(scope, &InventoryOptions { dry, no_write })
                .await;
            emit(&report)?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
