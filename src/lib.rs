//! # marketpull
//!
//! Signed, paginated ingestion of marketplace orders and inventory into a
//! local analytical warehouse.
//!
//! The core is the acquisition pipeline: a credential provider and request
//! signer that authenticate every call, a retrying paginated fetch engine
//! that turns page-at-a-time responses into a complete dataset, and an
//! aggregation layer that folds raw orders into per-country and per-product
//! rollups with well-defined exclusion rules.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐   ┌──────────┐
//! │ Credentials │──▶│  Transport   │──▶│ Paginate  │──▶│ Aggregate│
//! │ LWA + SigV4 │   │ + Normalize  │   │ + Retry   │   │ Rollups  │
//! └─────────────┘   └──────────────┘   └───────────┘   └────┬─────┘
//!                                                          │
//!                                      ┌───────────────────┤
//!                                      ▼                   ▼
//!                                 ┌──────────┐       ┌──────────┐
//!                                 │   Sink   │       │   CLI    │
//!                                 │ (SQLite) │       │ (mpull)  │
//!                                 └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`error`] | Typed pipeline errors |
//! | [`region`] | Regions, scopes and marketplace tables |
//! | [`window`] | Local-day reporting windows |
//! | [`signer`] | SigV4 request signing |
//! | [`credentials`] | Refresh-token exchange with a per-region cache |
//! | [`http_client`] | HTTP seam (reqwest and a scripted test double) |
//! | [`transport`] | Signed API calls |
//! | [`normalize`] | Response envelopes and error messages |
//! | [`retry`] | Backoff policy and sleeper seam |
//! | [`paginate`] | Cursor pagination |
//! | [`orders`] | Order and order-item queries |
//! | [`aggregate`] | Rollups |
//! | [`inventory`] | FBA and AWD snapshots |
//! | [`sink`] | Warehouse write path |
//! | [`pipeline`] | Run orchestration and the result object |
//! | [`db`] | Database connection |
//! | [`migrate`] | Warehouse tables |

pub mod aggregate;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod http_client;
pub mod inventory;
pub mod migrate;
pub mod normalize;
pub mod orders;
pub mod paginate;
pub mod pipeline;
pub mod region;
pub mod retry;
pub mod signer;
pub mod sink;
pub mod transport;
pub mod window;
