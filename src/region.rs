//! Static region and marketplace tables.
//!
//! A [`Region`] is an API cluster: it owns a host, a signing region and the
//! environment slots that may hold its refresh token. A [`Scope`] is what a
//! run reports on: a set of marketplaces (the rollup dimension), a local
//! timezone for the daily window, and the region its calls go to.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono_tz::Tz;

use crate::error::PipelineError;

/// Sentinel dimension for marketplace ids missing from a scope's table.
pub const UNKNOWN_DIMENSION: &str = "UNK";

/// Generic refresh-token slot consulted after the region-specific one.
pub const GENERIC_REFRESH_SLOT: &str = "LWA_REFRESH_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Na,
    Eu,
    Fe,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::Na, Region::Eu, Region::Fe];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Na => "NA",
            Self::Eu => "EU",
            Self::Fe => "FE",
        }
    }

    pub const fn host(self) -> &'static str {
        match self {
            Self::Na => "sellingpartnerapi-na.amazon.com",
            Self::Eu => "sellingpartnerapi-eu.amazon.com",
            Self::Fe => "sellingpartnerapi-fe.amazon.com",
        }
    }

    /// Region code used in the SigV4 credential scope.
    pub const fn signing_region(self) -> &'static str {
        match self {
            Self::Na => "us-east-1",
            Self::Eu => "eu-west-1",
            Self::Fe => "us-west-2",
        }
    }

    /// Environment variables to try for this region's refresh token, in order.
    pub fn refresh_slots(self) -> [&'static str; 2] {
        let specific = match self {
            Self::Na => "LWA_REFRESH_TOKEN_NA",
            Self::Eu => "LWA_REFRESH_TOKEN_EU",
            Self::Fe => "LWA_REFRESH_TOKEN_FE",
        };
        [specific, GENERIC_REFRESH_SLOT]
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NA" | "US" | "CA" | "MX" | "BR" => Ok(Self::Na),
            "EU" | "UK" => Ok(Self::Eu),
            "FE" => Ok(Self::Fe),
            other => Err(PipelineError::Config(format!("unknown region: '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Eu,
    Uk,
    Na,
}

const EU_MARKETPLACES: &[(&str, &str)] = &[
    ("DE", "A1PA6795UKMFR9"),
    ("FR", "A13V1IB3VIYZZH"),
    ("IT", "APJ6JRA9NG5V4"),
    ("ES", "A1RKKUPIHCS9HS"),
    ("NL", "A1805IZSGTT6HS"),
    ("SE", "A2NODRKZP88ZB9"),
    ("PL", "A1C3SOZRARQ6R3"),
];

const UK_MARKETPLACES: &[(&str, &str)] = &[("UK", "A1F83G8C2ARO7P")];

const NA_MARKETPLACES: &[(&str, &str)] = &[
    ("US", "ATVPDKIKX0DER"),
    ("CA", "A2EUQ1WTGCTBG2"),
    ("MX", "A1AM78C64UM0Y8"),
];

impl Scope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eu => "EU",
            Self::Uk => "UK",
            Self::Na => "NA",
        }
    }

    /// API region serving this scope. UK marketplaces live on the EU cluster.
    pub const fn region(self) -> Region {
        match self {
            Self::Eu | Self::Uk => Region::Eu,
            Self::Na => Region::Na,
        }
    }

    /// `(country, marketplace_id)` pairs, in table order.
    pub const fn marketplaces(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Eu => EU_MARKETPLACES,
            Self::Uk => UK_MARKETPLACES,
            Self::Na => NA_MARKETPLACES,
        }
    }

    pub fn marketplace_ids(self) -> Vec<&'static str> {
        self.marketplaces().iter().map(|(_, id)| *id).collect()
    }

    /// Resolve a marketplace id to its country code.
    pub fn country_for(self, marketplace_id: &str) -> Result<&'static str, PipelineError> {
        self.marketplaces()
            .iter()
            .find(|(_, id)| *id == marketplace_id)
            .map(|(cc, _)| *cc)
            .ok_or_else(|| PipelineError::UnknownDimension {
                marketplace_id: marketplace_id.to_string(),
            })
    }

    /// Like [`Scope::country_for`], recovering unknown ids into [`UNKNOWN_DIMENSION`].
    pub fn country_or_unknown(self, marketplace_id: &str) -> &'static str {
        self.country_for(marketplace_id).unwrap_or(UNKNOWN_DIMENSION)
    }

    pub const fn timezone(self) -> Tz {
        match self {
            Self::Eu => chrono_tz::Europe::Berlin,
            Self::Uk => chrono_tz::Europe::London,
            Self::Na => chrono_tz::America::Los_Angeles,
        }
    }

    /// FBA inventory pools `(pool, marketplace_id)` fetched for this scope.
    pub const fn inventory_pools(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Eu => &[("DE", "A1PA6795UKMFR9"), ("UK", "A1F83G8C2ARO7P")],
            Self::Uk => &[("UK", "A1F83G8C2ARO7P")],
            Self::Na => &[("US", "ATVPDKIKX0DER")],
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EU" => Ok(Self::Eu),
            "UK" => Ok(Self::Uk),
            "NA" | "US" | "CA" | "MX" | "BR" => Ok(Self::Na),
            other => Err(PipelineError::Config(format!(
                "unknown scope: '{}'. Must be EU, UK, or NA.",
                other
            ))),
        }
    }
}

/// Pool id for the NA warehousing-and-distribution inventory.
pub const AWD_POOL: &str = "US_AWD";

/// Inventory pool → region. UK and DE pools are served by the EU cluster.
pub fn region_for_pool(pool: &str) -> Region {
    match pool {
        "DE" | "UK" => Region::Eu,
        _ => Region::Na,
    }
}
