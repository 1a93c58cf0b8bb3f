//! Core domain model and persistence contracts for pricewatch.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-core";

pub type ProductId = i64;
pub type CompetitorId = i64;
pub type BrandId = i64;

#[derive(Debug, Error)]
#[error("unknown {kind} value {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// How a local product was tied to a competitor listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMethod {
    Url,
    ExactId,
    FuzzyName,
    Ai,
    Manual,
    NoMatch,
}

wire_enum!(MatchMethod, "match method", {
    Url => "url",
    ExactId => "exact-id",
    FuzzyName => "fuzzy-name",
    Ai => "ai",
    Manual => "manual",
    NoMatch => "no-match",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    List,
    Promo,
    NoMatch,
}

wire_enum!(AlertType, "alert type", {
    List => "list",
    Promo => "promo",
    NoMatch => "no_match",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

wire_enum!(RunStatus, "run status", {
    Running => "running",
    Success => "success",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Scheduled,
}

wire_enum!(TriggerType, "trigger type", {
    Manual => "manual",
    Scheduled => "scheduled",
});

/// Local catalog item. Baseline prices are owned by catalog administration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub external_id: Option<String>,
    pub description: String,
    pub brand_id: Option<BrandId>,
    pub list_price: Option<f64>,
    pub promo_price: Option<f64>,
}

/// A tracked storefront. `config` carries adapter-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub id: CompetitorId,
    pub name: String,
    pub base_url: String,
    pub adapter_id: String,
    pub active: bool,
    #[serde(default)]
    pub config: JsonValue,
}

/// Target product handed to an adapter, with the current mapping for that competitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRow {
    pub product: Product,
    pub brand_name: Option<String>,
    pub mapped_url: Option<String>,
    pub match_method: Option<MatchMethod>,
    pub match_score: Option<f64>,
}

impl ProductRow {
    /// URL of a previously confirmed mapping, if one exists.
    pub fn confirmed_url(&self) -> Option<&str> {
        match self.match_method {
            Some(MatchMethod::NoMatch) | None => None,
            Some(_) => self.mapped_url.as_deref(),
        }
    }
}

/// One (product, competitor) mapping row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorProduct {
    pub product_id: ProductId,
    pub competitor_id: CompetitorId,
    pub url: Option<String>,
    pub name: Option<String>,
    pub match_method: MatchMethod,
    pub match_score: Option<f64>,
    pub last_matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub product_id: ProductId,
    pub competitor_id: CompetitorId,
    pub captured_on: NaiveDate,
    pub list_price: Option<f64>,
    pub promo_price: Option<f64>,
}

/// Cached competitor-side listing, keyed by (competitor, url).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub competitor_id: CompetitorId,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub external_id: Option<String>,
    pub brand: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub list_price: Option<f64>,
    pub promo_price: Option<f64>,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub brand_id: BrandId,
    pub list_price_threshold_pct: Option<f64>,
    pub promo_price_threshold_pct: Option<f64>,
    pub active: bool,
}

/// Snapshot joined to the product it observes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub snapshot: PriceSnapshot,
    pub brand_id: Option<BrandId>,
    pub baseline_list_price: Option<f64>,
    pub baseline_promo_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub product_id: ProductId,
    pub competitor_id: CompetitorId,
    pub alert_type: AlertType,
    pub message: String,
    pub delta_pct: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        (self.product_id, self.alert_type)
    }
}

pub type AlertKey = (ProductId, AlertType);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(Run),
    AlreadyRunning,
}

/// UTC bounds `[start, end)` of a calendar day.
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("run {0} is already completed")]
    RunAlreadyCompleted(Uuid),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<ParseEnumError> for StoreError {
    fn from(err: ParseEnumError) -> Self {
        Self::InvalidData(err.to_string())
    }
}

/// Persistence contract for catalog, mappings, snapshots, cache and alerts.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Active products to reconcile against one competitor, ordered by id.
    /// `only_new` drops products already snapshotted on `run_date` and products
    /// whose mapping is `no-match`. `batch_size == 0` means no limit.
    async fn load_target_products(
        &self,
        competitor_id: CompetitorId,
        run_date: NaiveDate,
        only_new: bool,
        batch_size: usize,
    ) -> Result<Vec<ProductRow>, StoreError>;

    async fn upsert_mapping(&self, mapping: &CompetitorProduct) -> Result<(), StoreError>;

    async fn mark_no_match(
        &self,
        product_id: ProductId,
        competitor_id: CompetitorId,
    ) -> Result<(), StoreError>;

    async fn upsert_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError>;

    /// Mapping and snapshot upserts that succeed or fail together.
    async fn record_match(
        &self,
        mapping: &CompetitorProduct,
        snapshot: &PriceSnapshot,
    ) -> Result<(), StoreError>;

    async fn upsert_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError>;

    async fn load_catalog_entries(
        &self,
        competitor_id: CompetitorId,
    ) -> Result<Vec<CatalogEntry>, StoreError>;

    async fn load_active_competitors(
        &self,
        filter: Option<CompetitorId>,
    ) -> Result<Vec<Competitor>, StoreError>;

    async fn load_active_alert_rules(&self) -> Result<Vec<AlertRule>, StoreError>;

    async fn load_snapshots_with_products(
        &self,
        competitor_id: CompetitorId,
        captured_on: NaiveDate,
    ) -> Result<Vec<SnapshotRow>, StoreError>;

    async fn load_no_match_products(
        &self,
        competitor_id: CompetitorId,
    ) -> Result<Vec<ProductId>, StoreError>;

    async fn load_todays_alert_keys(
        &self,
        competitor_id: CompetitorId,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<HashSet<AlertKey>, StoreError>;

    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<usize, StoreError>;
}

/// Run lifecycle persistence. `try_start_run` is the system-wide single-run gate.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn try_start_run(&self, trigger: TriggerType) -> Result<StartOutcome, StoreError>;

    async fn complete_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_method_uses_hyphenated_wire_names() {
        assert_eq!(MatchMethod::ExactId.as_str(), "exact-id");
        assert_eq!("no-match".parse::<MatchMethod>().unwrap(), MatchMethod::NoMatch);
        assert_eq!(
            serde_json::to_string(&MatchMethod::FuzzyName).unwrap(),
            "\"fuzzy-name\""
        );
        assert!("fuzzy".parse::<MatchMethod>().is_err());
    }

    #[test]
    fn no_match_rows_have_no_confirmed_url() {
        let mut row = ProductRow {
            product: Product {
                id: 1,
                external_id: None,
                description: "Crema".into(),
                brand_id: None,
                list_price: None,
                promo_price: None,
            },
            brand_name: None,
            mapped_url: Some("https://shop.test/p/1".into()),
            match_method: Some(MatchMethod::NoMatch),
            match_score: None,
        };
        assert_eq!(row.confirmed_url(), None);
        row.match_method = Some(MatchMethod::Manual);
        assert_eq!(row.confirmed_url(), Some("https://shop.test/p/1"));
    }

    #[test]
    fn day_bounds_cover_one_utc_day() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let (start, end) = day_bounds(day);
        assert_eq!(start.to_rfc3339(), "2026-03-01T00:00:00+00:00");
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert_eq!("failed".parse::<RunStatus>().unwrap(), RunStatus::Failed);
    }
}
