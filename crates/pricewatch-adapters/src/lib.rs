//! Competitor adapter contracts, the tiered resolver and built-in storefront adapters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pricewatch_core::{CatalogEntry, CatalogStore, Competitor, CompetitorId, StoreError};
use pricewatch_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod ai;
pub mod matching;

mod json_api;
mod resolver;
mod storefront;

pub use json_api::{JsonApiConfig, JsonApiSource};
pub use resolver::{MatchSettings, Resolver};
pub use storefront::{parse_price, HtmlStorefrontSource, StorefrontConfig};

pub const CRATE_NAME: &str = "pricewatch-adapters";

pub const STOREFRONT_HTML: &str = "storefront-html";
pub const STOREFRONT_JSON: &str = "storefront-json";

/// A competitor-side product as read from a search result, detail page or catalog crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub external_id: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub list_price: Option<f64>,
    pub promo_price: Option<f64>,
    pub extracted_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            description: None,
            brand: None,
            external_id: None,
            categories: Vec::new(),
            list_price: None,
            promo_price: None,
            extracted_at: Utc::now(),
        }
    }

    /// Prices can be reused without a live fetch when read on or after
    /// `run_date`. A back-dated run cannot fetch anything older than today's
    /// price, so a later read is as good as a live one.
    pub fn is_fresh(&self, run_date: NaiveDate) -> bool {
        self.extracted_at.date_naive() >= run_date
            && (self.list_price.is_some() || self.promo_price.is_some())
    }

    pub fn to_catalog_entry(&self, competitor_id: CompetitorId) -> CatalogEntry {
        CatalogEntry {
            competitor_id,
            url: self.url.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            external_id: self.external_id.clone(),
            brand: self.brand.clone(),
            categories: self.categories.clone(),
            list_price: self.list_price,
            promo_price: self.promo_price,
            extracted_at: self.extracted_at,
        }
    }
}

impl From<CatalogEntry> for Listing {
    fn from(entry: CatalogEntry) -> Self {
        Self {
            url: entry.url,
            name: entry.name,
            description: entry.description,
            brand: entry.brand,
            external_id: entry.external_id,
            categories: entry.categories,
            list_price: entry.list_price,
            promo_price: entry.promo_price,
            extracted_at: entry.extracted_at,
        }
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(brand) = &self.brand {
            write!(f, " | brand: {brand}")?;
        }
        if let Some(id) = &self.external_id {
            write!(f, " | code: {id}")?;
        }
        if let Some(price) = self.promo_price.or(self.list_price) {
            write!(f, " | price: {price:.2}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub competitor_id: CompetitorId,
    pub competitor_name: String,
    pub base_url: String,
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    /// Restrict to products without a snapshot for `run_date`.
    pub only_new: bool,
    /// 0 = unbounded.
    pub batch_size: usize,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
    pub unmatched: usize,
    pub cancelled: bool,
    pub messages: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid adapter configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not parse competitor response: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Message(String),
}

/// One adapter per competitor: resolves that competitor's products and records prices.
#[async_trait]
pub trait CompetitorAdapter: Send + Sync {
    fn adapter_id(&self) -> &str;

    async fn run(&self, ctx: &AdapterContext) -> Result<RunResult, AdapterError>;
}

/// Competitor-specific I/O. The resolution algorithm lives in [`Resolver`].
#[async_trait]
pub trait CompetitorSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Live detail page for a known listing URL.
    async fn fetch_listing(&self, ctx: &AdapterContext, url: &str) -> Result<Listing, AdapterError>;

    fn supports_identifier_lookup(&self) -> bool {
        false
    }

    async fn search_by_identifier(
        &self,
        _ctx: &AdapterContext,
        _external_id: &str,
    ) -> Result<Vec<Listing>, AdapterError> {
        Ok(Vec::new())
    }

    async fn search(&self, ctx: &AdapterContext, query: &str) -> Result<Vec<Listing>, AdapterError>;

    fn supports_catalog(&self) -> bool {
        false
    }

    async fn crawl_catalog(&self, _ctx: &AdapterContext) -> Result<Vec<Listing>, AdapterError> {
        Ok(Vec::new())
    }
}

/// Shared collaborators handed to every adapter factory.
#[derive(Clone)]
pub struct AdapterDeps {
    pub store: Arc<dyn CatalogStore>,
    pub http: Arc<HttpFetcher>,
    pub ai: Option<Arc<ai::AiDisambiguator>>,
    pub settings: MatchSettings,
}

pub type AdapterFactory = Arc<
    dyn Fn(&AdapterDeps, &Competitor) -> Result<Box<dyn CompetitorAdapter>, AdapterError>
        + Send
        + Sync,
>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no adapter registered as {0:?}")]
    NotFound(String),
    #[error("adapter {adapter_id:?} could not be built: {source}")]
    Config {
        adapter_id: String,
        source: AdapterError,
    },
}

/// Compile-time map from adapter id to factory.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(STOREFRONT_HTML, |deps, competitor| {
            let source = HtmlStorefrontSource::from_competitor(deps.http.clone(), competitor)?;
            let adapter: Box<dyn CompetitorAdapter> =
                Box::new(Resolver::from_deps(STOREFRONT_HTML, source, deps));
            Ok(adapter)
        });
        registry.register(STOREFRONT_JSON, |deps, competitor| {
            let source = JsonApiSource::from_competitor(deps.http.clone(), competitor)?;
            let adapter: Box<dyn CompetitorAdapter> =
                Box::new(Resolver::from_deps(STOREFRONT_JSON, source, deps));
            Ok(adapter)
        });
        registry
    }

    pub fn register<F>(&mut self, adapter_id: impl Into<String>, factory: F)
    where
        F: Fn(&AdapterDeps, &Competitor) -> Result<Box<dyn CompetitorAdapter>, AdapterError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(adapter_id.into(), Arc::new(factory));
    }

    pub fn adapter_ids(&self) -> Vec<&str> {
        let mut ids = self.factories.keys().map(String::as_str).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn resolve(
        &self,
        deps: &AdapterDeps,
        competitor: &Competitor,
    ) -> Result<Box<dyn CompetitorAdapter>, RegistryError> {
        let factory = self
            .factories
            .get(&competitor.adapter_id)
            .ok_or_else(|| RegistryError::NotFound(competitor.adapter_id.clone()))?;
        factory(deps, competitor).map_err(|source| RegistryError::Config {
            adapter_id: competitor.adapter_id.clone(),
            source,
        })
    }
}
