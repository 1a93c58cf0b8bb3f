//! `storefront-json`: competitors exposing a JSON search/catalog API.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pricewatch_core::Competitor;
use pricewatch_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use url::Url;

use crate::storefront::{fill_template, parse_price, resolve_url};
use crate::{AdapterContext, AdapterError, CompetitorSource, Listing};

fn default_url_pointer() -> String {
    "/url".to_string()
}

fn default_name_pointer() -> String {
    "/name".to_string()
}

fn default_price_pointer() -> Option<String> {
    Some("/price".to_string())
}

fn default_divisor() -> f64 {
    1.0
}

fn default_max_pages() -> u32 {
    20
}

/// JSON pointers (RFC 6901) into one item object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonFieldPointers {
    #[serde(default = "default_url_pointer")]
    pub url: String,
    #[serde(default = "default_name_pointer")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub categories: Option<String>,
    #[serde(default = "default_price_pointer")]
    pub list_price: Option<String>,
    #[serde(default)]
    pub promo_price: Option<String>,
}

impl Default for JsonFieldPointers {
    fn default() -> Self {
        Self {
            url: default_url_pointer(),
            name: default_name_pointer(),
            description: None,
            brand: None,
            external_id: None,
            categories: None,
            list_price: default_price_pointer(),
            promo_price: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonApiConfig {
    /// Search endpoint with a `{query}` placeholder.
    pub search_url: String,
    #[serde(default)]
    pub identifier_search_url: Option<String>,
    /// Detail endpoint with a `{url}` placeholder; the listing URL itself when absent.
    #[serde(default)]
    pub detail_url: Option<String>,
    /// Catalog endpoint with an optional `{page}` placeholder.
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Pointer to the item array in search/catalog responses; empty = root.
    #[serde(default)]
    pub items_pointer: String,
    /// Pointer to the item object in detail responses; empty = root.
    #[serde(default)]
    pub detail_pointer: String,
    #[serde(default)]
    pub fields: JsonFieldPointers,
    /// Prices are divided by this (APIs that report cents use 100).
    #[serde(default = "default_divisor")]
    pub price_divisor: f64,
}

pub struct JsonApiSource {
    source_id: String,
    http: Arc<HttpFetcher>,
    base_url: Url,
    config: JsonApiConfig,
}

impl JsonApiSource {
    pub fn from_competitor(
        http: Arc<HttpFetcher>,
        competitor: &Competitor,
    ) -> Result<Self, AdapterError> {
        let config: JsonApiConfig = serde_json::from_value(competitor.config.clone())
            .map_err(|e| AdapterError::Config(format!("storefront-json config: {e}")))?;
        if !config.search_url.contains("{query}") {
            return Err(AdapterError::Config(
                "search_url needs a {query} placeholder".to_string(),
            ));
        }
        if config.price_divisor.is_nan() || config.price_divisor <= 0.0 {
            return Err(AdapterError::Config("price_divisor must be positive".to_string()));
        }
        let base_url = Url::parse(&competitor.base_url)
            .map_err(|e| AdapterError::Config(format!("base url {:?}: {e}", competitor.base_url)))?;
        Ok(Self {
            source_id: format!("competitor-{}", competitor.id),
            http,
            base_url,
            config,
        })
    }

    async fn fetch_json(&self, ctx: &AdapterContext, url: &str) -> Result<JsonValue, AdapterError> {
        let resp = self.http.fetch_text(ctx.run_id, &self.source_id, url).await?;
        serde_json::from_str(&resp.body)
            .map_err(|e| AdapterError::Parse(format!("invalid json from {url}: {e}")))
    }

    async fn fetch_items(
        &self,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<Vec<Listing>, AdapterError> {
        let body = self.fetch_json(ctx, url).await?;
        self.parse_items(&body)
    }

    fn parse_items(&self, body: &JsonValue) -> Result<Vec<Listing>, AdapterError> {
        let items = pointer(body, &self.config.items_pointer)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| {
                AdapterError::Parse(format!("no item array at {:?}", self.config.items_pointer))
            })?;
        Ok(items.iter().filter_map(|item| self.parse_item(item)).collect())
    }

    fn parse_item(&self, item: &JsonValue) -> Option<Listing> {
        let fields = &self.config.fields;
        let href = text_at(item, &fields.url)?;
        let url = resolve_url(&self.base_url, &href)?;
        let name = text_at(item, &fields.name)?;

        let mut listing = Listing::new(url, name);
        listing.description = fields.description.as_deref().and_then(|p| text_at(item, p));
        listing.brand = fields.brand.as_deref().and_then(|p| text_at(item, p));
        listing.external_id = fields.external_id.as_deref().and_then(|p| text_at(item, p));
        listing.categories = fields
            .categories
            .as_deref()
            .and_then(|p| pointer(item, p))
            .and_then(JsonValue::as_array)
            .map(|values| values.iter().filter_map(scalar_text).collect())
            .unwrap_or_default();
        listing.list_price = fields.list_price.as_deref().and_then(|p| self.price_at(item, p));
        listing.promo_price = fields.promo_price.as_deref().and_then(|p| self.price_at(item, p));
        Some(listing)
    }

    fn price_at(&self, item: &JsonValue, path: &str) -> Option<f64> {
        let raw = match pointer(item, path)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => parse_price(s),
            _ => None,
        }?;
        Some(raw / self.config.price_divisor)
    }
}

fn pointer<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        Some(value)
    } else {
        value.pointer(path)
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn text_at(item: &JsonValue, path: &str) -> Option<String> {
    pointer(item, path).and_then(scalar_text)
}

#[async_trait]
impl CompetitorSource for JsonApiSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<Listing, AdapterError> {
        let endpoint = match &self.config.detail_url {
            Some(template) => fill_template(template, "{url}", url),
            None => url.to_string(),
        };
        let body = self.fetch_json(ctx, &endpoint).await?;
        let item = pointer(&body, &self.config.detail_pointer)
            .ok_or_else(|| {
                AdapterError::Parse(format!("no item at {:?}", self.config.detail_pointer))
            })?;
        let mut listing = self
            .parse_item(item)
            .ok_or_else(|| AdapterError::Parse(format!("incomplete item from {endpoint}")))?;
        listing.url = url.to_string();
        Ok(listing)
    }

    fn supports_identifier_lookup(&self) -> bool {
        self.config.identifier_search_url.is_some()
    }

    async fn search_by_identifier(
        &self,
        ctx: &AdapterContext,
        external_id: &str,
    ) -> Result<Vec<Listing>, AdapterError> {
        let Some(template) = &self.config.identifier_search_url else {
            return Ok(Vec::new());
        };
        self.fetch_items(ctx, &fill_template(template, "{id}", external_id))
            .await
    }

    async fn search(
        &self,
        ctx: &AdapterContext,
        query: &str,
    ) -> Result<Vec<Listing>, AdapterError> {
        self.fetch_items(ctx, &fill_template(&self.config.search_url, "{query}", query))
            .await
    }

    fn supports_catalog(&self) -> bool {
        self.config.catalog_url.is_some()
    }

    async fn crawl_catalog(&self, ctx: &AdapterContext) -> Result<Vec<Listing>, AdapterError> {
        let Some(template) = &self.config.catalog_url else {
            return Ok(Vec::new());
        };
        let last_page = if template.contains("{page}") {
            self.config.max_pages.max(1)
        } else {
            1
        };
        let mut seen = HashSet::new();
        let mut listings = Vec::new();
        for page in 1..=last_page {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let url = template.replace("{page}", &page.to_string());
            let found = self.fetch_items(ctx, &url).await?;
            debug!(%url, found = found.len(), "catalog page fetched");
            if found.is_empty() {
                break;
            }
            listings.extend(found.into_iter().filter(|l| seen.insert(l.url.clone())));
        }
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_storage::HttpClientConfig;
    use serde_json::json;

    fn source(config: JsonValue) -> Result<JsonApiSource, AdapterError> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let competitor = Competitor {
            id: 9,
            name: "Perfumeria API".into(),
            base_url: "https://api.shop.test/".into(),
            adapter_id: crate::STOREFRONT_JSON.into(),
            active: true,
            config,
        };
        JsonApiSource::from_competitor(http, &competitor)
    }

    fn config() -> JsonValue {
        json!({
            "search_url": "https://api.shop.test/search?q={query}",
            "items_pointer": "/data/products",
            "fields": {
                "url": "/slug",
                "name": "/title",
                "brand": "/brand/name",
                "external_id": "/ean",
                "categories": "/tags",
                "list_price": "/prices/list",
                "promo_price": "/prices/sale"
            },
            "price_divisor": 100.0
        })
    }

    #[test]
    fn items_are_read_through_pointers() {
        let source = source(config()).unwrap();
        let body = json!({
            "data": {
                "products": [
                    {
                        "slug": "/p/serum-30",
                        "title": "Serum Vitamina C 30ml",
                        "brand": {"name": "Dermo"},
                        "ean": 7790002,
                        "tags": ["rostro", "serum"],
                        "prices": {"list": 452000, "sale": "3990,00"}
                    },
                    {"title": "missing url"}
                ]
            }
        });

        let listings = source.parse_items(&body).unwrap();
        assert_eq!(listings.len(), 1);
        let serum = &listings[0];
        assert_eq!(serum.url, "https://api.shop.test/p/serum-30");
        assert_eq!(serum.brand.as_deref(), Some("Dermo"));
        assert_eq!(serum.external_id.as_deref(), Some("7790002"));
        assert_eq!(serum.categories, vec!["rostro", "serum"]);
        assert_eq!(serum.list_price, Some(4520.0));
        assert_eq!(serum.promo_price, Some(39.9));
    }

    #[test]
    fn missing_item_array_is_a_parse_error() {
        let source = source(config()).unwrap();
        let result = source.parse_items(&json!({"data": {"items": []}}));
        assert!(matches!(result, Err(AdapterError::Parse(_))));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(source(json!({})), Err(AdapterError::Config(_))));

        let mut zero_divisor = config();
        zero_divisor["price_divisor"] = json!(0.0);
        assert!(matches!(source(zero_divisor), Err(AdapterError::Config(_))));

        let defaults = source(json!({"search_url": "https://api.shop.test/s?q={query}"})).unwrap();
        assert!(!defaults.supports_catalog());
        assert!(!defaults.supports_identifier_lookup());
        assert_eq!(defaults.config.fields.list_price.as_deref(), Some("/price"));
    }
}
