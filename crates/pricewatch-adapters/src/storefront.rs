//! `storefront-html`: CSS-selector driven scraping of a competitor's search,
//! detail and category pages.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pricewatch_core::Competitor;
use pricewatch_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::{AdapterContext, AdapterError, CompetitorSource, Listing};

fn default_max_pages() -> u32 {
    20
}

/// Competitor-level settings, read from `competitors.config_json`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorefrontConfig {
    /// Search page URL with a `{query}` placeholder.
    pub search_url: String,
    /// Optional identifier (EAN) search URL with an `{id}` placeholder.
    #[serde(default)]
    pub identifier_search_url: Option<String>,
    /// Category listing URLs crawled into the catalog cache; `{page}` is 1-based.
    #[serde(default)]
    pub catalog_urls: Vec<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    pub selectors: SelectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    pub result_item: String,
    pub result_link: String,
    pub result_name: String,
    #[serde(default)]
    pub result_price: Option<String>,
    #[serde(default)]
    pub result_promo_price: Option<String>,
    #[serde(default)]
    pub result_brand: Option<String>,
    pub detail_name: String,
    #[serde(default)]
    pub detail_price: Option<String>,
    #[serde(default)]
    pub detail_promo_price: Option<String>,
    #[serde(default)]
    pub detail_brand: Option<String>,
    #[serde(default)]
    pub detail_external_id: Option<String>,
    #[serde(default)]
    pub detail_description: Option<String>,
    #[serde(default)]
    pub detail_category: Option<String>,
}

#[derive(Debug)]
struct Selectors {
    result_item: Selector,
    result_link: Selector,
    result_name: Selector,
    result_price: Option<Selector>,
    result_promo_price: Option<Selector>,
    result_brand: Option<Selector>,
    detail_name: Selector,
    detail_price: Option<Selector>,
    detail_promo_price: Option<Selector>,
    detail_brand: Option<Selector>,
    detail_external_id: Option<Selector>,
    detail_description: Option<Selector>,
    detail_category: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Config(format!("invalid selector {selector:?}: {e}")))
}

fn compile_opt(selector: &Option<String>) -> Result<Option<Selector>, AdapterError> {
    selector.as_deref().map(compile).transpose()
}

impl Selectors {
    fn compile(config: &SelectorConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            result_item: compile(&config.result_item)?,
            result_link: compile(&config.result_link)?,
            result_name: compile(&config.result_name)?,
            result_price: compile_opt(&config.result_price)?,
            result_promo_price: compile_opt(&config.result_promo_price)?,
            result_brand: compile_opt(&config.result_brand)?,
            detail_name: compile(&config.detail_name)?,
            detail_price: compile_opt(&config.detail_price)?,
            detail_promo_price: compile_opt(&config.detail_promo_price)?,
            detail_brand: compile_opt(&config.detail_brand)?,
            detail_external_id: compile_opt(&config.detail_external_id)?,
            detail_description: compile_opt(&config.detail_description)?,
            detail_category: compile_opt(&config.detail_category)?,
        })
    }
}

pub struct HtmlStorefrontSource {
    source_id: String,
    http: Arc<HttpFetcher>,
    base_url: Url,
    config: StorefrontConfig,
    selectors: Selectors,
}

impl HtmlStorefrontSource {
    pub fn from_competitor(
        http: Arc<HttpFetcher>,
        competitor: &Competitor,
    ) -> Result<Self, AdapterError> {
        let config: StorefrontConfig = serde_json::from_value(competitor.config.clone())
            .map_err(|e| AdapterError::Config(format!("storefront-html config: {e}")))?;
        Self::new(http, competitor, config)
    }

    pub fn new(
        http: Arc<HttpFetcher>,
        competitor: &Competitor,
        config: StorefrontConfig,
    ) -> Result<Self, AdapterError> {
        if !config.search_url.contains("{query}") {
            return Err(AdapterError::Config(
                "search_url needs a {query} placeholder".to_string(),
            ));
        }
        let base_url = Url::parse(&competitor.base_url)
            .map_err(|e| AdapterError::Config(format!("base url {:?}: {e}", competitor.base_url)))?;
        let selectors = Selectors::compile(&config.selectors)?;
        Ok(Self {
            source_id: format!("competitor-{}", competitor.id),
            http,
            base_url,
            config,
            selectors,
        })
    }

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<(Url, String), AdapterError> {
        let resp = self.http.fetch_text(ctx.run_id, &self.source_id, url).await?;
        let page_url = Url::parse(&resp.final_url).unwrap_or_else(|_| self.base_url.clone());
        Ok((page_url, resp.body))
    }

    async fn fetch_results(
        &self,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<Vec<Listing>, AdapterError> {
        let (page_url, body) = self.fetch_page(ctx, url).await?;
        Ok(self.parse_results(&body, &page_url))
    }

    fn parse_results(&self, body: &str, page_url: &Url) -> Vec<Listing> {
        let document = Html::parse_document(body);
        let s = &self.selectors;
        document
            .select(&s.result_item)
            .filter_map(|item| {
                let href = item
                    .select(&s.result_link)
                    .next()
                    .and_then(|a| a.value().attr("href"))?;
                let url = resolve_url(page_url, href)?;
                let name = first_text(item, &s.result_name)?;
                let mut listing = Listing::new(url, name);
                listing.list_price = first_price(item, s.result_price.as_ref());
                listing.promo_price = first_price(item, s.result_promo_price.as_ref());
                listing.brand = s.result_brand.as_ref().and_then(|sel| first_text(item, sel));
                Some(listing)
            })
            .collect()
    }

    fn parse_detail(&self, body: &str, url: &str) -> Result<Listing, AdapterError> {
        let document = Html::parse_document(body);
        let root = document.root_element();
        let s = &self.selectors;
        let name = first_text(root, &s.detail_name)
            .ok_or_else(|| AdapterError::Parse(format!("no product name on {url}")))?;

        let mut listing = Listing::new(url, name);
        listing.list_price = first_price(root, s.detail_price.as_ref());
        listing.promo_price = first_price(root, s.detail_promo_price.as_ref());
        listing.brand = s.detail_brand.as_ref().and_then(|sel| first_text(root, sel));
        listing.external_id = s.detail_external_id.as_ref().and_then(|sel| first_text(root, sel));
        listing.description = s.detail_description.as_ref().and_then(|sel| first_text(root, sel));
        listing.categories = s
            .detail_category
            .as_ref()
            .map(|sel| root.select(sel).filter_map(element_text).collect())
            .unwrap_or_default();
        Ok(listing)
    }
}

#[async_trait]
impl CompetitorSource for HtmlStorefrontSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<Listing, AdapterError> {
        let (_, body) = self.fetch_page(ctx, url).await?;
        self.parse_detail(&body, url)
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
        let url = fill_template(template, "{id}", external_id);
        self.fetch_results(ctx, &url).await
    }

    async fn search(
        &self,
        ctx: &AdapterContext,
        query: &str,
    ) -> Result<Vec<Listing>, AdapterError> {
        let url = fill_template(&self.config.search_url, "{query}", query);
        self.fetch_results(ctx, &url).await
    }

    fn supports_catalog(&self) -> bool {
        !self.config.catalog_urls.is_empty()
    }

    async fn crawl_catalog(&self, ctx: &AdapterContext) -> Result<Vec<Listing>, AdapterError> {
        let mut seen = HashSet::new();
        let mut listings = Vec::new();
        for template in &self.config.catalog_urls {
            let paged = template.contains("{page}");
            let last_page = if paged { self.config.max_pages.max(1) } else { 1 };
            for page in 1..=last_page {
                if ctx.cancel.is_cancelled() {
                    return Ok(listings);
                }
                let url = template.replace("{page}", &page.to_string());
                let found = self.fetch_results(ctx, &url).await?;
                debug!(%url, found = found.len(), "catalog page crawled");
                if found.is_empty() {
                    break;
                }
                listings.extend(found.into_iter().filter(|l| seen.insert(l.url.clone())));
            }
        }
        Ok(listings)
    }
}

/// Substitute `key` in `template` with the form-encoded `value`.
pub(crate) fn fill_template(template: &str, key: &str, value: &str) -> String {
    let encoded = url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>();
    template.replace(key, &encoded)
}

pub(crate) fn resolve_url(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    base.join(href).ok().map(String::from)
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).find_map(element_text)
}

fn first_price(scope: ElementRef<'_>, selector: Option<&Selector>) -> Option<f64> {
    selector
        .and_then(|sel| first_text(scope, sel))
        .and_then(|text| parse_price(&text))
}

/// Parse a locale-formatted price such as `1.234,56 €`, `$1,234.56` or `12,50`.
///
/// With both separators present the last one is the decimal mark. A lone
/// separator is decimal unless it repeats or is followed by exactly three digits.
pub fn parse_price(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let raw = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect::<String>();
    let raw = raw.trim_end_matches(|c: char| c == '.' || c == ',');

    let decimal = match (raw.rfind('.'), raw.rfind(',')) {
        (Some(dot), Some(comma)) => Some(if dot > comma { '.' } else { ',' }),
        (Some(_), None) => lone_decimal_separator(raw, '.'),
        (None, Some(_)) => lone_decimal_separator(raw, ','),
        (None, None) => None,
    };

    raw.chars()
        .filter_map(|c| match c {
            '0'..='9' => Some(c),
            c if Some(c) == decimal => Some('.'),
            _ => None,
        })
        .collect::<String>()
        .parse()
        .ok()
}

fn lone_decimal_separator(raw: &str, separator: char) -> Option<char> {
    let groups = raw.split(separator).skip(1).collect::<Vec<_>>();
    match groups.as_slice() {
        [fraction] if fraction.len() != 3 => Some(separator),
        _ => None,
    }
}
