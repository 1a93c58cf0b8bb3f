use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pricewatch_core::{CatalogStore, CompetitorProduct, MatchMethod, PriceSnapshot, ProductRow};
use tracing::{debug, debug_span, info, info_span, warn, Instrument};

use crate::ai::AiDisambiguator;
use crate::matching::{TextMatcher, DEFAULT_MAX_QUERY_TOKENS};
use crate::{
    AdapterContext, AdapterDeps, AdapterError, CompetitorAdapter, CompetitorSource, Listing,
    RunResult,
};

#[derive(Debug, Clone)]
pub struct MatchSettings {
    /// Best text score at or above this is accepted without AI.
    pub min_score: f64,
    pub max_query_tokens: usize,
    /// Cached catalog is reused while its newest entry is younger than this.
    pub catalog_refresh: Duration,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            min_score: 0.55,
            max_query_tokens: DEFAULT_MAX_QUERY_TOKENS,
            catalog_refresh: Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Created,
    Updated,
    NoMatch,
}

/// Tiered resolution (stored URL, exact identifier, text search, AI) over a
/// [`CompetitorSource`]. Products are handled sequentially.
pub struct Resolver<S> {
    adapter_id: String,
    source: S,
    store: Arc<dyn CatalogStore>,
    ai: Option<Arc<AiDisambiguator>>,
    matcher: TextMatcher,
    settings: MatchSettings,
}

impl<S: CompetitorSource> Resolver<S> {
    pub fn new(
        adapter_id: impl Into<String>,
        source: S,
        store: Arc<dyn CatalogStore>,
        settings: MatchSettings,
    ) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            source,
            store,
            ai: None,
            matcher: TextMatcher::new(settings.max_query_tokens),
            settings,
        }
    }

    pub fn from_deps(adapter_id: impl Into<String>, source: S, deps: &AdapterDeps) -> Self {
        Self::new(adapter_id, source, deps.store.clone(), deps.settings.clone())
            .with_ai(deps.ai.clone())
    }

    pub fn with_ai(mut self, ai: Option<Arc<AiDisambiguator>>) -> Self {
        self.ai = ai;
        self
    }

    async fn prepare_cache(&self, ctx: &AdapterContext) -> Option<Vec<Listing>> {
        if !self.source.supports_catalog() {
            return None;
        }
        match self.load_or_rebuild_cache(ctx).await {
            Ok(listings) if listings.is_empty() => None,
            Ok(listings) => Some(listings),
            Err(err) => {
                warn!(
                    competitor_id = ctx.competitor_id,
                    error = %err,
                    "catalog cache unavailable; falling back to live search"
                );
                None
            }
        }
    }

    async fn load_or_rebuild_cache(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<Listing>, AdapterError> {
        let entries = self.store.load_catalog_entries(ctx.competitor_id).await?;
        let newest = entries.iter().map(|e| e.extracted_at).max();
        if newest.is_some_and(|at| Utc::now() - at <= self.settings.catalog_refresh) {
            debug!(entries = entries.len(), "catalog cache is within refresh window");
            return Ok(entries.into_iter().map(Listing::from).collect());
        }

        let crawled = self.source.crawl_catalog(ctx).await?;
        info!(
            competitor_id = ctx.competitor_id,
            listings = crawled.len(),
            "catalog cache rebuilt"
        );
        for listing in &crawled {
            self.store
                .upsert_catalog_entry(&listing.to_catalog_entry(ctx.competitor_id))
                .await?;
        }
        let entries = self.store.load_catalog_entries(ctx.competitor_id).await?;
        Ok(entries.into_iter().map(Listing::from).collect())
    }

    async fn resolve_product(
        &self,
        ctx: &AdapterContext,
        cache: Option<&[Listing]>,
        row: &ProductRow,
    ) -> Result<Resolution, AdapterError> {
        if let Some(url) = row.confirmed_url() {
            return self.refresh_confirmed(ctx, cache, row, url).await;
        }

        if let Some(external_id) = row
            .product
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            let hits = self.identifier_hits(ctx, cache, external_id).await?;
            match hits.as_slice() {
                [] => debug!(external_id, "no identifier hits; trying text search"),
                [hit] => {
                    debug!(external_id, url = %hit.url, "single identifier hit");
                    return self.accept(ctx, row, hit, MatchMethod::ExactId, 1.0).await;
                }
                _ => return self.decide(ctx, row, &hits, MatchMethod::ExactId).await,
            }
        }

        let query = self.matcher.build_query(&row.product.description);
        if query.is_empty() {
            debug!("description yields no search terms");
            return self.no_match(ctx, row).await;
        }
        match cache {
            Some(listings) => self.decide(ctx, row, listings, MatchMethod::FuzzyName).await,
            None => {
                let found = self.source.search(ctx, &query).await?;
                self.decide(ctx, row, &found, MatchMethod::FuzzyName).await
            }
        }
    }

    /// Tier 1: a confirmed mapping is re-priced, never re-matched.
    async fn refresh_confirmed(
        &self,
        ctx: &AdapterContext,
        cache: Option<&[Listing]>,
        row: &ProductRow,
        url: &str,
    ) -> Result<Resolution, AdapterError> {
        let cached = cache
            .and_then(|listings| listings.iter().find(|l| l.url == url))
            .filter(|l| l.is_fresh(ctx.run_date));
        let listing = match cached {
            Some(listing) => listing.clone(),
            None => self.fetch_and_cache(ctx, url).await?,
        };
        let method = row.match_method.unwrap_or(MatchMethod::Url);
        self.record(ctx, row, url, &listing, method, row.match_score)
            .await?;
        Ok(Resolution::Updated)
    }

    async fn identifier_hits(
        &self,
        ctx: &AdapterContext,
        cache: Option<&[Listing]>,
        external_id: &str,
    ) -> Result<Vec<Listing>, AdapterError> {
        let cached = cache
            .unwrap_or_default()
            .iter()
            .filter(|l| {
                l.external_id
                    .as_deref()
                    .is_some_and(|id| id.trim().eq_ignore_ascii_case(external_id))
            })
            .cloned()
            .collect::<Vec<_>>();
        if !cached.is_empty() || !self.source.supports_identifier_lookup() {
            return Ok(cached);
        }
        self.source.search_by_identifier(ctx, external_id).await
    }

    /// Rank `candidates`, accept the best at or above `min_score`, else ask the
    /// AI tier, else record no-match.
    async fn decide(
        &self,
        ctx: &AdapterContext,
        row: &ProductRow,
        candidates: &[Listing],
        method: MatchMethod,
    ) -> Result<Resolution, AdapterError> {
        let description = &row.product.description;
        let ranked = self.matcher.rank(description, candidates, |l| l.name.as_str());
        let Some(best) = ranked.first().copied() else {
            debug!("no candidates");
            return self.no_match(ctx, row).await;
        };

        if best.score >= self.settings.min_score {
            let chosen = &candidates[best.index];
            debug!(score = best.score, url = %chosen.url, %method, "text match accepted");
            return self.accept(ctx, row, chosen, method, best.score).await;
        }

        if let Some(ai) = &self.ai {
            let top = ranked.iter().take(ai.top_k()).collect::<Vec<_>>();
            let texts = top
                .iter()
                .map(|r| candidates[r.index].to_string())
                .collect::<Vec<_>>();
            let prompt = match &row.brand_name {
                Some(brand) => format!("{description} (brand: {brand})"),
                None => description.clone(),
            };
            if let Some(selection) = ai.select(&prompt, &texts).await {
                let chosen = &candidates[top[selection.index].index];
                debug!(confidence = selection.confidence, url = %chosen.url, "ai match accepted");
                return self
                    .accept(ctx, row, chosen, MatchMethod::Ai, selection.confidence)
                    .await;
            }
        }

        debug!(best_score = best.score, "no candidate met the threshold");
        self.no_match(ctx, row).await
    }

    async fn accept(
        &self,
        ctx: &AdapterContext,
        row: &ProductRow,
        candidate: &Listing,
        method: MatchMethod,
        score: f64,
    ) -> Result<Resolution, AdapterError> {
        let listing = if candidate.is_fresh(ctx.run_date) {
            self.store
                .upsert_catalog_entry(&candidate.to_catalog_entry(ctx.competitor_id))
                .await?;
            candidate.clone()
        } else {
            self.fetch_and_cache(ctx, &candidate.url).await?
        };
        self.record(ctx, row, &candidate.url, &listing, method, Some(score))
            .await?;
        Ok(Resolution::Created)
    }

    async fn fetch_and_cache(
        &self,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<Listing, AdapterError> {
        let listing = self.source.fetch_listing(ctx, url).await?;
        self.store
            .upsert_catalog_entry(&listing.to_catalog_entry(ctx.competitor_id))
            .await?;
        Ok(listing)
    }

    async fn record(
        &self,
        ctx: &AdapterContext,
        row: &ProductRow,
        url: &str,
        listing: &Listing,
        method: MatchMethod,
        score: Option<f64>,
    ) -> Result<(), AdapterError> {
        let mapping = CompetitorProduct {
            product_id: row.product.id,
            competitor_id: ctx.competitor_id,
            url: Some(url.to_string()),
            name: Some(listing.name.clone()),
            match_method: method,
            match_score: score,
            last_matched_at: Utc::now(),
        };
        let snapshot = PriceSnapshot {
            product_id: row.product.id,
            competitor_id: ctx.competitor_id,
            captured_on: ctx.run_date,
            list_price: listing.list_price,
            promo_price: listing.promo_price,
        };
        self.store.record_match(&mapping, &snapshot).await?;
        Ok(())
    }

    async fn no_match(
        &self,
        ctx: &AdapterContext,
        row: &ProductRow,
    ) -> Result<Resolution, AdapterError> {
        self.store
            .mark_no_match(row.product.id, ctx.competitor_id)
            .await?;
        Ok(Resolution::NoMatch)
    }
}

#[async_trait]
impl<S: CompetitorSource + 'static> CompetitorAdapter for Resolver<S> {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    async fn run(&self, ctx: &AdapterContext) -> Result<RunResult, AdapterError> {
        let span = info_span!(
            "resolve_competitor",
            run_id = %ctx.run_id,
            competitor_id = ctx.competitor_id,
            source_id = self.source.source_id()
        );
        async {
            let products = self
                .store
                .load_target_products(ctx.competitor_id, ctx.run_date, ctx.only_new, ctx.batch_size)
                .await?;
            info!(products = products.len(), only_new = ctx.only_new, "resolving products");

            let cache = self.prepare_cache(ctx).await;
            let mut result = RunResult::default();

            for row in &products {
                if ctx.cancel.is_cancelled() {
                    info!(processed = result.processed, "cancellation observed; stopping");
                    result.cancelled = true;
                    break;
                }
                result.processed += 1;

                let outcome = self
                    .resolve_product(ctx, cache.as_deref(), row)
                    .instrument(debug_span!("resolve_product", product_id = row.product.id))
                    .await;
                match outcome {
                    Ok(Resolution::Created) => result.created += 1,
                    Ok(Resolution::Updated) => result.updated += 1,
                    Ok(Resolution::NoMatch) => result.unmatched += 1,
                    Err(err) => {
                        warn!(
                            product_id = row.product.id,
                            error = %err,
                            "product resolution failed"
                        );
                        result.errors += 1;
                        result
                            .messages
                            .push(format!("product {}: {err}", row.product.id));
                    }
                }
            }
            Ok(result)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::tests::{disambiguator, ScriptedClient};
    use pricewatch_core::Product;
    use pricewatch_storage::{FetchError, MemoryStore};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const COMPETITOR: i64 = 7;

    #[derive(Default)]
    struct FakeSource {
        details: HashMap<String, Listing>,
        timeouts: Vec<String>,
        identifiers: Option<HashMap<String, Vec<Listing>>>,
        results: Vec<Listing>,
        catalog: Option<Result<Vec<Listing>, String>>,
        searches: AtomicUsize,
        fetches: AtomicUsize,
        crawls: AtomicUsize,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompetitorSource for FakeSource {
        fn source_id(&self) -> &str {
            "fake"
        }

        async fn fetch_listing(
            &self,
            _ctx: &AdapterContext,
            url: &str,
        ) -> Result<Listing, AdapterError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.timeouts.iter().any(|u| u == url) {
                return Err(AdapterError::Message(format!("timed out fetching {url}")));
            }
            self.details.get(url).cloned().ok_or_else(|| {
                AdapterError::Fetch(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
            })
        }

        fn supports_identifier_lookup(&self) -> bool {
            self.identifiers.is_some()
        }

        async fn search_by_identifier(
            &self,
            _ctx: &AdapterContext,
            external_id: &str,
        ) -> Result<Vec<Listing>, AdapterError> {
            Ok(self
                .identifiers
                .as_ref()
                .and_then(|ids| ids.get(external_id).cloned())
                .unwrap_or_default())
        }

        async fn search(
            &self,
            _ctx: &AdapterContext,
            query: &str,
        ) -> Result<Vec<Listing>, AdapterError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.results.clone())
        }

        fn supports_catalog(&self) -> bool {
            self.catalog.is_some()
        }

        async fn crawl_catalog(&self, _ctx: &AdapterContext) -> Result<Vec<Listing>, AdapterError> {
            self.crawls.fetch_add(1, Ordering::SeqCst);
            match &self.catalog {
                Some(Ok(listings)) => Ok(listings.clone()),
                Some(Err(message)) => Err(AdapterError::Message(message.clone())),
                None => Ok(Vec::new()),
            }
        }
    }

    fn today() -> chrono::NaiveDate {
        Utc::now().date_naive()
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            competitor_id: COMPETITOR,
            competitor_name: "Farmacia Test".into(),
            base_url: "https://shop.test".into(),
            run_id: Uuid::new_v4(),
            run_date: today(),
            only_new: false,
            batch_size: 0,
            cancel: CancellationToken::new(),
        }
    }

    fn listing(url: &str, name: &str, list_price: Option<f64>) -> Listing {
        let mut listing = Listing::new(url, name);
        listing.list_price = list_price;
        listing
    }

    fn stale(mut listing: Listing) -> Listing {
        listing.extracted_at = Utc::now() - Duration::days(1);
        listing
    }

    async fn store_with(description: &str, external_id: Option<&str>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .add_product(Product {
                id: 1,
                external_id: external_id.map(str::to_string),
                description: description.into(),
                brand_id: None,
                list_price: Some(100.0),
                promo_price: None,
            })
            .await;
        store
    }

    fn resolver(source: FakeSource, store: &Arc<MemoryStore>) -> Resolver<FakeSource> {
        Resolver::new("fake", source, store.clone(), MatchSettings::default())
    }

    async fn seed_mapping(
        store: &MemoryStore,
        method: MatchMethod,
        url: &str,
    ) -> CompetitorProduct {
        let mapping = CompetitorProduct {
            product_id: 1,
            competitor_id: COMPETITOR,
            url: Some(url.into()),
            name: Some("Crema".into()),
            match_method: method,
            match_score: Some(0.8),
            last_matched_at: Utc::now() - Duration::days(3),
        };
        store.upsert_mapping(&mapping).await.unwrap();
        mapping
    }

    #[tokio::test]
    async fn stored_url_that_now_404s_is_an_error_without_search_fallback() {
        let store = store_with("Crema Hidratante", None).await;
        let before = seed_mapping(&store, MatchMethod::FuzzyName, "https://shop.test/p/gone").await;
        let source = FakeSource {
            results: vec![listing("https://shop.test/p/new", "Crema Hidratante", Some(9.0))],
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!((result.processed, result.errors, result.updated), (1, 1, 0));
        assert_eq!(resolver.source.searches.load(Ordering::SeqCst), 0);
        assert_eq!(store.mapping(1, COMPETITOR).await, Some(before));
        assert_eq!(store.snapshot_count().await, 0);
        assert!(result.messages[0].contains("404"));
    }

    #[tokio::test]
    async fn stored_url_timeout_leaves_mapping_untouched() {
        let store = store_with("Crema Hidratante", None).await;
        let before = seed_mapping(&store, MatchMethod::Ai, "https://shop.test/p/slow").await;
        let source = FakeSource {
            timeouts: vec!["https://shop.test/p/slow".into()],
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.errors, 1);
        assert_eq!(result.updated, 0);
        assert_eq!(store.mapping(1, COMPETITOR).await, Some(before));
    }

    #[tokio::test]
    async fn confirmed_mapping_is_repriced_keeping_its_method() {
        let store = store_with("Crema Hidratante", None).await;
        seed_mapping(&store, MatchMethod::Manual, "https://shop.test/p/1").await;
        let mut details = HashMap::new();
        details.insert(
            "https://shop.test/p/1".to_string(),
            listing("https://shop.test/p/1", "Crema Hidratante 50ml", Some(12.0)),
        );
        let resolver = resolver(FakeSource { details, ..Default::default() }, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.updated, 1);
        let mapping = store.mapping(1, COMPETITOR).await.unwrap();
        assert_eq!(mapping.match_method, MatchMethod::Manual);
        assert_eq!(mapping.match_score, Some(0.8));
        let snapshot = store.snapshot(1, COMPETITOR, today()).await.unwrap();
        assert_eq!(snapshot.list_price, Some(12.0));
    }

    #[tokio::test]
    async fn single_identifier_hit_is_an_exact_match() {
        let store = store_with("Protector Solar FPS 50", Some("7790001")).await;
        let mut identifiers = HashMap::new();
        identifiers.insert(
            "7790001".to_string(),
            vec![listing("https://shop.test/p/sun", "Solar 50 Spray", Some(20.0))],
        );
        let source = FakeSource {
            identifiers: Some(identifiers),
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(resolver.source.searches.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.source.fetches.load(Ordering::SeqCst), 0);
        let mapping = store.mapping(1, COMPETITOR).await.unwrap();
        assert_eq!(mapping.match_method, MatchMethod::ExactId);
        assert_eq!(mapping.match_score, Some(1.0));
        assert_eq!(mapping.url.as_deref(), Some("https://shop.test/p/sun"));
    }

    #[tokio::test]
    async fn multiple_identifier_hits_are_ranked_by_text() {
        let store = store_with("Protector Solar FPS 50 Gel", Some("7790001")).await;
        let mut identifiers = HashMap::new();
        identifiers.insert(
            "7790001".to_string(),
            vec![
                listing("https://shop.test/p/spray", "Protector Solar FPS 50 Spray", Some(20.0)),
                listing("https://shop.test/p/gel", "Protector Solar FPS 50 Gel", Some(18.0)),
            ],
        );
        let source = FakeSource {
            identifiers: Some(identifiers),
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        resolver.run(&ctx()).await.unwrap();
        let mapping = store.mapping(1, COMPETITOR).await.unwrap();
        assert_eq!(mapping.match_method, MatchMethod::ExactId);
        assert_eq!(mapping.url.as_deref(), Some("https://shop.test/p/gel"));
        assert!((mapping.match_score.unwrap() - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn fuzzy_score_equal_to_threshold_is_accepted() {
        let description = "Crema Hidratante La Roche 50ml";
        let candidate = "LA ROCHE CREMA HIDRATANTE 50 ML";
        let store = store_with(description, None).await;
        let source = FakeSource {
            results: vec![listing("https://shop.test/p/lr", candidate, Some(31.5))],
            ..Default::default()
        };
        let exact = TextMatcher::score(
            &TextMatcher::normalize(description),
            &TextMatcher::normalize(candidate),
        );
        let settings = MatchSettings {
            min_score: exact,
            ..MatchSettings::default()
        };
        let resolver = Resolver::new("fake", source, store.clone(), settings);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(
            resolver.source.queries.lock().unwrap().as_slice(),
            ["crema hidratante la roche 50ml"]
        );
        let mapping = store.mapping(1, COMPETITOR).await.unwrap();
        assert_eq!(mapping.match_method, MatchMethod::FuzzyName);
        assert_eq!(mapping.match_score, Some(exact));
        assert_eq!(
            store.snapshot(1, COMPETITOR, today()).await.unwrap().list_price,
            Some(31.5)
        );
    }

    fn weak_candidates() -> Vec<Listing> {
        vec![
            listing("https://shop.test/p/shampoo", "Shampoo Anticaspa 400ml", Some(8.0)),
            listing("https://shop.test/p/locion", "Locion Corporal Roche", Some(15.0)),
        ]
    }

    #[tokio::test]
    async fn below_threshold_without_ai_is_no_match() {
        let store = store_with("Crema Hidratante La Roche 50ml", None).await;
        let source = FakeSource {
            results: weak_candidates(),
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!((result.unmatched, result.created), (1, 0));
        let mapping = store.mapping(1, COMPETITOR).await.unwrap();
        assert_eq!(mapping.match_method, MatchMethod::NoMatch);
        assert_eq!(mapping.url, None);
        assert_eq!(store.snapshot_count().await, 0);
    }

    #[tokio::test]
    async fn ai_selection_indexes_the_ranked_candidates() {
        let store = store_with("Crema Hidratante La Roche 50ml", None).await;
        let source = FakeSource {
            results: weak_candidates(),
            ..Default::default()
        };
        let client = Arc::new(ScriptedClient::new(vec![Ok(
            r#"{"index":0,"confidence":0.9,"reason":"same line"}"#.into(),
        )]));
        let ai = disambiguator(client.clone(), 0.6);
        let resolver = resolver(source, &store).with_ai(Some(Arc::new(ai)));

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.created, 1);
        let mapping = store.mapping(1, COMPETITOR).await.unwrap();
        assert_eq!(mapping.match_method, MatchMethod::Ai);
        assert_eq!(mapping.match_score, Some(0.9));
        assert_eq!(mapping.url.as_deref(), Some("https://shop.test/p/locion"));

        let prompt = &client.requests.lock().unwrap()[0].messages[1].content;
        assert!(prompt.contains("0. Locion Corporal Roche | price: 15.00"));
    }

    #[tokio::test]
    async fn low_confidence_ai_answer_is_no_match() {
        let store = store_with("Crema Hidratante La Roche 50ml", None).await;
        let source = FakeSource {
            results: weak_candidates(),
            ..Default::default()
        };
        let client = Arc::new(ScriptedClient::new(vec![Ok(
            r#"{"index":0,"confidence":0.4}"#.into(),
        )]));
        let resolver = resolver(source, &store).with_ai(Some(Arc::new(disambiguator(client, 0.6))));

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.unmatched, 1);
        assert_eq!(
            store.mapping(1, COMPETITOR).await.unwrap().match_method,
            MatchMethod::NoMatch
        );
    }

    #[tokio::test]
    async fn empty_catalog_cache_is_crawled_and_searched_in_memory() {
        let store = store_with("Crema Hidratante La Roche 50ml", None).await;
        let source = FakeSource {
            catalog: Some(Ok(vec![
                listing("https://shop.test/p/lr", "Crema Hidratante La Roche 50 ml", Some(30.0)),
                listing("https://shop.test/p/other", "Gel Limpiador", Some(10.0)),
            ])),
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(resolver.source.crawls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.source.searches.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(store.load_catalog_entries(COMPETITOR).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cached_price_from_an_earlier_day_is_refetched() {
        let store = store_with("Crema Hidratante La Roche 50ml", None).await;
        let cached = stale(listing(
            "https://shop.test/p/lr",
            "Crema Hidratante La Roche 50 ml",
            Some(30.0),
        ));
        store
            .upsert_catalog_entry(&cached.to_catalog_entry(COMPETITOR))
            .await
            .unwrap();
        let mut details = HashMap::new();
        details.insert(
            "https://shop.test/p/lr".to_string(),
            listing("https://shop.test/p/lr", "Crema Hidratante La Roche 50 ml", Some(27.0)),
        );
        let source = FakeSource {
            details,
            catalog: Some(Ok(Vec::new())),
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        resolver.run(&ctx()).await.unwrap();
        assert_eq!(resolver.source.crawls.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.snapshot(1, COMPETITOR, today()).await.unwrap().list_price,
            Some(27.0)
        );
        let entries = store.load_catalog_entries(COMPETITOR).await.unwrap();
        assert_eq!(entries[0].list_price, Some(27.0));
    }

    #[tokio::test]
    async fn crawl_failure_falls_back_to_live_search() {
        let store = store_with("Crema Hidratante La Roche 50ml", None).await;
        let source = FakeSource {
            catalog: Some(Err("category page changed".into())),
            results: vec![listing(
                "https://shop.test/p/lr",
                "Crema Hidratante La Roche 50ml",
                Some(30.0),
            )],
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!((result.created, result.errors), (1, 0));
        assert_eq!(resolver.source.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identifier_without_hits_falls_through_to_name_search() {
        let store = store_with("Crema Hidratante La Roche 50ml", Some("7790009")).await;
        let mut identifiers = HashMap::new();
        identifiers.insert(
            "7790001".to_string(),
            vec![listing("https://shop.test/p/sun", "Solar 50 Spray", Some(20.0))],
        );
        let source = FakeSource {
            identifiers: Some(identifiers),
            results: vec![listing(
                "https://shop.test/p/lr",
                "Crema Hidratante La Roche 50ml",
                Some(30.0),
            )],
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(resolver.source.searches.load(Ordering::SeqCst), 1);
        let mapping = store.mapping(1, COMPETITOR).await.unwrap();
        assert_eq!(mapping.match_method, MatchMethod::FuzzyName);
        assert_eq!(mapping.url.as_deref(), Some("https://shop.test/p/lr"));
    }

    #[tokio::test]
    async fn catalog_older_than_refresh_window_is_recrawled() {
        let store = store_with("Crema Hidratante La Roche 50ml", None).await;
        let mut old = listing(
            "https://shop.test/p/lr",
            "Crema Hidratante La Roche 50 ml",
            Some(30.0),
        );
        old.extracted_at = Utc::now() - Duration::days(8);
        store
            .upsert_catalog_entry(&old.to_catalog_entry(COMPETITOR))
            .await
            .unwrap();
        let source = FakeSource {
            catalog: Some(Ok(vec![listing(
                "https://shop.test/p/lr",
                "Crema Hidratante La Roche 50 ml",
                Some(26.0),
            )])),
            ..Default::default()
        };
        let resolver = resolver(source, &store);

        let result = resolver.run(&ctx()).await.unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(resolver.source.crawls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.source.fetches.load(Ordering::SeqCst), 0);
        let entries = store.load_catalog_entries(COMPETITOR).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].list_price, Some(26.0));
        assert_eq!(entries[0].extracted_at.date_naive(), today());
        assert_eq!(
            store.snapshot(1, COMPETITOR, today()).await.unwrap().list_price,
            Some(26.0)
        );
    }

    #[tokio::test]
    async fn back_dated_run_reuses_prices_read_today() {
        let store = store_with("Crema Hidratante La Roche 50ml", None).await;
        let source = FakeSource {
            catalog: Some(Ok(vec![listing(
                "https://shop.test/p/lr",
                "Crema Hidratante La Roche 50 ml",
                Some(30.0),
            )])),
            ..Default::default()
        };
        let resolver = resolver(source, &store);
        let mut ctx = ctx();
        ctx.run_date = today() - Duration::days(2);

        let result = resolver.run(&ctx).await.unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(resolver.source.fetches.load(Ordering::SeqCst), 0);
        let snapshot = store.snapshot(1, COMPETITOR, ctx.run_date).await.unwrap();
        assert_eq!(snapshot.list_price, Some(30.0));
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_product() {
        let store = store_with("Crema Hidratante", None).await;
        let ctx = ctx();
        ctx.cancel.cancel();
        let resolver = resolver(FakeSource::default(), &store);

        let result = resolver.run(&ctx).await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.processed, 0);
        assert_eq!(store.mapping_count().await, 0);
    }
}
