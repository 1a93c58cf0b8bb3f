//! In-process store used for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pricewatch_core::{
    Alert, AlertKey, AlertRule, BrandId, CatalogEntry, CatalogStore, Competitor, CompetitorId,
    CompetitorProduct, MatchMethod, PriceSnapshot, Product, ProductId, ProductRow, Run, RunStatus,
    RunStore, SnapshotRow, StartOutcome, StoreError, TriggerType,
};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    brands: HashMap<BrandId, String>,
    products: BTreeMap<ProductId, Product>,
    competitors: BTreeMap<CompetitorId, Competitor>,
    mappings: HashMap<(ProductId, CompetitorId), CompetitorProduct>,
    snapshots: HashMap<(ProductId, CompetitorId, NaiveDate), PriceSnapshot>,
    catalog: HashMap<(CompetitorId, String), CatalogEntry>,
    rules: Vec<AlertRule>,
    alerts: Vec<Alert>,
    runs: Vec<Run>,
}

/// All tables live behind one lock, so every operation is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_brand(&self, id: BrandId, name: &str) {
        self.state.lock().await.brands.insert(id, name.to_string());
    }

    pub async fn add_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    pub async fn add_competitor(&self, competitor: Competitor) {
        self.state
            .lock()
            .await
            .competitors
            .insert(competitor.id, competitor);
    }

    pub async fn add_alert_rule(&self, rule: AlertRule) {
        self.state.lock().await.rules.push(rule);
    }

    pub async fn add_alert(&self, alert: Alert) {
        self.state.lock().await.alerts.push(alert);
    }

    pub async fn mapping(
        &self,
        product_id: ProductId,
        competitor_id: CompetitorId,
    ) -> Option<CompetitorProduct> {
        self.state
            .lock()
            .await
            .mappings
            .get(&(product_id, competitor_id))
            .cloned()
    }

    pub async fn mapping_count(&self) -> usize {
        self.state.lock().await.mappings.len()
    }

    pub async fn snapshot(
        &self,
        product_id: ProductId,
        competitor_id: CompetitorId,
        captured_on: NaiveDate,
    ) -> Option<PriceSnapshot> {
        self.state
            .lock()
            .await
            .snapshots
            .get(&(product_id, competitor_id, captured_on))
            .cloned()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.state.lock().await.snapshots.len()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.state.lock().await.alerts.clone()
    }

    pub async fn runs(&self) -> Vec<Run> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_target_products(
        &self,
        competitor_id: CompetitorId,
        run_date: NaiveDate,
        only_new: bool,
        batch_size: usize,
    ) -> Result<Vec<ProductRow>, StoreError> {
        let state = self.state.lock().await;
        let limit = if batch_size == 0 { usize::MAX } else { batch_size };

        let rows = state
            .products
            .values()
            .filter_map(|product| {
                let mapping = state.mappings.get(&(product.id, competitor_id));
                if only_new {
                    let snapped = state
                        .snapshots
                        .contains_key(&(product.id, competitor_id, run_date));
                    let no_match =
                        mapping.is_some_and(|m| m.match_method == MatchMethod::NoMatch);
                    if snapped || no_match {
                        return None;
                    }
                }
                Some(ProductRow {
                    product: product.clone(),
                    brand_name: product
                        .brand_id
                        .and_then(|id| state.brands.get(&id).cloned()),
                    mapped_url: mapping.and_then(|m| m.url.clone()),
                    match_method: mapping.map(|m| m.match_method),
                    match_score: mapping.and_then(|m| m.match_score),
                })
            })
            .take(limit)
            .collect();
        Ok(rows)
    }

    async fn upsert_mapping(&self, mapping: &CompetitorProduct) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .mappings
            .insert((mapping.product_id, mapping.competitor_id), mapping.clone());
        Ok(())
    }

    async fn mark_no_match(
        &self,
        product_id: ProductId,
        competitor_id: CompetitorId,
    ) -> Result<(), StoreError> {
        self.upsert_mapping(&CompetitorProduct {
            product_id,
            competitor_id,
            url: None,
            name: None,
            match_method: MatchMethod::NoMatch,
            match_score: None,
            last_matched_at: Utc::now(),
        })
        .await
    }

    async fn upsert_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        self.state.lock().await.snapshots.insert(
            (snapshot.product_id, snapshot.competitor_id, snapshot.captured_on),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn record_match(
        &self,
        mapping: &CompetitorProduct,
        snapshot: &PriceSnapshot,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .mappings
            .insert((mapping.product_id, mapping.competitor_id), mapping.clone());
        state.snapshots.insert(
            (snapshot.product_id, snapshot.competitor_id, snapshot.captured_on),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn upsert_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .catalog
            .insert((entry.competitor_id, entry.url.clone()), entry.clone());
        Ok(())
    }

    async fn load_catalog_entries(
        &self,
        competitor_id: CompetitorId,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries = state
            .catalog
            .values()
            .filter(|e| e.competitor_id == competitor_id)
            .cloned()
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(entries)
    }

    async fn load_active_competitors(
        &self,
        filter: Option<CompetitorId>,
    ) -> Result<Vec<Competitor>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .competitors
            .values()
            .filter(|c| c.active && filter.map_or(true, |id| id == c.id))
            .cloned()
            .collect())
    }

    async fn load_active_alert_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .rules
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect())
    }

    async fn load_snapshots_with_products(
        &self,
        competitor_id: CompetitorId,
        captured_on: NaiveDate,
    ) -> Result<Vec<SnapshotRow>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .snapshots
            .values()
            .filter(|s| s.competitor_id == competitor_id && s.captured_on == captured_on)
            .filter_map(|s| {
                let product = state.products.get(&s.product_id)?;
                Some(SnapshotRow {
                    snapshot: s.clone(),
                    brand_id: product.brand_id,
                    baseline_list_price: product.list_price,
                    baseline_promo_price: product.promo_price,
                })
            })
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| r.snapshot.product_id);
        Ok(rows)
    }

    async fn load_no_match_products(
        &self,
        competitor_id: CompetitorId,
    ) -> Result<Vec<ProductId>, StoreError> {
        let state = self.state.lock().await;
        let mut ids = state
            .mappings
            .values()
            .filter(|m| m.competitor_id == competitor_id && m.match_method == MatchMethod::NoMatch)
            .map(|m| m.product_id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn load_todays_alert_keys(
        &self,
        competitor_id: CompetitorId,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<HashSet<AlertKey>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .alerts
            .iter()
            .filter(|a| {
                a.competitor_id == competitor_id
                    && a.created_at >= day_start
                    && a.created_at < day_end
            })
            .map(Alert::key)
            .collect())
    }

    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<usize, StoreError> {
        self.state.lock().await.alerts.extend_from_slice(alerts);
        Ok(alerts.len())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn try_start_run(&self, trigger: TriggerType) -> Result<StartOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.runs.iter().any(|r| r.status == RunStatus::Running) {
            return Ok(StartOutcome::AlreadyRunning);
        }
        let run = Run {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            trigger_type: trigger,
            started_at: Utc::now(),
            finished_at: None,
            message: None,
        };
        state.runs.push(run.clone());
        Ok(StartOutcome::Started(run))
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if run.status.is_terminal() {
            return Err(StoreError::RunAlreadyCompleted(run_id));
        }
        run.status = status;
        run.message = Some(message.to_string());
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn product(id: ProductId) -> Product {
        Product {
            id,
            external_id: None,
            description: format!("Product {id}"),
            brand_id: None,
            list_price: Some(10.0),
            promo_price: None,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 24).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_exactly_one_run() {
        let store = Arc::new(MemoryStore::new());
        let handles = (0..16)
            .map(|i| {
                let store = store.clone();
                let trigger = if i % 2 == 0 {
                    TriggerType::Manual
                } else {
                    TriggerType::Scheduled
                };
                tokio::spawn(async move { store.try_start_run(trigger).await.unwrap() })
            })
            .collect::<Vec<_>>();

        let mut started = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                StartOutcome::Started(_) => started += 1,
                StartOutcome::AlreadyRunning => refused += 1,
            }
        }
        assert_eq!(started, 1);
        assert_eq!(refused, 15);
    }

    #[tokio::test]
    async fn completing_a_run_twice_is_an_error_and_frees_the_gate() {
        let store = MemoryStore::new();
        let StartOutcome::Started(run) = store.try_start_run(TriggerType::Manual).await.unwrap()
        else {
            panic!("expected a started run");
        };
        store
            .complete_run(run.id, RunStatus::Success, "ok")
            .await
            .unwrap();
        let second = store.complete_run(run.id, RunStatus::Failed, "again").await;
        assert!(matches!(second, Err(StoreError::RunAlreadyCompleted(id)) if id == run.id));

        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.message.as_deref(), Some("ok"));
        assert!(matches!(
            store.try_start_run(TriggerType::Scheduled).await.unwrap(),
            StartOutcome::Started(_)
        ));
    }

    #[tokio::test]
    async fn snapshot_upsert_keeps_one_row_per_day() {
        let store = MemoryStore::new();
        let mut snapshot = PriceSnapshot {
            product_id: 1,
            competitor_id: 7,
            captured_on: date(),
            list_price: Some(10.0),
            promo_price: None,
        };
        store.upsert_snapshot(&snapshot).await.unwrap();
        snapshot.list_price = Some(12.5);
        snapshot.promo_price = Some(11.0);
        store.upsert_snapshot(&snapshot).await.unwrap();

        assert_eq!(store.snapshot_count().await, 1);
        let stored = store.snapshot(1, 7, date()).await.unwrap();
        assert_eq!(stored.list_price, Some(12.5));
        assert_eq!(stored.promo_price, Some(11.0));
    }

    #[tokio::test]
    async fn mapping_upsert_never_duplicates() {
        let store = MemoryStore::new();
        let mapping = CompetitorProduct {
            product_id: 1,
            competitor_id: 7,
            url: Some("https://shop.test/a".into()),
            name: Some("A".into()),
            match_method: MatchMethod::FuzzyName,
            match_score: Some(0.8),
            last_matched_at: Utc::now(),
        };
        store.upsert_mapping(&mapping).await.unwrap();
        store.mark_no_match(1, 7).await.unwrap();

        assert_eq!(store.mapping_count().await, 1);
        let stored = store.mapping(1, 7).await.unwrap();
        assert_eq!(stored.match_method, MatchMethod::NoMatch);
        assert_eq!(stored.url, None);
    }

    #[tokio::test]
    async fn only_new_skips_snapshotted_and_no_match_products() {
        let store = MemoryStore::new();
        for id in 1..=4 {
            store.add_product(product(id)).await;
        }
        store
            .upsert_snapshot(&PriceSnapshot {
                product_id: 1,
                competitor_id: 7,
                captured_on: date(),
                list_price: Some(9.0),
                promo_price: None,
            })
            .await
            .unwrap();
        store.mark_no_match(2, 7).await.unwrap();

        let all = store.load_target_products(7, date(), false, 0).await.unwrap();
        assert_eq!(all.len(), 4);

        let fresh = store.load_target_products(7, date(), true, 0).await.unwrap();
        let ids = fresh.iter().map(|r| r.product.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 4]);

        let batch = store.load_target_products(7, date(), true, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
