use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use pricewatch_core::{
    day_bounds, Alert, AlertType, BrandId, CatalogStore, CompetitorId, ProductId, StoreError,
};
use tracing::{debug, info};

/// Turns a competitor's snapshots for one day into deduplicated price-gap and
/// no-match alerts.
#[derive(Clone)]
pub struct AlertEngine {
    store: Arc<dyn CatalogStore>,
}

/// Signed percentage gap when `|delta| >= threshold`. No threshold or a
/// non-positive baseline never alerts.
fn price_gap(observed: f64, baseline: f64, threshold: Option<f64>) -> Option<f64> {
    let threshold = threshold?;
    if baseline <= 0.0 {
        return None;
    }
    let delta = (observed - baseline) * 100.0 / baseline;
    (delta.abs() >= threshold.abs()).then_some(delta)
}

fn gap_message(alert_type: AlertType, delta: f64, observed: f64, baseline: f64) -> String {
    format!(
        "{} price {delta:+.2}% vs baseline (competitor {observed:.2}, baseline {baseline:.2})",
        alert_type.as_str()
    )
}

impl AlertEngine {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Returns the number of alerts inserted. A no-op without active rules.
    pub async fn generate(
        &self,
        competitor_id: CompetitorId,
        run_date: NaiveDate,
    ) -> Result<usize, StoreError> {
        let rules = self.store.load_active_alert_rules().await?;
        if rules.is_empty() {
            debug!(competitor_id, "no active alert rules");
            return Ok(0);
        }
        let rules_by_brand = rules
            .iter()
            .map(|rule| (rule.brand_id, rule))
            .collect::<HashMap<BrandId, _>>();

        let (day_start, day_end) = day_bounds(run_date);
        let mut seen = self
            .store
            .load_todays_alert_keys(competitor_id, day_start, day_end)
            .await?;
        // Alerts must land inside the run date's day or dedup would miss them.
        let created_at = Utc::now().clamp(day_start, day_end - Duration::seconds(1));
        let new_alert = |product_id: ProductId, alert_type, message, delta_pct| Alert {
            product_id,
            competitor_id,
            alert_type,
            message,
            delta_pct,
            created_at,
        };

        let mut alerts = Vec::new();
        for row in self
            .store
            .load_snapshots_with_products(competitor_id, run_date)
            .await?
        {
            let Some(rule) = row.brand_id.and_then(|id| rules_by_brand.get(&id)) else {
                continue;
            };
            let product_id = row.snapshot.product_id;
            let checks = [
                (
                    AlertType::List,
                    row.snapshot.list_price,
                    row.baseline_list_price,
                    rule.list_price_threshold_pct,
                ),
                (
                    AlertType::Promo,
                    row.snapshot.promo_price,
                    row.baseline_promo_price,
                    rule.promo_price_threshold_pct,
                ),
            ];
            for (alert_type, observed, baseline, threshold) in checks {
                let (Some(observed), Some(baseline)) = (observed, baseline) else {
                    continue;
                };
                let Some(delta) = price_gap(observed, baseline, threshold) else {
                    continue;
                };
                if !seen.insert((product_id, alert_type)) {
                    continue;
                }
                let message = gap_message(alert_type, delta, observed, baseline);
                alerts.push(new_alert(product_id, alert_type, message, Some(delta)));
            }
        }

        for product_id in self.store.load_no_match_products(competitor_id).await? {
            if seen.insert((product_id, AlertType::NoMatch)) {
                let message = format!("no competitor match for product {product_id}");
                alerts.push(new_alert(product_id, AlertType::NoMatch, message, None));
            }
        }

        if alerts.is_empty() {
            return Ok(0);
        }
        let inserted = self.store.insert_alerts(&alerts).await?;
        info!(competitor_id, %run_date, inserted, "alerts generated");
        Ok(inserted)
    }
}
