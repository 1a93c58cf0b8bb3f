//! Postgres-backed store. Upserts are keyed by the tables' unique constraints.

use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pricewatch_core::{
    Alert, AlertKey, AlertRule, AlertType, CatalogEntry, CatalogStore, Competitor, CompetitorId,
    CompetitorProduct, MatchMethod, PriceSnapshot, Product, ProductId, ProductRow, Run, RunStatus,
    RunStore, SnapshotRow, StartOutcome, StoreError, TriggerType,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, Row};
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

const UPSERT_MAPPING_SQL: &str = r#"
    INSERT INTO competitor_products
        (product_id, competitor_id, url, name, match_method, match_score, last_matched_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (product_id, competitor_id) DO UPDATE SET
        url = EXCLUDED.url,
        name = EXCLUDED.name,
        match_method = EXCLUDED.match_method,
        match_score = EXCLUDED.match_score,
        last_matched_at = EXCLUDED.last_matched_at
"#;

const UPSERT_SNAPSHOT_SQL: &str = r#"
    INSERT INTO price_snapshots
        (product_id, competitor_id, captured_on, list_price, promo_price, captured_at)
    VALUES ($1, $2, $3, $4, $5, NOW())
    ON CONFLICT (product_id, competitor_id, captured_on) DO UPDATE SET
        list_price = EXCLUDED.list_price,
        promo_price = EXCLUDED.promo_price,
        captured_at = EXCLUDED.captured_at
"#;

async fn exec_upsert_mapping<'e, E>(executor: E, m: &CompetitorProduct) -> anyhow::Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(UPSERT_MAPPING_SQL)
        .bind(m.product_id)
        .bind(m.competitor_id)
        .bind(&m.url)
        .bind(&m.name)
        .bind(m.match_method.as_str())
        .bind(m.match_score)
        .bind(m.last_matched_at)
        .execute(executor)
        .await
        .with_context(|| {
            format!(
                "upserting mapping product={} competitor={}",
                m.product_id, m.competitor_id
            )
        })?;
    Ok(())
}

async fn exec_upsert_snapshot<'e, E>(executor: E, s: &PriceSnapshot) -> anyhow::Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(UPSERT_SNAPSHOT_SQL)
        .bind(s.product_id)
        .bind(s.competitor_id)
        .bind(s.captured_on)
        .bind(s.list_price)
        .bind(s.promo_price)
        .execute(executor)
        .await
        .with_context(|| {
            format!(
                "upserting snapshot product={} competitor={} date={}",
                s.product_id, s.competitor_id, s.captured_on
            )
        })?;
    Ok(())
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status").context("reading run status")?;
    let trigger: String = row.try_get("trigger_type").context("reading run trigger")?;
    Ok(Run {
        id: row.try_get("id").context("reading run id")?,
        status: status.parse()?,
        trigger_type: trigger.parse()?,
        started_at: row.try_get("started_at").context("reading run start")?,
        finished_at: row.try_get("finished_at").context("reading run finish")?,
        message: row.try_get("message").context("reading run message")?,
    })
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn load_target_products(
        &self,
        competitor_id: CompetitorId,
        run_date: NaiveDate,
        only_new: bool,
        batch_size: usize,
    ) -> Result<Vec<ProductRow>, StoreError> {
        let limit = (batch_size > 0).then_some(batch_size as i64);
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.external_id, p.description, p.brand_id, p.list_price, p.promo_price,
                   b.name AS brand_name,
                   cp.url AS mapped_url, cp.match_method, cp.match_score
              FROM products p
              LEFT JOIN brands b ON b.id = p.brand_id
              LEFT JOIN competitor_products cp
                     ON cp.product_id = p.id AND cp.competitor_id = $1
             WHERE p.active
               AND (NOT $3 OR (
                    NOT EXISTS (
                        SELECT 1 FROM price_snapshots s
                         WHERE s.product_id = p.id
                           AND s.competitor_id = $1
                           AND s.captured_on = $2)
                    AND COALESCE(cp.match_method, '') <> 'no-match'))
             ORDER BY p.id
             LIMIT $4
            "#,
        )
        .bind(competitor_id)
        .bind(run_date)
        .bind(only_new)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("loading target products")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let method: Option<String> = row.try_get("match_method").context("match_method")?;
            out.push(ProductRow {
                product: Product {
                    id: row.try_get("id").context("id")?,
                    external_id: row.try_get("external_id").context("external_id")?,
                    description: row.try_get("description").context("description")?,
                    brand_id: row.try_get("brand_id").context("brand_id")?,
                    list_price: row.try_get("list_price").context("list_price")?,
                    promo_price: row.try_get("promo_price").context("promo_price")?,
                },
                brand_name: row.try_get("brand_name").context("brand_name")?,
                mapped_url: row.try_get("mapped_url").context("mapped_url")?,
                match_method: method.as_deref().map(str::parse).transpose()?,
                match_score: row.try_get("match_score").context("match_score")?,
            });
        }
        Ok(out)
    }

    async fn upsert_mapping(&self, mapping: &CompetitorProduct) -> Result<(), StoreError> {
        exec_upsert_mapping(&self.pool, mapping).await?;
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
        exec_upsert_snapshot(&self.pool, snapshot).await?;
        Ok(())
    }

    async fn record_match(
        &self,
        mapping: &CompetitorProduct,
        snapshot: &PriceSnapshot,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.context("opening match transaction")?;
        exec_upsert_mapping(&mut *tx, mapping).await?;
        exec_upsert_snapshot(&mut *tx, snapshot).await?;
        tx.commit().await.context("committing match transaction")?;
        Ok(())
    }

    async fn upsert_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO competitor_catalog_entries
                (competitor_id, url, name, description, external_id, brand, categories,
                 list_price, promo_price, extracted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (competitor_id, url) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                external_id = EXCLUDED.external_id,
                brand = EXCLUDED.brand,
                categories = EXCLUDED.categories,
                list_price = EXCLUDED.list_price,
                promo_price = EXCLUDED.promo_price,
                extracted_at = EXCLUDED.extracted_at
            "#,
        )
        .bind(entry.competitor_id)
        .bind(&entry.url)
        .bind(&entry.name)
        .bind(&entry.description)
        .bind(&entry.external_id)
        .bind(&entry.brand)
        .bind(&entry.categories)
        .bind(entry.list_price)
        .bind(entry.promo_price)
        .bind(entry.extracted_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting catalog entry {}", entry.url))?;
        Ok(())
    }

    async fn load_catalog_entries(
        &self,
        competitor_id: CompetitorId,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT competitor_id, url, name, description, external_id, brand, categories,
                   list_price, promo_price, extracted_at
              FROM competitor_catalog_entries
             WHERE competitor_id = $1
             ORDER BY url
            "#,
        )
        .bind(competitor_id)
        .fetch_all(&self.pool)
        .await
        .context("loading catalog entries")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CatalogEntry {
                competitor_id: row.try_get("competitor_id").context("competitor_id")?,
                url: row.try_get("url").context("url")?,
                name: row.try_get("name").context("name")?,
                description: row.try_get("description").context("description")?,
                external_id: row.try_get("external_id").context("external_id")?,
                brand: row.try_get("brand").context("brand")?,
                categories: row.try_get("categories").context("categories")?,
                list_price: row.try_get("list_price").context("list_price")?,
                promo_price: row.try_get("promo_price").context("promo_price")?,
                extracted_at: row.try_get("extracted_at").context("extracted_at")?,
            });
        }
        Ok(out)
    }

    async fn load_active_competitors(
        &self,
        filter: Option<CompetitorId>,
    ) -> Result<Vec<Competitor>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, base_url, adapter_id, active, config_json
              FROM competitors
             WHERE active
               AND ($1::BIGINT IS NULL OR id = $1)
             ORDER BY id
            "#,
        )
        .bind(filter)
        .fetch_all(&self.pool)
        .await
        .context("loading active competitors")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Competitor {
                id: row.try_get("id").context("id")?,
                name: row.try_get("name").context("name")?,
                base_url: row.try_get("base_url").context("base_url")?,
                adapter_id: row.try_get("adapter_id").context("adapter_id")?,
                active: row.try_get("active").context("active")?,
                config: row.try_get("config_json").context("config_json")?,
            });
        }
        Ok(out)
    }

    async fn load_active_alert_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, brand_id, list_price_threshold_pct, promo_price_threshold_pct, active
              FROM alert_rules
             WHERE active
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading alert rules")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AlertRule {
                id: row.try_get("id").context("id")?,
                brand_id: row.try_get("brand_id").context("brand_id")?,
                list_price_threshold_pct: row
                    .try_get("list_price_threshold_pct")
                    .context("list_price_threshold_pct")?,
                promo_price_threshold_pct: row
                    .try_get("promo_price_threshold_pct")
                    .context("promo_price_threshold_pct")?,
                active: row.try_get("active").context("active")?,
            });
        }
        Ok(out)
    }

    async fn load_snapshots_with_products(
        &self,
        competitor_id: CompetitorId,
        captured_on: NaiveDate,
    ) -> Result<Vec<SnapshotRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.product_id, s.competitor_id, s.captured_on, s.list_price, s.promo_price,
                   p.brand_id, p.list_price AS baseline_list_price,
                   p.promo_price AS baseline_promo_price
              FROM price_snapshots s
              JOIN products p ON p.id = s.product_id
             WHERE s.competitor_id = $1
               AND s.captured_on = $2
             ORDER BY s.product_id
            "#,
        )
        .bind(competitor_id)
        .bind(captured_on)
        .fetch_all(&self.pool)
        .await
        .context("loading snapshots for alerting")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SnapshotRow {
                snapshot: PriceSnapshot {
                    product_id: row.try_get("product_id").context("product_id")?,
                    competitor_id: row.try_get("competitor_id").context("competitor_id")?,
                    captured_on: row.try_get("captured_on").context("captured_on")?,
                    list_price: row.try_get("list_price").context("list_price")?,
                    promo_price: row.try_get("promo_price").context("promo_price")?,
                },
                brand_id: row.try_get("brand_id").context("brand_id")?,
                baseline_list_price: row
                    .try_get("baseline_list_price")
                    .context("baseline_list_price")?,
                baseline_promo_price: row
                    .try_get("baseline_promo_price")
                    .context("baseline_promo_price")?,
            });
        }
        Ok(out)
    }

    async fn load_no_match_products(
        &self,
        competitor_id: CompetitorId,
    ) -> Result<Vec<ProductId>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT product_id
              FROM competitor_products
             WHERE competitor_id = $1
               AND match_method = 'no-match'
             ORDER BY product_id
            "#,
        )
        .bind(competitor_id)
        .fetch_all(&self.pool)
        .await
        .context("loading no-match mappings")?;
        Ok(ids)
    }

    async fn load_todays_alert_keys(
        &self,
        competitor_id: CompetitorId,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<HashSet<AlertKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT product_id, alert_type
              FROM alerts
             WHERE competitor_id = $1
               AND created_at >= $2
               AND created_at < $3
            "#,
        )
        .bind(competitor_id)
        .bind(day_start)
        .bind(day_end)
        .fetch_all(&self.pool)
        .await
        .context("loading same-day alert keys")?;

        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let alert_type: String = row.try_get("alert_type").context("alert_type")?;
            keys.insert((
                row.try_get("product_id").context("product_id")?,
                alert_type.parse::<AlertType>()?,
            ));
        }
        Ok(keys)
    }

    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<usize, StoreError> {
        if alerts.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("opening alert transaction")?;
        for alert in alerts {
            sqlx::query(
                r#"
                INSERT INTO alerts
                    (product_id, competitor_id, alert_type, message, delta_pct, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(alert.product_id)
            .bind(alert.competitor_id)
            .bind(alert.alert_type.as_str())
            .bind(&alert.message)
            .bind(alert.delta_pct)
            .bind(alert.created_at)
            .execute(&mut *tx)
            .await
            .context("inserting alert")?;
        }
        tx.commit().await.context("committing alerts")?;
        Ok(alerts.len())
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn try_start_run(&self, trigger: TriggerType) -> Result<StartOutcome, StoreError> {
        // The partial unique index turns a racing insert into a no-op.
        let row = sqlx::query(
            r#"
            INSERT INTO reconciliation_runs (id, status, trigger_type, started_at)
            SELECT $1, 'running', $2, NOW()
             WHERE NOT EXISTS (
                   SELECT 1 FROM reconciliation_runs WHERE status = 'running')
            ON CONFLICT DO NOTHING
            RETURNING id, status, trigger_type, started_at, finished_at, message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(trigger.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("admitting reconciliation run")?;

        match row {
            Some(row) => Ok(StartOutcome::Started(run_from_row(&row)?)),
            None => Ok(StartOutcome::AlreadyRunning),
        }
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        message: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE reconciliation_runs
               SET status = $2,
                   message = $3,
                   finished_at = NOW()
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .context("completing reconciliation run")?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_run(run_id).await? {
            Some(_) => Err(StoreError::RunAlreadyCompleted(run_id)),
            None => Err(StoreError::NotFound(format!("run {run_id}"))),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, trigger_type, started_at, finished_at, message
              FROM reconciliation_runs
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading reconciliation run")?;
        row.as_ref().map(run_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a scratch postgres"]
    async fn concurrent_starts_admit_exactly_one_run_in_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = Arc::new(PgStore::connect(&url).await.unwrap());
        store.migrate().await.unwrap();
        sqlx::query("UPDATE reconciliation_runs SET status = 'failed' WHERE status = 'running'")
            .execute(store.pool())
            .await
            .unwrap();

        let handles = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.try_start_run(TriggerType::Manual).await.unwrap() })
            })
            .collect::<Vec<_>>();

        let mut started = Vec::new();
        for handle in handles {
            if let StartOutcome::Started(run) = handle.await.unwrap() {
                started.push(run);
            }
        }
        assert_eq!(started.len(), 1);
        store
            .complete_run(started[0].id, RunStatus::Success, "test")
            .await
            .unwrap();
    }
}
