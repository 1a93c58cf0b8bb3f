use std::any::Any;
use std::panic::AssertUnwindSafe;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures_util::FutureExt;
use pricewatch_adapters::{AdapterContext, AdapterDeps, AdapterRegistry, RunResult};
use pricewatch_core::{Competitor, CompetitorId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::alerts::AlertEngine;

pub const MAX_SUMMARY_MESSAGES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    pub competitor: Option<CompetitorId>,
    pub only_new: bool,
    /// 0 = unbounded.
    pub batch_size: usize,
    pub run_date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub unmatched: usize,
    pub errors: usize,
    pub skipped: usize,
    pub alerts: usize,
    pub cancelled: bool,
    pub messages: Vec<String>,
    #[serde(default)]
    pub dropped_messages: usize,
}

impl RunSummary {
    pub fn push_message(&mut self, message: impl Into<String>) {
        if self.messages.len() < MAX_SUMMARY_MESSAGES {
            self.messages.push(message.into());
        } else {
            self.dropped_messages += 1;
        }
    }

    fn absorb(&mut self, competitor: &Competitor, result: RunResult) {
        self.processed += result.processed;
        self.created += result.created;
        self.updated += result.updated;
        self.unmatched += result.unmatched;
        self.errors += result.errors;
        self.cancelled |= result.cancelled;
        for message in result.messages {
            self.push_message(format!("{}: {message}", competitor.name));
        }
    }

    pub fn counters_line(&self) -> String {
        let mut line = format!(
            "processed={} created={} updated={} unmatched={} errors={} skipped={} alerts={}",
            self.processed,
            self.created,
            self.updated,
            self.unmatched,
            self.errors,
            self.skipped,
            self.alerts
        );
        if self.cancelled {
            line.push_str(" cancelled");
        }
        line
    }

    /// Counters followed by every kept message, joined with `" | "`.
    pub fn outcome_message(&self) -> String {
        let mut parts = vec![self.counters_line()];
        parts.extend(self.messages.iter().cloned());
        if self.dropped_messages > 0 {
            parts.push(format!("... {} more", self.dropped_messages));
        }
        parts.join(" | ")
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs every active competitor's adapter in turn, isolating failures per
/// competitor, and raises alerts after each competitor that completes.
pub struct Reconciler {
    registry: AdapterRegistry,
    deps: AdapterDeps,
    alerts: AlertEngine,
}

impl Reconciler {
    pub fn new(registry: AdapterRegistry, deps: AdapterDeps) -> Self {
        let alerts = AlertEngine::new(deps.store.clone());
        Self {
            registry,
            deps,
            alerts,
        }
    }

    pub fn alert_engine(&self) -> &AlertEngine {
        &self.alerts
    }

    pub async fn run(
        &self,
        run_id: Uuid,
        options: &ReconcileOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let competitors = self
            .deps
            .store
            .load_active_competitors(options.competitor)
            .await
            .context("loading active competitors")?;
        info!(
            %run_id,
            competitors = competitors.len(),
            run_date = %options.run_date,
            "reconciliation started"
        );

        let mut summary = RunSummary::default();
        if let (Some(id), true) = (options.competitor, competitors.is_empty()) {
            summary.skipped += 1;
            summary.push_message(format!("competitor {id} is not active or does not exist"));
        }

        for competitor in &competitors {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.reconcile_competitor(run_id, options, cancel, competitor, &mut summary)
                .instrument(info_span!(
                    "reconcile_competitor",
                    competitor_id = competitor.id,
                    adapter_id = %competitor.adapter_id
                ))
                .await;
        }
        summary.cancelled |= cancel.is_cancelled();

        info!(%run_id, summary = %summary.counters_line(), "reconciliation finished");
        Ok(summary)
    }

    async fn reconcile_competitor(
        &self,
        run_id: Uuid,
        options: &ReconcileOptions,
        cancel: &CancellationToken,
        competitor: &Competitor,
        summary: &mut RunSummary,
    ) {
        let adapter = match self.registry.resolve(&self.deps, competitor) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(error = %err, "competitor skipped");
                summary.skipped += 1;
                summary.push_message(format!("{}: skipped: {err}", competitor.name));
                return;
            }
        };

        let ctx = AdapterContext {
            competitor_id: competitor.id,
            competitor_name: competitor.name.clone(),
            base_url: competitor.base_url.clone(),
            run_id,
            run_date: options.run_date,
            only_new: options.only_new,
            batch_size: options.batch_size,
            cancel: cancel.clone(),
        };

        match AssertUnwindSafe(adapter.run(&ctx)).catch_unwind().await {
            Ok(Ok(result)) => {
                info!(
                    processed = result.processed,
                    created = result.created,
                    updated = result.updated,
                    errors = result.errors,
                    "competitor reconciled"
                );
                summary.absorb(competitor, result);
            }
            Ok(Err(err)) => {
                warn!(error = %err, "adapter failed");
                summary.errors += 1;
                summary.push_message(format!("{}: adapter failed: {err}", competitor.name));
                return;
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "adapter panicked");
                summary.errors += 1;
                summary.push_message(format!("{}: adapter panicked: {message}", competitor.name));
                return;
            }
        }

        match self.alerts.generate(competitor.id, options.run_date).await {
            Ok(created) => summary.alerts += created,
            Err(err) => {
                warn!(error = %err, "alert generation failed");
                summary.errors += 1;
                summary.push_message(format!(
                    "{}: alert generation failed: {err}",
                    competitor.name
                ));
            }
        }
    }
}
