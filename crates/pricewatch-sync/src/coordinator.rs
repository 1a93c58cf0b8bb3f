use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::FutureExt;
use pricewatch_core::{Run, RunStatus, RunStore, StartOutcome, StoreError, TriggerType};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::reconciler::{panic_message, ReconcileOptions, Reconciler, RunSummary};

pub const ABANDONED_MESSAGE: &str = "abandoned by operator";

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { run: Run, summary: RunSummary },
    AlreadyRunning,
}

/// Admits at most one run system-wide and always completes the run it admitted.
pub struct RunCoordinator {
    runs: Arc<dyn RunStore>,
    reconciler: Arc<Reconciler>,
}

impl RunCoordinator {
    pub fn new(runs: Arc<dyn RunStore>, reconciler: Arc<Reconciler>) -> Self {
        Self { runs, reconciler }
    }

    pub async fn execute(
        &self,
        trigger: TriggerType,
        options: &ReconcileOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let run = match self
            .runs
            .try_start_run(trigger)
            .await
            .context("starting reconciliation run")?
        {
            StartOutcome::Started(run) => run,
            StartOutcome::AlreadyRunning => {
                info!(%trigger, "a reconciliation run is already in progress; request refused");
                return Ok(RunOutcome::AlreadyRunning);
            }
        };
        info!(run_id = %run.id, %trigger, "run admitted");

        let outcome = AssertUnwindSafe(self.reconciler.run(run.id, options, cancel))
            .catch_unwind()
            .await;
        let (status, message, summary) = match outcome {
            Ok(Ok(summary)) => {
                let status = if summary.cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Success
                };
                (status, summary.outcome_message(), summary)
            }
            Ok(Err(err)) => {
                error!(run_id = %run.id, error = %format!("{err:#}"), "reconciliation failed");
                (
                    RunStatus::Failed,
                    format!("reconciliation failed: {err:#}"),
                    RunSummary::default(),
                )
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(run_id = %run.id, panic = %message, "reconciliation panicked");
                (
                    RunStatus::Failed,
                    format!("reconciliation panicked: {message}"),
                    RunSummary::default(),
                )
            }
        };

        self.runs
            .complete_run(run.id, status, &message)
            .await
            .with_context(|| format!("completing run {}", run.id))?;
        info!(run_id = %run.id, %status, "run completed");

        let run = self
            .runs
            .get_run(run.id)
            .await
            .context("reloading completed run")?
            .unwrap_or(Run {
                status,
                message: Some(message),
                ..run
            });
        Ok(RunOutcome::Completed { run, summary })
    }

    /// Marks a run left `Running` by a crashed process as failed.
    pub async fn abandon(&self, run_id: Uuid) -> Result<()> {
        match self
            .runs
            .complete_run(run_id, RunStatus::Failed, ABANDONED_MESSAGE)
            .await
        {
            Ok(()) => {
                warn!(%run_id, "run abandoned by operator");
                Ok(())
            }
            Err(StoreError::RunAlreadyCompleted(id)) => Err(anyhow!("run {id} is not running")),
            Err(err) => Err(err).with_context(|| format!("abandoning run {run_id}")),
        }
    }
}
