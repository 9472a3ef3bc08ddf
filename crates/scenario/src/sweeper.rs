//! Periodic sweep: picks up due enrollments and runs them on a bounded
//! worker pool.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::executor::{StepExecutor, StepRun};

/// Counts for one sweep tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Enrollments selected as due.
    pub due: usize,
    /// Steps run and persisted, including zero-delay follow-ups.
    pub executed: usize,
    pub contended: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Enrollments that were still due after `max_zero_delay_chain` runs.
    pub chain_limit_hits: usize,
}

impl SweepReport {
    fn merge(&mut self, other: &SweepReport) {
        self.executed += other.executed;
        self.contended += other.contended;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.chain_limit_hits += other.chain_limit_hits;
    }
}

pub struct Sweeper {
    ctx: EngineContext,
    executor: Arc<StepExecutor>,
}

impl Sweeper {
    pub fn new(ctx: EngineContext, executor: Arc<StepExecutor>) -> Self {
        Self { ctx, executor }
    }

    /// Runs every enrollment due at the context clock's `now` once, plus any
    /// zero-delay steps that follow, and waits for all of them.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = self.ctx.clock.now();
        let due = self
            .ctx
            .enrollments
            .due(now, self.ctx.settings.sweep_batch_size);

        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return report;
        }
        debug!(due = due.len(), "Sweeping due enrollments");

        let semaphore = Arc::new(Semaphore::new(self.ctx.settings.worker_concurrency));
        let mut workers = JoinSet::new();
        for enrollment in due {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = self.executor.clone();
            let ctx = self.ctx.clone();
            workers.spawn(async move {
                let _permit = permit;
                run_chain(&executor, &ctx, enrollment.id).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(tally) => report.merge(&tally),
                Err(e) => {
                    error!(error = %e, "Sweep worker panicked");
                    report.errors += 1;
                }
            }
        }

        metrics::counter!("scenario.sweeps").increment(1);
        metrics::gauge!("scenario.sweep.due").set(report.due as f64);
        info!(
            due = report.due,
            executed = report.executed,
            contended = report.contended,
            conflicts = report.conflicts,
            errors = report.errors,
            chain_limit_hits = report.chain_limit_hits,
            "Sweep finished"
        );
        report
    }

    /// Sweeps on a fixed interval until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.ctx.settings.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            node_id = %self.ctx.settings.node_id,
            interval_secs = self.ctx.settings.sweep_interval.as_secs(),
            "Sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(node_id = %self.ctx.settings.node_id, "Sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Runs one enrollment, then keeps running it while the step it landed on
/// is already due, up to the configured chain bound.
async fn run_chain(executor: &StepExecutor, ctx: &EngineContext, id: Uuid) -> SweepReport {
    let mut tally = SweepReport::default();
    let limit = ctx.settings.max_zero_delay_chain.max(1);

    for round in 0..limit {
        let run = match executor.run_step(id).await {
            Ok(run) => run,
            Err(e) => {
                error!(enrollment_id = %id, error = %e, "Step run failed");
                metrics::counter!("scenario.steps.errors").increment(1);
                tally.errors += 1;
                return tally;
            }
        };

        match run {
            StepRun::Ran { enrollment, .. } => {
                tally.executed += 1;
                if !enrollment.is_due(ctx.clock.now()) {
                    return tally;
                }
                if round + 1 == limit {
                    warn!(
                        enrollment_id = %id,
                        scenario_id = %enrollment.scenario_id,
                        step_order = enrollment.current_step_order,
                        limit,
                        "Zero-delay chain limit reached, resuming next sweep"
                    );
                    metrics::counter!("scenario.chain_limit_hits").increment(1);
                    tally.chain_limit_hits += 1;
                }
            }
            StepRun::LockContended => {
                tally.contended += 1;
                return tally;
            }
            StepRun::Conflict { .. } => {
                tally.conflicts += 1;
                return tally;
            }
            StepRun::Skipped { .. } => {
                tally.skipped += 1;
                return tally;
            }
        }
    }
    tally
}
