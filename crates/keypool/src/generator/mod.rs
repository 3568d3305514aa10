//! The generator job: tops up the available pool with verified candidates.
//!
//! One invocation of [`GeneratorJob::run`] runs to completion. An external
//! scheduler decides the cadence. Each run:
//!
//! 1. reads the pool size `S` and plans `G` and `Y` from `L`, `T` and `y`;
//! 2. repeatedly mints `Y` candidates, drops any present in a system of record
//!    or in the issued ledger, and adds the survivors to the pool, until the
//!    pool size reaches `G` or `max_attempts` is reached;
//! 3. folds the run's success ratio into the smoothed yield estimate.
//!
//! Exhausting the attempt budget is a normal outcome
//! ([`RunOutcome::AttemptsExhausted`]). The next run starts from fresh
//! readings.


use crate::{
    BatchPlan, KeySource, LoadSource, PoolStore, RecordChecker, RecordTable, Result, Signal,
    SignalDefaults, YieldEstimate, YieldPolicy, YieldStore, absent_from_all, mint_batch,
    plan_batch, read_load, read_yield,
};
use core::time::Duration;

/// Static parameters of the generator job.
#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    /// Reservation horizon `T`: seconds of demand the pool should cover.
    pub horizon: Duration,
    /// Upper bound on mint-verify-add attempts per run.
    pub max_attempts: usize,
    /// Upper bound on `Y`, the candidates minted per attempt.
    pub max_batch: usize,
    /// Smoothing factor and floor for the yield estimate.
    pub yield_policy: YieldPolicy,
    /// Systems of record every candidate must be absent from.
    pub record_tables: Vec<RecordTable>,
}

/// How a generator run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The pool already covered the projected demand. Nothing was minted.
    Satisfied,
    /// The pool size reached `G` during this run.
    TargetReached,
    /// `max_attempts` ran out before the pool size reached `G`.
    AttemptsExhausted,
}

/// Totals from one generator run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub plan: BatchPlan,
    /// Pool size when the run started.
    pub initial_pool: usize,
    /// Pool size at the last reading.
    pub final_pool: usize,
    /// Mint-verify-add rounds executed.
    pub attempts: usize,
    /// Candidates minted.
    pub attempted: u64,
    /// Candidates newly added to the pool.
    pub succeeded: u64,
    /// Estimate the run was planned with.
    pub previous_yield: YieldEstimate,
    /// Estimate after folding in this run.
    pub yield_estimate: YieldEstimate,
}

/// Batch generator over a pool store `P`, record checker `R` and key source
/// `K`.
pub struct GeneratorJob<P, R, K> {
    store: P,
    records: R,
    keys: K,
    config: GeneratorConfig,
}

impl<P, R, K> GeneratorJob<P, R, K>
where
    P: PoolStore,
    R: RecordChecker,
    K: KeySource + Send,
{
    pub const fn new(store: P, records: R, keys: K, config: GeneratorConfig) -> Self {
        Self {
            store,
            records,
            keys,
            config,
        }
    }

    pub const fn store(&self) -> &P {
        &self.store
    }

    pub const fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Runs one generation cycle with explicit control inputs.
    ///
    /// `load` is `L` in keys per second and `estimate` the current `y`. The
    /// updated estimate is returned in the report. Persisting it is the
    /// caller's job (see [`GeneratorJob::run_cycle`]).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StoreUnavailable`] or
    /// [`crate::Error::RecordsUnavailable`] if a round trip fails. The run is
    /// abandoned at that point; keys already added stay in the pool.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(load = load, y = estimate.value())))]
    pub async fn run(&mut self, load: f64, estimate: YieldEstimate) -> Result<RunReport> {
        let policy = self.config.yield_policy;
        let estimate = policy.clamp(estimate.value());
        let initial_pool = self.store.available_len().await?;
        let plan = plan_batch(load, self.config.horizon, initial_pool, estimate)
            .capped(self.config.max_batch);

        let mut report = RunReport {
            outcome: RunOutcome::Satisfied,
            plan,
            initial_pool,
            final_pool: initial_pool,
            attempts: 0,
            attempted: 0,
            succeeded: 0,
            previous_yield: estimate,
            yield_estimate: estimate,
        };

        if plan.is_satisfied() {
            #[cfg(feature = "tracing")]
            tracing::info!(
                pool = initial_pool,
                demand = plan.demand,
                "Pool covers projected demand, nothing to generate"
            );
            return Ok(report);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            pool = initial_pool,
            target = plan.target,
            batch = plan.attempt,
            "Generating candidates"
        );

        report.outcome = RunOutcome::AttemptsExhausted;

        while report.attempts < self.config.max_attempts {
            report.attempts += 1;

            let batch = mint_batch(&mut self.keys, plan.attempt);
            report.attempted += batch.len() as u64;

            let survivors =
                absent_from_all(&self.records, &self.config.record_tables, batch).await?;
            let survivors = self.store.retain_unissued(survivors).await?;
            let added = self.store.add_available(&survivors).await?;
            report.succeeded += added as u64;

            report.final_pool = self.store.available_len().await?;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                attempt = report.attempts,
                survivors = survivors.len(),
                added,
                pool = report.final_pool,
                "Batch verified"
            );

            if report.final_pool as u64 >= plan.target {
                report.outcome = RunOutcome::TargetReached;
                break;
            }
        }

        report.yield_estimate = policy.update(estimate, report.attempted, report.succeeded);

        match report.outcome {
            RunOutcome::TargetReached => {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    attempts = report.attempts,
                    attempted = report.attempted,
                    succeeded = report.succeeded,
                    pool = report.final_pool,
                    y = report.yield_estimate.value(),
                    "Pool topped up"
                );
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    max_attempts = self.config.max_attempts,
                    attempted = report.attempted,
                    succeeded = report.succeeded,
                    pool = report.final_pool,
                    target = plan.target,
                    "Attempt budget exhausted before reaching target"
                );
            }
        }

        Ok(report)
    }

    /// Reads `L` and `y` (falling back to `defaults`), runs one cycle, and
    /// persists the updated estimate when it changed.
    ///
    /// A failure to persist the estimate is logged and otherwise ignored. The
    /// next run will simply start from the older value.
    ///
    /// # Errors
    ///
    /// Propagates store and record failures from [`GeneratorJob::run`].
    pub async fn run_cycle<L, Y>(
        &mut self,
        load_source: &L,
        yield_store: &Y,
        defaults: &SignalDefaults,
    ) -> Result<CycleReport>
    where
        L: LoadSource + ?Sized,
        Y: YieldStore + ?Sized,
    {
        let load = read_load(load_source, defaults).await;
        let prior_yield = read_yield(yield_store, defaults).await;

        let run = self.run(load.value(), prior_yield.value()).await?;

        let changed = prior_yield.is_defaulted() || run.yield_estimate != run.previous_yield;
        let persisted = if changed {
            match yield_store.store_yield(run.yield_estimate.value()).await {
                Ok(()) => true,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_e, "Failed to persist yield estimate");
                    false
                }
            }
        } else {
            false
        };

        Ok(CycleReport {
            load,
            prior_yield,
            run,
            persisted,
        })
    }
}

/// A [`RunReport`] plus the provenance of its inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub load: Signal<f64>,
    pub prior_yield: Signal<YieldEstimate>,
    pub run: RunReport,
    /// Whether the updated yield estimate was written back.
    pub persisted: bool,
}
