use crate::server::{
    config::{CleanupConfig, GenerateConfig},
    telemetry::{
        increment_candidates_accepted, increment_candidates_generated, increment_ledger_purged,
        increment_store_failures, record_yield_estimate,
    },
};
use keypool::{
    CleanupJob, CycleReport, Error, GeneratorJob, LoadSource, PgRecords, PrometheusLoad,
    RedisStore, StaticLoad, ThreadRandomKeys,
};

/// Runs one generator cycle against Redis, Postgres and (optionally)
/// Prometheus.
pub async fn generate(config: GenerateConfig) -> anyhow::Result<CycleReport> {
    let store = RedisStore::connect(
        &config.store.redis_url,
        config.store.keys.clone(),
        config.store.timeout,
    )
    .await?;
    let records = PgRecords::connect(
        &config.database_url,
        config.db_max_connections,
        config.store.timeout,
    )
    .await?;

    let load: Box<dyn LoadSource> = match &config.prometheus_url {
        Some(url) => Box::new(PrometheusLoad::new(
            url,
            config.load_query.clone(),
            config.store.timeout,
        )?),
        None => Box::new(StaticLoad(config.defaults.load)),
    };

    let keys = ThreadRandomKeys::new(config.key_length, config.alphabet)?;
    let mut job = GeneratorJob::new(store.clone(), records, keys, config.generator.clone());

    let cycle = job
        .run_cycle(load.as_ref(), &store, &config.defaults)
        .await
        .inspect_err(count_store_failure)?;

    increment_candidates_generated(cycle.run.attempted);
    increment_candidates_accepted(cycle.run.succeeded);
    record_yield_estimate(cycle.run.yield_estimate.value());

    #[cfg(feature = "tracing")]
    tracing::info!(
        outcome = ?cycle.run.outcome,
        load = cycle.load.value(),
        load_defaulted = cycle.load.is_defaulted(),
        pool = cycle.run.final_pool,
        attempted = cycle.run.attempted,
        succeeded = cycle.run.succeeded,
        y = cycle.run.yield_estimate.value(),
        persisted = cycle.persisted,
        "Generator run finished"
    );

    Ok(cycle)
}

/// Purges expired issued-ledger entries once.
pub async fn cleanup(config: CleanupConfig) -> anyhow::Result<usize> {
    let store = RedisStore::connect(
        &config.store.redis_url,
        config.store.keys.clone(),
        config.store.timeout,
    )
    .await?;

    let report = CleanupJob::new(store, config.retention)
        .run()
        .await
        .inspect_err(count_store_failure)?;
    increment_ledger_purged(report.removed as u64);

    #[cfg(feature = "tracing")]
    tracing::info!(
        cutoff = report.cutoff,
        removed = report.removed,
        retention_secs = config.retention.as_secs(),
        "Cleanup run finished"
    );

    Ok(report.removed)
}

fn count_store_failure(e: &Error) {
    if matches!(e, Error::StoreUnavailable { .. }) {
        increment_store_failures();
    }
}
