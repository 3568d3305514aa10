use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use core::time::Duration;
use keypool::{
    Alphabet, BufferConfig, GeneratorConfig, MinKeys, RecordTable, RedisKeys, ReplenishConfig,
    SignalDefaults, YieldPolicy,
};
use std::net::SocketAddr;

/// Command line for the `keypool` binary.
///
/// Every option can also be supplied through the environment variable named
/// in its help text. A `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "keypool",
    version,
    about = "Pre-verified random identifiers, served from a local buffer"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the long-lived buffer sidecar and its HTTP interface.
    Sidecar(SidecarArgs),
    /// Run one generator cycle and exit.
    Generate(GenerateArgs),
    /// Purge expired issued-ledger entries once and exit.
    Cleanup(CleanupArgs),
}

/// Connection settings for the shared pool store.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Redis connection URL.
    ///
    /// Environment variable: `REDIS_URL`
    #[arg(long, env = "REDIS_URL", default_value_t = String::from("redis://localhost:6379/0"))]
    pub redis_url: String,

    /// Upper bound on every store round trip, in milliseconds.
    ///
    /// Environment variable: `STORE_TIMEOUT_MS`
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 2_000)]
    pub store_timeout_ms: u64,

    /// Redis SET holding verified, unissued keys.
    ///
    /// Environment variable: `AVAILABLE_POOL_KEY`
    #[arg(long, env = "AVAILABLE_POOL_KEY", default_value_t = String::from("buffer_keys"))]
    pub available_pool_key: String,

    /// Redis ZSET of issued keys scored by issuance time.
    ///
    /// Environment variable: `ISSUED_LEDGER_KEY`
    #[arg(long, env = "ISSUED_LEDGER_KEY", default_value_t = String::from("used_keys"))]
    pub issued_ledger_key: String,

    /// Redis STRING holding the smoothed yield estimate.
    ///
    /// Environment variable: `YIELD_KEY`
    #[arg(long, env = "YIELD_KEY", default_value_t = String::from("unique_yield"))]
    pub yield_key: String,
}

#[derive(Args, Debug, Clone)]
pub struct SidecarArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Address the HTTP interface listens on.
    ///
    /// Environment variable: `SIDECAR_ADDR`
    #[arg(long, env = "SIDECAR_ADDR", default_value_t = String::from("0.0.0.0:8500"))]
    pub addr: String,

    /// Keys moved from the shared pool per transfer.
    ///
    /// Environment variable: `KEY_BATCH_SIZE`
    #[arg(long, env = "KEY_BATCH_SIZE", default_value_t = 20)]
    pub key_batch_size: usize,

    /// Transfer whenever the local cache holds fewer keys than this. Acts as
    /// the baseline when a load-derived threshold is configured.
    ///
    /// Environment variable: `L2_MIN_KEYS`
    #[arg(long, env = "L2_MIN_KEYS", default_value_t = 5)]
    pub l2_min_keys: usize,

    /// Maximum number of keys held in the local cache.
    ///
    /// Environment variable: `L2_CAPACITY`
    #[arg(long, env = "L2_CAPACITY", default_value_t = 1_000)]
    pub l2_capacity: usize,

    /// Replenishment tick, in milliseconds.
    ///
    /// Environment variable: `REPLENISH_INTERVAL_MS`
    #[arg(long, env = "REPLENISH_INTERVAL_MS", default_value_t = 1_000)]
    pub replenish_interval_ms: u64,

    /// Serve rate (keys/s) above which the threshold grows. Enables the
    /// load-derived threshold together with `LOAD_STEP` and `KEYS_PER_STEP`.
    ///
    /// Environment variable: `LOAD_CUTOFF`
    #[arg(long, env = "LOAD_CUTOFF")]
    pub load_cutoff: Option<f64>,

    /// Width of one load step above the cutoff, in keys/s.
    ///
    /// Environment variable: `LOAD_STEP`
    #[arg(long, env = "LOAD_STEP")]
    pub load_step: Option<f64>,

    /// Extra keys required per load step.
    ///
    /// Environment variable: `KEYS_PER_STEP`
    #[arg(long, env = "KEYS_PER_STEP")]
    pub keys_per_step: Option<usize>,

    /// Seconds to wait for the replenishment task on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Length of generated keys.
    ///
    /// Environment variable: `KEY_LENGTH`
    #[arg(long, env = "KEY_LENGTH", default_value_t = 7)]
    pub key_length: usize,

    /// Symbol set: `alphanumeric` or `url-safe`.
    ///
    /// Environment variable: `KEY_ALPHABET`
    #[arg(long, env = "KEY_ALPHABET", default_value_t = String::from("alphanumeric"))]
    pub key_alphabet: String,

    /// Reservation horizon T: seconds of demand the pool should cover.
    ///
    /// Environment variable: `TIME_RESERVE`
    #[arg(long, env = "TIME_RESERVE", default_value_t = 60)]
    pub time_reserve: u64,

    /// Upper bound on mint-verify-add attempts per run.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: usize,

    /// Upper bound on candidates minted per attempt, whatever the load.
    ///
    /// Environment variable: `MAX_BATCH`
    #[arg(long, env = "MAX_BATCH", default_value_t = 100_000)]
    pub max_batch: usize,

    /// Smoothing factor for the yield estimate, in (0, 1].
    ///
    /// Environment variable: `YIELD_ALPHA`
    #[arg(long, env = "YIELD_ALPHA", default_value_t = 0.3)]
    pub yield_alpha: f64,

    /// Lower bound for the yield estimate, in (0, 1].
    ///
    /// Environment variable: `YIELD_FLOOR`
    #[arg(long, env = "YIELD_FLOOR", default_value_t = 0.05)]
    pub yield_floor: f64,

    /// Yield estimate used when none is stored or it cannot be read.
    ///
    /// Environment variable: `DEFAULT_YIELD`
    #[arg(long, env = "DEFAULT_YIELD", default_value_t = 0.9)]
    pub default_yield: f64,

    /// Load (keys/s) used when the load signal cannot be read.
    ///
    /// Environment variable: `DEFAULT_LOAD`
    #[arg(long, env = "DEFAULT_LOAD", default_value_t = 10.0)]
    pub default_load: f64,

    /// PostgreSQL URL of the systems of record.
    ///
    /// Environment variable: `DATABASE_URL`
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Connections kept in the Postgres pool.
    ///
    /// Environment variable: `DB_MAX_CONNECTIONS`
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 2)]
    pub db_max_connections: u32,

    /// Comma-separated `table:column` list of key columns to check.
    ///
    /// Environment variable: `RECORD_TABLES`
    #[arg(long, env = "RECORD_TABLES", default_value_t = String::from("note:note_id,customuser:user_id"))]
    pub record_tables: String,

    /// Prometheus base URL for the load signal. `DEFAULT_LOAD` is used when
    /// unset.
    ///
    /// Environment variable: `PROMETHEUS_URL`
    #[arg(long, env = "PROMETHEUS_URL")]
    pub prometheus_url: Option<String>,

    /// PromQL returning keys consumed per second. `{window}` is replaced by
    /// the averaging window.
    ///
    /// Environment variable: `LOAD_QUERY`
    #[arg(long, env = "LOAD_QUERY", default_value_t = String::from(keypool::DEFAULT_LOAD_QUERY))]
    pub load_query: String,

    /// Averaging window for the load signal, in seconds.
    ///
    /// Environment variable: `LOAD_WINDOW_SECS`
    #[arg(long, env = "LOAD_WINDOW_SECS", default_value_t = 300)]
    pub load_window_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Ledger retention window in minutes.
    ///
    /// Environment variable: `EXPIRE_MINUTES`
    #[arg(long, env = "EXPIRE_MINUTES", default_value_t = 15)]
    pub expire_minutes: u64,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
    pub keys: RedisKeys,
    pub timeout: Duration,
}

impl TryFrom<StoreArgs> for StoreConfig {
    type Error = anyhow::Error;

    fn try_from(args: StoreArgs) -> Result<Self, Self::Error> {
        if args.store_timeout_ms == 0 {
            bail!("STORE_TIMEOUT_MS must be greater than 0");
        }
        for (name, value) in [
            ("AVAILABLE_POOL_KEY", &args.available_pool_key),
            ("ISSUED_LEDGER_KEY", &args.issued_ledger_key),
            ("YIELD_KEY", &args.yield_key),
        ] {
            if value.is_empty() {
                bail!("{name} must not be empty");
            }
        }
        if args.available_pool_key == args.issued_ledger_key {
            bail!("AVAILABLE_POOL_KEY and ISSUED_LEDGER_KEY must differ");
        }

        Ok(Self {
            redis_url: args.redis_url,
            keys: RedisKeys {
                available: args.available_pool_key,
                issued: args.issued_ledger_key,
                yield_estimate: args.yield_key,
            },
            timeout: Duration::from_millis(args.store_timeout_ms),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub store: StoreConfig,
    pub addr: SocketAddr,
    pub buffer: BufferConfig,
}

impl TryFrom<SidecarArgs> for SidecarConfig {
    type Error = anyhow::Error;

    fn try_from(args: SidecarArgs) -> Result<Self, Self::Error> {
        let addr: SocketAddr = args
            .addr
            .parse()
            .with_context(|| format!("SIDECAR_ADDR `{}` is not a socket address", args.addr))?;

        if args.replenish_interval_ms == 0 {
            bail!("REPLENISH_INTERVAL_MS must be greater than 0");
        }

        let min_keys = match (args.load_cutoff, args.load_step, args.keys_per_step) {
            (None, None, None) => MinKeys::Static(args.l2_min_keys),
            (Some(cutoff), Some(step), Some(keys_per_step)) => {
                MinKeys::load_step(args.l2_min_keys, cutoff, step, keys_per_step)?
            }
            _ => bail!("LOAD_CUTOFF, LOAD_STEP and KEYS_PER_STEP must be set together"),
        };

        let buffer = BufferConfig {
            capacity: args.l2_capacity,
            replenish: ReplenishConfig {
                batch_size: args.key_batch_size,
                min_keys,
                interval: Duration::from_millis(args.replenish_interval_ms),
            },
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        };
        buffer.validate()?;

        Ok(Self {
            store: args.store.try_into()?,
            addr,
            buffer,
        })
    }
}

/// Validated settings for one `generate` run.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub store: StoreConfig,
    pub key_length: usize,
    pub alphabet: Alphabet,
    pub generator: GeneratorConfig,
    pub defaults: SignalDefaults,
    pub database_url: String,
    pub db_max_connections: u32,
    pub prometheus_url: Option<String>,
    pub load_query: String,
}

impl TryFrom<GenerateArgs> for GenerateConfig {
    type Error = anyhow::Error;

    fn try_from(args: GenerateArgs) -> Result<Self, Self::Error> {
        if args.key_length == 0 {
            bail!("KEY_LENGTH must be greater than 0");
        }
        if args.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be greater than 0");
        }
        if args.max_batch == 0 {
            bail!("MAX_BATCH must be greater than 0");
        }
        if args.time_reserve == 0 {
            bail!("TIME_RESERVE must be greater than 0");
        }
        if args.db_max_connections == 0 {
            bail!("DB_MAX_CONNECTIONS must be greater than 0");
        }
        if !(args.default_yield > 0.0 && args.default_yield <= 1.0) {
            bail!("DEFAULT_YIELD must be in (0, 1], got {}", args.default_yield);
        }
        if !(args.default_load.is_finite() && args.default_load >= 0.0) {
            bail!("DEFAULT_LOAD must be non-negative, got {}", args.default_load);
        }
        if args.load_window_secs == 0 {
            bail!("LOAD_WINDOW_SECS must be greater than 0");
        }

        let alphabet: Alphabet = args.key_alphabet.parse()?;
        let yield_policy = YieldPolicy::new(args.yield_alpha, args.yield_floor)?;
        let record_tables = RecordTable::parse_list(&args.record_tables)?;
        let prometheus_url = args.prometheus_url.filter(|url| !url.trim().is_empty());

        Ok(Self {
            store: args.store.try_into()?,
            key_length: args.key_length,
            alphabet,
            generator: GeneratorConfig {
                horizon: Duration::from_secs(args.time_reserve),
                max_attempts: args.max_attempts,
                max_batch: args.max_batch,
                yield_policy,
                record_tables,
            },
            defaults: SignalDefaults {
                load: args.default_load,
                yield_estimate: args.default_yield,
                window: Duration::from_secs(args.load_window_secs),
            },
            database_url: args.database_url,
            db_max_connections: args.db_max_connections,
            prometheus_url,
            load_query: args.load_query,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub store: StoreConfig,
    pub retention: Duration,
}

impl TryFrom<CleanupArgs> for CleanupConfig {
    type Error = anyhow::Error;

    fn try_from(args: CleanupArgs) -> Result<Self, Self::Error> {
        if args.expire_minutes == 0 {
            bail!("EXPIRE_MINUTES must be greater than 0");
        }
        Ok(Self {
            store: args.store.try_into()?,
            retention: Duration::from_secs(args.expire_minutes.saturating_mul(60)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        Cli::try_parse_from(std::iter::once("keypool").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    fn sidecar(args: &[&str]) -> anyhow::Result<SidecarConfig> {
        let mut full = vec!["sidecar"];
        full.extend_from_slice(args);
        match parse(&full) {
            Command::Sidecar(args) => SidecarConfig::try_from(args),
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn generate(args: &[&str]) -> anyhow::Result<GenerateConfig> {
        let mut full = vec!["generate", "--database-url", "postgres://localhost/app"];
        full.extend_from_slice(args);
        match parse(&full) {
            Command::Generate(args) => GenerateConfig::try_from(args),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sidecar_defaults() {
        let config = sidecar(&[]).unwrap();
        assert_eq!(config.addr, "0.0.0.0:8500".parse().unwrap());
        assert_eq!(config.buffer, BufferConfig::default());
        assert_eq!(config.store.keys, RedisKeys::default());
        assert_eq!(config.store.timeout, Duration::from_secs(2));
    }

    #[test]
    fn sidecar_load_derived_threshold() {
        let config = sidecar(&[
            "--load-cutoff",
            "10",
            "--load-step",
            "5",
            "--keys-per-step",
            "20",
        ])
        .unwrap();
        assert_eq!(config.buffer.replenish.min_keys.threshold(20.0), 45);

        assert!(sidecar(&["--load-cutoff", "10"]).is_err());
    }

    #[test]
    fn sidecar_rejects_bad_values() {
        assert!(sidecar(&["--key-batch-size", "0"]).is_err());
        assert!(sidecar(&["--l2-capacity", "0"]).is_err());
        assert!(sidecar(&["--l2-capacity", "10", "--key-batch-size", "20"]).is_err());
        assert!(sidecar(&["--addr", "not-an-address"]).is_err());
        assert!(sidecar(&["--replenish-interval-ms", "0"]).is_err());
    }

    #[test]
    fn generate_defaults() {
        let config = generate(&[]).unwrap();
        assert_eq!(config.key_length, 7);
        assert_eq!(config.alphabet, Alphabet::Alphanumeric);
        assert_eq!(config.generator.horizon, Duration::from_secs(60));
        assert_eq!(config.generator.max_attempts, 5);
        assert_eq!(config.generator.max_batch, 100_000);
        assert_eq!(config.generator.yield_policy, YieldPolicy::default());
        assert_eq!(config.generator.record_tables.len(), 2);
        assert_eq!(config.defaults, SignalDefaults::default());
        assert_eq!(config.prometheus_url, None);
    }

    #[test]
    fn generate_rejects_bad_values() {
        assert!(generate(&["--key-length", "0"]).is_err());
        assert!(generate(&["--max-attempts", "0"]).is_err());
        assert!(generate(&["--max-batch", "0"]).is_err());
        assert!(generate(&["--yield-alpha", "0"]).is_err());
        assert!(generate(&["--yield-alpha", "1.5"]).is_err());
        assert!(generate(&["--yield-floor", "0"]).is_err());
        assert!(generate(&["--record-tables", "note"]).is_err());
        assert!(generate(&["--record-tables", "note;drop:id"]).is_err());
        assert!(generate(&["--key-alphabet", "emoji"]).is_err());
        assert!(generate(&["--default-yield", "0"]).is_err());
    }

    #[test]
    fn cleanup_retention() {
        let Command::Cleanup(args) = parse(&["cleanup", "--expire-minutes", "30"]) else {
            panic!("expected cleanup");
        };
        let config = CleanupConfig::try_from(args).unwrap();
        assert_eq!(config.retention, Duration::from_secs(1_800));
    }

    #[test]
    fn store_keys_must_differ() {
        let Command::Cleanup(args) = parse(&[
            "cleanup",
            "--available-pool-key",
            "keys",
            "--issued-ledger-key",
            "keys",
        ]) else {
            panic!("expected cleanup");
        };
        assert!(CleanupConfig::try_from(args).is_err());
    }
}
