use crate::{CandidateKey, Error, PoolStore, Result, YieldStore, error::bounded};
use ::redis::{Client, Cmd, FromRedisValue, Script, aio::MultiplexedConnection, cmd};
use async_trait::async_trait;
use core::time::Duration;

// SPOP and the ledger ZADDs run inside one script invocation, which Redis
// executes without interleaving any other command.
const TRANSFER_SCRIPT: &str = r"
local keys = redis.call('SPOP', KEYS[1], ARGV[1])
local now = tonumber(ARGV[2])
for _, key in ipairs(keys) do
    redis.call('ZADD', KEYS[2], now, key)
end
return keys
";

/// Redis key names used by [`RedisStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisKeys {
    /// SET of verified, unissued candidates.
    pub available: String,
    /// ZSET of issued keys scored by issuance time (unix seconds).
    pub issued: String,
    /// STRING holding the smoothed yield estimate.
    pub yield_estimate: String,
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self {
            available: "buffer_keys".to_owned(),
            issued: "used_keys".to_owned(),
            yield_estimate: "unique_yield".to_owned(),
        }
    }
}

/// A [`PoolStore`] and [`YieldStore`] backed by Redis.
///
/// The connection is multiplexed, so clones share one socket. Each round
/// trip is bounded by `timeout`; expiry surfaces as
/// [`Error::StoreUnavailable`].
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    keys: RedisKeys,
    timeout: Duration,
    transfer: Script,
}

impl RedisStore {
    /// Connects to the Redis instance at `url` (`redis://[:password@]host:port/db`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a malformed URL and
    /// [`Error::StoreUnavailable`] if the connection cannot be established
    /// within `timeout`.
    pub async fn connect(url: &str, keys: RedisKeys, timeout: Duration) -> Result<Self> {
        let client = Client::open(url).map_err(|e| Error::config(format!("REDIS_URL: {e}")))?;
        let connect = async {
            client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| Error::store(format!("connect: {e}")))
        };
        let conn = bounded(timeout, connect, || {
            Error::store(format!("connect timed out after {timeout:?}"))
        })
        .await?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            available = %keys.available,
            issued = %keys.issued,
            "Connected to Redis pool store"
        );

        Ok(Self {
            conn,
            keys,
            timeout,
            transfer: Script::new(TRANSFER_SCRIPT),
        })
    }

    pub const fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    async fn exec<T: FromRedisValue>(&self, op: &'static str, command: Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        let timeout = self.timeout;
        let query = async {
            command
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::store(format!("{op}: {e}")))
        };
        bounded(timeout, query, || {
            Error::store(format!("{op} timed out after {timeout:?}"))
        })
        .await
    }
}

#[async_trait]
impl PoolStore for RedisStore {
    async fn available_len(&self) -> Result<usize> {
        let mut command = cmd("SCARD");
        command.arg(&self.keys.available);
        self.exec("SCARD", command).await
    }

    async fn add_available(&self, keys: &[CandidateKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut command = cmd("SADD");
        command
            .arg(&self.keys.available)
            .arg(keys.iter().map(CandidateKey::as_str).collect::<Vec<_>>());
        self.exec("SADD", command).await
    }

    async fn retain_unissued(&self, keys: Vec<CandidateKey>) -> Result<Vec<CandidateKey>> {
        if keys.is_empty() {
            return Ok(keys);
        }
        // ZMSCORE answers membership for the whole batch in one round trip.
        let mut command = cmd("ZMSCORE");
        command
            .arg(&self.keys.issued)
            .arg(keys.iter().map(CandidateKey::as_str).collect::<Vec<_>>());
        let scores: Vec<Option<f64>> = self.exec("ZMSCORE", command).await?;
        if scores.len() != keys.len() {
            return Err(Error::store(format!(
                "ZMSCORE returned {} scores for {} members",
                scores.len(),
                keys.len()
            )));
        }
        Ok(keys
            .into_iter()
            .zip(scores)
            .filter_map(|(key, score)| score.is_none().then_some(key))
            .collect())
    }

    async fn transfer(&self, max: usize, issued_at: u64) -> Result<Vec<CandidateKey>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let timeout = self.timeout;
        let mut invocation = self.transfer.prepare_invoke();
        invocation
            .key(&self.keys.available)
            .key(&self.keys.issued)
            .arg(max)
            .arg(issued_at);
        let run = async {
            invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| Error::store(format!("transfer: {e}")))
        };
        let moved: Vec<String> = bounded(timeout, run, || {
            Error::store(format!("transfer timed out after {timeout:?}"))
        })
        .await?;
        Ok(moved.into_iter().map(CandidateKey::from).collect())
    }

    async fn purge_issued_before(&self, cutoff: u64) -> Result<usize> {
        let mut command = cmd("ZREMRANGEBYSCORE");
        command
            .arg(&self.keys.issued)
            .arg("-inf")
            .arg(format!("({cutoff}"));
        self.exec("ZREMRANGEBYSCORE", command).await
    }

    async fn forget_issued(&self, key: &CandidateKey) -> Result<bool> {
        let mut command = cmd("ZREM");
        command.arg(&self.keys.issued).arg(key.as_str());
        let removed: usize = self.exec("ZREM", command).await?;
        Ok(removed > 0)
    }

    async fn issued_len(&self) -> Result<usize> {
        let mut command = cmd("ZCARD");
        command.arg(&self.keys.issued);
        self.exec("ZCARD", command).await
    }
}

#[async_trait]
impl YieldStore for RedisStore {
    async fn load_yield(&self) -> Result<Option<f64>> {
        let mut command = cmd("GET");
        command.arg(&self.keys.yield_estimate);
        let raw: Option<String> = self.exec("GET", command).await?;
        raw.map(|value| {
            value
                .parse::<f64>()
                .map_err(|e| Error::store(format!("yield estimate `{value}`: {e}")))
        })
        .transpose()
    }

    async fn store_yield(&self, value: f64) -> Result<()> {
        let mut command = cmd("SET");
        command.arg(&self.keys.yield_estimate).arg(value);
        self.exec("SET", command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_names() {
        let keys = RedisKeys::default();
        assert_eq!(keys.available, "buffer_keys");
        assert_eq!(keys.issued, "used_keys");
        assert_eq!(keys.yield_estimate, "unique_yield");
    }

    #[test]
    fn transfer_script_pops_then_stamps() {
        let spop = TRANSFER_SCRIPT.find("SPOP").unwrap();
        let zadd = TRANSFER_SCRIPT.find("ZADD").unwrap();
        assert!(spop < zadd);
        assert!(TRANSFER_SCRIPT.contains("KEYS[2], now, key"));
    }

    #[tokio::test]
    async fn malformed_url_is_config_error() {
        let err = RedisStore::connect("not a url", RedisKeys::default(), Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
