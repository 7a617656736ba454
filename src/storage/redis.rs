//! Redis-backed storage: the shared authoritative counter backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::StorageError;
use crate::key::LimitKey;
use crate::request::AddAndGetRequest;
use crate::storage::{CounterFilter, UsageStorage};
use crate::window;

pub(crate) const DEFAULT_PREFIX: &str = "spillway";
const KEY_SEPARATOR: &str = "|";
const KEY_SEPARATOR_SUBSTITUTE: &str = "_";
const WILDCARD: &str = "*";

/// Atomic two-bucket carry-over counter.
///
/// Reads the current and previous window buckets, combines them as
/// `current + cost + previous * weight`, and applies the increment only
/// while the combined count is still within capacity. Runs server-side so
/// the read-combine-increment is atomic across both keys, which a single
/// `INCRBY` cannot express. The combined count is returned as a string and
/// ceiling-rounded by the caller.
const CARRY_OVER_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local previous = tonumber(redis.call('GET', KEYS[2]) or '0')
local cost = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local weight = tonumber(ARGV[3])
local combined = current + cost + previous * weight
if combined <= capacity then
    redis.call('INCRBY', KEYS[1], cost)
end
return tostring(combined)
";

/// Storage backed by a shared Redis server.
///
/// Uses an auto-reconnecting [`ConnectionManager`], so a dropped connection
/// recovers on its own. Calls here block on network I/O; on the request hot
/// path this store belongs behind [`AsyncBatchStorage`] so external trouble
/// never slows callers down.
///
/// [`AsyncBatchStorage`]: crate::storage::AsyncBatchStorage
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    key_prefix: String,
    key_expiration: Option<Duration>,
    carry_over: Script,
}

impl RedisStorage {
    pub fn builder(url: impl Into<String>) -> RedisStorageBuilder {
        RedisStorageBuilder {
            url: url.into(),
            key_prefix: DEFAULT_PREFIX.to_string(),
            key_expiration: None,
        }
    }

    /// Connects with the default key prefix and TTL policy.
    pub async fn connect(url: impl Into<String>) -> Result<Self, StorageError> {
        Self::builder(url).build().await
    }

    /// Carry-over variant of `add_and_get`: approximates a sliding window
    /// with two fixed buckets per counter instead of a local per-slide grid.
    ///
    /// Each request must carry its `capacity`; the increment is suppressed
    /// server-side once the weighted count would pass it. The whole batch
    /// runs as one atomic pipeline of script invocations plus TTLs.
    pub async fn add_and_get_with_limit(
        &self,
        requests: &[AddAndGetRequest],
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        if requests.is_empty() {
            return Ok(HashMap::new());
        }
        let mut connection = self.connection.clone();
        // EVALSHA inside a pipeline cannot recover from NOSCRIPT on its own.
        let _: String = self.carry_over.prepare_invoke().load_async(&mut connection).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut keys = Vec::with_capacity(requests.len());
        for request in requests {
            let key = LimitKey::from_request(request);
            let previous = LimitKey::previous_from_request(request);
            let current_key = encode_key(&self.key_prefix, &key);
            let previous_key = encode_key(&self.key_prefix, &previous);

            let mut invocation = self.carry_over.prepare_invoke();
            invocation
                .key(current_key.as_str())
                .key(previous_key.as_str())
                .arg(request.cost())
                .arg(request.capacity())
                .arg(request.previous_bucket_weight());
            pipe.invoke_script(&invocation);
            let ttl = ttl_seconds(self.key_expiration, request.window_length());
            if ttl > 0 {
                pipe.expire(&current_key, ttl).ignore();
            }
            keys.push((key, current_key));
        }
        let counts: Vec<String> = pipe.query_async(&mut connection).await?;

        let mut results = HashMap::with_capacity(requests.len());
        for ((key, redis_key), combined) in keys.into_iter().zip(counts) {
            let count: f64 = combined.parse().map_err(|_| StorageError::MalformedValue {
                key: redis_key,
                value: combined.clone(),
            })?;
            results.insert(key, count.ceil() as i64);
        }
        Ok(results)
    }
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .field("key_expiration", &self.key_expiration)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl UsageStorage for RedisStorage {
    async fn add_and_get(
        &self,
        requests: &[AddAndGetRequest],
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        if requests.is_empty() {
            return Ok(HashMap::new());
        }
        let mut connection = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut keys = Vec::with_capacity(requests.len());
        for request in requests {
            let key = LimitKey::from_request(request);
            let redis_key = encode_key(&self.key_prefix, &key);
            pipe.incr(&redis_key, request.cost());
            let ttl = ttl_seconds(self.key_expiration, request.window_length());
            if ttl > 0 {
                pipe.expire(&redis_key, ttl).ignore();
            }
            keys.push(key);
        }
        let counts: Vec<i64> = pipe.query_async(&mut connection).await?;
        Ok(keys.into_iter().zip(counts).collect())
    }

    async fn counters(
        &self,
        filter: &CounterFilter,
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        let mut connection = self.connection.clone();
        let pattern = key_pattern(&self.key_prefix, filter);
        let keys: Vec<String> = connection.keys(&pattern).await?;

        let mut counters = HashMap::with_capacity(keys.len());
        for stored_key in keys {
            let value: Option<String> = connection.get(&stored_key).await?;
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                tracing::info!(key = %stored_key, "key has no value, skipping");
                continue;
            };
            let count: i64 = match value.parse() {
                Ok(count) => count,
                Err(_) => {
                    tracing::warn!(key = %stored_key, value = %value, "unparseable counter value, skipping");
                    continue;
                }
            };
            match parse_key(&stored_key) {
                // The scan pattern only narrows on a prefix of the filter's
                // fields; the full filter is applied here.
                Ok(key) if filter.matches(&key) => {
                    counters.insert(key, count);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(key = %stored_key, error = %error, "unparseable counter key, skipping");
                }
            }
        }
        Ok(counters)
    }

    /// The connection manager has no explicit shutdown; dropping the last
    /// clone closes it.
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Builder for [`RedisStorage`]. Connecting is the only fatal path in the
/// crate: a backend that cannot be constructed propagates to the caller.
#[derive(Debug, Clone)]
pub struct RedisStorageBuilder {
    url: String,
    key_prefix: String,
    key_expiration: Option<Duration>,
}

impl RedisStorageBuilder {
    pub fn key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// Fixed TTL for every stored key, replacing the default
    /// `2 × window_length`.
    pub fn key_expiration(mut self, key_expiration: Duration) -> Self {
        self.key_expiration = Some(key_expiration);
        self
    }

    pub async fn build(self) -> Result<RedisStorage, StorageError> {
        let client = redis::Client::open(self.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        Ok(RedisStorage {
            connection,
            key_prefix: self.key_prefix,
            key_expiration: self.key_expiration,
            carry_over: Script::new(CARRY_OVER_SCRIPT),
        })
    }
}

/// `<prefix>|<resource>|<limit>|<property>|<windowStart>|<windowLength>`,
/// with separators inside field values substituted away. Lossy, but a
/// substituted field still lands on a stable, collision-tolerant key.
pub(crate) fn encode_key(prefix: &str, key: &LimitKey) -> String {
    let window_start = window::format_instant(key.window_start());
    let window_length = window::format_duration(key.window_length());
    [
        prefix,
        key.resource(),
        key.limit_name(),
        key.property(),
        window_start.as_str(),
        window_length.as_str(),
    ]
    .map(sanitize)
    .join(KEY_SEPARATOR)
}

pub(crate) fn key_pattern(prefix: &str, filter: &CounterFilter) -> String {
    let mut segments = vec![sanitize(prefix)];
    segments.extend(filter.prefix_segments().into_iter().map(sanitize));
    segments.push(WILDCARD.to_string());
    segments.join(KEY_SEPARATOR)
}

/// Versioned parse: six segments is the current shape; five is the legacy
/// shape without a window length, which defaults to zero.
pub(crate) fn parse_key(stored_key: &str) -> Result<LimitKey, StorageError> {
    let malformed = || StorageError::MalformedKey { key: stored_key.to_string() };
    let segments: Vec<&str> = stored_key.split(KEY_SEPARATOR).collect();
    let window_length = match segments.len() {
        6 => window::parse_duration(segments[5]).ok_or_else(malformed)?,
        5 => Duration::ZERO,
        _ => return Err(malformed()),
    };
    let window_start = window::parse_instant(segments[4]).ok_or_else(malformed)?;
    Ok(LimitKey::new(segments[1], segments[2], segments[3], true, window_start, window_length))
}

fn sanitize(segment: &str) -> String {
    segment.replace(KEY_SEPARATOR, KEY_SEPARATOR_SUBSTITUTE)
}

/// Safety TTL on stored keys. Zero means "set no TTL": a zero-length window
/// has no meaningful expiry, and `EXPIRE key 0` would delete the counter.
fn ttl_seconds(key_expiration: Option<Duration>, window_length: Duration) -> i64 {
    match key_expiration {
        Some(expiration) => expiration.as_secs() as i64,
        // Twice the window so an abandoned bucket cannot linger. Logical
        // expiry is the bucket going out of scope, not this TTL.
        None => (window_length.as_secs() as i64).saturating_mul(2),
    }
}
