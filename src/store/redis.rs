use crate::store::{CheckInput, CheckOutput, CounterStore, Decision, RollbackToken};
use actix_web::rt::time::Instant;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
}

/// A sliding-window [CounterStore] backed by Redis sorted sets, suitable for
/// sharing one set of counters across multiple processes.
///
/// Each recorded event is one sorted-set entry scored by its timestamp, so the
/// window slides continuously instead of resetting at bucket boundaries.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl RedisStore {
    /// Create a RedisStore builder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_admission_gate::store::redis::RedisStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisStore::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
        }
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply an optional prefix to all counting keys given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other
    /// purposes; the prefix acts as a namespace to avoid collision with other
    /// keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisStore {
        RedisStore {
            connection: self.connection,
            key_prefix: self.key_prefix,
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_millis() as u64
}

impl CounterStore for RedisStore {
    type Error = Error;

    /// The expire/count/add steps run as one pipelined MULTI block for
    /// throughput, but the count is read before the add rather than under a
    /// serializable transaction across callers. Concurrent checks on the same
    /// key can therefore observe the same pre-add count and all be admitted,
    /// overshooting the limit by up to the concurrency depth at decision time.
    async fn record(
        &self,
        input: CheckInput,
    ) -> Result<(Decision, CheckOutput, RollbackToken), Self::Error> {
        let key = self.make_key(&input.key);
        let now_ms = epoch_ms();
        let window_ms = input.window.as_millis() as u64;
        let cutoff = now_ms.saturating_sub(window_ms);
        // Timestamp plus random suffix, so two events in the same millisecond
        // remain distinct members.
        let member = format!("{}-{:08x}", now_ms, rand::random::<u32>());
        let expire_secs = (window_ms + 999) / 1000;

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Expire entries that have aged out of the window
            .cmd("ZREMRANGEBYSCORE")
            .arg(key.as_ref())
            .arg("-inf")
            .arg(format!("({cutoff}"))
            .ignore()
            // Count before adding the current event
            .cmd("ZCARD")
            .arg(key.as_ref())
            // Record the current event
            .cmd("ZADD")
            .arg(key.as_ref())
            .arg(now_ms)
            .arg(&member)
            .ignore()
            // Refresh the key's own expiry so abandoned keys self-clean
            .cmd("EXPIRE")
            .arg(key.as_ref())
            .arg(expire_secs)
            .ignore();

        let mut con = self.connection.clone();
        let (count_before,): (u64,) = pipe.query_async(&mut con).await?;

        let allow = count_before < input.max_requests;
        let output = CheckOutput {
            limit: input.max_requests,
            remaining: input.max_requests.saturating_sub(count_before + 1),
            reset: Instant::now() + input.window,
        };
        let token = RollbackToken {
            key: input.key,
            member: Some(member),
        };
        Ok((Decision::from_allowed(allow), output, token))
    }

    async fn rollback(&self, token: RollbackToken) -> Result<(), Self::Error> {
        let key = self.make_key(&token.key);
        let mut con = self.connection.clone();
        if let Some(member) = token.member {
            let () = con.zrem(key.as_ref(), member).await?;
        }
        Ok(())
    }

    /// Note that the key prefix (if set) is automatically included, you do not
    /// need to prepend it yourself.
    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        let key = self.make_key(key);
        let mut con = self.connection.clone();
        let () = con.del(key.as_ref()).await?;
        Ok(())
    }
}
