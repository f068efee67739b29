use crate::store::{CheckInput, CheckOutput, CounterStore, Decision, RollbackToken};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A fixed-window [CounterStore] that keeps its buckets in a
/// [Dashmap](dashmap::DashMap), for single-process deployments.
///
/// One bucket exists per key at a time. A bucket whose reset time has passed
/// is replaced in place the next time its key is checked; buckets for keys
/// that are never checked again are reaped by the garbage collector.
#[derive(Clone)]
pub struct MemoryStore {
    map: Arc<DashMap<String, Bucket>>,
    gc_handle: Option<Arc<JoinHandle<()>>>,
}

struct Bucket {
    reset: Instant,
    count: u64,
}

impl MemoryStore {
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    fn garbage_collector(map: Arc<DashMap<String, Bucket>>, interval: Duration) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                map.retain(|_k, v| v.reset > now);
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

impl CounterStore for MemoryStore {
    type Error = Infallible;

    async fn record(
        &self,
        input: CheckInput,
    ) -> Result<(Decision, CheckOutput, RollbackToken), Self::Error> {
        let now = Instant::now();
        let mut count = 1;
        let mut reset = now
            .checked_add(input.window)
            .expect("window unexpectedly large");
        self.map
            .entry(input.key.clone())
            .and_modify(|v| {
                // If this bucket hasn't yet expired, increment and extract the count/reset
                if v.reset > now {
                    v.count += 1;
                    count = v.count;
                    reset = v.reset;
                } else {
                    // If this bucket has expired we will reset the count to 1 and set a new reset time.
                    v.reset = reset;
                    v.count = count;
                }
            })
            .or_insert_with(|| Bucket {
                // If the bucket doesn't exist, create it with a count of 1, and set the reset time.
                reset,
                count,
            });
        let allow = count <= input.max_requests;
        let output = CheckOutput {
            limit: input.max_requests,
            remaining: input.max_requests.saturating_sub(count),
            reset,
        };
        let token = RollbackToken {
            key: input.key,
            member: None,
        };
        Ok((Decision::from_allowed(allow), output, token))
    }

    async fn rollback(&self, token: RollbackToken) -> Result<(), Self::Error> {
        self.map.entry(token.key).and_modify(|v| {
            v.count = v.count.saturating_sub(1);
        });
        Ok(())
    }

    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.map.remove(key);
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = &self.gc_handle {
            handle.abort();
        }
    }
}

pub struct MemoryStoreBuilder {
    gc_interval: Option<Duration>,
}

impl MemoryStoreBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing
    /// expired buckets.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> MemoryStore {
        let map = Arc::new(DashMap::<String, Bucket>::new());
        let gc_handle = self
            .gc_interval
            .map(|gc_interval| Arc::new(MemoryStore::garbage_collector(map.clone(), gc_interval)));
        MemoryStore { map, gc_handle }
    }
}
