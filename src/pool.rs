//! Core proxy pool implementation.

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::health::{self, ErrorCode, HealthPolicy, ReleaseOutcome};
use crate::proxy::{self, AcquireRequest, AcquiredProxy, ProxyEntry, ProxyRecord};
use crate::utils;

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Configuration for the proxy pool.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// How outcomes move proxies in and out of cooldown and dead windows.
    pub health: HealthPolicy,
    /// Optional per-proxy request rate, enforced before each proxied send.
    pub max_requests_per_second: Option<f64>,
}

/// Counts describing the pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    /// Neither dead nor cooling, regardless of load.
    pub available: usize,
    /// Cooling down but not dead.
    pub cooling: usize,
    pub dead: usize,
    /// Sum of in-flight calls across all proxies.
    pub in_flight: usize,
}

/// Everything the pool lock guards.
#[derive(Debug)]
struct PoolState {
    records: Vec<ProxyRecord>,
    by_id: HashMap<String, usize>,
    /// Sticky key -> proxy id.
    sticky: HashMap<String, String>,
}

impl PoolState {
    fn sticky_hit(&self, key: &str, now: SystemTime, cap: usize) -> Option<usize> {
        let id = self.sticky.get(key)?;
        let index = *self.by_id.get(id)?;
        self.records[index].is_usable(now, cap).then_some(index)
    }

    /// Pick the least-loaded, longest-idle, most reliable usable proxy.
    /// When nothing is usable, fall back to the one that wakes up first.
    /// The flag is true when the fallback was taken.
    fn select(&self, now: SystemTime, cap: usize) -> (usize, bool) {
        let best = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_usable(now, cap))
            .min_by_key(|(_, r)| (r.in_flight, r.last_used_at, r.fail_streak))
            .map(|(i, _)| i);

        match best {
            Some(index) => (index, false),
            None => {
                let index = self
                    .records
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| r.wake_at())
                    .map_or(0, |(i, _)| i);
                (index, true)
            }
        }
    }
}

/// A pool of proxies with per-proxy health and sticky session affinity.
///
/// All runtime state sits behind one lock, so acquire and release are atomic
/// with respect to each other. Neither ever waits for a proxy to recover.
#[derive(Debug)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
}

impl ProxyPool {
    /// Create a pool with the default configuration and the system clock.
    pub fn new(entries: Vec<ProxyEntry>) -> Result<Self> {
        Self::with_config(entries, PoolConfig::default())
    }

    /// Create a pool with the given configuration and the system clock.
    pub fn with_config(entries: Vec<ProxyEntry>, config: PoolConfig) -> Result<Self> {
        Self::with_clock(entries, config, Arc::new(SystemClock))
    }

    /// Create a pool reading time from `clock`.
    pub fn with_clock(entries: Vec<ProxyEntry>, config: PoolConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::EmptyPool);
        }

        let quota = match config.max_requests_per_second {
            Some(rps) => Some(proxy::rate_quota(rps).ok_or(Error::InvalidRateLimit(rps))?),
            None => None,
        };

        let now = clock.now();
        let records: Vec<ProxyRecord> = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| ProxyRecord::new(entry, i, now, quota))
            .collect();
        let by_id = records.iter().enumerate().map(|(i, r)| (r.id.clone(), i)).collect();

        info!("Proxy pool initialized with {} proxies", records.len());

        Ok(Self {
            state: Mutex::new(PoolState {
                records,
                by_id,
                sticky: HashMap::new(),
            }),
            config,
            clock,
        })
    }

    /// Create a pool from JSON proxy lists at URLs or file paths.
    ///
    /// Sources that cannot be loaded are skipped; the pool fails only if no
    /// source yields any proxy.
    pub async fn from_sources(sources: &[String], config: PoolConfig) -> Result<Self> {
        info!("Initializing proxy pool from {} sources", sources.len());
        let entries = utils::load_entries_from_sources(sources).await;
        Self::with_config(entries, config)
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of proxies in the pool.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Always false: a pool cannot be built empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out a proxy for one attempt.
    ///
    /// Never blocks and always returns some proxy; when every proxy is dead,
    /// cooling or saturated, the one that recovers first is handed out anyway.
    /// The only failure is a chosen proxy with no port for the requested
    /// protocol, in which case no state is changed.
    pub fn acquire(&self, request: &AcquireRequest) -> Result<AcquiredProxy> {
        let now = self.clock.now();
        let cap = request.max_in_flight_per_proxy;
        let mut state = self.state.lock();

        let sticky = request
            .sticky_key
            .as_deref()
            .and_then(|key| state.sticky_hit(key, now, cap));

        let index = match sticky {
            Some(index) => index,
            None => {
                let (index, degraded) = state.select(now, cap);
                if degraded {
                    debug!(
                        "No usable proxy, handing out {} which wakes up first",
                        state.records[index].id
                    );
                }
                index
            }
        };

        let record = &mut state.records[index];
        let acquired = record.to_acquired(request.protocol, request.sticky_key.clone())?;
        record.in_flight += 1;
        record.last_used_at = now;

        if sticky.is_none() {
            if let Some(key) = &request.sticky_key {
                state.sticky.insert(key.clone(), acquired.id.clone());
            }
        }

        Ok(acquired)
    }

    /// Report the outcome of an attempt made through proxy `id`.
    pub fn release(&self, id: &str, outcome: ReleaseOutcome) {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let Some(&index) = state.by_id.get(id) else {
            warn!("Release for unknown proxy {}", id);
            return;
        };

        let record = &mut state.records[index];
        let was_dead = record.is_dead(now);
        let category = health::apply_outcome(record, &outcome, now, &self.config.health);

        if let Some(category) = category {
            if !was_dead && record.is_dead(now) {
                warn!(
                    "Proxy {} marked dead for {:?} after {} consecutive failures (last: {:?})",
                    record.id,
                    record.dead_until.duration_since(now).unwrap_or(Duration::ZERO),
                    record.fail_streak,
                    category
                );
            } else {
                debug!("Proxy {} failed with {:?} (streak {})", record.id, category, record.fail_streak);
            }
        }
    }

    /// Acquire a proxy wrapped in a guard that releases it on drop.
    pub fn lease(&self, request: &AcquireRequest) -> Result<ProxyLease<'_>> {
        let proxy = self.acquire(request)?;
        Ok(ProxyLease {
            pool: self,
            proxy,
            started: Instant::now(),
            released: false,
        })
    }

    /// Forget the proxy bound to a sticky key.
    pub fn clear_sticky(&self, key: &str) {
        self.state.lock().sticky.remove(key);
    }

    /// The proxy id currently bound to a sticky key.
    pub fn sticky_binding(&self, key: &str) -> Option<String> {
        self.state.lock().sticky.get(key).cloned()
    }

    /// Get statistics about the proxy pool.
    pub fn stats(&self) -> PoolStats {
        let now = self.clock.now();
        let state = self.state.lock();

        let mut stats = PoolStats {
            total: state.records.len(),
            ..PoolStats::default()
        };
        for record in &state.records {
            stats.in_flight += record.in_flight;
            if record.is_dead(now) {
                stats.dead += 1;
            } else if record.is_cooling(now) {
                stats.cooling += 1;
            } else {
                stats.available += 1;
            }
        }
        stats
    }

    /// Copies of every record, in input order.
    pub fn snapshot(&self) -> Vec<ProxyRecord> {
        self.state.lock().records.clone()
    }

    /// Copy of one record.
    pub fn record(&self, id: &str) -> Option<ProxyRecord> {
        let state = self.state.lock();
        state.by_id.get(id).map(|&i| state.records[i].clone())
    }
}

/// A proxy held for one attempt.
///
/// Dropping a lease without calling [`release`](ProxyLease::release) reports
/// the attempt as cancelled, so an abandoned call never leaks `in_flight`.
#[derive(Debug)]
pub struct ProxyLease<'a> {
    pool: &'a ProxyPool,
    proxy: AcquiredProxy,
    started: Instant,
    released: bool,
}

impl ProxyLease<'_> {
    /// The acquired proxy.
    pub fn proxy(&self) -> &AcquiredProxy {
        &self.proxy
    }

    /// Time since the proxy was acquired, or since [`mark_issued`](ProxyLease::mark_issued).
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Restart the timer when the request actually goes out.
    pub fn mark_issued(&mut self) {
        self.started = Instant::now();
    }

    /// Release with an explicit outcome.
    pub fn release(mut self, outcome: ReleaseOutcome) {
        self.released = true;
        self.pool.release(&self.proxy.id, outcome);
    }
}

impl Drop for ProxyLease<'_> {
    fn drop(&mut self) {
        if !self.released {
            debug!("Lease on {} dropped before release", self.proxy.id);
            self.pool
                .release(&self.proxy.id, ReleaseOutcome::code_failure(ErrorCode::Cancelled, self.elapsed()));
        }
    }
}
