use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::debug;

use carebridge_core::{Error, Result};

/// Connection limits and deadlines for a client pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Total cap across all sources.
    pub max_connections: usize,
    /// Idle keepalive cap per source.
    pub max_keepalive_connections: usize,
    /// Idle connections older than this are discarded on next acquisition.
    pub keepalive_expiry: Duration,
    /// Deadline for a single outbound call.
    pub request_timeout: Duration,
    /// How long a caller may wait for a free connection slot.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            max_keepalive_connections: 10,
            keepalive_expiry: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Point-in-time pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub sources: Vec<String>,
    pub total_connections: usize,
    pub in_use: usize,
    pub keepalive_connections_per_source: HashMap<String, usize>,
}

#[derive(Default)]
struct Ledger {
    idle: VecDeque<Instant>,
}

struct PoolInner {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    ledgers: DashMap<String, Ledger>,
    in_use: AtomicUsize,
}

/// Bounded connection accounting shared by every source in a client pool.
///
/// The total cap is enforced by a FIFO semaphore, so waiting callers are
/// served in arrival order and no source can be starved. Transport reuse
/// itself is delegated to the per-source HTTP client; the ledger tracks
/// keepalive entries so idle expiry and the snapshot stay observable.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections));
        Self {
            inner: Arc::new(PoolInner {
                config,
                permits,
                ledgers: DashMap::new(),
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Make a source known to the pool so it appears in status snapshots.
    pub fn register_source(&self, name: impl Into<String>) {
        self.inner.ledgers.entry(name.into()).or_default();
    }

    pub fn remove_source(&self, name: &str) {
        self.inner.ledgers.remove(name);
    }

    /// Acquire a connection slot for `source`, blocking until one frees or
    /// the acquire deadline elapses.
    pub async fn acquire(&self, source: &str) -> Result<ConnectionPermit> {
        let permit = match tokio::time::timeout(
            self.inner.config.acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(Error::cancelled("connection pool is closed")),
            Err(_elapsed) => {
                return Err(Error::request_timeout(format!(
                    "no connection available for source '{source}' within {:?}",
                    self.inner.config.acquire_timeout
                )));
            }
        };

        let reused = self.take_idle(source);
        if !reused {
            self.make_room_for_fresh_connection();
        }
        self.inner.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(ConnectionPermit {
            pool: self.inner.clone(),
            source: source.to_string(),
            reusable: false,
            _permit: permit,
        })
    }

    /// Pop a keepalive entry for `source`, discarding expired ones first.
    fn take_idle(&self, source: &str) -> bool {
        let mut ledger = self.inner.ledgers.entry(source.to_string()).or_default();
        let expiry = self.inner.config.keepalive_expiry;
        let now = Instant::now();
        while let Some(last_used) = ledger.idle.front() {
            if now.duration_since(*last_used) > expiry {
                ledger.idle.pop_front();
                debug!(source, "Discarded expired keepalive connection");
            } else {
                break;
            }
        }
        ledger.idle.pop_front().is_some()
    }

    /// Evict oldest idle entries (any source) so a fresh connection keeps
    /// the total open count within the cap.
    fn make_room_for_fresh_connection(&self) {
        let cap = self.inner.config.max_connections;
        loop {
            let open = self.inner.in_use.load(Ordering::SeqCst) + self.idle_total() + 1;
            if open <= cap {
                return;
            }
            let oldest = self
                .inner
                .ledgers
                .iter()
                .filter_map(|entry| entry.value().idle.front().map(|t| (entry.key().clone(), *t)))
                .min_by_key(|(_, t)| *t);
            match oldest {
                Some((name, _)) => {
                    if let Some(mut ledger) = self.inner.ledgers.get_mut(&name) {
                        ledger.idle.pop_front();
                    }
                }
                None => return,
            }
        }
    }

    fn idle_total(&self) -> usize {
        self.inner
            .ledgers
            .iter()
            .map(|entry| entry.value().idle.len())
            .sum()
    }

    pub fn status(&self) -> PoolStatus {
        let mut sources: Vec<String> = self
            .inner
            .ledgers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        sources.sort();

        let keepalive: HashMap<String, usize> = self
            .inner
            .ledgers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().idle.len()))
            .collect();

        let in_use = self.inner.in_use.load(Ordering::SeqCst);
        PoolStatus {
            sources,
            total_connections: in_use + self.idle_total(),
            in_use,
            keepalive_connections_per_source: keepalive,
        }
    }

    /// Close the pool: drop keepalive entries and fail further acquires.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.ledgers.clear();
    }

    /// Slots currently available without waiting; test hook.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Whether an acquire would currently block; test hook.
    pub fn would_block(&self) -> bool {
        matches!(
            self.inner.permits.clone().try_acquire_owned(),
            Err(TryAcquireError::NoPermits)
        )
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("ConnectionPool")
            .field("in_use", &status.in_use)
            .field("total_connections", &status.total_connections)
            .finish_non_exhaustive()
    }
}

/// Holds one connection slot; releasing it returns the slot to the pool.
///
/// A permit starts out non-reusable: only when the caller marks the
/// transport healthy (`keep()`) does release record a keepalive entry.
/// Cancelled or failed transports are simply discarded.
pub struct ConnectionPermit {
    pool: Arc<PoolInner>,
    source: String,
    reusable: bool,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl ConnectionPermit {
    /// Mark the underlying transport healthy for keepalive reuse.
    pub fn keep(&mut self) {
        self.reusable = true;
    }

    /// Explicitly discard the transport (cancellation, protocol error).
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.reusable {
            let mut ledger = self.pool.ledgers.entry(self.source.clone()).or_default();
            if ledger.idle.len() < self.pool.config.max_keepalive_connections {
                ledger.idle.push_back(Instant::now());
            }
        }
    }
}
