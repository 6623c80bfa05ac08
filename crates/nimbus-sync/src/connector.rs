//! # Redis Connector
//!
//! One lazily established [`ConnectionManager`] shared by the cache tier,
//! the tracker and the bus publisher.
//!
//! ```text
//! call ──► connected? ──yes──► clone manager (reconnects on its own)
//!              │ no
//!              ▼
//!        retry window open? ──no──► error, caller falls back
//!              │ yes
//!              ▼
//!        ConnectionManager::new ──ok──► keep it, reset backoff
//!                                └─err─► widen retry window (backoff)
//! ```
//!
//! A server that boots while Redis is down keeps running on its fallbacks
//! and picks Redis up on the first call after it comes back.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, RedisResult};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};

/// Upper bound on one connection attempt, including the manager's own
/// internal retries.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Spacing of connection attempts while Redis is unreachable.
#[derive(Debug)]
struct RetryGate {
    backoff: ExponentialBackoff,
    next_attempt: Option<Instant>,
}

impl RetryGate {
    fn new() -> Self {
        RetryGate {
            backoff: Self::create_backoff(),
            next_attempt: None,
        }
    }

    fn create_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    fn is_open(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    fn failed(&mut self, now: Instant) -> Duration {
        let wait = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);
        self.next_attempt = Some(now + wait);
        wait
    }
}

/// Cheap to clone; every clone shares the same connection.
#[derive(Clone)]
pub struct RedisConnector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    gate: Mutex<RetryGate>,
}

impl RedisConnector {
    /// Parses `url` without connecting.
    pub fn open(url: &str) -> SyncResult<Self> {
        let client = redis::Client::open(url).map_err(|e| SyncError::InvalidUrl(e.to_string()))?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: redis::Client) -> Self {
        RedisConnector {
            inner: Arc::new(ConnectorInner {
                client,
                conn: OnceCell::new(),
                gate: Mutex::new(RetryGate::new()),
            }),
        }
    }

    pub fn client(&self) -> &redis::Client {
        &self.inner.client
    }

    pub fn is_connected(&self) -> bool {
        self.inner.conn.initialized()
    }

    /// Returns the shared connection, connecting first if needed.
    ///
    /// While Redis is unreachable, attempts are spaced by exponential
    /// backoff. Calls in between, and calls made while another caller is
    /// attempting, fail at once without touching the network.
    pub async fn connection(&self) -> RedisResult<ConnectionManager> {
        if let Some(conn) = self.inner.conn.get() {
            return Ok(conn.clone());
        }

        let Ok(mut gate) = self.inner.gate.try_lock() else {
            return Err(not_connected("redis connection attempt in progress"));
        };
        if let Some(conn) = self.inner.conn.get() {
            return Ok(conn.clone());
        }
        if !gate.is_open(Instant::now()) {
            return Err(not_connected(
                "redis unreachable, waiting before next connection attempt",
            ));
        }

        let attempt = tokio::time::timeout(
            CONNECT_TIMEOUT,
            ConnectionManager::new(self.inner.client.clone()),
        )
        .await
        .unwrap_or_else(|_| Err(not_connected("redis connection attempt timed out")));

        match attempt {
            Ok(conn) => {
                info!("Connected to Redis");
                gate.backoff.reset();
                gate.next_attempt = None;
                let _ = self.inner.conn.set(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                let wait = gate.failed(Instant::now());
                warn!(error = %e, retry_in = ?wait, "Redis connection attempt failed");
                Err(e)
            }
        }
    }
}

fn not_connected(message: &'static str) -> RedisError {
    RedisError::from((ErrorKind::IoError, message))
}
