//! Per-origin connection pool. Entries are scored on error rate, latency and
//! freshness; the worst entry is evicted when the pool is full, and ALPN
//! outcomes are cached per origin so repeat connections skip the probing
//! decision.

use crate::buffer::BufferPool;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::Result;
use crate::http1::Http1Connection;
use crate::socket::{self, BoxedTransport, Transport};
use crate::types::Protocol;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Entry scores below this are not worth keeping.
const MIN_USABLE_SCORE: f64 = 30.0;
const MAX_CONNECTION_AGE: Duration = Duration::from_secs(60 * 60);
const MAX_IDLE: Duration = Duration::from_secs(5 * 60);
const ALPN_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// (scheme, host, port) a connection is good for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Https,
    Http,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.scheme {
            Scheme::Https => "https",
            Scheme::Http => "http",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// A live connection of either protocol.
pub enum PooledConnection {
    H2(Connection),
    H1(Http1Connection),
}

impl PooledConnection {
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self {
            PooledConnection::H2(_) => Protocol::Http2,
            PooledConnection::H1(_) => Protocol::Http11,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            PooledConnection::H2(conn) => conn.is_closed(),
            PooledConnection::H1(conn) => conn.is_closed(),
        }
    }

    fn age(&self) -> Duration {
        match self {
            PooledConnection::H2(conn) => conn.age(),
            PooledConnection::H1(conn) => conn.age(),
        }
    }

    fn idle_time(&self) -> Duration {
        match self {
            PooledConnection::H2(conn) => conn.idle_time(),
            PooledConnection::H1(conn) => conn.idle_time(),
        }
    }

    fn has_stream_capacity(&self) -> bool {
        match self {
            PooledConnection::H2(conn) => conn.has_stream_capacity(),
            // serial, but queueing on the lock is fine
            PooledConnection::H1(_) => true,
        }
    }

    #[must_use]
    pub fn active_streams(&self) -> usize {
        match self {
            PooledConnection::H2(conn) => conn.active_streams(),
            PooledConnection::H1(_) => 0,
        }
    }
}

/// Per-entry statistics; all writes happen on release.
#[derive(Debug)]
struct EntryStats {
    requests: u64,
    errors: u64,
    avg_latency_ms: f64,
    last_used: Instant,
}

struct PoolEntry {
    id: u64,
    conn: Arc<PooledConnection>,
    stats: std::sync::Mutex<EntryStats>,
}

impl PoolEntry {
    fn new(id: u64, conn: Arc<PooledConnection>) -> Self {
        Self {
            id,
            conn,
            stats: std::sync::Mutex::new(EntryStats {
                requests: 0,
                errors: 0,
                avg_latency_ms: 0.0,
                last_used: Instant::now(),
            }),
        }
    }

    /// Health score: base 100, down with error rate and latency, up with
    /// recency of use.
    fn score(&self) -> f64 {
        let stats = self.stats.lock().expect("entry stats lock");
        let mut score = 100.0;
        if stats.requests > 0 {
            score -= 50.0 * (stats.errors as f64 / stats.requests as f64).min(1.0);
        }
        score -= (stats.avg_latency_ms / 100.0).min(30.0);
        let idle_minutes = stats.last_used.elapsed().as_secs_f64() / 60.0;
        score += (20.0 - idle_minutes).max(0.0);
        score
    }

    fn is_usable(&self) -> bool {
        !self.is_expired() && self.conn.has_stream_capacity()
    }

    /// Expired entries are dropped from the pool entirely; a connection that
    /// is merely out of stream capacity is kept.
    fn is_expired(&self) -> bool {
        self.conn.is_closed()
            || self.conn.age() > MAX_CONNECTION_AGE
            || self.idle_time() > MAX_IDLE
            || self.score() < MIN_USABLE_SCORE
    }

    fn idle_time(&self) -> Duration {
        let by_stats = self
            .stats
            .lock()
            .expect("entry stats lock")
            .last_used
            .elapsed();
        by_stats.min(self.conn.idle_time())
    }

    fn record(&self, success: bool, latency: Duration) {
        let mut stats = self.stats.lock().expect("entry stats lock");
        stats.requests += 1;
        if !success {
            stats.errors += 1;
        }
        let latency_ms = latency.as_secs_f64() * 1000.0;
        stats.avg_latency_ms = if stats.requests == 1 {
            latency_ms
        } else {
            // exponential moving average, light on recent noise
            stats.avg_latency_ms * 0.8 + latency_ms * 0.2
        };
        stats.last_used = Instant::now();
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub verify_tls: bool,
    /// Speak HTTP/2 on cleartext origins without negotiation.
    pub h2_prior_knowledge: bool,
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
            verify_tls: true,
            h2_prior_knowledge: false,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Handle returned by `acquire`; pass it back to `release` with the outcome.
pub struct Lease {
    pub conn: Arc<PooledConnection>,
    origin: Origin,
    entry_id: u64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    tls_config: Arc<rustls::ClientConfig>,
    buffers: Arc<BufferPool>,
    entries: Mutex<HashMap<Origin, Vec<PoolEntry>>>,
    alpn_cache: std::sync::Mutex<HashMap<Origin, (Protocol, Instant)>>,
    next_entry_id: AtomicU64,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let tls_config = socket::tls_config(config.verify_tls);
        Self {
            config,
            tls_config,
            buffers: Arc::new(BufferPool::default()),
            entries: Mutex::new(HashMap::new()),
            alpn_cache: std::sync::Mutex::new(HashMap::new()),
            next_entry_id: AtomicU64::new(1),
        }
    }

    /// Cached ALPN outcome for an origin, if fresh.
    #[must_use]
    pub fn cached_protocol(&self, origin: &Origin) -> Option<Protocol> {
        let cache = self.alpn_cache.lock().expect("alpn cache lock");
        cache.get(origin).and_then(|(protocol, at)| {
            (at.elapsed() < ALPN_CACHE_TTL).then_some(*protocol)
        })
    }

    fn cache_protocol(&self, origin: &Origin, protocol: Protocol) {
        self.alpn_cache
            .lock()
            .expect("alpn cache lock")
            .insert(origin.clone(), (protocol, Instant::now()));
    }

    /// Best healthy connection for the origin, opening one if needed.
    pub async fn acquire(&self, origin: &Origin) -> Result<Lease> {
        {
            let mut entries = self.entries.lock().await;
            let slot = entries.entry(origin.clone()).or_default();
            slot.retain(|entry| {
                let keep = !entry.is_expired();
                if !keep {
                    trace!("dropping expired connection {} to {origin}", entry.id);
                    if let PooledConnection::H2(conn) = entry.conn.as_ref() {
                        conn.close();
                    }
                }
                keep
            });
            let best = slot
                .iter()
                .filter(|entry| entry.is_usable())
                .max_by(|a, b| a.score().total_cmp(&b.score()));
            if let Some(entry) = best {
                trace!(
                    "reusing connection {} to {origin} (score {:.1})",
                    entry.id,
                    entry.score()
                );
                return Ok(Lease {
                    conn: entry.conn.clone(),
                    origin: origin.clone(),
                    entry_id: entry.id,
                });
            }
        }

        // nothing usable: open a fresh connection outside the pool lock
        let conn = Arc::new(self.open(origin).await?);
        let id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().await;
        let total: usize = entries.values().map(Vec::len).sum();
        if total >= self.config.max_connections {
            self.evict_worst(&mut entries);
        }
        entries
            .entry(origin.clone())
            .or_default()
            .push(PoolEntry::new(id, conn.clone()));
        info!("opened {} connection {id} to {origin}", conn.protocol());
        Ok(Lease {
            conn,
            origin: origin.clone(),
            entry_id: id,
        })
    }

    /// Update entry statistics after a finished request.
    pub async fn release(&self, lease: Lease, success: bool, latency: Duration) {
        let entries = self.entries.lock().await;
        if let Some(slot) = entries.get(&lease.origin) {
            if let Some(entry) = slot.iter().find(|entry| entry.id == lease.entry_id) {
                entry.record(success, latency);
                trace!(
                    "release {} success={success} latency={latency:?} score {:.1}",
                    lease.entry_id,
                    entry.score()
                );
            }
        }
    }

    /// Open a connection in the background so the next `acquire` finds it
    /// warm.
    pub fn warmup(self: &Arc<Self>, origin: Origin) {
        let pool = self.clone();
        tokio::spawn(async move {
            match pool.acquire(&origin).await {
                Ok(_) => debug!("warmed up {origin}"),
                Err(err) => warn!("warmup of {origin} failed: {err}"),
            }
        });
    }

    /// Drop every expired entry across all origins. `acquire` sweeps its own
    /// origin; this is for callers that want idle/age limits enforced
    /// eagerly.
    pub async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        for (origin, slot) in entries.iter_mut() {
            slot.retain(|entry| {
                let keep = !entry.is_expired();
                if !keep {
                    debug!("sweeping expired connection {} to {origin}", entry.id);
                    if let PooledConnection::H2(conn) = entry.conn.as_ref() {
                        conn.close();
                    }
                }
                keep
            });
        }
        entries.retain(|_, slot| !slot.is_empty());
    }

    /// Close every pooled connection.
    pub async fn close_all(&self) {
        let mut entries = self.entries.lock().await;
        for (origin, slot) in entries.drain() {
            for entry in slot {
                debug!("closing connection {} to {origin}", entry.id);
                if let PooledConnection::H2(conn) = entry.conn.as_ref() {
                    conn.close();
                }
            }
        }
    }

    #[must_use]
    pub async fn size(&self) -> usize {
        self.entries.lock().await.values().map(Vec::len).sum()
    }

    fn evict_worst(&self, entries: &mut HashMap<Origin, Vec<PoolEntry>>) {
        let worst = entries
            .iter()
            .flat_map(|(origin, slot)| {
                slot.iter()
                    .map(move |entry| (origin.clone(), entry.id, entry.score()))
            })
            .min_by(|a, b| a.2.total_cmp(&b.2));
        if let Some((origin, id, score)) = worst {
            debug!("evicting connection {id} to {origin} (score {score:.1})");
            if let Some(slot) = entries.get_mut(&origin) {
                if let Some(index) = slot.iter().position(|entry| entry.id == id) {
                    let entry = slot.remove(index);
                    if let PooledConnection::H2(conn) = entry.conn.as_ref() {
                        conn.close();
                    }
                }
            }
        }
    }

    /// Dial the origin and wrap the negotiated protocol in an engine.
    async fn open(&self, origin: &Origin) -> Result<PooledConnection> {
        match origin.scheme {
            Scheme::Https => {
                let tls = socket::connect_tls(
                    &origin.host,
                    origin.port,
                    self.tls_config.clone(),
                    self.config.connect_timeout,
                )
                .await?;
                let alpn = tls.alpn_protocol();
                let transport: BoxedTransport = Box::new(tls);
                match alpn {
                    Some(Protocol::Http2) => {
                        self.cache_protocol(origin, Protocol::Http2);
                        let conn = Connection::handshake(
                            transport,
                            self.config.connection.clone(),
                            self.buffers.clone(),
                        )
                        .await?;
                        Ok(PooledConnection::H2(conn))
                    }
                    _ => {
                        // http/1.1 or no ALPN answer: fall back
                        self.cache_protocol(origin, Protocol::Http11);
                        Ok(PooledConnection::H1(Http1Connection::new(transport)))
                    }
                }
            }
            Scheme::Http => {
                let tcp = socket::connect_tcp(
                    &origin.host,
                    origin.port,
                    self.config.connect_timeout,
                )
                .await?;
                let transport: BoxedTransport = Box::new(tcp);
                if self.config.h2_prior_knowledge {
                    self.cache_protocol(origin, Protocol::Http2);
                    let conn = Connection::handshake(
                        transport,
                        self.config.connection.clone(),
                        self.buffers.clone(),
                    )
                    .await?;
                    Ok(PooledConnection::H2(conn))
                } else {
                    // no h2c upgrade: cleartext means HTTP/1.1
                    self.cache_protocol(origin, Protocol::Http11);
                    Ok(PooledConnection::H1(Http1Connection::new(transport)))
                }
            }
        }
    }

    /// Test/seeding hook: insert an already-established connection.
    pub async fn insert(&self, origin: Origin, conn: PooledConnection) -> Arc<PooledConnection> {
        let conn = Arc::new(conn);
        let id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().await;
        let total: usize = entries.values().map(Vec::len).sum();
        if total >= self.config.max_connections {
            self.evict_worst(&mut entries);
        }
        entries
            .entry(origin)
            .or_default()
            .push(PoolEntry::new(id, conn.clone()));
        conn
    }

    #[must_use]
    pub fn buffers(&self) -> Arc<BufferPool> {
        self.buffers.clone()
    }

    #[must_use]
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.config.connection
    }
}

/// `acquire` + run + `release` bookkeeping around one request attempt.
pub struct Attempt {
    pub lease: Lease,
    started: Instant,
}

impl Attempt {
    #[must_use]
    pub fn new(lease: Lease) -> Self {
        Self {
            lease,
            started: Instant::now(),
        }
    }

    pub async fn finish(self, pool: &ConnectionPool, result: &Result<crate::response::Response>) {
        let latency = self.started.elapsed();
        pool.release(self.lease, result.is_ok(), latency).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::InMemory;

    fn pipe_conn() -> PooledConnection {
        let (client_io, _server_io) = InMemory::pair(None, 1024);
        PooledConnection::H1(Http1Connection::new(Box::new(client_io)))
    }

    fn origin(port: u16) -> Origin {
        Origin {
            scheme: Scheme::Http,
            host: "origin.test".to_owned(),
            port,
        }
    }

    #[test]
    fn score_reflects_errors_latency_and_recency() {
        let entry = PoolEntry::new(1, Arc::new(pipe_conn()));
        // untouched: base 100 plus the full recency bonus
        assert!((entry.score() - 120.0).abs() < 0.5);

        for _ in 0..5 {
            entry.record(true, Duration::from_millis(100));
        }
        for _ in 0..5 {
            entry.record(false, Duration::from_millis(100));
        }
        // half the requests failed (-25), 100ms average (-1), just used (+20)
        assert!((entry.score() - 94.0).abs() < 0.5);
    }

    #[test]
    fn latency_penalty_is_capped() {
        let entry = PoolEntry::new(1, Arc::new(pipe_conn()));
        for _ in 0..10 {
            entry.record(true, Duration::from_secs(60));
        }
        // -min(30, 60000/100) = -30, plus recency
        assert!((entry.score() - 90.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn eviction_removes_the_lowest_scored_entry() {
        let pool = ConnectionPool::new(PoolConfig {
            max_connections: 2,
            ..PoolConfig::default()
        });
        pool.insert(origin(1), pipe_conn()).await;
        pool.insert(origin(2), pipe_conn()).await;

        // degrade the second entry
        {
            let entries = pool.entries.lock().await;
            let entry = &entries.get(&origin(2)).unwrap()[0];
            for _ in 0..10 {
                entry.record(false, Duration::from_secs(10));
            }
        }

        pool.insert(origin(3), pipe_conn()).await;

        let entries = pool.entries.lock().await;
        assert_eq!(entries.get(&origin(1)).map(Vec::len), Some(1));
        assert_eq!(
            entries.get(&origin(2)).map(Vec::len).unwrap_or(0),
            0,
            "the degraded entry must be the one evicted"
        );
        assert_eq!(entries.get(&origin(3)).map(Vec::len), Some(1));
    }
}
