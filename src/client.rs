use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::pool::{Attempt, ConnectionPool, Origin, PoolConfig, PooledConnection, Scheme};
use crate::request::{Method, Request};
use crate::response::Response;
use crate::types::Headers;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

/// Trip-wire against hammering an origin that keeps failing. Closed passes
/// everything through; too many consecutive failures opens it for a cooldown,
/// after which a single probe may close it again.
#[derive(Debug)]
pub struct Breaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

impl Breaker {
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Whether a request may proceed right now.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("breaker lock");
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record(&self, success: bool) {
        let mut state = self.state.lock().expect("breaker lock");
        *state = match (*state, success) {
            (_, true) => BreakerState::Closed { failures: 0 },
            (BreakerState::Closed { failures }, false) => {
                if failures + 1 >= self.failure_threshold {
                    warn!("circuit breaker opened after {} failures", failures + 1);
                    BreakerState::Open {
                        since: Instant::now(),
                    }
                } else {
                    BreakerState::Closed {
                        failures: failures + 1,
                    }
                }
            }
            (BreakerState::HalfOpen, false) => BreakerState::Open {
                since: Instant::now(),
            },
            (open @ BreakerState::Open { .. }, false) => open,
        };
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub connection_pool_size: u32,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Local ceiling on streams per connection; the peer's setting may lower
    /// it further.
    pub max_concurrent_streams_per_conn: u32,
    /// Speak HTTP/2 on cleartext origins without negotiation.
    pub h2_prior_knowledge: bool,
    pub verify_tls: bool,
    pub circuit_breaker: Option<Arc<Breaker>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_pool_size: 10,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_concurrent_streams_per_conn: crate::settings::DEFAULT_MAX_CONCURRENT_STREAMS,
            h2_prior_knowledge: false,
            verify_tls: true,
            circuit_breaker: None,
        }
    }
}

pub struct Client {
    config: Config,
    pool: Arc<ConnectionPool>,
}

impl Client {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let pool = ConnectionPool::new(PoolConfig {
            max_connections: config.connection_pool_size as usize,
            connect_timeout: config.connect_timeout,
            verify_tls: config.verify_tls,
            h2_prior_knowledge: config.h2_prior_knowledge,
            connection: ConnectionConfig {
                max_concurrent_streams: config.max_concurrent_streams_per_conn,
                ..ConnectionConfig::default()
            },
        });
        Self {
            config,
            pool: Arc::new(pool),
        }
    }

    pub async fn get(&self, url: impl AsRef<str>, headers: Option<Headers>) -> Result<Response> {
        self.request(Request::get(parse_url(url)?, headers)).await
    }

    pub async fn post(
        &self,
        url: impl AsRef<str>,
        headers: Option<Headers>,
        body: impl Into<Bytes>,
    ) -> Result<Response> {
        self.request(Request::post(parse_url(url)?, headers, body))
            .await
    }

    pub async fn put(
        &self,
        url: impl AsRef<str>,
        headers: Option<Headers>,
        body: impl Into<Bytes>,
    ) -> Result<Response> {
        self.request(Request::new(Method::Put, parse_url(url)?, headers, body))
            .await
    }

    pub async fn delete(&self, url: impl AsRef<str>, headers: Option<Headers>) -> Result<Response> {
        self.request(Request::new(
            Method::Delete,
            parse_url(url)?,
            headers,
            Bytes::new(),
        ))
        .await
    }

    pub async fn head(&self, url: impl AsRef<str>, headers: Option<Headers>) -> Result<Response> {
        self.request(Request::new(
            Method::Head,
            parse_url(url)?,
            headers,
            Bytes::new(),
        ))
        .await
    }

    pub async fn options(
        &self,
        url: impl AsRef<str>,
        headers: Option<Headers>,
    ) -> Result<Response> {
        self.request(Request::new(
            Method::Options,
            parse_url(url)?,
            headers,
            Bytes::new(),
        ))
        .await
    }

    pub async fn patch(
        &self,
        url: impl AsRef<str>,
        headers: Option<Headers>,
        body: impl Into<Bytes>,
    ) -> Result<Response> {
        self.request(Request::new(Method::Patch, parse_url(url)?, headers, body))
            .await
    }

    /// Run one request through the pool, retrying once on a fresh connection
    /// when the failure is retryable and the method idempotent.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let origin = origin_of(&request.url)?;
        if let Some(breaker) = &self.config.circuit_breaker {
            if !breaker.allow() {
                return Err(Error::CircuitOpen);
            }
        }

        let mut result = self.attempt(&origin, &request).await;
        if let Err(err) = &result {
            if err.is_retryable() && request.method.is_idempotent() {
                debug!(
                    "retrying {} {} on a fresh connection after {err}",
                    request.method, request.url
                );
                result = self.attempt(&origin, &request).await;
            }
        }
        if let Some(breaker) = &self.config.circuit_breaker {
            breaker.record(result.is_ok());
        }
        result
    }

    async fn attempt(&self, origin: &Origin, request: &Request) -> Result<Response> {
        let lease = self.pool.acquire(origin).await?;
        let attempt = Attempt::new(lease);
        trace!(
            "{} {} via {}",
            request.method,
            request.url,
            attempt.lease.conn.protocol()
        );

        let work = async {
            match attempt.lease.conn.as_ref() {
                PooledConnection::H2(conn) => {
                    conn.send_request(
                        request.headers.clone(),
                        request.body.clone(),
                        request.priority,
                    )
                    .await
                }
                PooledConnection::H1(conn) => {
                    conn.send_request(&request.headers, &request.body).await
                }
            }
        };
        let result = match tokio::time::timeout(self.config.request_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.request_timeout)),
        };
        attempt.finish(&self.pool, &result).await;
        result
    }

    /// Open a connection to `url`'s origin ahead of the first request.
    pub fn warmup(&self, url: impl AsRef<str>) -> Result<()> {
        let origin = origin_of(&parse_url(url)?)?;
        self.pool.warmup(origin);
        Ok(())
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close_all().await;
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

fn parse_url(url: impl AsRef<str>) -> Result<Url> {
    Url::parse(url.as_ref()).map_err(|err| Error::InvalidRequest(format!("URL: {err}")))
}

fn origin_of(url: &Url) -> Result<Origin> {
    let scheme = match url.scheme() {
        "https" => Scheme::Https,
        "http" => Scheme::Http,
        other => {
            return Err(Error::InvalidRequest(format!(
                "unsupported scheme {other:?}"
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidRequest("URL has no host".to_owned()))?
        .to_owned();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidRequest("URL has no port".to_owned()))?;
    Ok(Origin { scheme, host, port })
}
