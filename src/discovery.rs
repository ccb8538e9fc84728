//! Port discovery for hostnames without a route
//!
//! When a request for an unknown hostname hits the well-known issuer metadata
//! path, the proxy assumes the issuer already runs on one of a few
//! conventional local ports and asks each candidate for the same path. The
//! first candidate answering `200 OK` becomes the route target.
//!
//! A [`DiscoveryAttempt`] is an explicit state machine:
//! `Probing(i)` moves to `Found(target)` on success, to `Probing(i + 1)` on any
//! error, non-200 status or timeout, and to `Exhausted` past the last port.
//! Attempts share nothing: every request starts again from the first port.

use crate::config::{DiscoveryConfig, DiscoveryStrategy, UpstreamConfig};
use crate::forward::backend_client;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Path issuers expose to identify themselves
pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-credential-issuer";

/// Result of probing one candidate port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Answered 200 OK
    Accepted,
    /// Answered with another status
    Rejected(u16),
    /// Connection, TLS, or protocol failure
    Unreachable(String),
    /// No answer within the probe timeout
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ProbeOutcome::Accepted)
    }
}

/// Transport used to probe a candidate port
#[async_trait]
pub trait Prober: Send + Sync {
    /// Request the well-known path on `port`. Timeouts are applied by the caller.
    async fn probe(&self, port: u16) -> ProbeOutcome;

    /// Origin (scheme, host, port) that `port` resolves to
    fn origin(&self, port: u16) -> String;
}

/// Probes candidates over HTTP(S) with reqwest
pub struct HttpProber {
    client: reqwest::Client,
    scheme: String,
    host: String,
}

impl HttpProber {
    pub fn new(scheme: &str, host: &str, accept_invalid_certs: bool) -> reqwest::Result<Self> {
        let client = backend_client(accept_invalid_certs)?;

        Ok(Self {
            client,
            scheme: scheme.to_string(),
            host: host.to_string(),
        })
    }

    pub fn from_config(discovery: &DiscoveryConfig, upstream: &UpstreamConfig) -> reqwest::Result<Self> {
        Self::new(&discovery.scheme, &discovery.host, upstream.accept_invalid_certs)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, port: u16) -> ProbeOutcome {
        let url = format!("{}{}", self.origin(port), WELL_KNOWN_PATH);
        match self.client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => ProbeOutcome::Accepted,
            Ok(response) => ProbeOutcome::Rejected(response.status().as_u16()),
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }

    fn origin(&self, port: u16) -> String {
        format!("{}://{}:{}", self.scheme, self.host, port)
    }
}

/// Where a discovery attempt currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    /// About to probe the candidate at this index
    Probing(usize),
    /// A candidate answered; holds its origin
    Found(String),
    /// Every candidate failed
    Exhausted,
}

/// A route found by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub hostname: String,
    pub target: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no issuer answered discovery for {hostname} (tried ports {attempted:?})")]
    Exhausted { hostname: String, attempted: Vec<u16> },
}

async fn probe_with_timeout(prober: &dyn Prober, port: u16, timeout: Duration) -> ProbeOutcome {
    // Dropping the probe future on timeout aborts its connection
    match tokio::time::timeout(timeout, prober.probe(port)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::TimedOut,
    }
}

/// One sequential walk over the candidate ports for a single hostname
#[derive(Debug)]
pub struct DiscoveryAttempt {
    hostname: String,
    candidate_ports: Vec<u16>,
    current_index: usize,
    per_probe_timeout: Duration,
    state: ProbeState,
    outcomes: Vec<(u16, ProbeOutcome)>,
}

impl DiscoveryAttempt {
    pub fn new(hostname: impl Into<String>, candidate_ports: Vec<u16>, per_probe_timeout: Duration) -> Self {
        let state = if candidate_ports.is_empty() {
            ProbeState::Exhausted
        } else {
            ProbeState::Probing(0)
        };

        Self {
            hostname: hostname.into(),
            candidate_ports,
            current_index: 0,
            per_probe_timeout,
            state,
            outcomes: Vec::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> &ProbeState {
        &self.state
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Outcomes of the probes made so far, in order
    pub fn outcomes(&self) -> &[(u16, ProbeOutcome)] {
        &self.outcomes
    }

    /// Probe the current candidate and take one transition.
    /// Terminal states are left unchanged.
    pub async fn step(&mut self, prober: &dyn Prober) -> &ProbeState {
        let index = match self.state {
            ProbeState::Probing(index) => index,
            ProbeState::Found(_) | ProbeState::Exhausted => return &self.state,
        };

        let port = self.candidate_ports[index];
        let outcome = probe_with_timeout(prober, port, self.per_probe_timeout).await;
        debug!(hostname = %self.hostname, port, outcome = ?outcome, "Discovery probe finished");

        self.current_index = index + 1;
        self.state = if outcome.is_accepted() {
            ProbeState::Found(prober.origin(port))
        } else if self.current_index < self.candidate_ports.len() {
            ProbeState::Probing(self.current_index)
        } else {
            ProbeState::Exhausted
        };
        self.outcomes.push((port, outcome));

        &self.state
    }

    /// Step until a terminal state
    pub async fn run(mut self, prober: &dyn Prober) -> Result<Discovered, DiscoveryError> {
        loop {
            match self.step(prober).await {
                ProbeState::Probing(_) => continue,
                ProbeState::Found(target) => {
                    let target = target.clone();
                    let port = self.candidate_ports[self.current_index - 1];
                    return Ok(Discovered {
                        hostname: self.hostname,
                        target,
                        port,
                    });
                }
                ProbeState::Exhausted => {
                    return Err(DiscoveryError::Exhausted {
                        hostname: self.hostname,
                        attempted: self.outcomes.iter().map(|(port, _)| *port).collect(),
                    });
                }
            }
        }
    }
}

/// Resolves unknown hostnames by probing candidate ports
pub struct DiscoveryEngine {
    prober: Arc<dyn Prober>,
    ports: Vec<u16>,
    probe_timeout: Duration,
    strategy: DiscoveryStrategy,
}

impl DiscoveryEngine {
    pub fn new(
        prober: Arc<dyn Prober>,
        ports: Vec<u16>,
        probe_timeout: Duration,
        strategy: DiscoveryStrategy,
    ) -> Self {
        Self {
            prober,
            ports,
            probe_timeout,
            strategy,
        }
    }

    /// Build an engine with the HTTP prober from configuration
    pub fn from_config(discovery: &DiscoveryConfig, upstream: &UpstreamConfig) -> reqwest::Result<Self> {
        let prober = HttpProber::from_config(discovery, upstream)?;
        Ok(Self::new(
            Arc::new(prober),
            discovery.ports.clone(),
            discovery.probe_timeout(),
            discovery.strategy,
        ))
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub async fn discover(&self, hostname: &str) -> Result<Discovered, DiscoveryError> {
        debug!(
            hostname,
            ports = ?self.ports,
            timeout_ms = self.probe_timeout.as_millis() as u64,
            strategy = ?self.strategy,
            "Starting discovery"
        );

        let result = match self.strategy {
            DiscoveryStrategy::Sequential => {
                DiscoveryAttempt::new(hostname, self.ports.clone(), self.probe_timeout)
                    .run(self.prober.as_ref())
                    .await
            }
            DiscoveryStrategy::Concurrent => self.discover_concurrent(hostname).await,
        };

        match &result {
            Ok(found) => info!(hostname, target = %found.target, "Discovered issuer"),
            Err(e) => warn!(hostname, error = %e, "Discovery failed"),
        }
        result
    }

    /// Probe every candidate at once under one shared deadline.
    /// The first success by completion order wins; the rest are dropped.
    async fn discover_concurrent(&self, hostname: &str) -> Result<Discovered, DiscoveryError> {
        let prober = self.prober.as_ref();
        let mut probes: FuturesUnordered<_> = self
            .ports
            .iter()
            .map(|&port| async move { (port, prober.probe(port).await) })
            .collect();

        let deadline = tokio::time::sleep(self.probe_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = probes.next() => match next {
                    Some((port, ProbeOutcome::Accepted)) => {
                        return Ok(Discovered {
                            hostname: hostname.to_string(),
                            target: prober.origin(port),
                            port,
                        });
                    }
                    Some((port, outcome)) => {
                        debug!(hostname, port, outcome = ?outcome, "Discovery probe finished");
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    debug!(hostname, pending = probes.len(), "Discovery deadline reached");
                    break;
                }
            }
        }

        Err(DiscoveryError::Exhausted {
            hostname: hostname.to_string(),
            attempted: self.ports.clone(),
        })
    }
}
