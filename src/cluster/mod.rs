pub mod health;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use url::Url;

use crate::config::ClusterConfig;
use crate::error::ProxyError;

/// Resolved health-check settings with defaults applied.
#[derive(Debug, Clone)]
pub struct HealthCheckSettings {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl HealthCheckSettings {
    fn from_config(config: &crate::config::HealthCheckConfig) -> Self {
        Self {
            path: config.path.clone(),
            interval: if config.interval.is_zero() {
                Duration::from_secs(10)
            } else {
                config.interval
            },
            timeout: if config.timeout.is_zero() {
                Duration::from_secs(1)
            } else {
                config.timeout
            },
            unhealthy_threshold: if config.unhealthy_threshold == 0 {
                3
            } else {
                config.unhealthy_threshold
            },
            healthy_threshold: if config.healthy_threshold == 0 {
                1
            } else {
                config.healthy_threshold
            },
        }
    }
}

/// Resolved circuit-breaker settings with defaults applied.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub consecutive_failures: u32,
    pub cooldown: Duration,
}

impl BreakerSettings {
    fn from_config(config: &crate::config::CircuitBreakerConfig) -> Self {
        Self {
            consecutive_failures: if config.consecutive_failures == 0 {
                5
            } else {
                config.consecutive_failures
            },
            cooldown: if config.cooldown.is_zero() {
                Duration::from_secs(30)
            } else {
                config.cooldown
            },
        }
    }
}

/// One physical upstream. Health-check state and breaker state are mutated by
/// independent observers (the probe loop and request outcomes) and never
/// touch each other's counters.
#[derive(Debug)]
struct Endpoint {
    url: Url,
    alive: bool,
    hc_successes: u32,
    hc_failures: u32,
    cb_failures: u32,
    circuit_open_until: Option<Instant>,
}

impl Endpoint {
    fn new(url: Url) -> Self {
        Self {
            url,
            alive: true,
            hc_successes: 0,
            hc_failures: 0,
            cb_failures: 0,
            circuit_open_until: None,
        }
    }
}

struct State {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

/// The endpoint handed out by selection. `index` addresses the endpoint for
/// subsequent outcome reporting.
#[derive(Debug, Clone)]
pub struct PickedEndpoint {
    pub index: usize,
    pub url: Url,
}

/// Named group of endpoints balanced round-robin. One mutex guards the
/// cursor and every endpoint field; it is never held across I/O.
pub struct Cluster {
    name: String,
    state: Mutex<State>,
    health: Option<HealthCheckSettings>,
    breaker: Option<BreakerSettings>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        endpoints: Vec<Url>,
        health: Option<HealthCheckSettings>,
        breaker: Option<BreakerSettings>,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                endpoints: endpoints.into_iter().map(Endpoint::new).collect(),
                cursor: 0,
            }),
            health,
            breaker,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for raw in &config.endpoints {
            let url = Url::parse(raw).with_context(|| {
                format!("parse endpoint {:?} for cluster {}", raw, config.name)
            })?;
            endpoints.push(url);
        }

        Ok(Self::new(
            config.name.clone(),
            endpoints,
            config.health_check.as_ref().map(HealthCheckSettings::from_config),
            config.circuit_breaker.as_ref().map(BreakerSettings::from_config),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> Option<&HealthCheckSettings> {
        self.health.as_ref()
    }

    /// Select the next eligible endpoint, walking at most one full lap from
    /// the cursor. Dead endpoints and endpoints with an open circuit are
    /// skipped; an open circuit whose cooldown has elapsed is closed in place
    /// and its endpoint returned.
    pub fn pick_endpoint(&self) -> Result<PickedEndpoint, ProxyError> {
        let mut state = self.state.lock();
        let n = state.endpoints.len();
        if n == 0 {
            return Err(ProxyError::NoAvailableEndpoint(self.name.clone()));
        }

        let now = Instant::now();

        for _ in 0..n {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % n;

            let endpoint = &mut state.endpoints[idx];
            if !endpoint.alive {
                continue;
            }

            if let Some(until) = endpoint.circuit_open_until {
                if now < until {
                    continue;
                }
                endpoint.circuit_open_until = None;
                endpoint.cb_failures = 0;
            }

            return Ok(PickedEndpoint {
                index: idx,
                url: endpoint.url.clone(),
            });
        }

        Err(ProxyError::NoAvailableEndpoint(self.name.clone()))
    }

    /// A successful request closes the failure streak.
    pub fn report_success(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(endpoint) = state.endpoints.get_mut(index) {
            endpoint.cb_failures = 0;
        }
    }

    /// A failed request extends the streak and, once it reaches the breaker
    /// threshold, opens the circuit for the configured cooldown.
    pub fn report_failure(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(endpoint) = state.endpoints.get_mut(index) {
            endpoint.cb_failures += 1;
            if let Some(breaker) = &self.breaker {
                if endpoint.cb_failures >= breaker.consecutive_failures {
                    endpoint.circuit_open_until = Some(Instant::now() + breaker.cooldown);
                }
            }
        }
    }

    /// Apply one probe outcome. Liveness flips only once the corresponding
    /// threshold is crossed; the opposite counter resets on every outcome.
    pub(crate) fn record_probe(&self, index: usize, ok: bool) {
        let Some(health) = &self.health else { return };
        let mut state = self.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(index) else { return };

        if ok {
            endpoint.hc_failures = 0;
            endpoint.hc_successes += 1;
            if endpoint.hc_successes >= health.healthy_threshold {
                endpoint.alive = true;
            }
        } else {
            endpoint.hc_successes = 0;
            endpoint.hc_failures += 1;
            if endpoint.hc_failures >= health.unhealthy_threshold {
                endpoint.alive = false;
            }
        }
    }

    /// Probe targets: every endpoint's base URL with the health path applied.
    pub(crate) fn probe_targets(&self, path: &str) -> Vec<(usize, Url)> {
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, endpoint)| {
                let mut url = endpoint.url.clone();
                url.set_path(path);
                url.set_query(None);
                (idx, url)
            })
            .collect()
    }

    pub fn unhealthy_count(&self) -> usize {
        let state = self.state.lock();
        state.endpoints.iter().filter(|e| !e.alive).count()
    }

    #[cfg(test)]
    pub(crate) fn set_alive(&self, index: usize, alive: bool) {
        self.state.lock().endpoints[index].alive = alive;
    }

    #[cfg(test)]
    pub(crate) fn endpoint_alive(&self, index: usize) -> bool {
        self.state.lock().endpoints[index].alive
    }

    #[cfg(test)]
    pub(crate) fn probe_counters(&self, index: usize) -> (u32, u32) {
        let state = self.state.lock();
        let endpoint = &state.endpoints[index];
        (endpoint.hc_successes, endpoint.hc_failures)
    }

    #[cfg(test)]
    pub(crate) fn breaker_state(&self, index: usize) -> (u32, bool) {
        let state = self.state.lock();
        let endpoint = &state.endpoints[index];
        (endpoint.cb_failures, endpoint.circuit_open_until.is_some())
    }
}
