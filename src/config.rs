use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub listeners: Vec<ListenerConfig>,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    pub clusters: Vec<ClusterConfig>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub address: String,
    pub tls: TlsConfig,
    #[serde(rename = "ipBlockCIDRs")]
    pub ip_block_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerConfig {
    pub name: String,
    pub address: String,
    pub tls: TlsConfig,
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub max_entries: i64,
    #[serde(rename = "defaultTTL", with = "duration_serde")]
    pub default_ttl: Duration,
    pub max_body_bytes: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub name: String,
    pub endpoints: Vec<String>,
    pub health_check: Option<HealthCheckConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub consecutive_failures: u32,
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteConfig {
    pub name: String,
    pub path_prefix: String,
    pub cluster: String,
    pub cache: Option<RouteCacheConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteCacheConfig {
    pub enabled: Option<bool>,
    #[serde(with = "duration_serde::option")]
    pub ttl: Option<Duration>,
}

impl Config {
    /// Load configuration from a YAML file, apply defaults and validate.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path))?;

        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.server.address.is_empty() {
            self.server.address = "0.0.0.0:8080".to_string();
        }
        if self.cache.max_entries <= 0 {
            self.cache.max_entries = 1000;
        }
        if self.cache.max_body_bytes <= 0 {
            self.cache.max_body_bytes = 1 << 20; // 1 MiB
        }
    }

    /// Validate cross references between sections.
    pub fn validate(&self) -> Result<()> {
        let cluster_names: HashSet<&str> = self.clusters.iter().map(|c| c.name.as_str()).collect();

        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                anyhow::bail!("cluster name cannot be empty");
            }
            if cluster.endpoints.is_empty() {
                anyhow::bail!("cluster '{}' must have at least one endpoint", cluster.name);
            }
            for endpoint in &cluster.endpoints {
                let url = Url::parse(endpoint).with_context(|| {
                    format!("invalid endpoint {:?} in cluster '{}'", endpoint, cluster.name)
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    anyhow::bail!(
                        "endpoint {:?} in cluster '{}' must use http or https",
                        endpoint,
                        cluster.name
                    );
                }
            }
        }

        for route in &self.routes {
            if route.path_prefix.is_empty() {
                anyhow::bail!("route '{}' has an empty pathPrefix", route.name);
            }
            if !cluster_names.contains(route.cluster.as_str()) {
                anyhow::bail!("route '{}' references unknown cluster: {}", route.name, route.cluster);
            }
        }

        let listener_names: HashSet<&str> = self.listeners.iter().map(|l| l.name.as_str()).collect();
        for listener in &self.listeners {
            if listener.address.is_empty() {
                anyhow::bail!("listener '{}' has an empty address", listener.name);
            }
            if let Some(target) = &listener.redirect_to {
                if !listener_names.contains(target.as_str()) {
                    anyhow::bail!(
                        "listener '{}' has redirectTo={:?} but target not found",
                        listener.name,
                        target
                    );
                }
            }
        }

        Ok(())
    }

    /// Whether caching applies to the given route (enabled unless switched off).
    pub fn route_cache_enabled(&self, route: &RouteConfig) -> bool {
        route
            .cache
            .as_ref()
            .and_then(|c| c.enabled)
            .unwrap_or(true)
    }

    /// Cache TTL for the given route, falling back to the global default.
    pub fn route_ttl(&self, route: &RouteConfig) -> Duration {
        route
            .cache
            .as_ref()
            .and_then(|c| c.ttl)
            .unwrap_or(self.cache.default_ttl)
    }
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, ""),
        };
        let value: u64 = num
            .parse()
            .map_err(|_| format!("invalid duration: {:?}", s))?;

        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" | "" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            _ => Err(format!("invalid duration unit: {:?}", s)),
        }
    }

    pub(crate) mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let value: Option<String> = Option::deserialize(deserializer)?;
            match value {
                Some(s) => super::parse_duration(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
