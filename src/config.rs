use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Gateway configuration, loaded from a JSON file.
///
/// Either `domains` (per-domain node pools) or a flat `nodes` list may be
/// given; a flat list is registered under the wildcard domain `"*"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listen address. A bare `":7003"` is accepted and bound on all interfaces.
    pub host: String,
    #[serde(default)]
    pub pem_path: String,
    #[serde(default)]
    pub key_path: String,
    pub proto: String,
    /// HMAC secret for the access gate; `"none"` disables it.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub rate_limit: RateLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: String,
    pub nodes: Vec<Node>,
}

/// One backend as configured. Immutable until a reload replaces the whole set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub url: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    /// Trailing window duration, e.g. `"1s"` or `"500ms"`.
    #[serde(with = "humantime_serde")]
    pub rate_time: Duration,
    pub rate_limit: i64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            rate_time: Duration::from_secs(1),
            rate_limit: 10_000,
        }
    }
}

fn default_jwt_secret() -> String {
    "none".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate everything that must be fatal before serving.
    pub fn validate(&self) -> Result<()> {
        if self.proto != "http" && self.proto != "https" {
            return Err(Error::Config(
                "protocol must be either http or https".to_string(),
            ));
        }
        if self.proto == "https" {
            if !Path::new(&self.pem_path).exists() {
                return Err(Error::Config(format!(
                    "certificate file not found: {}",
                    self.pem_path
                )));
            }
            if !Path::new(&self.key_path).exists() {
                return Err(Error::Config(format!(
                    "key file not found: {}",
                    self.key_path
                )));
            }
        }
        if self.rate_limit.rate_time.is_zero() {
            return Err(Error::Config("rateTime must be non-zero".to_string()));
        }
        if self.domains.is_empty() && self.nodes.is_empty() {
            return Err(Error::Config("no nodes configured".to_string()));
        }
        for domain in &self.domains {
            if domain.nodes.is_empty() {
                return Err(Error::Config(format!(
                    "domain {} has no nodes",
                    domain.domain
                )));
            }
        }
        self.listen_addr()?;
        Ok(())
    }

    /// The listen address as a socket address, accepting the `":port"` shorthand.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let host = if self.host.starts_with(':') {
            format!("0.0.0.0{}", self.host)
        } else {
            self.host.clone()
        };
        host.parse()
            .map_err(|_| Error::Config(format!("invalid listen address: {}", self.host)))
    }

    /// All routing tables to build: per-domain pools plus the flat node list
    /// under the wildcard domain.
    pub fn domain_nodes(&self) -> Vec<(String, &[Node])> {
        let mut tables: Vec<(String, &[Node])> = Vec::new();
        if !self.nodes.is_empty() {
            tables.push((crate::engine::WILDCARD_DOMAIN.to_string(), &self.nodes));
        }
        for domain in &self.domains {
            tables.push((domain.domain.clone(), &domain.nodes));
        }
        tables
    }
}
