//! Process configuration (§6). Loaded from a YAML file and overlaid with CLI
//! flags by the `piko-cli` crate; this module only owns the shape and
//! defaults, mirroring the teacher's plain serde-derived `Config` structs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
}

impl Config {
    pub async fn from_file(path: PathBuf) -> anyhow::Result<Self> {
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| anyhow::anyhow!("reading config file {}: {err}", path.display()))?;
        let config: Config = serde_yml::from_str(&data)
            .map_err(|err| anyhow::anyhow!("parsing config file {}: {err}", path.display()))?;
        Ok(config)
    }

    pub async fn write(&self, path: PathBuf) -> anyhow::Result<()> {
        let data = serde_yml::to_string(self)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}

/// Where forwarders connect to register upstream sessions (C5), distinct
/// from the public `proxy` listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub advertise_addr: String,
    #[serde(with = "humantime_serde", default = "default_server_timeout")]
    pub timeout: Duration,
}

fn default_server_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8004".parse().unwrap(),
            advertise_addr: "localhost:8004".to_string(),
            timeout: default_server_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClusterConfig {
    pub node_id: Option<String>,
    pub node_id_prefix: Option<String>,
    #[serde(default)]
    pub join: Vec<String>,
    #[serde(default)]
    pub abort_if_join_fails: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_id_prefix: None,
            join: Vec::new(),
            abort_if_join_fails: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HttpTuning {
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_read_header_timeout")]
    pub read_header_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_read_header_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_max_header_bytes() -> usize {
    1 << 20
}

impl Default for HttpTuning {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            read_header_timeout: default_read_header_timeout(),
            write_timeout: default_write_timeout(),
            idle_timeout: default_idle_timeout(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HeaderFilter {
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub block_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AccessLogConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub request_headers: HeaderFilter,
    #[serde(default)]
    pub response_headers: HeaderFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    #[serde(default = "default_tcp_bind_addr")]
    pub tcp_bind_addr: SocketAddr,
    pub advertise_addr: String,
    #[serde(with = "humantime_serde", default = "default_proxy_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub http: HttpTuning,
    #[serde(default)]
    pub access_log: AccessLogConfig,
}

fn default_proxy_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_tcp_bind_addr() -> SocketAddr {
    "0.0.0.0:8003".parse().unwrap()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().unwrap(),
            tcp_bind_addr: default_tcp_bind_addr(),
            advertise_addr: "localhost:8000".to_string(),
            timeout: default_proxy_timeout(),
            http: HttpTuning::default(),
            access_log: AccessLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RebalanceConfig {
    #[serde(default = "default_min_conns")]
    pub min_conns: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_shed_rate")]
    pub shed_rate: f64,
}

fn default_min_conns() -> usize {
    5
}
fn default_threshold() -> f64 {
    1.5
}
fn default_shed_rate() -> f64 {
    0.05
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            min_conns: default_min_conns(),
            threshold: default_threshold(),
            shed_rate: default_shed_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UpstreamConfig {
    #[serde(default)]
    pub rebalance: RebalanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AdminConfig {
    pub bind_addr: SocketAddr,
    pub advertise_addr: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".parse().unwrap(),
            advertise_addr: "localhost:8001".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GossipConfig {
    pub bind_addr: SocketAddr,
    pub advertise_addr: String,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8002".parse().unwrap(),
            advertise_addr: "localhost:8002".to_string(),
        }
    }
}

/// The client-side forwarder (C7): one local listener tunnelling to one
/// endpoint on a remote Piko node's TCP proxy port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ForwarderConfig {
    pub bind_addr: Option<SocketAddr>,
    pub target_addr: Option<SocketAddr>,
    pub endpoint_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub subsystems: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JwksConfig {
    pub endpoint: String,
    #[serde(with = "humantime_serde", default = "default_jwks_ttl")]
    pub cache_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_jwks_timeout")]
    pub timeout: Duration,
}

fn default_jwks_ttl() -> Duration {
    Duration::from_secs(300)
}
fn default_jwks_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AuthConfig {
    #[serde(default)]
    pub hmac_secret_key: Option<String>,
    #[serde(default)]
    pub rsa_public_key: Option<PathBuf>,
    #[serde(default)]
    pub ecdsa_public_key: Option<PathBuf>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub disable_disconnect_on_expiry: bool,
    #[serde(default)]
    pub require_endpoints: bool,
    #[serde(default)]
    pub jwks: Option<JwksConfig>,
}

/// Small local shim for `#[serde(with = "humantime_serde")]` so we don't need
/// the `humantime-serde` crate purely for a handful of `Duration` fields.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        humantime::format_duration(*value).to_string().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.proxy.timeout, Duration::from_secs(10));
        assert_eq!(config.upstream.rebalance.min_conns, 5);
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yml::to_string(&config).unwrap();
        let parsed: Config = serde_yml::from_str(&yaml).unwrap();
        assert_eq!(parsed.proxy.bind_addr, config.proxy.bind_addr);
    }
}
