use crate::error::ResourceError;
use crate::resource_cache::{LazyCache, ResourceLoader};
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Per-domain configuration, read from `<domain>.conf` or `default.conf`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(rename = "upstream", default)]
    pub admission: AdmissionPolicy,
    #[serde(rename = "smtp")]
    pub delivery: SmtpDelivery,
    #[serde(rename = "smtptest", default)]
    pub mailbox_probe: MailboxProbeConfig,
    #[serde(rename = "abuseipdb", default)]
    pub reputation: ReputationGateConfig,
}

/// How the visitor's address is derived from the connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    #[serde(
        rename = "whitelist",
        default,
        deserialize_with = "deserialize_networks"
    )]
    pub trusted_networks: Vec<IpNet>,
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIpMethod {
    Direct,
    ForwardedFor,
    RealIp,
}

impl AdmissionPolicy {
    pub fn method(&self) -> ClientIpMethod {
        match self.method.to_lowercase().as_str() {
            "x-forwarded-for" => ClientIpMethod::ForwardedFor,
            "x-real-ip" => ClientIpMethod::RealIp,
            _ => ClientIpMethod::Direct,
        }
    }

    pub fn trusts(&self, ip: IpAddr) -> bool {
        self.trusted_networks.iter().any(|net| net.contains(&ip))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpDelivery {
    pub host: String,
    pub port: u16,
    pub recipient: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxProbeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub helo: String,
    #[serde(default)]
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationGateConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(rename = "cache_file", default = "default_cache_file")]
    pub cache_location: PathBuf,
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("cache.json")
}

impl Default for ReputationGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            cache_location: default_cache_file(),
        }
    }
}

/// Accepts CIDR notation or a bare address (treated as a single host).
fn deserialize_networks<'de, D>(deserializer: D) -> Result<Vec<IpNet>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    raw.iter()
        .map(|s| parse_network(s).map_err(serde::de::Error::custom))
        .collect()
}

pub fn parse_network(s: &str) -> Result<IpNet, String> {
    let s = s.trim();
    if s.contains('/') {
        s.parse::<IpNet>()
            .map_err(|e| format!("invalid network {s}: {e}"))
    } else {
        s.parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|e| format!("invalid address {s}: {e}"))
    }
}

/// Reads `<dir>/<domain>.conf` files.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    dir: PathBuf,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{domain}.conf"))
    }
}

impl ResourceLoader for ConfigLoader {
    type Resource = TenantConfig;

    fn load(&self, key: &str) -> Result<Option<TenantConfig>, ResourceError> {
        let path = self.path_for(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ResourceError::Io { path, source }),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ResourceError::Malformed {
                path,
                reason: e.to_string(),
            })
    }
}

/// Lazily populated, per-file invalidated tenant configuration.
pub type ConfigCache = LazyCache<ConfigLoader>;
