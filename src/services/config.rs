use crate::constants::network::{DEFAULT_BIND_ADDRESS, TIMEOUT_SSH_CONNECT_MS};
use crate::errors::ProxyError;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

const DEFAULT_IDENTITY_KEY_FILE: &str = "~/.ssh/id_rsa_ssh_proxy";
const DEFAULT_KNOWN_HOSTS_FILE: &str = "~/.ssh/known_hosts";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Unknown hosts are learned into the known-hosts file; pinned keys must match.
    AcceptNew,
    /// Only hosts already in the known-hosts file with a matching key are accepted.
    Strict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsIoMode {
    Library,
    Embedded,
}

#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub io_mode: TlsIoMode,
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind_address: SocketAddr,
    pub identity_key_file: PathBuf,
    pub public_key_file: PathBuf,
    pub known_hosts_file: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout_ms: u64,
    pub trusted_hosts: Vec<IpAddr>,
    pub tls: Option<TlsSettings>,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ProxyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ProxyError> {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let home = lookup("HOME");

        let bind_address = parse_bind_address(
            &read("SSH_PROXY_BIND").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
        )?;
        let identity_key_file = expand_home(
            &read("SSH_PROXY_IDENTITY_KEY_FILE")
                .unwrap_or_else(|| DEFAULT_IDENTITY_KEY_FILE.to_string()),
            home.as_deref(),
        );
        let public_key_file = match read("SSH_PROXY_PUBLIC_KEY_FILE") {
            Some(path) => expand_home(&path, home.as_deref()),
            None => default_public_key_file(&identity_key_file),
        };
        let known_hosts_file = expand_home(
            &read("SSH_PROXY_KNOWN_HOSTS_FILE")
                .unwrap_or_else(|| DEFAULT_KNOWN_HOSTS_FILE.to_string()),
            home.as_deref(),
        );
        let host_key_policy = match read("SSH_PROXY_HOST_KEY_POLICY") {
            Some(raw) => normalize_host_key_policy(&raw)?,
            None => HostKeyPolicy::AcceptNew,
        };
        let connect_timeout_ms = match read("SSH_PROXY_CONNECT_TIMEOUT_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| {
                    ProxyError::configuration(format!(
                        "SSH_PROXY_CONNECT_TIMEOUT_MS must be a positive integer, got {}",
                        raw
                    ))
                })?,
            None => TIMEOUT_SSH_CONNECT_MS,
        };
        let trusted_hosts = match read("SSH_PROXY_TRUSTED_HOSTS") {
            Some(raw) => parse_trusted_hosts(&raw)?,
            None => Vec::new(),
        };
        let tls = match (read("SSH_PROXY_TLS_CERT"), read("SSH_PROXY_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert_file: expand_home(&cert, home.as_deref()),
                key_file: expand_home(&key, home.as_deref()),
                io_mode: normalize_tls_io_mode(read("SSH_PROXY_TLS_IO").as_deref())?,
            }),
            (None, None) => None,
            _ => {
                return Err(ProxyError::configuration(
                    "SSH_PROXY_TLS_CERT and SSH_PROXY_TLS_KEY must be set together",
                ))
            }
        };

        Ok(Self {
            bind_address,
            identity_key_file,
            public_key_file,
            known_hosts_file,
            host_key_policy,
            connect_timeout_ms,
            trusted_hosts,
            tls,
        })
    }

    pub fn with_bind_address(mut self, raw: &str) -> Result<Self, ProxyError> {
        self.bind_address = parse_bind_address(raw)?;
        Ok(self)
    }
}

fn parse_bind_address(raw: &str) -> Result<SocketAddr, ProxyError> {
    raw.parse::<SocketAddr>().map_err(|_| {
        ProxyError::configuration(format!("Invalid bind address: {}", raw))
            .with_hint("Expected <ip>:<port>, e.g. 0.0.0.0:8022.")
    })
}

fn normalize_host_key_policy(raw: &str) -> Result<HostKeyPolicy, ProxyError> {
    match raw.trim().to_lowercase().replace('-', "_").as_str() {
        "accept_new" | "accept_new_or_local_tunnel" | "tofu" => Ok(HostKeyPolicy::AcceptNew),
        "strict" | "always" => Ok(HostKeyPolicy::Strict),
        other => Err(
            ProxyError::configuration(format!("Unknown host key policy: {}", other))
                .with_hint("Use one of: accept_new, strict."),
        ),
    }
}

fn normalize_tls_io_mode(raw: Option<&str>) -> Result<TlsIoMode, ProxyError> {
    let Some(raw) = raw else {
        return Ok(TlsIoMode::Library);
    };
    match raw.trim().to_lowercase().as_str() {
        "library" | "nonblocking" => Ok(TlsIoMode::Library),
        "embedded" | "blocking" => Ok(TlsIoMode::Embedded),
        other => Err(
            ProxyError::configuration(format!("Unknown TLS io mode: {}", other))
                .with_hint("Use one of: library, embedded."),
        ),
    }
}

fn parse_trusted_hosts(raw: &str) -> Result<Vec<IpAddr>, ProxyError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse::<IpAddr>().map_err(|_| {
                ProxyError::configuration(format!("Invalid trusted host address: {}", entry))
            })
        })
        .collect()
}

fn default_public_key_file(identity: &Path) -> PathBuf {
    let mut raw = identity.as_os_str().to_os_string();
    raw.push(".pub");
    PathBuf::from(raw)
}

fn expand_home(path: &str, home: Option<&str>) -> PathBuf {
    if let Some(home) = home {
        if path == "~" {
            return PathBuf::from(home);
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return Path::new(home).join(rest);
        }
    }
    PathBuf::from(path)
}
