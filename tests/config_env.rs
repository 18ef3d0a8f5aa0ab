mod common;
use common::ENV_LOCK;

use ssh_exec_proxy::services::config::{HostKeyPolicy, ProxyConfig};
use std::path::PathBuf;

const KEYS: &[&str] = &[
    "SSH_PROXY_BIND",
    "SSH_PROXY_IDENTITY_KEY_FILE",
    "SSH_PROXY_PUBLIC_KEY_FILE",
    "SSH_PROXY_KNOWN_HOSTS_FILE",
    "SSH_PROXY_HOST_KEY_POLICY",
    "SSH_PROXY_CONNECT_TIMEOUT_MS",
    "SSH_PROXY_TRUSTED_HOSTS",
    "SSH_PROXY_TLS_CERT",
    "SSH_PROXY_TLS_KEY",
    "SSH_PROXY_TLS_IO",
];

fn clear_env() {
    for key in KEYS {
        std::env::remove_var(key);
    }
}

#[tokio::test]
async fn from_env_reads_process_environment() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    std::env::set_var("SSH_PROXY_IDENTITY_KEY_FILE", "/srv/keys/proxy");
    std::env::set_var("SSH_PROXY_KNOWN_HOSTS_FILE", "/srv/keys/known_hosts");
    std::env::set_var("SSH_PROXY_HOST_KEY_POLICY", "Strict");
    std::env::set_var("SSH_PROXY_CONNECT_TIMEOUT_MS", "2500");

    let config = ProxyConfig::from_env().expect("config");
    assert_eq!(config.identity_key_file, PathBuf::from("/srv/keys/proxy"));
    assert_eq!(config.public_key_file, PathBuf::from("/srv/keys/proxy.pub"));
    assert_eq!(config.known_hosts_file, PathBuf::from("/srv/keys/known_hosts"));
    assert_eq!(config.host_key_policy, HostKeyPolicy::Strict);
    assert_eq!(config.connect_timeout_ms, 2500);
    assert_eq!(config.bind_address.to_string(), "127.0.0.1:8022");
    clear_env();
}

#[tokio::test]
async fn cli_bind_overrides_environment() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    std::env::set_var("SSH_PROXY_BIND", "127.0.0.1:9001");

    let config = ProxyConfig::from_env()
        .and_then(|config| config.with_bind_address("0.0.0.0:7000"))
        .expect("config");
    assert_eq!(config.bind_address.to_string(), "0.0.0.0:7000");
    assert!(ProxyConfig::from_env()
        .and_then(|config| config.with_bind_address("not-an-address"))
        .is_err());
    clear_env();
}

#[tokio::test]
async fn blank_values_fall_back_to_defaults() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    std::env::set_var("SSH_PROXY_HOST_KEY_POLICY", "   ");
    std::env::set_var("SSH_PROXY_TRUSTED_HOSTS", "");

    let config = ProxyConfig::from_env().expect("config");
    assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptNew);
    assert!(config.trusted_hosts.is_empty());
    clear_env();
}
