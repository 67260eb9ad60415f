//! Configuration stores the proxy can read its dynamic configuration from
//!
//! Each variant knows how to launch its store (if it is a process), probe it,
//! secure it, apply preload transactions, and which provider arguments the
//! proxy needs to read from it.

pub mod consul;
pub mod etcd;
pub mod file;

pub use consul::ConsulBackend;
pub use etcd::{EtcdBackend, EtcdTls};
pub use file::FileBackend;

use crate::config::{BackendConfig, BackendType};
use crate::dynamic::DynamicConfig;
use crate::error::Result;
use crate::preload::{BackendCredential, PreloadTransaction};
use crate::supervisor::ServiceSpec;
use std::collections::BTreeMap;
use std::time::Duration;

/// Key prefix the KV providers read from
pub const DEFAULT_ROOT_KEY: &str = "traefik";

pub enum Backend {
    File(FileBackend),
    Etcd(EtcdBackend),
    Consul(ConsulBackend),
}

impl Backend {
    /// Build the configured backend
    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let backend = match config.backend_type {
            BackendType::File => Backend::File(FileBackend::new(&config.dynamic_config_file)?),
            BackendType::Etcd => {
                let mut etcd = EtcdBackend::new(config.endpoint())?.with_root_key(&config.root_key);
                if config.tls_ca_cert.is_some() || config.tls_insecure_skip_verify {
                    etcd = etcd.with_tls(EtcdTls {
                        ca_cert: config.tls_ca_cert.clone(),
                        insecure_skip_verify: config.tls_insecure_skip_verify,
                    })?;
                }
                if let Some(max) = config.max_txn_ops {
                    etcd = etcd.with_max_txn_ops(max);
                }
                if let Some(port) = config.aux_port_base {
                    etcd = etcd.with_peer_port(port);
                }
                if config.launch {
                    etcd = etcd.with_command(config.command());
                } else if let Some(credential) = config.credential() {
                    // An external store already has auth enabled
                    etcd = etcd.with_credential(credential);
                }
                Backend::Etcd(etcd)
            }
            BackendType::Consul => {
                let mut consul = ConsulBackend::new(config.endpoint())?.with_root_key(&config.root_key);
                if config.launch {
                    consul = consul.with_command(config.command());
                }
                if let Some(port) = config.aux_port_base {
                    consul = consul.with_aux_port_base(port);
                }
                if let Some(ref token) = config.token {
                    consul = consul.with_token(token);
                }
                Backend::Consul(consul)
            }
        };
        Ok(backend)
    }

    /// Provider name, as used in Traefik's `<router>@<provider>` names
    pub fn name(&self) -> &'static str {
        match self {
            Backend::File(_) => "file",
            Backend::Etcd(_) => "etcd",
            Backend::Consul(_) => "consul",
        }
    }

    /// Prepare to launch the store as a child process.
    ///
    /// Returns `None` for backends that are not processes or are managed
    /// elsewhere.
    pub fn prepare_launch(&mut self) -> Result<Option<ServiceSpec>> {
        match self {
            Backend::File(_) => Ok(None),
            Backend::Etcd(etcd) => etcd.prepare_launch(),
            Backend::Consul(consul) => consul.prepare_launch(),
        }
    }

    /// One health check of the store
    pub async fn probe(&self) -> anyhow::Result<bool> {
        match self {
            Backend::File(file) => file.probe(),
            Backend::Etcd(etcd) => etcd.probe().await,
            Backend::Consul(consul) => consul.probe().await,
        }
    }

    pub async fn bootstrap_auth(&mut self, credential: &BackendCredential) -> Result<()> {
        match self {
            Backend::File(_) => Ok(()),
            Backend::Etcd(etcd) => etcd.bootstrap_auth(credential).await,
            Backend::Consul(consul) => consul.bootstrap_auth(credential).await,
        }
    }

    /// Apply a preload transaction
    pub async fn apply(&mut self, txn: &PreloadTransaction) -> Result<()> {
        match self {
            Backend::File(file) => file.apply(txn).await,
            Backend::Etcd(etcd) => etcd.apply(txn).await,
            Backend::Consul(consul) => consul.apply(txn).await,
        }
    }

    /// The transaction that makes `config` the whole dynamic configuration
    pub fn replace_transaction(&self, config: &DynamicConfig) -> Result<PreloadTransaction> {
        match self {
            Backend::File(file) => file.replace_transaction(config),
            Backend::Etcd(etcd) => Ok(PreloadTransaction::replace_kv(etcd.root_key(), config)),
            Backend::Consul(consul) => Ok(PreloadTransaction::replace_kv(consul.root_key(), config)),
        }
    }

    /// The transaction that moves the backend from `current` to `desired`.
    ///
    /// KV stores get only the changed keys; the file is rewritten whole.
    pub fn update_transaction(
        &self,
        current: &DynamicConfig,
        desired: &DynamicConfig,
    ) -> Result<PreloadTransaction> {
        match self {
            Backend::File(file) => file.replace_transaction(desired),
            Backend::Etcd(etcd) => Ok(PreloadTransaction::update_kv(etcd.root_key(), current, desired)),
            Backend::Consul(consul) => Ok(PreloadTransaction::update_kv(consul.root_key(), current, desired)),
        }
    }

    /// Proxy command-line arguments that select this provider
    pub fn proxy_args(&self) -> Vec<String> {
        match self {
            Backend::File(file) => file.proxy_args(),
            Backend::Etcd(etcd) => etcd.proxy_args(),
            Backend::Consul(consul) => consul.proxy_args(),
        }
    }

    /// Environment the proxy needs to talk to this provider
    pub fn proxy_env(&self) -> BTreeMap<String, String> {
        match self {
            Backend::File(_) => BTreeMap::new(),
            Backend::Etcd(etcd) => etcd.proxy_env(),
            Backend::Consul(consul) => consul.proxy_env(),
        }
    }

    /// Grace period before a launched store is killed
    pub fn stop_grace(&self) -> Duration {
        match self {
            Backend::File(_) => Duration::ZERO,
            Backend::Etcd(_) => Duration::from_secs(20),
            Backend::Consul(_) => Duration::from_secs(30),
        }
    }

    /// Remove state this backend created; called after the store is stopped
    pub async fn cleanup(&mut self) {
        match self {
            Backend::File(file) => file.cleanup().await,
            Backend::Etcd(etcd) => etcd.cleanup(),
            Backend::Consul(consul) => consul.cleanup(),
        }
    }
}

/// Shared HTTP client for store APIs
pub(crate) fn http_client() -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")
}

/// `host:port` of an endpoint URL, as the proxy's KV providers expect
pub(crate) fn host_port(endpoint: &str) -> String {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    without_scheme.trim_end_matches('/').to_string()
}

/// Port of an endpoint URL; launched stores need it explicit
pub(crate) fn endpoint_port(endpoint: &str) -> Result<u16> {
    host_port(endpoint)
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| {
            crate::error::BootstrapError::Config(format!(
                "endpoint '{}' must include a port",
                endpoint
            ))
        })
}
