use crate::backoff::BackoffPolicy;
use crate::installer::{UnverifiedPolicy, DEFAULT_RELEASE_URL, DEFAULT_VERSION};
use crate::preload::BackendCredential;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a gateway bring-up
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Where and which proxy release to install
    #[serde(default)]
    pub install: InstallConfig,

    /// How the proxy is launched and reached
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Store the proxy reads its dynamic configuration from
    #[serde(default)]
    pub backend: BackendConfig,

    /// Retry schedule shared by every readiness wait
    #[serde(default)]
    pub backoff: BackoffConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstallConfig {
    /// Install directory (default: ./dependencies)
    #[serde(default = "default_install_dir")]
    pub dir: PathBuf,

    /// Proxy release version (default: 2.9.8)
    #[serde(default = "default_version")]
    pub version: String,

    /// Target platform such as "linux-amd64" (default: this machine)
    pub platform: Option<String>,

    /// Versions without a recorded checksum: "refuse" (default) or "trust-on-first-use"
    #[serde(default = "default_unverified")]
    pub unverified: UnverifiedPolicy,

    /// Release download root (default: GitHub releases)
    #[serde(default = "default_release_url")]
    pub release_url: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            dir: default_install_dir(),
            version: default_version(),
            platform: None,
            unverified: default_unverified(),
            release_url: default_release_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Launch the proxy (default: true). When false, attach to a running one.
    #[serde(default = "default_true")]
    pub launch: bool,

    /// Use this proxy executable instead of installing one
    pub command: Option<PathBuf>,

    /// Public entrypoint URL (default: https://127.0.0.1:8000)
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Proxy API URL (default: http://127.0.0.1:8099)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_public_entrypoint")]
    pub public_entrypoint: String,

    #[serde(default = "default_api_entrypoint")]
    pub api_entrypoint: String,

    /// Basic-auth user guarding the proxy API
    #[serde(default = "default_api_username")]
    pub api_username: String,

    #[serde(default = "default_api_password")]
    pub api_password: String,

    /// Proxy log level (default: debug)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Delay before the proxy applies provider changes (default: 0s)
    #[serde(default = "default_providers_throttle")]
    pub providers_throttle: String,

    /// Static configuration file; replaces the generated command-line arguments
    pub static_config_file: Option<PathBuf>,

    /// Extra environment for the proxy process
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Seconds to wait for the public endpoint to respond (default: 30)
    #[serde(default = "default_proxy_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Seconds to wait for a route to appear in the proxy API (default: 45)
    #[serde(default = "default_check_route_timeout")]
    pub check_route_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_proxy_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            launch: true,
            command: None,
            public_url: default_public_url(),
            api_url: default_api_url(),
            public_entrypoint: default_public_entrypoint(),
            api_entrypoint: default_api_entrypoint(),
            api_username: default_api_username(),
            api_password: default_api_password(),
            log_level: default_log_level(),
            providers_throttle: default_providers_throttle(),
            static_config_file: None,
            env: BTreeMap::new(),
            startup_timeout_secs: default_proxy_startup_timeout(),
            check_route_timeout_secs: default_check_route_timeout(),
            stop_grace_secs: default_proxy_stop_grace(),
        }
    }
}

impl ProxyConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn check_route_timeout(&self) -> Duration {
        Duration::from_secs(self.check_route_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Configuration store type
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Dynamic configuration file watched by the proxy (default)
    #[default]
    File,
    Etcd,
    Consul,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// "file" (default), "etcd" or "consul"
    #[serde(default, rename = "type")]
    pub backend_type: BackendType,

    /// Launch the store (default: true). When false, attach to a running one.
    #[serde(default = "default_true")]
    pub launch: bool,

    /// Store executable (default: "etcd" or "consul" from PATH)
    pub command: Option<PathBuf>,

    /// Store API URL (default: the store's standard local port)
    pub endpoint: Option<String>,

    /// Dynamic configuration file (file backend, default: ./rules.toml)
    #[serde(default = "default_dynamic_config_file")]
    pub dynamic_config_file: PathBuf,

    /// KV prefix the proxy reads (default: traefik)
    #[serde(default = "default_root_key")]
    pub root_key: String,

    // === Authentication ===
    /// etcd user to create and authenticate as
    pub username: Option<String>,
    pub password: Option<String>,

    /// Role granted to `username` (default: root)
    #[serde(default = "default_role")]
    pub role: String,

    /// Consul ACL token
    pub token: Option<String>,

    // === TLS (etcd) ===
    pub tls_ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub tls_insecure_skip_verify: bool,

    /// First extra port a launched store binds: etcd's peer port, or the
    /// first of Consul's six DNS/server/serf/gRPC ports (default: endpoint port + 1)
    pub aux_port_base: Option<u16>,

    /// Largest etcd transaction; passed to a launched etcd (default: 128)
    pub max_txn_ops: Option<usize>,

    /// Seconds to wait for the store to become healthy (default: etcd 10, consul 20)
    pub startup_timeout_secs: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: BackendType::File,
            launch: true,
            command: None,
            endpoint: None,
            dynamic_config_file: default_dynamic_config_file(),
            root_key: default_root_key(),
            username: None,
            password: None,
            role: default_role(),
            token: None,
            tls_ca_cert: None,
            tls_insecure_skip_verify: false,
            aux_port_base: None,
            max_txn_ops: None,
            startup_timeout_secs: None,
        }
    }
}

impl BackendConfig {
    pub fn endpoint(&self) -> String {
        match (&self.endpoint, self.backend_type) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, BackendType::Consul) => "http://127.0.0.1:8500".to_string(),
            (None, _) => "http://127.0.0.1:2379".to_string(),
        }
    }

    pub fn command(&self) -> PathBuf {
        match (&self.command, self.backend_type) {
            (Some(command), _) => command.clone(),
            (None, BackendType::Consul) => PathBuf::from("consul"),
            (None, _) => PathBuf::from("etcd"),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        let secs = self.startup_timeout_secs.unwrap_or(match self.backend_type {
            BackendType::File => 5,
            BackendType::Etcd => 10,
            BackendType::Consul => 20,
        });
        Duration::from_secs(secs)
    }

    /// Identity the store is secured with, if authentication is configured
    pub fn credential(&self) -> Option<BackendCredential> {
        match self.backend_type {
            BackendType::File => None,
            BackendType::Etcd => match (&self.username, &self.password) {
                (Some(user), Some(password)) => {
                    Some(BackendCredential::new(user.as_str(), password.as_str(), self.role.as_str()))
                }
                _ => None,
            },
            BackendType::Consul => self
                .token
                .as_ref()
                .map(|token| BackendCredential::new("consul", token.as_str(), "management")),
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        match self.backend_type {
            BackendType::File => {
                if let Err(e) = crate::dynamic::FileFormat::from_path(&self.dynamic_config_file) {
                    errors.push(format!("backend.dynamic_config_file: {}", e));
                }
            }
            BackendType::Etcd => {
                if self.username.is_some() != self.password.is_some() {
                    errors.push("backend: 'username' and 'password' must be set together".to_string());
                }
            }
            BackendType::Consul => {
                if self.username.is_some() || self.password.is_some() {
                    errors.push("backend: consul uses 'token', not 'username'/'password'".to_string());
                }
            }
        }

        if self.root_key.trim_matches('/').is_empty() {
            errors.push("backend.root_key must not be empty".to_string());
        }
        if let Some(ref endpoint) = self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                errors.push(format!("backend.endpoint '{}' must be an http(s) URL", endpoint));
            }
        }
        if self.max_txn_ops == Some(0) {
            errors.push("backend.max_txn_ops must be greater than 0".to_string());
        }
        if self.max_txn_ops.is_some() && self.backend_type != BackendType::Etcd {
            errors.push("backend.max_txn_ops only applies to etcd".to_string());
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl BackoffConfig {
    /// Policy with this schedule and the given deadline
    pub fn policy(&self, timeout: Duration) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            timeout,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("./dependencies")
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_unverified() -> UnverifiedPolicy {
    UnverifiedPolicy::Refuse
}

fn default_release_url() -> String {
    DEFAULT_RELEASE_URL.to_string()
}

fn default_public_url() -> String {
    "https://127.0.0.1:8000".to_string()
}

fn default_api_url() -> String {
    "http://127.0.0.1:8099".to_string()
}

fn default_public_entrypoint() -> String {
    "https".to_string()
}

fn default_api_entrypoint() -> String {
    "auth_api".to_string()
}

fn default_api_username() -> String {
    "api_admin".to_string()
}

fn default_api_password() -> String {
    "admin".to_string()
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_providers_throttle() -> String {
    "0s".to_string()
}

fn default_proxy_startup_timeout() -> u64 {
    30
}

fn default_check_route_timeout() -> u64 {
    45
}

fn default_proxy_stop_grace() -> u64 {
    5
}

fn default_dynamic_config_file() -> PathBuf {
    PathBuf::from("./rules.toml")
}

fn default_root_key() -> String {
    crate::backend::DEFAULT_ROOT_KEY.to_string()
}

fn default_role() -> String {
    "root".to_string()
}

fn default_initial_delay() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    5000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.install.version.trim_start_matches('v').split('.').count() != 3 {
            errors.push(format!(
                "install.version '{}' must look like X.Y.Z",
                self.install.version
            ));
        }
        if let Some(ref platform) = self.install.platform {
            if let Err(e) = platform.parse::<crate::installer::Platform>() {
                errors.push(e.to_string());
            }
        }

        for (field, url) in [
            ("proxy.public_url", &self.proxy.public_url),
            ("proxy.api_url", &self.proxy.api_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("{} '{}' must be an http(s) URL", field, url));
            }
        }
        if self.proxy.check_route_timeout_secs == 0 {
            errors.push("proxy.check_route_timeout_secs must be greater than 0".to_string());
        }

        self.backend.validate(&mut errors);

        if self.backoff.initial_delay_ms == 0 {
            errors.push("backoff.initial_delay_ms must be greater than 0".to_string());
        }
        if self.backoff.multiplier < 1.0 {
            errors.push("backoff.multiplier must be at least 1.0".to_string());
        }
        if self.backoff.max_delay_ms < self.backoff.initial_delay_ms {
            errors.push("backoff.max_delay_ms must not be below initial_delay_ms".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
