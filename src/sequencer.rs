//! Ordered bring-up and teardown of the backend store and the proxy
//!
//! ```text
//! Idle -> Installing -> BackendStarting -> BackendReady -> Preloading
//!      -> ProxyStarting -> Converged -> Running -> Stopping -> Stopped
//! ```
//!
//! Any failure on the way up moves to `Failed` after tearing down whatever
//! was started, in reverse order. `bring_up` may be called again from
//! `Stopped` or `Failed`.

use crate::backend::Backend;
use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::convergence::{ConvergenceGate, ConvergenceTarget, Reachability};
use crate::dynamic::{DynamicConfig, API_ROUTER};
use crate::error::{BootstrapError, Result};
use crate::installer::{ArtifactInstaller, Installation, Platform};
use crate::preload;
use crate::supervisor::{ServiceSpec, ServiceSupervisor};
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Where a sequencer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Installing,
    BackendStarting,
    BackendReady,
    Preloading,
    ProxyStarting,
    Converged,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Installing => "installing",
            Phase::BackendStarting => "starting backend",
            Phase::BackendReady => "backend ready",
            Phase::Preloading => "preloading",
            Phase::ProxyStarting => "starting proxy",
            Phase::Converged => "converged",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Brings up one proxy and its configuration store and tears them down
pub struct Sequencer {
    config: Config,
    installer: ArtifactInstaller,
    backend: Backend,
    gate: ConvergenceGate,
    backend_process: Option<ServiceSupervisor>,
    proxy_process: Option<ServiceSupervisor>,
    installation: Option<Installation>,
    dynamic: DynamicConfig,
    phase: Phase,
}

impl Sequencer {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let installer = ArtifactInstaller::new(&config.install.dir, config.install.unverified)?
            .with_release_url(config.install.release_url.clone());
        let backend = Backend::from_config(&config.backend)?;

        Ok(Self {
            installer,
            backend,
            gate: ConvergenceGate::new()?,
            backend_process: None,
            proxy_process: None,
            installation: None,
            dynamic: DynamicConfig::new(),
            phase: Phase::Idle,
            config,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The proxy install used by the last bring-up, if one was needed
    pub fn installation(&self) -> Option<&Installation> {
        self.installation.as_ref()
    }

    /// The dynamic configuration last committed to the backend
    pub fn dynamic_config(&self) -> &DynamicConfig {
        &self.dynamic
    }

    pub fn proxy_pid(&self) -> Option<u32> {
        self.proxy_process.as_ref().and_then(ServiceSupervisor::pid)
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_process.as_ref().and_then(ServiceSupervisor::pid)
    }

    /// Run every bring-up phase in order, ending in `Running`.
    ///
    /// On failure everything already started is torn down and the phase is
    /// left at `Failed`.
    pub async fn bring_up(&mut self) -> Result<()> {
        if !matches!(self.phase, Phase::Idle | Phase::Stopped | Phase::Failed) {
            return Err(BootstrapError::InvalidState {
                operation: "bring up",
                state: self.phase.to_string(),
            });
        }

        match self.run_bring_up().await {
            Ok(()) => {
                self.phase = Phase::Running;
                info!(backend = self.backend.name(), public_url = %self.config.proxy.public_url, "Gateway running");
                Ok(())
            }
            Err(e) => {
                error!(phase = %self.phase, error = %e, "Bring-up failed, tearing down");
                if let Err(teardown_err) = self.release().await {
                    warn!(error = %teardown_err, "Teardown after failed bring-up was incomplete");
                }
                self.phase = Phase::Failed;
                Err(e)
            }
        }
    }

    async fn run_bring_up(&mut self) -> Result<()> {
        self.phase = Phase::Installing;
        let proxy_binary = self.install_proxy().await?;

        self.phase = Phase::BackendStarting;
        self.start_backend().await?;
        self.phase = Phase::BackendReady;
        info!(backend = self.backend.name(), pid = ?self.backend_pid(), "Backend ready");

        self.phase = Phase::Preloading;
        if self.needs_auth_bootstrap() {
            if let Some(credential) = self.config.backend.credential() {
                preload::bootstrap_auth(&mut self.backend, &credential).await?;
            }
        }
        let initial = self.with_api_auth(DynamicConfig::new());
        let txn = self.backend.replace_transaction(&initial)?;
        preload::preload(&mut self.backend, &txn).await?;
        self.dynamic = initial;

        self.phase = Phase::ProxyStarting;
        self.start_proxy(proxy_binary).await?;
        self.phase = Phase::Converged;

        self.await_router(API_ROUTER).await
    }

    async fn install_proxy(&mut self) -> Result<Option<PathBuf>> {
        let proxy = &self.config.proxy;
        if !proxy.launch {
            info!("Proxy is external, skipping install");
            return Ok(None);
        }
        if let Some(ref command) = proxy.command {
            return Ok(Some(command.clone()));
        }

        let platform = match self.config.install.platform {
            Some(ref platform) => platform.parse::<Platform>()?,
            None => Platform::current(),
        };
        let target = self.installer.resolve(&self.config.install.version, &platform);
        let installation = self.installer.install(&target).await?;
        let binary = installation.binary.clone();
        self.installation = Some(installation);
        Ok(Some(binary))
    }

    async fn start_backend(&mut self) -> Result<()> {
        let policy = self.policy(self.config.backend.startup_timeout());
        let spec = if self.config.backend.launch {
            self.backend.prepare_launch()?
        } else {
            None
        };

        let backend = &self.backend;
        match spec {
            Some(spec) => {
                let process = self.backend_process.insert(ServiceSupervisor::start(spec)?);
                process.wait_healthy(|| backend.probe(), &policy).await
            }
            None => match policy.wait_until(|| backend.probe()).await {
                Ok(attempts) => {
                    info!(backend = backend.name(), attempts, "Backend reachable");
                    Ok(())
                }
                Err(timeout) => Err(BootstrapError::HealthTimeout {
                    name: backend.name().to_string(),
                    elapsed: timeout.elapsed,
                    attempts: timeout.attempts,
                    last_error: timeout.last_error,
                }),
            },
        }
    }

    /// Etcd users are only created in a store we launched; Consul tokens
    /// are verified either way
    fn needs_auth_bootstrap(&self) -> bool {
        match self.backend {
            Backend::File(_) => false,
            Backend::Etcd(_) => self.config.backend.launch,
            Backend::Consul(_) => true,
        }
    }

    async fn start_proxy(&mut self, binary: Option<PathBuf>) -> Result<()> {
        let policy = self.policy(self.config.proxy.startup_timeout());
        let public = Reachability::responds(self.config.proxy.public_url.clone());

        let Some(binary) = binary else {
            let target = ConvergenceTarget::new("public endpoint", public, policy.timeout);
            return self.gate.await_ready(&target, &policy).await;
        };

        let spec = self.proxy_spec(binary)?;
        let gate = &self.gate;
        let process = self.proxy_process.insert(ServiceSupervisor::start(spec)?);
        process.wait_healthy(|| gate.probe(&public), &policy).await
    }

    fn proxy_spec(&self, binary: PathBuf) -> Result<ServiceSpec> {
        let proxy = &self.config.proxy;
        let mut spec = ServiceSpec::new("traefik", binary);

        match proxy.static_config_file {
            Some(ref file) => {
                spec = spec.arg(format!("--configfile={}", file.display()));
            }
            None => {
                spec = spec
                    .arg("--api")
                    .arg(format!("--log.level={}", proxy.log_level))
                    .arg(format!(
                        "--providers.providersThrottleDuration={}",
                        proxy.providers_throttle
                    ))
                    .arg(format!(
                        "--entrypoints.{}.address=:{}",
                        proxy.public_entrypoint,
                        url_port(&proxy.public_url)?
                    ))
                    .arg(format!(
                        "--entrypoints.{}.address=:{}",
                        proxy.api_entrypoint,
                        url_port(&proxy.api_url)?
                    ))
                    .args(self.backend.proxy_args());
            }
        }

        for (key, value) in self.backend.proxy_env().into_iter().chain(proxy.env.clone()) {
            spec = spec.env(key, value);
        }
        Ok(spec)
    }

    /// Replace the dynamic configuration and wait until `router` is served.
    ///
    /// Only the keys that change are written to a KV store. The API router
    /// and its basic-auth middleware are always kept.
    pub async fn apply(&mut self, config: DynamicConfig, router: &str) -> Result<()> {
        if self.phase != Phase::Running {
            return Err(BootstrapError::InvalidState {
                operation: "apply configuration",
                state: self.phase.to_string(),
            });
        }

        let config = self.with_api_auth(config);
        self.commit(config).await?;
        self.await_router(router).await
    }

    /// Add one route to the current configuration and wait for it
    pub async fn add_route(&mut self, name: &str, rule: &str, target_url: &str) -> Result<()> {
        let mut config = self.dynamic.clone();
        config.add_route(name, rule, target_url, &self.config.proxy.public_entrypoint);
        self.apply(config, name).await
    }

    /// Remove one route from the current configuration.
    ///
    /// Returns once the backend has committed the change.
    pub async fn remove_route(&mut self, name: &str) -> Result<bool> {
        if self.phase != Phase::Running {
            return Err(BootstrapError::InvalidState {
                operation: "remove route",
                state: self.phase.to_string(),
            });
        }

        let mut config = self.dynamic.clone();
        if !config.remove_route(name) {
            return Ok(false);
        }
        self.commit(config).await?;
        Ok(true)
    }

    /// Send the difference from the committed configuration to `config`
    async fn commit(&mut self, config: DynamicConfig) -> Result<()> {
        let txn = self.backend.update_transaction(&self.dynamic, &config)?;
        if !txn.is_empty() {
            preload::preload(&mut self.backend, &txn).await?;
        }
        self.dynamic = config;
        Ok(())
    }

    /// Stop the proxy, then the backend. Safe to call repeatedly.
    pub async fn teardown(&mut self) -> Result<()> {
        match self.phase {
            Phase::Idle | Phase::Stopped | Phase::Failed => return Ok(()),
            _ => {}
        }

        info!(phase = %self.phase, "Tearing down");
        self.phase = Phase::Stopping;
        let result = self.release().await;
        self.phase = Phase::Stopped;
        info!("Teardown complete");
        result
    }

    /// Stop whatever is running in reverse start order; reports the first error
    async fn release(&mut self) -> Result<()> {
        let mut first_error = None;

        if let Some(mut proxy) = self.proxy_process.take() {
            if let Err(e) = proxy.stop(self.config.proxy.stop_grace()).await {
                warn!(error = %e, "Failed to stop proxy");
                first_error = first_error.or(Some(e));
            }
        }

        if let Some(mut store) = self.backend_process.take() {
            if let Err(e) = store.stop(self.backend.stop_grace()).await {
                warn!(error = %e, "Failed to stop backend");
                first_error = first_error.or(Some(e));
            }
        }
        self.backend.cleanup().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn with_api_auth(&self, config: DynamicConfig) -> DynamicConfig {
        let proxy = &self.config.proxy;
        config.with_api_auth(&proxy.api_username, &proxy.api_password, &proxy.api_entrypoint)
    }

    async fn await_router(&self, router: &str) -> Result<()> {
        let proxy = &self.config.proxy;
        let url = format!(
            "{}/api/http/routers/{}@{}",
            proxy.api_url.trim_end_matches('/'),
            router,
            self.backend.name()
        );
        let target = ConvergenceTarget::new(
            format!("router {}", router),
            Reachability::succeeds(url).with_basic_auth(&proxy.api_username, &proxy.api_password),
            proxy.check_route_timeout(),
        );
        let policy = self.policy(proxy.check_route_timeout());
        self.gate.await_ready(&target, &policy).await
    }

    fn policy(&self, timeout: std::time::Duration) -> BackoffPolicy {
        self.config.backoff.policy(timeout)
    }
}

/// Port of an http(s) URL, explicit or implied by the scheme
fn url_port(url: &str) -> Result<u16> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.port_or_known_default())
        .ok_or_else(|| BootstrapError::Config(format!("cannot determine port of '{}'", url)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendType;
    use crate::testing::{MockResponse, MockServer, RecordedRequest};
    use base64::Engine;
    use serde_json::json;

    fn quick(config: &mut Config) {
        config.backoff.initial_delay_ms = 10;
        config.backoff.max_delay_ms = 50;
        config.proxy.startup_timeout_secs = 2;
        config.proxy.check_route_timeout_secs = 2;
    }

    /// Stands in for a running proxy whose API knows every router
    async fn external_proxy() -> MockServer {
        let expected = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("api_admin:admin")
        );
        MockServer::start(move |req| {
            if !req.path.starts_with("/api/http/routers/") {
                return MockResponse::status(404, "404 page not found");
            }
            if req.header("authorization") != Some(expected.as_str()) {
                return MockResponse::status(401, "401 Unauthorized");
            }
            MockResponse::json(serde_json::json!({ "status": "enabled" }))
        })
        .await
    }

    fn file_config(dir: &std::path::Path, proxy: &MockServer) -> Config {
        let mut config = Config::default();
        quick(&mut config);
        config.proxy.launch = false;
        config.proxy.public_url = proxy.url();
        config.proxy.api_url = proxy.url();
        config.backend.backend_type = BackendType::File;
        config.backend.dynamic_config_file = dir.join("rules.toml");
        config
    }

    #[tokio::test]
    async fn test_bring_up_apply_teardown_with_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = external_proxy().await;
        let mut sequencer = Sequencer::new(file_config(dir.path(), &proxy)).unwrap();
        assert_eq!(sequencer.phase(), Phase::Idle);

        sequencer.bring_up().await.unwrap();
        assert_eq!(sequencer.phase(), Phase::Running);
        assert!(sequencer.installation().is_none());

        let rules_path = dir.path().join("rules.toml");
        let rules = std::fs::read_to_string(&rules_path).unwrap();
        assert!(rules.contains("api@internal"));
        assert!(proxy
            .requests()
            .iter()
            .any(|r| r.path == "/api/http/routers/route_api@file"));

        sequencer
            .add_route("route_user", "PathPrefix(`/user/alice`)", "http://127.0.0.1:9001")
            .await
            .unwrap();
        let rules = std::fs::read_to_string(&rules_path).unwrap();
        assert!(rules.contains("route_user"));
        assert!(rules.contains("route_api"), "API route is kept");
        assert!(proxy
            .requests()
            .iter()
            .any(|r| r.path == "/api/http/routers/route_user@file"));

        assert!(sequencer.remove_route("route_user").await.unwrap());
        assert!(!sequencer.dynamic_config().has_router("route_user"));
        assert!(!sequencer.remove_route("route_user").await.unwrap());

        sequencer.teardown().await.unwrap();
        assert_eq!(sequencer.phase(), Phase::Stopped);
        assert!(!rules_path.exists(), "created config file is removed");

        sequencer.teardown().await.unwrap();
        assert_eq!(sequencer.phase(), Phase::Stopped);

        let err = sequencer
            .apply(DynamicConfig::new(), "route_user")
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_bring_up_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = external_proxy().await;
        let mut sequencer = Sequencer::new(file_config(dir.path(), &proxy)).unwrap();

        sequencer.bring_up().await.unwrap();
        let err = sequencer.bring_up().await.unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidState { operation: "bring up", .. }));
        assert_eq!(sequencer.phase(), Phase::Running);

        sequencer.teardown().await.unwrap();
        sequencer.bring_up().await.unwrap();
        assert_eq!(sequencer.phase(), Phase::Running);
        sequencer.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_bring_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let mut config = Config::default();
        quick(&mut config);
        config.proxy.launch = false;
        config.backend.backend_type = BackendType::Etcd;
        config.backend.launch = false;
        config.backend.endpoint = Some(format!("http://{}", closed));
        config.backend.startup_timeout_secs = Some(1);

        let mut sequencer = Sequencer::new(config).unwrap();
        let err = sequencer.bring_up().await.unwrap_err();
        match err {
            BootstrapError::HealthTimeout { name, .. } => assert_eq!(name, "etcd"),
            other => panic!("expected HealthTimeout, got {other:?}"),
        }
        assert_eq!(sequencer.phase(), Phase::Failed);

        // Failed is terminal for teardown
        sequencer.teardown().await.unwrap();
        assert_eq!(sequencer.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_unconverged_proxy_fails_bring_up() {
        let dir = tempfile::tempdir().unwrap();
        // Answers every request, but never lists the API router
        let proxy = MockServer::start(|_| MockResponse::status(404, "404 page not found")).await;
        let mut config = file_config(dir.path(), &proxy);
        config.proxy.check_route_timeout_secs = 1;

        let mut sequencer = Sequencer::new(config).unwrap();
        let err = sequencer.bring_up().await.unwrap_err();
        assert!(matches!(err, BootstrapError::ConvergenceTimeout { .. }), "{err:?}");
        assert_eq!(sequencer.phase(), Phase::Failed);
        assert!(!dir.path().join("rules.toml").exists());
    }

    #[test]
    fn test_proxy_arguments_for_etcd() {
        let mut config = Config::default();
        config.backend.backend_type = BackendType::Etcd;
        config.backend.launch = false;
        config.backend.username = Some("root".to_string());
        config.backend.password = Some("secret".to_string());
        config.proxy.env.insert("TZ".to_string(), "UTC".to_string());

        let sequencer = Sequencer::new(config).unwrap();
        let spec = sequencer.proxy_spec(PathBuf::from("/opt/traefik")).unwrap();

        assert_eq!(spec.name, "traefik");
        assert_eq!(
            spec.args[..5],
            [
                "--api",
                "--log.level=debug",
                "--providers.providersThrottleDuration=0s",
                "--entrypoints.https.address=:8000",
                "--entrypoints.auth_api.address=:8099",
            ]
        );
        assert!(spec.args.contains(&"--providers.etcd".to_string()));
        assert!(spec.args.contains(&"--providers.etcd.username=root".to_string()));
        assert_eq!(spec.env.get("ETCDCTL_API").map(String::as_str), Some("3"));
        assert_eq!(spec.env.get("TZ").map(String::as_str), Some("UTC"));
        assert!(!spec.inherit_env);
    }

    #[test]
    fn test_static_config_file_replaces_arguments() {
        let mut config = Config::default();
        config.proxy.static_config_file = Some(PathBuf::from("/etc/traefik/traefik.toml"));

        let sequencer = Sequencer::new(config).unwrap();
        let spec = sequencer.proxy_spec(PathBuf::from("traefik")).unwrap();
        assert_eq!(spec.args, vec!["--configfile=/etc/traefik/traefik.toml"]);
    }

    /// One server answering both as etcd's JSON gateway and as the proxy
    async fn etcd_and_proxy(reject_txn: bool) -> MockServer {
        MockServer::start(move |req| match req.path.as_str() {
            "/health" => MockResponse::json(json!({ "health": "true" })),
            "/v3/auth/authenticate" => MockResponse::json(json!({ "token": "etcd-token" })),
            path if path.starts_with("/v3/auth/") => MockResponse::json(json!({})),
            "/v3/kv/txn" if reject_txn => MockResponse::status(
                400,
                json!({ "error": "etcdserver: permission denied" }).to_string(),
            ),
            "/v3/kv/txn" => MockResponse::json(json!({ "succeeded": true })),
            path if path.starts_with("/api/http/routers/") => {
                MockResponse::json(json!({ "status": "enabled" }))
            }
            _ => MockResponse::status(404, "404 page not found"),
        })
        .await
    }

    fn etcd_config(server: &MockServer) -> Config {
        let mut config = Config::default();
        quick(&mut config);
        config.proxy.launch = false;
        config.proxy.public_url = server.url();
        config.proxy.api_url = server.url();
        config.backend.backend_type = BackendType::Etcd;
        config.backend.launch = false;
        config.backend.endpoint = Some(server.url());
        config.backend.startup_timeout_secs = Some(2);
        config
    }

    fn is_proxy_request(req: &RecordedRequest) -> bool {
        req.path == "/" || req.path.starts_with("/api/")
    }

    fn position(requests: &[RecordedRequest], path: &str) -> usize {
        requests
            .iter()
            .position(|r| r.path == path)
            .unwrap_or_else(|| panic!("no request to {path}"))
    }

    fn txn_sizes(server: &MockServer) -> Vec<usize> {
        server
            .requests()
            .iter()
            .filter(|r| r.path == "/v3/kv/txn")
            .map(|r| r.json()["success"].as_array().map_or(0, Vec::len))
            .collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launched_etcd_secured_and_preloaded_before_proxy() {
        use std::os::unix::fs::PermissionsExt;

        // Stands in for the etcd executable; the mock answers its API
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("etcd");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let server = etcd_and_proxy(false).await;
        let mut config = etcd_config(&server);
        config.backend.launch = true;
        config.backend.command = Some(script);
        config.backend.username = Some("root".to_string());
        config.backend.password = Some("secret".to_string());

        let mut sequencer = Sequencer::new(config).unwrap();
        sequencer.bring_up().await.unwrap();
        assert_eq!(sequencer.phase(), Phase::Running);
        let backend_pid = sequencer.backend_pid().unwrap();

        let requests = server.requests();
        let user_add = position(&requests, "/v3/auth/user/add");
        let grant = position(&requests, "/v3/auth/user/grant");
        let enable = position(&requests, "/v3/auth/enable");
        let txn = position(&requests, "/v3/kv/txn");
        let first_proxy = requests.iter().position(is_proxy_request).unwrap();
        assert!(position(&requests, "/health") < user_add);
        assert!(user_add < grant && grant < enable && enable < txn);
        assert!(txn < first_proxy, "configuration committed before the proxy is contacted");
        assert_eq!(requests[txn].header("authorization"), Some("etcd-token"));
        assert!(requests
            .iter()
            .any(|r| r.path == "/api/http/routers/route_api@etcd"));

        sequencer.teardown().await.unwrap();
        assert!(sequencer.backend_pid().is_none());
        assert_ne!(unsafe { libc::kill(backend_pid as i32, 0) }, 0, "store process is gone");
    }

    #[tokio::test]
    async fn test_external_etcd_is_not_bootstrapped() {
        let server = etcd_and_proxy(false).await;
        let mut config = etcd_config(&server);
        config.backend.username = Some("root".to_string());
        config.backend.password = Some("secret".to_string());

        let mut sequencer = Sequencer::new(config).unwrap();
        sequencer.bring_up().await.unwrap();

        let requests = server.requests();
        assert!(!requests.iter().any(|r| r.path == "/v3/auth/user/add"));
        assert!(position(&requests, "/v3/auth/authenticate") < position(&requests, "/v3/kv/txn"));
        assert!(position(&requests, "/v3/kv/txn") < requests.iter().position(is_proxy_request).unwrap());
        sequencer.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_preload_never_reaches_proxy() {
        let server = etcd_and_proxy(true).await;
        let mut sequencer = Sequencer::new(etcd_config(&server)).unwrap();

        let err = sequencer.bring_up().await.unwrap_err();
        assert!(
            matches!(err, BootstrapError::PreloadTransaction { backend: "etcd", .. }),
            "{err:?}"
        );
        assert_eq!(sequencer.phase(), Phase::Failed);
        assert!(sequencer.proxy_pid().is_none());
        assert!(!server.requests().iter().any(is_proxy_request));
    }

    #[tokio::test]
    async fn test_route_changes_stay_within_etcd_transaction_limit() {
        let server = etcd_and_proxy(false).await;
        let mut sequencer = Sequencer::new(etcd_config(&server)).unwrap();
        sequencer.bring_up().await.unwrap();

        // 40 routes flatten to 160 keys, more than one etcd transaction holds
        for i in 0..40 {
            sequencer
                .add_route(
                    &format!("route_user{}", i),
                    &format!("PathPrefix(`/user/{}`)", i),
                    &format!("http://127.0.0.1:{}", 9000 + i),
                )
                .await
                .unwrap();
        }
        assert_eq!(sequencer.dynamic_config().router_names().len(), 41);

        let sizes = txn_sizes(&server);
        assert_eq!(sizes.len(), 41);
        assert!(sizes[1..].iter().all(|&ops| ops == 4), "{sizes:?}");

        assert!(sequencer.remove_route("route_user7").await.unwrap());
        assert_eq!(txn_sizes(&server).last(), Some(&4));

        // A single change larger than the limit is refused without a request
        let mut bulk = DynamicConfig::new();
        for i in 0..40 {
            bulk.add_route(&format!("bulk{}", i), "PathPrefix(`/bulk`)", "http://127.0.0.1:9999", "https");
        }
        let sent = server.request_count();
        let err = sequencer.apply(bulk, "bulk0").await.unwrap_err();
        assert!(matches!(err, BootstrapError::PreloadTransaction { .. }), "{err:?}");
        assert_eq!(server.request_count(), sent);
        assert_eq!(sequencer.phase(), Phase::Running);

        sequencer.teardown().await.unwrap();
    }

    #[test]
    fn test_url_port() {
        assert_eq!(url_port("https://127.0.0.1:8000").unwrap(), 8000);
        assert_eq!(url_port("https://gateway.example").unwrap(), 443);
        assert_eq!(url_port("http://gateway.example/").unwrap(), 80);
        assert!(url_port("gateway:8000").is_err());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::BackendStarting.to_string(), "starting backend");
        assert_eq!(Phase::Running.to_string(), "running");
    }
}
