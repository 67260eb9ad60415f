//! Consul KV through the HTTP API
//!
//! Consul limits a transaction to 64 operations. Larger preloads are sent as
//! several transactions in order and are therefore not atomic as a whole.

use super::{endpoint_port, host_port, DEFAULT_ROOT_KEY};
use crate::error::{BootstrapError, Result};
use crate::preload::{BackendCredential, PreloadOp, PreloadTransaction};
use crate::supervisor::ServiceSpec;
use anyhow::Context;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Operations Consul accepts in a single `/v1/txn` request
pub const MAX_TXN_OPS: usize = 64;

const TOKEN_HEADER: &str = "X-Consul-Token";

pub struct ConsulBackend {
    endpoint: String,
    root_key: String,
    /// consul executable; `None` attaches to an already running agent
    command: Option<PathBuf>,
    config_dir: Option<tempfile::TempDir>,
    /// First of the six non-HTTP ports a launched agent binds
    aux_port_base: Option<u16>,
    /// ACL token; for a launched agent also its initial management token
    token: Option<String>,
    client: reqwest::Client,
}

impl ConsulBackend {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            root_key: DEFAULT_ROOT_KEY.to_string(),
            command: None,
            config_dir: None,
            aux_port_base: None,
            token: None,
            client: super::http_client()?,
        })
    }

    /// Launch a dev-mode agent from this executable
    pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Bind the agent's DNS, server, serf and gRPC ports from `base` upwards
    /// instead of right after the HTTP port
    pub fn with_aux_port_base(mut self, base: u16) -> Self {
        self.aux_port_base = Some(base);
        self
    }

    /// Enable ACLs with this token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_root_key(mut self, root_key: impl Into<String>) -> Self {
        self.root_key = root_key.into().trim_end_matches('/').to_string();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn root_key(&self) -> &str {
        &self.root_key
    }

    pub fn prepare_launch(&mut self) -> Result<Option<ServiceSpec>> {
        let Some(ref command) = self.command else {
            return Ok(None);
        };
        let port = endpoint_port(&self.endpoint)?;
        let ports = AgentPorts::after(self.aux_port_base.unwrap_or(port.saturating_add(1)))?;

        let mut spec = ServiceSpec::new("consul", command).args([
            "agent".to_string(),
            "-dev".to_string(),
            "-client=127.0.0.1".to_string(),
            format!("-http-port={}", port),
        ]);
        spec = spec.args(ports.args());

        if let Some(ref token) = self.token {
            let dir = tempfile::Builder::new().prefix("consul-").tempdir()?;
            let acl_config = json!({
                "acl": {
                    "enabled": true,
                    "default_policy": "deny",
                    "down_policy": "extend-cache",
                    "tokens": { "initial_management": token },
                }
            });
            let path = dir.path().join("acl.json");
            std::fs::write(&path, acl_config.to_string())?;
            spec = spec.arg(format!("-config-file={}", path.display()));
            self.config_dir = Some(dir);
        }

        Ok(Some(spec))
    }

    /// The agent is usable once it reports a raft leader
    pub async fn probe(&self) -> anyhow::Result<bool> {
        let url = format!("{}/v1/status/leader", self.endpoint);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("{} returned {}", url, status);
        }
        let leader: String = response.json().await.context("invalid leader response")?;
        Ok(!leader.is_empty())
    }

    /// ACLs are switched on at agent launch; this checks the credential's
    /// secret is a valid token and adopts it
    pub async fn bootstrap_auth(&mut self, credential: &BackendCredential) -> Result<()> {
        let url = format!("{}/v1/acl/token/self", self.endpoint);
        let result = async {
            let response = self
                .client
                .get(&url)
                .header(TOKEN_HEADER, &credential.secret)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("{} returned {}: {}", url, status, body.trim());
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        result.map_err(|source| BootstrapError::AuthBootstrap {
            backend: "consul",
            step: "verify token",
            source,
        })?;
        debug!(principal = %credential.principal, "Consul token verified");
        self.token = Some(credential.secret.clone());
        Ok(())
    }

    pub async fn apply(&self, txn: &PreloadTransaction) -> Result<()> {
        let failed = |source| BootstrapError::PreloadTransaction {
            backend: "consul",
            source,
        };

        let ops = txn
            .ops()
            .iter()
            .map(txn_op)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(failed)?;

        let chunks: Vec<&[Value]> = ops.chunks(MAX_TXN_OPS).collect();
        if chunks.len() > 1 {
            warn!(
                ops = ops.len(),
                transactions = chunks.len(),
                "Preload exceeds Consul's transaction limit, applying non-atomically"
            );
        }

        for (index, chunk) in chunks.iter().enumerate() {
            self.submit(chunk)
                .await
                .with_context(|| format!("transaction {} of {}", index + 1, chunks.len()))
                .map_err(failed)?;
        }
        info!(ops = ops.len(), "Consul transaction committed");
        Ok(())
    }

    async fn submit(&self, ops: &[Value]) -> anyhow::Result<()> {
        let url = format!("{}/v1/txn", self.endpoint);
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&ops)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let reasons = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| {
                v.get("Errors").and_then(Value::as_array).map(|errors| {
                    errors
                        .iter()
                        .filter_map(|e| e.get("What").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("; ")
                })
            })
            .filter(|r| !r.is_empty())
            .unwrap_or(text);
        anyhow::bail!("{} returned {}: {}", url, status, reasons.trim())
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match self.token {
            Some(ref token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    pub fn proxy_args(&self) -> Vec<String> {
        vec![
            "--providers.consul".to_string(),
            format!("--providers.consul.endpoints={}", host_port(&self.endpoint)),
            format!("--providers.consul.rootKey={}", self.root_key),
        ]
    }

    pub fn proxy_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(ref token) = self.token {
            env.insert("CONSUL_HTTP_TOKEN".to_string(), token.clone());
        }
        env
    }

    pub fn cleanup(&mut self) {
        if let Some(dir) = self.config_dir.take() {
            debug!(path = %dir.path().display(), "Removing consul config directory");
        }
    }
}

/// Ports a `-dev` agent binds besides HTTP; all remapped so that several
/// agents can run side by side
struct AgentPorts {
    dns: u16,
    server: u16,
    serf_lan: u16,
    serf_wan: u16,
    grpc: u16,
    grpc_tls: u16,
}

impl AgentPorts {
    fn after(base: u16) -> Result<Self> {
        if base.checked_add(5).is_none() {
            return Err(BootstrapError::Config(format!(
                "consul port range starting at {} overflows",
                base
            )));
        }
        Ok(Self {
            dns: base,
            server: base + 1,
            serf_lan: base + 2,
            serf_wan: base + 3,
            grpc: base + 4,
            grpc_tls: base + 5,
        })
    }

    fn args(&self) -> Vec<String> {
        vec![
            format!("-dns-port={}", self.dns),
            format!("-server-port={}", self.server),
            format!("-serf-lan-port={}", self.serf_lan),
            format!("-serf-wan-port={}", self.serf_wan),
            format!("-grpc-port={}", self.grpc),
            format!("-grpc-tls-port={}", self.grpc_tls),
        ]
    }
}

fn txn_op(op: &PreloadOp) -> anyhow::Result<Value> {
    match op {
        PreloadOp::Put { key, value } => Ok(json!({
            "KV": { "Verb": "set", "Key": key, "Value": B64.encode(value) }
        })),
        PreloadOp::Delete { key } => Ok(json!({
            "KV": { "Verb": "delete", "Key": key }
        })),
        PreloadOp::DeletePrefix { prefix } => Ok(json!({
            "KV": { "Verb": "delete-tree", "Key": prefix }
        })),
        PreloadOp::Rewrite { .. } => anyhow::bail!("consul does not accept whole-file rewrites"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockResponse, MockServer};

    #[tokio::test]
    async fn test_probe_requires_leader() {
        let server = MockServer::start(|_| MockResponse::ok(r#""127.0.0.1:8300""#)).await;
        let backend = ConsulBackend::new(server.url()).unwrap();
        assert!(backend.probe().await.unwrap());
        assert_eq!(server.requests()[0].path, "/v1/status/leader");

        let server = MockServer::start(|_| MockResponse::ok(r#""""#)).await;
        let backend = ConsulBackend::new(server.url()).unwrap();
        assert!(!backend.probe().await.unwrap());
    }

    #[tokio::test]
    async fn test_preload_sends_verbs() {
        let server = MockServer::start(|_| MockResponse::json(json!({ "Results": [], "Errors": null }))).await;
        let backend = ConsulBackend::new(server.url()).unwrap().with_token("s3cret");
        let txn = PreloadTransaction::new()
            .delete_prefix("traefik/")
            .put("traefik/http/routers/route_api/service", "api@internal")
            .delete("traefik/http/routers/route_old/rule");

        backend.apply(&txn).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "PUT");
        assert_eq!(requests[0].path, "/v1/txn");
        assert_eq!(requests[0].header("x-consul-token"), Some("s3cret"));

        let body = requests[0].json();
        assert_eq!(body[0]["KV"]["Verb"], "delete-tree");
        assert_eq!(body[0]["KV"]["Key"], "traefik/");
        assert_eq!(body[1]["KV"]["Verb"], "set");
        assert_eq!(body[1]["KV"]["Value"], B64.encode("api@internal"));
        assert_eq!(body[2]["KV"]["Verb"], "delete");
        assert_eq!(body[2]["KV"]["Key"], "traefik/http/routers/route_old/rule");
    }

    #[tokio::test]
    async fn test_large_preload_is_split() {
        let server = MockServer::start(|_| MockResponse::json(json!({ "Results": [] }))).await;
        let backend = ConsulBackend::new(server.url()).unwrap();
        let mut txn = PreloadTransaction::new();
        for i in 0..130 {
            txn = txn.put(format!("traefik/k{}", i), "v");
        }

        backend.apply(&txn).await.unwrap();

        let sizes: Vec<usize> = server
            .requests()
            .iter()
            .map(|r| r.json().as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![64, 64, 2]);
    }

    #[tokio::test]
    async fn test_rejected_transaction_reports_reason() {
        let server = MockServer::start(|_| {
            MockResponse::status(
                409,
                json!({ "Results": null, "Errors": [{ "OpIndex": 0, "What": "Permission denied" }] })
                    .to_string(),
            )
        })
        .await;
        let backend = ConsulBackend::new(server.url()).unwrap();

        let err = backend
            .apply(&PreloadTransaction::new().put("traefik/a", "b"))
            .await
            .unwrap_err();
        match err {
            BootstrapError::PreloadTransaction { backend, source } => {
                assert_eq!(backend, "consul");
                assert!(format!("{source:#}").contains("Permission denied"));
            }
            other => panic!("expected PreloadTransaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_verifies_token() {
        let server = MockServer::start(|req| {
            if req.header("x-consul-token") == Some("s3cret") {
                MockResponse::json(json!({ "AccessorID": "a", "SecretID": "s3cret" }))
            } else {
                MockResponse::status(403, "ACL not found")
            }
        })
        .await;

        let mut backend = ConsulBackend::new(server.url()).unwrap();
        let wrong = BackendCredential::new("gateway", "nope", "management");
        match backend.bootstrap_auth(&wrong).await.unwrap_err() {
            BootstrapError::AuthBootstrap { backend, step, .. } => {
                assert_eq!(backend, "consul");
                assert_eq!(step, "verify token");
            }
            other => panic!("expected AuthBootstrap, got {other:?}"),
        }
        assert!(backend.proxy_env().is_empty());

        let right = BackendCredential::new("gateway", "s3cret", "management");
        backend.bootstrap_auth(&right).await.unwrap();
        assert_eq!(
            backend.proxy_env().get("CONSUL_HTTP_TOKEN").map(String::as_str),
            Some("s3cret")
        );
        assert_eq!(server.requests()[1].path, "/v1/acl/token/self");
    }

    #[test]
    fn test_launch_with_acls() {
        let mut backend = ConsulBackend::new("http://127.0.0.1:8501")
            .unwrap()
            .with_command("/usr/bin/consul")
            .with_token("s3cret");
        let spec = backend.prepare_launch().unwrap().unwrap();

        assert_eq!(spec.args[..4], ["agent", "-dev", "-client=127.0.0.1", "-http-port=8501"]);
        let config_file = spec
            .args
            .iter()
            .find_map(|arg| arg.strip_prefix("-config-file="))
            .unwrap()
            .to_string();
        let config_file = config_file.as_str();
        let written: Value = serde_json::from_str(&std::fs::read_to_string(config_file).unwrap()).unwrap();
        assert_eq!(written["acl"]["enabled"], true);
        assert_eq!(written["acl"]["tokens"]["initial_management"], "s3cret");

        backend.cleanup();
        assert!(!std::path::Path::new(config_file).exists());
    }

    #[test]
    fn test_launched_agents_use_disjoint_ports() {
        let mut first = ConsulBackend::new("http://127.0.0.1:8500")
            .unwrap()
            .with_command("consul");
        let mut second = ConsulBackend::new("http://127.0.0.1:8510")
            .unwrap()
            .with_command("consul");
        let first = first.prepare_launch().unwrap().unwrap();
        let second = second.prepare_launch().unwrap().unwrap();

        assert_eq!(
            first.args[4..],
            [
                "-dns-port=8501",
                "-server-port=8502",
                "-serf-lan-port=8503",
                "-serf-wan-port=8504",
                "-grpc-port=8505",
                "-grpc-tls-port=8506",
            ]
        );
        let ports = |args: &[String]| -> Vec<u16> {
            args.iter()
                .filter_map(|arg| arg.rsplit_once("-port=").and_then(|(_, p)| p.parse().ok()))
                .collect()
        };
        let (a, b) = (ports(&first.args), ports(&second.args));
        assert_eq!(a.len(), 7);
        assert!(a.iter().all(|port| !b.contains(port)), "{a:?} vs {b:?}");
    }

    #[test]
    fn test_explicit_aux_port_base() {
        let mut backend = ConsulBackend::new("http://127.0.0.1:8500")
            .unwrap()
            .with_command("consul")
            .with_aux_port_base(18600);
        let spec = backend.prepare_launch().unwrap().unwrap();
        assert!(spec.args.contains(&"-dns-port=18600".to_string()));
        assert!(spec.args.contains(&"-grpc-tls-port=18605".to_string()));

        let mut overflow = ConsulBackend::new("http://127.0.0.1:8500")
            .unwrap()
            .with_command("consul")
            .with_aux_port_base(65533);
        assert!(matches!(overflow.prepare_launch(), Err(BootstrapError::Config(_))));
    }

    #[test]
    fn test_proxy_args() {
        let backend = ConsulBackend::new("http://127.0.0.1:8500").unwrap();
        assert_eq!(
            backend.proxy_args(),
            vec![
                "--providers.consul",
                "--providers.consul.endpoints=127.0.0.1:8500",
                "--providers.consul.rootKey=traefik",
            ]
        );
    }
}
