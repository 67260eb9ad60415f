//! etcd v3 through its JSON gateway
//!
//! Keys and values travel base64-encoded. A preload is a single `/v3/kv/txn`
//! request with an empty compare list, so either every operation commits or
//! none does.

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
use tracing::{debug, info};

/// etcd's own default for `--max-txn-ops`
pub const DEFAULT_MAX_TXN_OPS: usize = 128;

/// How the proxy and this client trust an etcd served over TLS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdTls {
    pub ca_cert: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

pub struct EtcdBackend {
    endpoint: String,
    root_key: String,
    /// etcd executable; `None` attaches to an already running store
    command: Option<PathBuf>,
    data_dir: Option<tempfile::TempDir>,
    /// Peer port of a launched member (default: client port + 1)
    peer_port: Option<u16>,
    /// Largest transaction the store accepts; passed to a launched member
    max_txn_ops: usize,
    credential: Option<BackendCredential>,
    tls: EtcdTls,
    client: reqwest::Client,
}

impl EtcdBackend {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            root_key: DEFAULT_ROOT_KEY.to_string(),
            command: None,
            data_dir: None,
            peer_port: None,
            max_txn_ops: DEFAULT_MAX_TXN_OPS,
            credential: None,
            tls: EtcdTls::default(),
            client: super::http_client()?,
        })
    }

    /// Launch etcd from this executable instead of attaching to a running one
    pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Authenticate with this identity (for a store that already has auth enabled)
    pub fn with_credential(mut self, credential: BackendCredential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_peer_port(mut self, port: u16) -> Self {
        self.peer_port = Some(port);
        self
    }

    /// Transaction size limit; must match the store's `--max-txn-ops`
    pub fn with_max_txn_ops(mut self, max: usize) -> Self {
        self.max_txn_ops = max.max(1);
        self
    }

    pub fn max_txn_ops(&self) -> usize {
        self.max_txn_ops
    }

    pub fn with_root_key(mut self, root_key: impl Into<String>) -> Self {
        self.root_key = root_key.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_tls(mut self, tls: EtcdTls) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .danger_accept_invalid_certs(tls.insecure_skip_verify);
        if let Some(ref ca) = tls.ca_cert {
            let pem = std::fs::read(ca)
                .with_context(|| format!("Failed to read etcd CA certificate {}", ca.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid etcd CA certificate {}", ca.display()))?;
            builder = builder.add_root_certificate(cert);
        }
        self.client = builder.build().context("Failed to create HTTP client")?;
        self.tls = tls;
        Ok(self)
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
        let client_port = endpoint_port(&self.endpoint)?;
        let peer_port = match self.peer_port {
            Some(port) => port,
            None => client_port.checked_add(1).ok_or_else(|| {
                BootstrapError::Config(format!("no peer port after client port {}", client_port))
            })?,
        };
        let peer_url = format!("http://127.0.0.1:{}", peer_port);
        let data_dir = tempfile::Builder::new().prefix("etcd-").tempdir()?;

        let spec = ServiceSpec::new("etcd", command)
            .arg("--name=default")
            .arg(format!("--data-dir={}", data_dir.path().display()))
            .arg(format!("--listen-client-urls={}", self.endpoint))
            .arg(format!("--advertise-client-urls={}", self.endpoint))
            .arg(format!("--listen-peer-urls={}", peer_url))
            .arg(format!("--initial-advertise-peer-urls={}", peer_url))
            .arg(format!("--initial-cluster=default={}", peer_url))
            .arg(format!("--max-txn-ops={}", self.max_txn_ops))
            .env("ETCDCTL_API", "3");
        self.data_dir = Some(data_dir);
        Ok(Some(spec))
    }

    /// `/health` reports `{"health":"true"}` once the member can serve
    pub async fn probe(&self) -> anyhow::Result<bool> {
        let url = format!("{}/health", self.endpoint);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("{} returned {}", url, status);
        }
        let body: Value = response.json().await.context("invalid /health response")?;
        Ok(body.get("health").and_then(Value::as_str) == Some("true"))
    }

    /// `user add`, `grant role`, `auth enable`; the first failure is returned as is
    pub async fn bootstrap_auth(&mut self, credential: &BackendCredential) -> Result<()> {
        let steps: [(&'static str, &str, Value); 3] = [
            (
                "user add",
                "/v3/auth/user/add",
                json!({ "name": credential.principal, "password": credential.secret }),
            ),
            (
                "grant role",
                "/v3/auth/user/grant",
                json!({ "user": credential.principal, "role": credential.role }),
            ),
            ("auth enable", "/v3/auth/enable", json!({})),
        ];

        for (step, path, body) in steps {
            self.post(path, &body, None)
                .await
                .map_err(|source| BootstrapError::AuthBootstrap {
                    backend: "etcd",
                    step,
                    source,
                })?;
            debug!(step, "etcd auth step done");
        }

        self.credential = Some(credential.clone());
        Ok(())
    }

    pub async fn apply(&self, txn: &PreloadTransaction) -> Result<()> {
        let failed = |source| BootstrapError::PreloadTransaction {
            backend: "etcd",
            source,
        };

        if txn.len() > self.max_txn_ops {
            return Err(failed(anyhow::anyhow!(
                "transaction of {} operations exceeds the limit of {} (--max-txn-ops)",
                txn.len(),
                self.max_txn_ops
            )));
        }

        let ops = txn
            .ops()
            .iter()
            .map(txn_request)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(failed)?;
        let token = self.authenticate().await.map_err(failed)?;

        let response = self
            .post("/v3/kv/txn", &json!({ "success": ops }), token.as_deref())
            .await
            .map_err(failed)?;

        if response.get("succeeded").and_then(Value::as_bool) == Some(false) {
            return Err(failed(anyhow::anyhow!("transaction not applied")));
        }
        info!(ops = txn.len(), "etcd transaction committed");
        Ok(())
    }

    /// Auth token for the configured credential, if any
    async fn authenticate(&self) -> anyhow::Result<Option<String>> {
        let Some(ref credential) = self.credential else {
            return Ok(None);
        };
        let response = self
            .post(
                "/v3/auth/authenticate",
                &json!({ "name": credential.principal, "password": credential.secret }),
                None,
            )
            .await
            .context("authentication failed")?;
        let token = response
            .get("token")
            .and_then(Value::as_str)
            .context("authenticate response has no token")?;
        Ok(Some(token.to_string()))
    }

    async fn post(&self, path: &str, body: &Value, token: Option<&str>) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.endpoint, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = token {
            request = request.header("Authorization", token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .or_else(|| v.get("error"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or(text);
            anyhow::bail!("{} returned {}: {}", path, status, message);
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("invalid response from {}", path))
    }

    pub fn proxy_args(&self) -> Vec<String> {
        let mut args = vec![
            "--providers.etcd".to_string(),
            format!("--providers.etcd.endpoints={}", host_port(&self.endpoint)),
            format!("--providers.etcd.rootKey={}", self.root_key),
        ];
        if let Some(ref credential) = self.credential {
            args.push(format!("--providers.etcd.username={}", credential.principal));
            args.push(format!("--providers.etcd.password={}", credential.secret));
        }
        if self.tls.insecure_skip_verify {
            args.push("--providers.etcd.tls.insecureSkipVerify=true".to_string());
        }
        if let Some(ref ca) = self.tls.ca_cert {
            args.push(format!("--providers.etcd.tls.ca={}", ca.display()));
        }
        args
    }

    pub fn proxy_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("ETCDCTL_API".to_string(), "3".to_string())])
    }

    pub fn cleanup(&mut self) {
        if let Some(dir) = self.data_dir.take() {
            debug!(path = %dir.path().display(), "Removing etcd data directory");
        }
    }
}

fn txn_request(op: &PreloadOp) -> anyhow::Result<Value> {
    match op {
        PreloadOp::Put { key, value } => Ok(json!({
            "requestPut": { "key": B64.encode(key), "value": B64.encode(value) }
        })),
        PreloadOp::Delete { key } => Ok(json!({
            "requestDeleteRange": { "key": B64.encode(key) }
        })),
        PreloadOp::DeletePrefix { prefix } => Ok(json!({
            "requestDeleteRange": {
                "key": B64.encode(prefix),
                "range_end": B64.encode(prefix_end(prefix.as_bytes())),
            }
        })),
        PreloadOp::Rewrite { .. } => anyhow::bail!("etcd does not accept whole-file rewrites"),
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: the range covers all keys
    vec![0]
}
