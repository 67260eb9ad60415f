//! Seeding a backend with configuration before the proxy reads it
//!
//! A [`PreloadTransaction`] is an ordered list of operations that a backend
//! applies atomically where it can: etcd commits the whole list in one
//! `txn`, the file backend renames a complete file into place, and Consul
//! splits lists longer than its per-transaction limit (logged as non-atomic).

use crate::backend::Backend;
use crate::dynamic::DynamicConfig;
use crate::error::Result;
use std::collections::BTreeMap;
use tracing::info;

/// One step of a preload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadOp {
    Put { key: String, value: String },
    /// Remove exactly `key`
    Delete { key: String },
    /// Remove every key starting with `prefix`
    DeletePrefix { prefix: String },
    /// Replace a whole configuration file (file backend only)
    Rewrite { contents: String },
}

/// Ordered preload operations, applied in sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadTransaction {
    ops: Vec<PreloadOp>,
}

impl PreloadTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(PreloadOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(PreloadOp::Delete { key: key.into() });
        self
    }

    pub fn delete_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ops.push(PreloadOp::DeletePrefix {
            prefix: prefix.into(),
        });
        self
    }

    pub fn rewrite(mut self, contents: impl Into<String>) -> Self {
        self.ops.push(PreloadOp::Rewrite {
            contents: contents.into(),
        });
        self
    }

    /// Replace everything under `root` with the flattened `config`
    pub fn replace_kv(root: &str, config: &DynamicConfig) -> Self {
        let root = root.trim_end_matches('/');
        let mut txn = Self::new().delete_prefix(format!("{}/", root));
        for (key, value) in config.to_kv(root) {
            txn = txn.put(key, value);
        }
        txn
    }

    /// Move the keys under `root` from `current` to `desired`: deletes for
    /// keys that disappear, puts for keys that are new or changed
    pub fn update_kv(root: &str, current: &DynamicConfig, desired: &DynamicConfig) -> Self {
        let root = root.trim_end_matches('/');
        let current: BTreeMap<String, String> = current.to_kv(root).into_iter().collect();
        let desired: BTreeMap<String, String> = desired.to_kv(root).into_iter().collect();

        let mut txn = Self::new();
        for key in current.keys().filter(|key| !desired.contains_key(*key)) {
            txn = txn.delete(key.as_str());
        }
        for (key, value) in &desired {
            if current.get(key) != Some(value) {
                txn = txn.put(key.as_str(), value.as_str());
            }
        }
        txn
    }

    pub fn ops(&self) -> &[PreloadOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Identity a backend is secured with
#[derive(Clone, PartialEq, Eq)]
pub struct BackendCredential {
    pub principal: String,
    pub secret: String,
    pub role: String,
}

impl BackendCredential {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
            role: role.into(),
        }
    }
}

impl std::fmt::Debug for BackendCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredential")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("role", &self.role)
            .finish()
    }
}

/// Apply `txn` to the backend. On error nothing may depend on the contents.
pub async fn preload(backend: &mut Backend, txn: &PreloadTransaction) -> Result<()> {
    info!(backend = backend.name(), ops = txn.len(), "Preloading configuration");
    backend.apply(txn).await?;
    info!(backend = backend.name(), "Preload committed");
    Ok(())
}

/// Secure the backend with `credential`; every step must succeed in order
pub async fn bootstrap_auth(backend: &mut Backend, credential: &BackendCredential) -> Result<()> {
    info!(backend = backend.name(), principal = %credential.principal, "Bootstrapping authentication");
    backend.bootstrap_auth(credential).await?;
    info!(backend = backend.name(), "Authentication enabled");
    Ok(())
}
