//! Traefik dynamic configuration as a tree
//!
//! The same tree is written to a file for the file provider or flattened into
//! keys under a root prefix (`traefik/http/routers/<name>/rule`, arrays indexed
//! as `.../entryPoints/0`) for the KV providers.

use anyhow::Context;
use base64::Engine;
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::path::Path;

/// Router that exposes the proxy API and dashboard
pub const API_ROUTER: &str = "route_api";
/// Basic-auth middleware guarding [`API_ROUTER`]
pub const API_MIDDLEWARE: &str = "auth_api";

/// On-disk format of a dynamic configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Toml,
    Yaml,
}

impl FileFormat {
    /// Format implied by the file extension
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(FileFormat::Toml),
            Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
            _ => anyhow::bail!(
                "cannot infer config format of {}: expected .toml, .yaml or .yml",
                path.display()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicConfig {
    root: Value,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }
}

impl DynamicConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(root: Value) -> anyhow::Result<Self> {
        if !root.is_object() {
            anyhow::bail!("dynamic configuration must be a table");
        }
        Ok(Self { root })
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Guard the proxy API behind basic auth on `entrypoint`
    pub fn with_api_auth(mut self, username: &str, password: &str, entrypoint: &str) -> Self {
        let http = self.http_mut();
        insert_path(
            http,
            &["routers", API_ROUTER],
            json!({
                "rule": "PathPrefix(`/api`) || PathPrefix(`/dashboard`)",
                "entryPoints": [entrypoint],
                "service": "api@internal",
                "middlewares": [API_MIDDLEWARE],
            }),
        );
        insert_path(
            http,
            &["middlewares", API_MIDDLEWARE],
            json!({ "basicAuth": { "users": [htpasswd_entry(username, password)] } }),
        );
        self
    }

    /// Route requests matching `rule` on `entrypoint` to `target_url`
    pub fn add_route(&mut self, name: &str, rule: &str, target_url: &str, entrypoint: &str) {
        let http = self.http_mut();
        insert_path(
            http,
            &["routers", name],
            json!({
                "rule": rule,
                "entryPoints": [entrypoint],
                "service": name,
            }),
        );
        insert_path(
            http,
            &["services", name],
            json!({ "loadBalancer": { "servers": [{ "url": target_url }] } }),
        );
    }

    /// Remove a route and its service; returns whether it existed
    pub fn remove_route(&mut self, name: &str) -> bool {
        let http = self.http_mut();
        let mut removed = false;
        for section in ["routers", "services"] {
            if let Some(Value::Object(entries)) = http.get_mut(section) {
                removed |= entries.remove(name).is_some();
                if entries.is_empty() {
                    http.remove(section);
                }
            }
        }
        removed
    }

    pub fn has_router(&self, name: &str) -> bool {
        self.root
            .pointer(&format!("/http/routers/{}", name))
            .is_some()
    }

    pub fn router_names(&self) -> Vec<String> {
        match self.root.pointer("/http/routers") {
            Some(Value::Object(routers)) => routers.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Flatten to `(key, value)` pairs under `root_key`, sorted by key
    pub fn to_kv(&self, root_key: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        flatten(root_key.trim_end_matches('/'), &self.root, &mut pairs);
        pairs
    }

    pub fn render(&self, format: FileFormat) -> anyhow::Result<String> {
        match format {
            FileFormat::Toml => toml::to_string(&self.root).context("failed to render TOML"),
            FileFormat::Yaml => serde_yaml::to_string(&self.root).context("failed to render YAML"),
        }
    }

    pub fn parse(source: &str, format: FileFormat) -> anyhow::Result<Self> {
        let root: Value = match format {
            FileFormat::Toml => toml::from_str(source).context("invalid TOML")?,
            FileFormat::Yaml => serde_yaml::from_str(source).context("invalid YAML")?,
        };
        // An empty YAML document deserializes as null
        if root.is_null() {
            return Ok(Self::default());
        }
        Self::from_value(root)
    }

    fn http_mut(&mut self) -> &mut Map<String, Value> {
        let root = object_mut(&mut self.root);
        object_mut(root.entry("http").or_insert_with(|| Value::Object(Map::new())))
    }
}

/// `user:{SHA}<base64 sha1>` as understood by Traefik's basicAuth middleware
pub fn htpasswd_entry(username: &str, password: &str) -> String {
    let digest = Sha1::digest(password.as_bytes());
    format!(
        "{}:{{SHA}}{}",
        username,
        base64::engine::general_purpose::STANDARD.encode(digest)
    )
}

fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just made an object"),
    }
}

fn insert_path(map: &mut Map<String, Value>, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [first, rest @ ..] => {
            let child = map
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            insert_path(object_mut(child), rest, value);
        }
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&format!("{}/{}", prefix, key), child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten(&format!("{}/{}", prefix, index), child, out);
            }
        }
        Value::Null => {}
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}
