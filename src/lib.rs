//! Proxyvisor - brings up a Traefik reverse proxy with its configuration store
//!
//! This library:
//! - Installs a pinned Traefik release, verified against recorded SHA-256 digests
//! - Launches and supervises the proxy and an optional etcd or Consul store
//! - Preloads the store with dynamic configuration before the proxy reads it
//! - Waits until the proxy actually serves the configured routes
//! - Tears everything down in reverse order

pub mod backend;
pub mod backoff;
pub mod config;
pub mod convergence;
pub mod dynamic;
pub mod error;
pub mod installer;
pub mod manifest;
pub mod preload;
pub mod sequencer;
pub mod supervisor;

#[cfg(test)]
mod testing;
