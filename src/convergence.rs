//! Readiness predicates and the gate that polls them
//!
//! Every check goes through [`BackoffPolicy::wait_until`], so the same
//! deadline semantics apply to backend health, the public endpoint and
//! proxy API route checks alike.

use crate::backoff::BackoffPolicy;
use crate::error::{BootstrapError, Result};
use anyhow::Context;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Which HTTP responses count as ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Any response at all, including 404 or 5xx
    Any,
    /// A 2xx status
    Success,
}

/// Something that becomes observable once a change has propagated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// A TCP connection can be established
    Tcp(SocketAddr),
    Http {
        url: String,
        expect: Expect,
        basic_auth: Option<(String, String)>,
        /// The body must contain this text
        body_contains: Option<String>,
    },
}

impl Reachability {
    /// Any HTTP response from `url`
    pub fn responds(url: impl Into<String>) -> Self {
        Reachability::Http {
            url: url.into(),
            expect: Expect::Any,
            basic_auth: None,
            body_contains: None,
        }
    }

    /// A 2xx response from `url`
    pub fn succeeds(url: impl Into<String>) -> Self {
        Reachability::Http {
            url: url.into(),
            expect: Expect::Success,
            basic_auth: None,
            body_contains: None,
        }
    }

    /// Attach basic-auth credentials to an HTTP check
    pub fn with_basic_auth(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        match self {
            Reachability::Http {
                url,
                expect,
                body_contains,
                ..
            } => Reachability::Http {
                url,
                expect,
                basic_auth: Some((username.into(), password.into())),
                body_contains,
            },
            tcp => tcp,
        }
    }

    /// Require the response body to contain `text`
    pub fn with_body_containing(self, text: impl Into<String>) -> Self {
        match self {
            Reachability::Http {
                url,
                expect,
                basic_auth,
                ..
            } => Reachability::Http {
                url,
                expect,
                basic_auth,
                body_contains: Some(text.into()),
            },
            tcp => tcp,
        }
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Tcp(addr) => write!(f, "tcp://{}", addr),
            Reachability::Http { url, .. } => f.write_str(url),
        }
    }
}

/// A labelled check with its own deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceTarget {
    pub label: String,
    pub check: Reachability,
    pub deadline: Duration,
}

impl ConvergenceTarget {
    pub fn new(label: impl Into<String>, check: Reachability, deadline: Duration) -> Self {
        Self {
            label: label.into(),
            check,
            deadline,
        }
    }
}

/// Polls reachability checks until they pass
#[derive(Clone)]
pub struct ConvergenceGate {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl ConvergenceGate {
    /// Gate whose HTTP probes accept self-signed certificates, as served by
    /// a proxy that has no certificate configured yet
    pub fn new() -> anyhow::Result<Self> {
        let probe_timeout = Duration::from_secs(5);
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(probe_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            probe_timeout,
        })
    }

    /// Wait until `target` passes, within its deadline.
    ///
    /// `policy` supplies the delay schedule; its timeout is replaced by the
    /// target's deadline.
    pub async fn await_ready(&self, target: &ConvergenceTarget, policy: &BackoffPolicy) -> Result<()> {
        debug!(target = %target.label, check = %target.check, "Waiting for convergence");
        let policy = policy.with_timeout(target.deadline);

        match policy.wait_until(|| self.probe(&target.check)).await {
            Ok(attempts) => {
                info!(target = %target.label, attempts, "Converged");
                Ok(())
            }
            Err(timeout) => Err(BootstrapError::ConvergenceTimeout {
                target: target.label.clone(),
                elapsed: timeout.elapsed,
                attempts: timeout.attempts,
                last_error: timeout.last_error,
            }),
        }
    }

    /// Evaluate a check once
    pub async fn probe(&self, check: &Reachability) -> anyhow::Result<bool> {
        match check {
            Reachability::Tcp(addr) => {
                tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr))
                    .await
                    .with_context(|| format!("connect to {} timed out", addr))?
                    .with_context(|| format!("connect to {} failed", addr))?;
                Ok(true)
            }
            Reachability::Http {
                url,
                expect,
                basic_auth,
                body_contains,
            } => {
                let mut request = self.client.get(url);
                if let Some((username, password)) = basic_auth {
                    request = request.basic_auth(username, Some(password));
                }
                let response = request
                    .send()
                    .await
                    .with_context(|| format!("request to {} failed", url))?;

                let status = response.status();
                if *expect == Expect::Success && !status.is_success() {
                    anyhow::bail!("{} returned {}", url, status);
                }

                if let Some(needle) = body_contains {
                    let body = response.text().await?;
                    if !body.contains(needle.as_str()) {
                        anyhow::bail!("{} response does not contain {:?}", url, needle);
                    }
                }
                Ok(true)
            }
        }
    }
}
