//! Agent RPC client (C9): a `reqwest`-backed handle on the control plane,
//! with a background reachability poll and a single-flight reconnect state
//! machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Strip any URL scheme and add the default port if the address doesn't
/// already carry one.
pub fn normalize_addr(addr: &str) -> String {
    let stripped = addr.split("://").next_back().unwrap_or(addr);
    if stripped.contains(':') {
        stripped.to_string()
    } else {
        format!("{stripped}:9090")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Reconnecting,
    Exhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("maximum reconnect attempts exceeded")]
    MaxReconnectExceeded,
}

/// Scoped-acquisition guard: dropping it cancels the borrowed timeout/auth
/// context. Callers must hold it for the duration of the call it guards.
pub struct CallGuard {
    _cancel: tokio_util::sync::DropGuard,
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
    state: RwLock<ConnState>,
    reconnect_attempts: AtomicU32,
    max_reconnect_attempts: u32,
    reconnect_lock: Mutex<()>,
    max_reconnect_reached: std::sync::atomic::AtomicBool,
}

/// Connects lazily to a control plane address; call [`RpcClient::spawn_supervision`]
/// once to start the background reachability poll.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    pub fn new(server_addr: &str, max_reconnect_attempts: u32) -> Self {
        let base_url = format!("http://{}", normalize_addr(server_addr));
        Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                base_url,
                token: RwLock::new(None),
                state: RwLock::new(ConnState::Connected),
                reconnect_attempts: AtomicU32::new(0),
                max_reconnect_attempts,
                reconnect_lock: Mutex::new(()),
                max_reconnect_reached: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub async fn set_token(&self, token: String) {
        *self.inner.token.write().await = Some(token);
    }

    pub async fn state(&self) -> ConnState {
        *self.inner.state.read().await
    }

    /// Call an RPC method by name: `POST {base_url}/rpc/agent.v1.AgentService/{method}`.
    /// Attaches a bearer token if one is set and records a tracing span for
    /// method name and duration.
    pub async fn call<Req, Resp>(&self, method: &str, req: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let span = tracing::info_span!("rpc_call", method);
        let _enter = span.enter();
        let start = std::time::Instant::now();

        let url = format!("{}/rpc/agent.v1.AgentService/{method}", self.inner.base_url);
        let mut builder = self.inner.http.post(&url).json(req);

        if let Some(token) = self.inner.token.read().await.clone() {
            builder = builder.bearer_auth(token);
        }

        let result = builder.send().await;
        let elapsed = start.elapsed();
        tracing::info!(method, elapsed_ms = elapsed.as_millis() as u64, "rpc call completed");

        let response = result?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RpcError::Server { status: status.as_u16(), message });
        }

        response.json::<Resp>().await.map_err(RpcError::Request)
    }

    /// Poll `GET {base_url}/health` once to check reachability.
    async fn probe_health(&self) -> bool {
        self.inner
            .http
            .get(format!("{}/health", self.inner.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Single-flight reconnect attempt. Duplicate concurrent calls while one
    /// is already in progress no-op and return `Ok(())` immediately.
    pub async fn reconnect(&self) -> Result<()> {
        let Ok(_guard) = self.inner.reconnect_lock.try_lock() else {
            return Ok(());
        };

        if self.inner.max_reconnect_reached.load(Ordering::SeqCst) {
            bail!(RpcError::MaxReconnectExceeded);
        }

        *self.inner.state.write().await = ConnState::Reconnecting;
        let attempt = self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if self.inner.max_reconnect_attempts > 0 && attempt >= self.inner.max_reconnect_attempts {
            self.inner.max_reconnect_reached.store(true, Ordering::SeqCst);
            *self.inner.state.write().await = ConnState::Exhausted;
            bail!(RpcError::MaxReconnectExceeded);
        }

        if self.probe_health().await {
            self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
            self.inner.max_reconnect_reached.store(false, Ordering::SeqCst);
            *self.inner.state.write().await = ConnState::Connected;
        }

        Ok(())
    }

    /// Background task: poll reachability every 5s, triggering `reconnect`
    /// whenever the last probe failed. Runs until `cancel` fires.
    pub fn spawn_supervision(&self, cancel: CancellationToken) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }

                let healthy = client.probe_health().await;
                let state = client.state().await;
                if !healthy && state == ConnState::Connected {
                    if let Err(e) = client.reconnect().await {
                        tracing::warn!(error = %e, "reconnect attempt failed");
                    }
                } else if healthy && state != ConnState::Connected {
                    let _ = client.reconnect().await;
                }
            }
        });
    }

    /// Context helper: bound the next call by `timeout`, returning a guard
    /// the caller must hold (and drop when done) to release the timeout
    /// context.
    pub fn with_timeout(&self, timeout: Duration) -> (CancellationToken, CallGuard) {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            child.cancel();
        });
        let guard = CallGuard { _cancel: token.clone().drop_guard() };
        (token, guard)
    }

    /// Context helper: set `token` as the bearer credential for the
    /// lifetime of the guard, restoring the prior token on drop is not
    /// possible synchronously, so callers scope token lifetime by holding
    /// the client itself per-agent instead.
    pub async fn with_auth(&self, token: String) -> CallGuard {
        self.set_token(token).await;
        let cancel = CancellationToken::new();
        CallGuard { _cancel: cancel.drop_guard() }
    }

    pub async fn with_timeout_and_auth(&self, timeout: Duration, token: String) -> (CancellationToken, CallGuard) {
        self.set_token(token).await;
        self.with_timeout(timeout)
    }

    pub fn reconnect_attempts(&self) -> usize {
        self.inner.reconnect_attempts.load(Ordering::SeqCst) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_scheme_and_adds_default_port() {
        assert_eq!(normalize_addr("http://example.com"), "example.com:9090");
        assert_eq!(normalize_addr("example.com"), "example.com:9090");
        assert_eq!(normalize_addr("example.com:1234"), "example.com:1234");
        assert_eq!(normalize_addr("https://example.com:8443"), "example.com:8443");
    }

    #[tokio::test]
    async fn new_client_starts_connected() {
        let client = RpcClient::new("example.com", 5);
        assert_eq!(client.state().await, ConnState::Connected);
        assert_eq!(client.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn reconnect_marks_exhausted_after_max_attempts() {
        let client = RpcClient::new("unreachable.invalid:1", 1);
        let result = client.reconnect().await;
        assert!(result.is_err());
        assert_eq!(client.state().await, ConnState::Exhausted);
    }

    #[tokio::test]
    async fn set_token_is_visible_to_call_path() {
        let client = RpcClient::new("example.com", 5);
        client.set_token("abc".to_string()).await;
        assert_eq!(client.inner.token.read().await.as_deref(), Some("abc"));
    }
}
