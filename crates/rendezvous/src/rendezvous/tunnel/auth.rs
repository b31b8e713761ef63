use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rendezvous::tunnel::api::AuthenticationError;

/// What a peer presented in `Authentication.Authenticate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthRequest {
    pub uuid: Uuid,
    pub name: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// `name` overrides the self-declared peer name when present.
    Accepted { name: Option<String> },
    Rejected,
    Aborted(String),
}

impl AuthOutcome {
    pub fn error_code(&self) -> AuthenticationError {
        match self {
            AuthOutcome::Accepted { .. } => AuthenticationError::NoError,
            AuthOutcome::Rejected => AuthenticationError::AuthenticationFailed,
            AuthOutcome::Aborted(_) => AuthenticationError::Aborted,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth: http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("auth: endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

/// Token check run on `Authentication.Authenticate`.
///
/// The relay bounds every call with its authentication timeout; implementations
/// do not need their own.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn authenticate(&self, req: &AuthRequest) -> AuthOutcome;
}

/// Compares the presented token against one shared secret. An empty secret
/// accepts everyone.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    fn kind(&self) -> &'static str {
        "token"
    }

    async fn authenticate(&self, req: &AuthRequest) -> AuthOutcome {
        if self.token.is_empty() || constant_time_eq(self.token.as_bytes(), req.token.as_bytes()) {
            AuthOutcome::Accepted { name: None }
        } else {
            AuthOutcome::Rejected
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Deserialize)]
struct HttpVerdict {
    accepted: bool,
    #[serde(default)]
    name: Option<String>,
}

/// Delegates the decision to an HTTP endpoint.
///
/// The request body is the [`AuthRequest`] as JSON; a 2xx answer of
/// `{"accepted": bool, "name": "..."}` decides.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthenticator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn verdict(&self, req: &AuthRequest) -> Result<HttpVerdict, AuthError> {
        let resp = self.client.post(&self.url).json(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::Status(status));
        }
        Ok(resp.json::<HttpVerdict>().await?)
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn authenticate(&self, req: &AuthRequest) -> AuthOutcome {
        match self.verdict(req).await {
            Ok(v) if v.accepted => AuthOutcome::Accepted { name: v.name },
            Ok(_) => AuthOutcome::Rejected,
            Err(err) => {
                tracing::warn!(url = %self.url, uuid = %req.uuid, err = %err, "auth: endpoint unavailable");
                AuthOutcome::Aborted(err.to_string())
            }
        }
    }
}

/// Scripted authenticator for tests: returns a fixed outcome after an
/// optional delay and counts calls.
#[derive(Debug)]
pub struct MockAuthenticator {
    outcome: AuthOutcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockAuthenticator {
    pub fn new(outcome: AuthOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn accepting() -> Self {
        Self::new(AuthOutcome::Accepted { name: None })
    }

    pub fn rejecting() -> Self {
        Self::new(AuthOutcome::Rejected)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn authenticate(&self, _req: &AuthRequest) -> AuthOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}

pub type SharedAuthenticator = Arc<dyn Authenticator>;
