use crate::error::ObserveError;
use crate::monitor::HealthStatus;
use async_trait::async_trait;
use parley_cache::TwoTierCache;
use std::sync::Arc;
use std::time::Duration;

const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// An external dependency whose reachability feeds the health verdict.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Checks the dependency once. An `Err` is recorded as `unhealthy`.
    async fn check(&self) -> Result<HealthStatus, ObserveError>;
}

/// Reports the shared cache tier.
///
/// A cache running without a remote tier is `degraded`, not broken: every
/// read still works against the local map.
pub struct CacheProbe {
    cache: Arc<TwoTierCache>,
}

impl CacheProbe {
    pub fn new(cache: Arc<TwoTierCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl DependencyProbe for CacheProbe {
    fn name(&self) -> &str {
        "cache"
    }

    async fn check(&self) -> Result<HealthStatus, ObserveError> {
        let stats = self.cache.stats();
        match stats.remote_backend {
            None => Ok(HealthStatus::Degraded),
            Some(_) if stats.remote_available => Ok(HealthStatus::Healthy),
            Some(backend) => Err(ObserveError::Unavailable(format!(
                "{backend} is not answering"
            ))),
        }
    }
}

/// GETs a URL, optionally with a bearer token. Any 2xx is healthy; other
/// statuses mean the service answered but refused, which is `degraded`.
pub struct HttpProbe {
    name: String,
    url: String,
    bearer: Option<String>,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            bearer: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

impl std::fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProbe")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl DependencyProbe for HttpProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<HealthStatus, ObserveError> {
        let mut request = self.client.get(&self.url).timeout(HTTP_PROBE_TIMEOUT);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(HealthStatus::Healthy)
        } else {
            tracing::debug!(
                probe = %self.name,
                status = response.status().as_u16(),
                "dependency answered with non-success status"
            );
            Ok(HealthStatus::Degraded)
        }
    }
}
