//! Access token seam for the Sheets HTTP client
//!
//! Token acquisition and refresh belong to the auth layer in front of the
//! gateway; the client only asks for a bearer token per request.

use async_trait::async_trait;
use sheetgate_core::{UpstreamError, UpstreamErrorKind};

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Bearer token for the next request
    async fn access_token(&self) -> Result<String, UpstreamError>;

    /// Called after the upstream rejected a token with 401
    async fn invalidate(&self) {}
}

/// Fixed token, for service accounts with externally managed rotation and
/// for tests
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider").field("token", &"<redacted>").finish()
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, UpstreamError> {
        if self.token.trim().is_empty() {
            return Err(UpstreamError::new(
                UpstreamErrorKind::Unauthenticated,
                "no access token configured",
            ));
        }
        Ok(self.token.clone())
    }
}
