//! Identity extraction. Authentication itself happens upstream; this layer
//! only reads the identity the gateway has already established.

use async_trait::async_trait;
use axum::http::HeaderMap;
use relay_core::Identity;

/// Default header carrying the authenticated user ID.
pub const USER_HEADER: &str = "x-relay-user";
/// Default header carrying comma-separated organization IDs.
pub const ORGS_HEADER: &str = "x-relay-orgs";

/// Resolves the identity behind an incoming request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The caller's identity, or `None` when the request carries none.
    async fn authenticate(&self, headers: &HeaderMap) -> Option<Identity>;
}

/// Trusts identity headers set by a gateway in front of the relay.
#[derive(Clone, Debug)]
pub struct TrustedHeaders {
    user_header: String,
    orgs_header: String,
}

impl TrustedHeaders {
    /// Read identity from custom header names.
    pub fn new(user_header: impl Into<String>, orgs_header: impl Into<String>) -> Self {
        Self {
            user_header: user_header.into(),
            orgs_header: orgs_header.into(),
        }
    }
}

impl Default for TrustedHeaders {
    fn default() -> Self {
        Self::new(USER_HEADER, ORGS_HEADER)
    }
}

#[async_trait]
impl Authenticator for TrustedHeaders {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<Identity> {
        let user = headers
            .get(&self.user_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())?;
        let orgs = headers
            .get(&self.orgs_header)
            .and_then(|v| v.to_str().ok())
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|org| !org.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Some(Identity::new(user).with_orgs(orgs))
    }
}
