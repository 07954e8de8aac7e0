/// Upstream authentication seam.
///
/// The byte-level handshake is deliberately outside this crate: the pool
/// hands a fresh connection and the configured credential to whatever
/// [`Authenticator`] was injected, and a handshake failure counts as a
/// failed dial attempt. No BSON is parsed here.
use async_trait::async_trait;

use crate::conn::AsyncReadWrite;
use crate::error::ProxyResult;

/// Credentials for the upstream handshake. The source database is always
/// `admin`.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub source: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            source: "admin".to_string(),
        }
    }
}

/// Performs the authentication handshake on a freshly dialed upstream.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        conn: &mut (dyn AsyncReadWrite),
        credential: &Credential,
    ) -> ProxyResult<()>;
}

/// Accepts every connection without a handshake. Deployments that front an
/// authenticated server replace this with their handshake implementation.
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn authenticate(
        &self,
        _conn: &mut (dyn AsyncReadWrite),
        _credential: &Credential,
    ) -> ProxyResult<()> {
        Ok(())
    }
}
