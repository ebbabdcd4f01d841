use std::net::SocketAddr;
use tonic::metadata::MetadataMap;

/// Verifies the identity of a connecting client before its session starts.
pub trait Authenticator: Send + Sync + 'static {
    /// Returns the client's verified identities, or `None` if the client is allowed to connect
    /// without one.
    fn authenticate(
        &self,
        peer: Option<SocketAddr>,
        metadata: &MetadataMap,
    ) -> Result<Option<Vec<String>>, AuthError>;
}

/// Admits every client without an identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unauthenticated;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid credentials: {0}")]
    Invalid(String),
}

impl Authenticator for Unauthenticated {
    fn authenticate(
        &self,
        _: Option<SocketAddr>,
        _: &MetadataMap,
    ) -> Result<Option<Vec<String>>, AuthError> {
        Ok(None)
    }
}

impl<F> Authenticator for F
where
    F: Fn(Option<SocketAddr>, &MetadataMap) -> Result<Option<Vec<String>>, AuthError>,
    F: Send + Sync + 'static,
{
    fn authenticate(
        &self,
        peer: Option<SocketAddr>,
        metadata: &MetadataMap,
    ) -> Result<Option<Vec<String>>, AuthError> {
        (self)(peer, metadata)
    }
}
