//! Credential plumbing for the session handshake.
//!
//! The real-time layer never stores or refreshes credentials itself. It asks a
//! [`CredentialSource`] for the current token on every connect attempt, retries included.

/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;

/// Supplies the current auth credential, if any.
///
/// Implemented for closures and for a [`watch::Receiver`] fed by whatever owns the session
/// storage.
pub trait CredentialSource: Send + Sync + 'static {
    fn credential(&self) -> Option<SecretString>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<SecretString> + Send + Sync + 'static,
{
    fn credential(&self) -> Option<SecretString> {
        self()
    }
}

impl CredentialSource for watch::Receiver<Option<SecretString>> {
    fn credential(&self) -> Option<SecretString> {
        self.borrow().clone()
    }
}

/// A credential that never changes, e.g. a service token.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct StaticCredential(pub SecretString);

impl StaticCredential {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self(SecretString::from(token))
    }
}

impl CredentialSource for StaticCredential {
    fn credential(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}
