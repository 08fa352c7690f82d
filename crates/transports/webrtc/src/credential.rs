//! Gateway credentials
//!
//! The credential is an opaque bearer string handed to the gateway when a
//! signaling channel is opened. A fresh credential is requested for every
//! connection attempt so that rotating tokens are picked up on retry.

use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;

/// Opaque gateway credential
///
/// `Debug` is redacted so the token never ends up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token, for building the signaling URL
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// True for an empty token
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Supplies credentials for signaling attempts
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fetch the credential to use for the next attempt
    ///
    /// Failures are reported as `Error::Connect`.
    async fn credential(&self) -> Result<Credential>;
}

/// A fixed credential
///
/// ```
/// use camgrid_webrtc::credential::{CredentialSource, StaticCredential};
///
/// # tokio_test::block_on(async {
/// let source = StaticCredential::new("nvr-token");
/// let credential = source.credential().await.unwrap();
/// assert_eq!(credential.expose(), "nvr-token");
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct StaticCredential {
    credential: Credential,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn credential(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}

/// Reads the credential from an environment variable on every attempt
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl CredentialSource for EnvCredential {
    async fn credential(&self) -> Result<Credential> {
        match std::env::var(&self.var) {
            Ok(token) if !token.is_empty() => Ok(Credential::new(token)),
            Ok(_) => Err(Error::Connect(format!("credential variable {} is empty", self.var))),
            Err(_) => Err(Error::Connect(format!("credential variable {} is not set", self.var))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let credential = Credential::new("super-secret");
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("super-secret"));
        assert_eq!(credential.expose(), "super-secret");
    }

    #[tokio::test]
    async fn test_static_credential() {
        let source = StaticCredential::new("abc");
        assert_eq!(source.credential().await.unwrap().expose(), "abc");
    }

    #[tokio::test]
    async fn test_env_credential_missing() {
        let source = EnvCredential::new("CAMGRID_TEST_CREDENTIAL_THAT_IS_NEVER_SET");
        let err = source.credential().await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
    }
}
