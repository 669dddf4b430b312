//! Pluggable SASL-style authentication performed during connection startup.
//!
//! When a node answers STARTUP with AUTHENTICATE, the connection asks the
//! configured [`AuthenticatorProvider`] for an initial response and a
//! session, then answers every AUTH_CHALLENGE through
//! [`AuthenticatorSession::evaluate_challenge`] until the node reports
//! AUTH_SUCCESS.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Class name of the node-side authenticator that [`PlainTextAuthenticator`] speaks to.
pub const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// Type to represent an authentication error message.
pub type AuthError = String;

/// One authentication exchange, valid for a single connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers a challenge sent by the node. The token is authenticator
    /// specific and may be missing.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called once the node accepted the exchange.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Factory of [`AuthenticatorSession`]s, shared by every connection of a session.
///
/// Set it with `SessionBuilder::authenticator_provider`, or use
/// `SessionBuilder::user` for a [`PlainTextAuthenticator`].
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Starts an exchange with a node that announced `authenticator_name`.
    /// Returns the initial response together with the session that handles
    /// the rest of the exchange.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username and password authentication against `PasswordAuthenticator`.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Creates new [`PlainTextAuthenticator`] instance with provided username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        if authenticator_name != PASSWORD_AUTHENTICATOR {
            return Err(format!("unexpected authenticator {:?}", authenticator_name));
        }

        let mut response = BytesMut::new();
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());

        Ok((
            Some(response.to_vec()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}
