//! Binding connections to user identities.

use duet_core::error::Error;
use duet_core::token;
use duet_core::unix_millis;

/// Resolves a bearer token to a user id. Nothing else in the relay is
/// reachable until a connection has passed through here.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<String, Error>;
}

/// Verifies HMAC session tokens issued by the login service.
pub struct TokenAuthenticator {
    secret: Vec<u8>,
}

impl TokenAuthenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<String, Error> {
        token::verify(&self.secret, token.trim(), unix_millis())
    }
}
