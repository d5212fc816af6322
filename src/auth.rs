//! Connection Authenticator
//!
//! Verifies the bearer token presented at upgrade time and yields the
//! connecting user's identity. Verification never panics or propagates an
//! error past this boundary: the caller gets `Some(identity)` or `None` and
//! decides how to close the connection.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Token claims carried by platform-issued bearer credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    /// Platform role (e.g. "mentor", "mentee", "admin").
    pub role: String,
    /// Expiry as Unix seconds.
    pub exp: u64,
}

/// Decoded identity of an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub role: String,
}

/// Verifies HS256 bearer tokens against the shared platform secret.
pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    /// Creates an authenticator for the given shared secret.
    pub fn new(secret: &str) -> Self {
        Authenticator {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verifies a bearer token, returning the identity on success.
    ///
    /// Returns `None` on a malformed token, bad signature, or expired claims.
    pub fn verify(&self, token: &str) -> Option<Identity> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(Identity {
                user_id: data.claims.sub,
                role: data.claims.role,
            }),
            Err(err) => {
                debug!("Token verification failed: {}", err);
                None
            }
        }
    }
}

/// Issues a short-lived HS256 token for the given user.
///
/// Used by test fixtures and local tooling; the platform's auth service is
/// the production issuer.
pub fn issue_token(secret: &str, user_id: i64, role: &str, ttl_secs: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        exp: now + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("HS256 token encoding cannot fail")
}
