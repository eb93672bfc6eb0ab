//! Bearer token verification.
//!
//! Access control here is deliberately thin: a JWT identifies the owning
//! user and nothing else. Issuing tokens (login, registration, password
//! hashing) is out of scope for this crate — it only verifies tokens that
//! some other, external service has already signed.
//!
//! ## Supplying the token
//!
//! The JWT is supplied as a normal `Authorization: Bearer <token>` header.
//!
//! ## Example claims
//!
//! ```json
//! {
//!   "sub": "5c2b1b1e-2222-4444-8888-000000000000",
//!   "exp": 4102324986
//! }
//! ```

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables)
)]

pub mod util;

use std::error::Error as StdError;

use chrono::{DateTime, Utc};
use displaydoc::Display;
use jsonwebtoken::{Algorithm, Validation};
pub use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// A token verification/issuance error.
#[derive(Debug, Display)]
pub enum Error {
    /// JWT error: {0}
    TokenError(jsonwebtoken::errors::Error),

    /// Token has no subject claim
    MissingSubject,

    /// Subject claim {0:?} is not a valid user ID
    InvalidSubject(String),
}

impl StdError for Error {}

/// Standard JWT claims, following RFC 7519.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    issued_at: Option<i64>,

    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,

    #[serde(rename = "sub")]
    subject: String,
}

/// A validated bearer token.
#[derive(Debug)]
pub struct Token(Claims);

impl Token {
    /// Verifies and decodes a token signed with HS256.
    pub fn from_jwt_hs256(token: &str, key: &DecodingKey) -> Result<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        jsonwebtoken::decode::<Claims>(token, key, &validation)
            .map_err(Error::TokenError)
            .map(|data| Token(data.claims))
    }

    /// Creates a new token for `owner`, expiring at `exp`.
    pub fn new(owner: Uuid, exp: &DateTime<Utc>) -> Self {
        Self(Claims {
            issued_at: Some(Utc::now().timestamp()),
            expires_at: Some(exp.timestamp()),
            subject: owner.to_string(),
        })
    }

    /// Encodes and signs the token with HS256.
    pub fn encode(&self, key: &EncodingKey) -> Result<String> {
        let header = jsonwebtoken::Header::new(Algorithm::HS256);
        jsonwebtoken::encode(&header, &self.0, key).map_err(Error::TokenError)
    }

    /// Returns the owning user's ID.
    pub fn owner(&self) -> Result<Uuid> {
        self.0
            .subject
            .parse()
            .map_err(|_| Error::InvalidSubject(self.0.subject.clone()))
    }
}

#[cfg(test)]
mod extra_tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let owner = Uuid::new_v4();
        let exp = Utc::now() + chrono::Duration::hours(1);
        let token = Token::new(owner, &exp);

        let encoding_key = EncodingKey::from_secret(b"test-secret");
        let decoding_key = DecodingKey::from_secret(b"test-secret");

        let jwt = token.encode(&encoding_key).unwrap();
        let decoded = Token::from_jwt_hs256(&jwt, &decoding_key).unwrap();

        assert_eq!(decoded.owner().unwrap(), owner);
    }

    #[test]
    fn test_expired_token_rejected() {
        let owner = Uuid::new_v4();
        let exp = Utc::now() - chrono::Duration::hours(1);
        let token = Token::new(owner, &exp);

        let encoding_key = EncodingKey::from_secret(b"test-secret");
        let decoding_key = DecodingKey::from_secret(b"test-secret");

        let jwt = token.encode(&encoding_key).unwrap();
        assert!(Token::from_jwt_hs256(&jwt, &decoding_key).is_err());
    }
}
