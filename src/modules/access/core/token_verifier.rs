// Bearer token verification.
//
// Purpose
// - Turn an HS256 signed token into a Principal, or explain precisely why not.
//
// Responsibilities
// - Try only the key named by the token's `kid`, or every trusted key when there is none.
// - Check the signature before the expiry, and the expiry against the supplied clock.
// - Stay pure: no I/O, no wall clock.

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::modules::access::core::principal::Principal;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("missing bearer token")]
    Missing,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature does not match a trusted key")]
    InvalidSignature,

    #[error("token expired at {expired_at}")]
    Expired { expired_at: i64 },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeySetError {
    #[error("at least one signing key must be trusted")]
    Empty,

    #[error("duplicate key id: {0}")]
    DuplicateKid(String),
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    roles: Vec<String>,
    exp: i64,
}

#[derive(Clone)]
pub struct TrustedKey {
    kid: String,
    key: DecodingKey,
}

impl TrustedKey {
    pub fn from_secret(kid: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            kid: kid.into(),
            key: DecodingKey::from_secret(secret),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }
}

impl fmt::Debug for TrustedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedKey").field("kid", &self.kid).finish_non_exhaustive()
    }
}

/// The currently trusted signing keys, in the order they are tried.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: Vec<TrustedKey>,
}

impl KeySet {
    pub fn new(keys: Vec<TrustedKey>) -> Result<Self, KeySetError> {
        if keys.is_empty() {
            return Err(KeySetError::Empty);
        }
        let mut seen = HashSet::new();
        for key in &keys {
            if !seen.insert(key.kid.as_str()) {
                return Err(KeySetError::DuplicateKid(key.kid.clone()));
            }
        }
        Ok(Self { keys })
    }

    pub fn kids(&self) -> Vec<&str> {
        self.keys.iter().map(TrustedKey::kid).collect()
    }

    fn candidates<'a>(&'a self, kid: Option<&'a str>) -> impl Iterator<Item = &'a TrustedKey> {
        self.keys
            .iter()
            .filter(move |key| kid.is_none_or(|kid| key.kid == kid))
    }
}

#[derive(Debug, Clone)]
pub struct TokenVerifier {
    keys: KeySet,
    leeway_secs: i64,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(keys: KeySet) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["sub", "exp"]);
        Self {
            keys,
            leeway_secs: 0,
            validation,
        }
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = i64::try_from(leeway_secs).unwrap_or(i64::MAX);
        self
    }

    /// A verifier with the same settings trusting a different key set.
    pub fn with_keys(&self, keys: KeySet) -> Self {
        Self {
            keys,
            leeway_secs: self.leeway_secs,
            validation: self.validation.clone(),
        }
    }

    pub fn kids(&self) -> Vec<&str> {
        self.keys.kids()
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Principal, TokenError> {
        let header = decode_header(token).map_err(|err| TokenError::Malformed(err.to_string()))?;

        let mut claims = None;
        for trusted in self.keys.candidates(header.kid.as_deref()) {
            match decode::<Claims>(token, &trusted.key, &self.validation) {
                Ok(data) => {
                    claims = Some(data.claims);
                    break;
                }
                Err(err) => match err.kind() {
                    ErrorKind::InvalidSignature => continue,
                    ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                        return Err(TokenError::InvalidSignature);
                    }
                    _ => return Err(TokenError::Malformed(err.to_string())),
                },
            }
        }
        let claims = claims.ok_or(TokenError::InvalidSignature)?;

        if claims.sub.trim().is_empty() {
            return Err(TokenError::Malformed("empty subject".to_string()));
        }
        if now.timestamp() > claims.exp.saturating_add(self.leeway_secs) {
            return Err(TokenError::Expired {
                expired_at: claims.exp,
            });
        }

        Ok(Principal {
            subject: claims.sub,
            roles: claims.roles.into_iter().collect(),
            expires_at: claims.exp,
        })
    }
}
