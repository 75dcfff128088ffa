// Token fixtures: sign HS256 tokens the way an identity provider would.

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::json;

use crate::modules::access::core::token_verifier::{KeySet, TrustedKey};

pub const KID: &str = "key-2024";
pub const SECRET: &[u8] = b"fixture-signing-secret-0001";
pub const OTHER_KID: &str = "key-2025";
pub const OTHER_SECRET: &[u8] = b"fixture-signing-secret-0002";

/// Far enough in the future for fixture instants.
pub const FAR_EXPIRY: i64 = 4_000_000_000;

pub fn key_set() -> KeySet {
    KeySet::new(vec![TrustedKey::from_secret(KID, SECRET)]).expect("fixture key set")
}

pub fn sign(kid: Option<&str>, secret: &[u8], claims: serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = kid.map(str::to_string);
    encode(&header, &claims, &EncodingKey::from_secret(secret)).expect("fixture token")
}

pub fn token_for(subject: &str, roles: &[&str], exp: i64) -> String {
    sign(
        Some(KID),
        SECRET,
        json!({ "sub": subject, "roles": roles, "exp": exp }),
    )
}

pub fn owner_token(subject: &str) -> String {
    token_for(subject, &["seller"], FAR_EXPIRY)
}

pub fn admin_token() -> String {
    token_for("user-admin-0001", &["admin"], FAR_EXPIRY)
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}
