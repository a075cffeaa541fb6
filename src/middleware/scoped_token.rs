//! Scoped tool tokens, adapted from the teacher's `JwtService`/`Claims`
//! pattern (spec.md §4.2 step 5 "scoped token narrowing").
//!
//! A scoped token lets a caller hand a downstream agent a short-lived
//! credential limited to a subset of tools instead of the full API key.
//! Unlike the teacher's session tokens these carry no user identity or
//! role — only the parent API key and the tool subset it may invoke.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScopedClaims {
    /// The API key this token narrows access for.
    pub key: String,
    pub tools: HashSet<String>,
    pub exp: usize,
    pub iat: usize,
}

pub struct ScopedTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl ScopedTokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    pub fn issue(&self, key: &str, tools: HashSet<String>, ttl_secs: u64) -> Result<String, jsonwebtoken::errors::Error> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as usize;
        let claims = ScopedClaims { key: key.to_string(), tools, exp: now + ttl_secs as usize, iat: now };
        encode(&Header::default(), &claims, &self.encoding_key)
    }

    pub fn validate(&self, token: &str) -> Result<ScopedClaims, jsonwebtoken::errors::Error> {
        decode::<ScopedClaims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256)).map(|data| data.claims)
    }

    pub fn extract_token_from_header(auth_header: &str) -> Option<&str> {
        auth_header.strip_prefix("Bearer ")
    }
}
