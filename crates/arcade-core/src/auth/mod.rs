//! Agent bearer tokens (C8).
//!
//! Tokens are HMAC-SHA256 based like the scoped per-task tokens this crate's
//! ancestor used, but generalized to a permanent, agent-scoped credential:
//! a signing key is first derived from the control plane's API key, then
//! used to sign a small claims set identifying the agent. Format:
//! `arcade_at_<claims_b64>.<hmac_hex>`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "arcade_at_";
const SIGNING_KEY_CONTEXT: &[u8] = b"arcade-agent-token";
const ISSUER: &str = "arcade-agent";

/// A token's lifetime: effectively permanent (100 years), matching agents
/// that are provisioned once and expected to run indefinitely.
const TOKEN_LIFETIME_DAYS: i64 = 365 * 100;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),
    #[error("token claims are not valid JSON: {0}")]
    InvalidClaims(#[from] serde_json::Error),
    #[error("token HMAC verification failed")]
    HmacMismatch,
    #[error("token is not yet valid (nbf in the future)")]
    NotYetValid,
    #[error("token has expired")]
    Expired,
    #[error("unknown agent {0}")]
    UnknownAgent(Uuid),
}

/// Claims carried by an agent bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub agent_id: Uuid,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Derive the per-control-plane signing key from its API key.
///
/// Two-level HMAC: the API key never signs claims directly, so rotating the
/// derivation context (if ever needed) doesn't require rotating the API key
/// itself.
fn derive_signing_key(api_key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(api_key).expect("HMAC accepts a key of any length");
    mac.update(SIGNING_KEY_CONTEXT);
    mac.finalize().into_bytes().to_vec()
}

fn sign(signing_key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(signing_key).expect("HMAC accepts a key of any length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Generate a permanent bearer token for `agent_id`, signed with the
/// control plane's `api_key`.
pub fn generate_permanent_token(api_key: &[u8], agent_id: Uuid) -> String {
    let now = Utc::now();
    let claims = Claims {
        agent_id,
        iss: ISSUER.to_string(),
        iat: now.timestamp(),
        nbf: now.timestamp(),
        exp: (now + Duration::days(TOKEN_LIFETIME_DAYS)).timestamp(),
    };
    encode_token(api_key, &claims)
}

fn encode_token(api_key: &[u8], claims: &Claims) -> String {
    let payload = serde_json::to_vec(claims).expect("Claims always serializes");
    let claims_b64 = URL_SAFE_NO_PAD.encode(&payload);

    let signing_key = derive_signing_key(api_key);
    let mac = sign(&signing_key, claims_b64.as_bytes());
    let mac_hex = hex::encode(mac);

    format!("{TOKEN_PREFIX}{claims_b64}.{mac_hex}")
}

/// Verify a token's signature and freshness, returning its claims.
///
/// Does not check that the agent still exists or is active; callers that
/// need that should go through a [`TokenVerifier`] backed by the agent
/// table.
pub fn verify_permanent_token(api_key: &[u8], token: &str) -> Result<Claims, AuthError> {
    let rest = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| AuthError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}")))?;

    let (claims_b64, mac_hex) = rest
        .split_once('.')
        .ok_or_else(|| AuthError::InvalidFormat("expected '.' between claims and hmac".to_string()))?;

    let provided_mac = hex::decode(mac_hex)
        .map_err(|e| AuthError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    let signing_key = derive_signing_key(api_key);
    let mut mac = HmacSha256::new_from_slice(&signing_key).expect("HMAC accepts a key of any length");
    mac.update(claims_b64.as_bytes());
    mac.verify_slice(&provided_mac)
        .map_err(|_| AuthError::HmacMismatch)?;

    let payload = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|e| AuthError::InvalidFormat(format!("invalid base64 in claims: {e}")))?;
    let claims: Claims = serde_json::from_slice(&payload)?;

    let now = Utc::now().timestamp();
    if now < claims.nbf {
        return Err(AuthError::NotYetValid);
    }
    if now > claims.exp {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

/// Verifies a bearer token and resolves it to an agent. Implementations
/// range from a single shared API key (for a single control plane process)
/// to one backed by per-agent keys stored in the database.
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Verifies against a single, statically-configured API key. Suitable for a
/// single control plane process with no key rotation.
pub struct StaticVerifier {
    api_key: Vec<u8>,
}

impl StaticVerifier {
    pub fn new(api_key: impl Into<Vec<u8>>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        verify_permanent_token(&self.api_key, token)
    }
}

/// Verifies against a fixed set of API keys, any of which may have signed
/// the token. Used in tests and for multi-key rollover.
pub struct InMemoryVerifier {
    api_keys: Vec<Vec<u8>>,
}

impl InMemoryVerifier {
    pub fn new(api_keys: Vec<Vec<u8>>) -> Self {
        Self { api_keys }
    }
}

#[async_trait::async_trait]
impl TokenVerifier for InMemoryVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut last_err = AuthError::HmacMismatch;
        for api_key in &self.api_keys {
            match verify_permanent_token(api_key, token) {
                Ok(claims) => return Ok(claims),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

/// Verifies the token's signature, then confirms the claimed agent is still
/// registered and not offline.
pub struct DbVerifier<'a> {
    pool: &'a sqlx::PgPool,
    api_key: Vec<u8>,
}

impl<'a> DbVerifier<'a> {
    pub fn new(pool: &'a sqlx::PgPool, api_key: impl Into<Vec<u8>>) -> Self {
        Self {
            pool,
            api_key: api_key.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenVerifier for DbVerifier<'_> {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = verify_permanent_token(&self.api_key, token)?;
        arcade_db::queries::agents::get_agent(self.pool, claims.agent_id)
            .await
            .map_err(|_| AuthError::UnknownAgent(claims.agent_id))?
            .ok_or(AuthError::UnknownAgent(claims.agent_id))?;
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Vec<u8> {
        b"test-api-key-for-arcade".to_vec()
    }

    #[test]
    fn generate_token_has_correct_prefix_and_shape() {
        let agent_id = Uuid::new_v4();
        let token = generate_permanent_token(&key(), agent_id);
        assert!(token.starts_with(TOKEN_PREFIX));
        assert_eq!(token.matches('.').count(), 1);
    }

    #[test]
    fn generate_and_verify_roundtrip() {
        let agent_id = Uuid::new_v4();
        let token = generate_permanent_token(&key(), agent_id);
        let claims = verify_permanent_token(&key(), &token).unwrap();

        assert_eq!(claims.agent_id, agent_id);
        assert_eq!(claims.iss, ISSUER);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn reject_wrong_key() {
        let agent_id = Uuid::new_v4();
        let token = generate_permanent_token(&key(), agent_id);
        let result = verify_permanent_token(b"wrong-key", &token);
        assert!(matches!(result, Err(AuthError::HmacMismatch)));
    }

    #[test]
    fn reject_tampered_claims() {
        let agent_id = Uuid::new_v4();
        let token = generate_permanent_token(&key(), agent_id);
        let other_id = Uuid::new_v4();
        let tampered = token.replace(&agent_id.to_string(), &other_id.to_string());
        let result = verify_permanent_token(&key(), &tampered);
        assert!(result.is_err());
    }

    #[test]
    fn reject_missing_prefix() {
        let result = verify_permanent_token(&key(), "not-a-token");
        assert!(matches!(result, Err(AuthError::InvalidFormat(_))));
    }

    #[test]
    fn reject_missing_separator() {
        let result = verify_permanent_token(&key(), "arcade_at_noseparatorhere");
        assert!(matches!(result, Err(AuthError::InvalidFormat(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let agent_id = Uuid::new_v4();
        let now = Utc::now();
        let claims = Claims {
            agent_id,
            iss: ISSUER.to_string(),
            iat: (now - Duration::days(2)).timestamp(),
            nbf: (now - Duration::days(2)).timestamp(),
            exp: (now - Duration::days(1)).timestamp(),
        };
        let token = encode_token(&key(), &claims);
        let result = verify_permanent_token(&key(), &token);
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn not_yet_valid_token_is_rejected() {
        let agent_id = Uuid::new_v4();
        let now = Utc::now();
        let claims = Claims {
            agent_id,
            iss: ISSUER.to_string(),
            iat: now.timestamp(),
            nbf: (now + Duration::days(1)).timestamp(),
            exp: (now + Duration::days(2)).timestamp(),
        };
        let token = encode_token(&key(), &claims);
        let result = verify_permanent_token(&key(), &token);
        assert!(matches!(result, Err(AuthError::NotYetValid)));
    }

    #[tokio::test]
    async fn in_memory_verifier_accepts_any_configured_key() {
        let agent_id = Uuid::new_v4();
        let key_a = b"key-a".to_vec();
        let key_b = b"key-b".to_vec();
        let token = generate_permanent_token(&key_b, agent_id);

        let verifier = InMemoryVerifier::new(vec![key_a, key_b]);
        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.agent_id, agent_id);
    }

    #[tokio::test]
    async fn in_memory_verifier_rejects_unknown_key() {
        let agent_id = Uuid::new_v4();
        let token = generate_permanent_token(&key(), agent_id);

        let verifier = InMemoryVerifier::new(vec![b"other-key".to_vec()]);
        let result = verifier.verify(&token).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn static_verifier_roundtrip() {
        let agent_id = Uuid::new_v4();
        let token = generate_permanent_token(&key(), agent_id);

        let verifier = StaticVerifier::new(key());
        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.agent_id, agent_id);
    }
}
