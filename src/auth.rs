//! C4: credential verifier.
//!
//! Three credential shapes converge on one resolver that always requires
//! a live [`SessionRecord`](crate::session::SessionRecord) and returns a
//! [`Principal`]. API-key comparison goes through `subtle`'s constant-time
//! equality so a near-miss secret takes the same time as an exact miss.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{CoreError, Result};
use crate::events::{AuthResult, CoreEvent, EventBus};
use crate::session::SessionStore;

/// The resolved identity behind any accepted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
    pub roles: HashSet<String>,
    pub session_id: String,
}

/// One of the three credential shapes the operation contract accepts.
#[derive(Debug, Clone)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
    RawSessionId(String),
}

/// Claims carried inside a bearer access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub username: String,
    pub roles: Vec<String>,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub iat: i64,
    pub exp: i64,
}

/// A long-lived API key record as held in the key store.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub user_id: String,
    pub name: String,
    pub roles: HashSet<String>,
    /// SHA-256 digest of the secret, never the secret itself.
    pub secret_digest: [u8; 32],
}

/// Long-lived store of API keys, looked up by digest.
#[derive(Default)]
pub struct ApiKeyStore {
    keys: Vec<ApiKeyRecord>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record: ApiKeyRecord) {
        self.keys.push(record);
    }

    /// Constant-time lookup: every stored key is compared, regardless of
    /// whether an earlier one already matched, so the search time does
    /// not leak how many keys preceded the match.
    fn find(&self, secret: &str) -> Option<&ApiKeyRecord> {
        let digest = digest_secret(secret);
        let mut found: Option<&ApiKeyRecord> = None;
        for key in &self.keys {
            if bool::from(digest.ct_eq(&key.secret_digest)) {
                found = Some(key);
            }
        }
        found
    }
}

/// Digest a plaintext secret (password or API key) for storage/comparison.
/// Callers provisioning [`UserRecord`]/[`ApiKeyRecord`]s out of band use
/// this so the plaintext secret itself is never persisted.
pub fn digest_secret(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// A registered user, as consulted by `CreateSession`'s username/password
/// login step . Stores a digest, never the password itself,
/// following the same pattern as [`ApiKeyRecord`].
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub roles: HashSet<String>,
    pub password_digest: [u8; 32],
}

/// Long-lived store of registered users, looked up by username then
/// verified by constant-time password digest comparison.
#[derive(Default)]
pub struct UserStore {
    users: Vec<UserRecord>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record: UserRecord) {
        self.users.push(record);
    }

    /// Verify `username`/`password`, returning the matching record only on
    /// an exact password match. The username lookup is a plain scan (not
    /// secret, so no constant-time requirement); the password comparison
    /// itself goes through `subtle` like [`ApiKeyStore::find`].
    pub fn verify_password(&self, username: &str, password: &str) -> Option<&UserRecord> {
        let digest = digest_secret(password);
        self.users
            .iter()
            .find(|u| u.username == username)
            .filter(|u| bool::from(digest.ct_eq(&u.password_digest)))
    }
}

/// Verifies the three credential shapes and resolves each to a live session.
pub struct CredentialVerifier {
    jwt_decoding_key: DecodingKey,
    jwt_encoding_key: EncodingKey,
    jwt_validation: Validation,
    api_keys: ApiKeyStore,
    sessions: Arc<SessionStore>,
    events: EventBus,
}

impl CredentialVerifier {
    pub fn new(hmac_secret: &[u8], api_keys: ApiKeyStore, sessions: Arc<SessionStore>, events: EventBus) -> Self {
        Self {
            jwt_decoding_key: DecodingKey::from_secret(hmac_secret),
            jwt_encoding_key: EncodingKey::from_secret(hmac_secret),
            jwt_validation: Validation::new(jsonwebtoken::Algorithm::HS256),
            api_keys,
            sessions,
            events,
        }
    }

    /// Mint a signed access token for an already-created session.
    pub fn issue_access_token(&self, claims: &AccessTokenClaims) -> Result<String> {
        jsonwebtoken::encode(&jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256), claims, &self.jwt_encoding_key)
            .map_err(|e| CoreError::Internal(format!("token signing failed: {e}")))
    }

    /// Mint a long-lived refresh token for `CreateSession`'s response
    /// . No dedicated refresh-exchange operation is in
    /// scope; the token is opaque to this crate beyond its own signature.
    pub fn issue_refresh_token(&self, claims: &AccessTokenClaims) -> Result<String> {
        self.issue_access_token(claims)
    }

    pub fn verify(&self, credential: &Credential, now: DateTime<Utc>) -> Result<Principal> {
        let result = self.verify_inner(credential, now);
        match &result {
            Ok(principal) => log::debug!("credential verified for session {}", principal.session_id),
            Err(e) => log::warn!("⚠️ credential verification failed: {e}"),
        }
        self.events.publish(CoreEvent::AuthAttempt {
            session_id: result.as_ref().ok().map(|p| p.session_id.clone()),
            result: if result.is_ok() { AuthResult::Allowed } else { AuthResult::Denied },
        });
        result
    }

    fn verify_inner(&self, credential: &Credential, now: DateTime<Utc>) -> Result<Principal> {
        match credential {
            Credential::Bearer(token) => self.verify_bearer(token),
            Credential::ApiKey(secret) => self.verify_api_key(secret),
            Credential::RawSessionId(session_id) => self.verify_raw_session(session_id, now),
        }
    }

    fn verify_bearer(&self, token: &str) -> Result<Principal> {
        let data = jsonwebtoken::decode::<AccessTokenClaims>(token, &self.jwt_decoding_key, &self.jwt_validation)
            .map_err(|_| CoreError::Unauthenticated("invalid or expired access token".into()))?;
        let claims = data.claims;
        self.require_live_session(&claims.session_id)?;
        Ok(Principal {
            user_id: claims.sub,
            username: claims.username,
            roles: claims.roles.into_iter().collect(),
            session_id: claims.session_id,
        })
    }

    fn verify_api_key(&self, secret: &str) -> Result<Principal> {
        let record = self
            .api_keys
            .find(secret)
            .ok_or_else(|| CoreError::Unauthenticated("unknown api key".into()))?;
        // Synthetic session id,; no session-store lookup
        // is required (or possible) for an api-key principal.
        Ok(Principal {
            user_id: record.user_id.clone(),
            username: record.name.clone(),
            roles: record.roles.clone(),
            session_id: format!("apikey:{}", record.key_id),
        })
    }

    fn verify_raw_session(&self, session_id: &str, _now: DateTime<Utc>) -> Result<Principal> {
        let record = self.require_live_session(session_id)?;
        Ok(Principal {
            user_id: record.user_id,
            username: record.username,
            roles: record.roles,
            session_id: record.session_id,
        })
    }

    fn require_live_session(&self, session_id: &str) -> Result<crate::session::SessionRecord> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| CoreError::Unauthenticated(format!("session {session_id} expired or unknown")))
    }
}
