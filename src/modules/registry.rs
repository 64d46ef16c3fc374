//! Session Registry
//!
//! Issues stream sessions (identifier + signing key pair) and answers
//! validity and public-key queries for the segment and key endpoints.
//! A session is valid from issuance until its TTL elapses; expired records
//! are treated exactly like unknown ones and are reclaimed by a sweeper.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use super::signer::{SessionKeyPair, SignerError};

/// Length of a session identifier in hex characters
pub const SESSION_ID_LEN: usize = 32;

/// Opaque session identifier (128-bit random, lowercase hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().simple().to_string())
    }

    /// Parse an identifier received from a client.
    ///
    /// Only the canonical form is accepted, which also makes the value safe
    /// to use as a directory name.
    pub fn parse(value: &str) -> Option<Self> {
        let well_formed = value.len() == SESSION_ID_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| SessionId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An issued stream session
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub keys: SessionKeyPair,
    /// Wall-clock issuance time
    pub issued_at: DateTime<Utc>,
    /// Monotonic deadline after which the session is invalid
    pub expires_at: Instant,
    pub ttl: Duration,
}

impl Session {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }

    /// Wall-clock expiry in milliseconds since the Unix epoch
    pub fn expires_at_unix_ms(&self) -> i64 {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        self.issued_at.timestamp_millis().saturating_add(ttl_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to generate session keys: {0}")]
    KeyGeneration(#[from] SignerError),
}

/// Shared registry of issued sessions
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        SessionRegistry {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new session with a fresh identifier and key pair.
    ///
    /// The key pair is generated before the registry is locked; the record
    /// becomes visible to lookups in one step.
    pub async fn issue(&self) -> Result<Arc<Session>, RegistryError> {
        let keys = SessionKeyPair::generate()?;

        let mut sessions = self.sessions.write().await;
        let mut id = SessionId::generate();
        while sessions.contains_key(&id) {
            log::warn!("Session id collision, regenerating");
            id = SessionId::generate();
        }

        let session = Arc::new(Session {
            id: id.clone(),
            keys,
            issued_at: Utc::now(),
            expires_at: Instant::now() + self.ttl,
            ttl: self.ttl,
        });
        sessions.insert(id, session.clone());

        log::info!("Session issued: {} (ttl {:?})", session.id, self.ttl);
        Ok(session)
    }

    /// Look up a session that is still valid.
    ///
    /// Unknown and expired sessions both return `None`.
    pub async fn lookup(&self, id: &SessionId) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(session) if session.is_valid() => Some(session.clone()),
            Some(_) => {
                log::debug!("Session expired: {}", id);
                None
            }
            None => {
                log::debug!("Session not found: {}", id);
                None
            }
        }
    }

    /// SPKI DER public key of a valid session
    pub async fn public_key_of(&self, id: &SessionId) -> Option<Vec<u8>> {
        self.lookup(id)
            .await
            .map(|session| session.keys.public_key_der().to_vec())
    }

    /// Remove expired records, returning their identifiers
    pub async fn sweep_expired(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|session| !session.is_valid_at(now))
            .map(|session| session.id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            log::info!("Swept {} expired session(s)", expired.len());
        }
        expired
    }

    /// Number of stored records, including expired ones not yet swept
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::signer;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), SESSION_ID_LEN);
        assert_eq!(SessionId::parse(id.as_str()), Some(id.clone()));
        assert_ne!(id, SessionId::generate());
    }

    #[test]
    fn test_session_id_parse_rejects_non_canonical() {
        assert!(SessionId::parse("").is_none());
        assert!(SessionId::parse("abc").is_none());
        assert!(SessionId::parse("../../../../etc/passwd").is_none());
        assert!(SessionId::parse(&"A".repeat(SESSION_ID_LEN)).is_none());
        assert!(SessionId::parse(&"g".repeat(SESSION_ID_LEN)).is_none());
        assert!(SessionId::parse(&"a".repeat(SESSION_ID_LEN + 1)).is_none());
        assert!(SessionId::parse(&"0".repeat(SESSION_ID_LEN)).is_some());
    }

    #[tokio::test]
    async fn test_issue_then_lookup() {
        let registry = SessionRegistry::new(TTL);
        let session = registry.issue().await.unwrap();

        let found = registry.lookup(&session.id).await.unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert_eq!(
            registry.public_key_of(&session.id).await.unwrap(),
            session.keys.public_key_der()
        );
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = SessionRegistry::new(TTL);
        let id = SessionId::generate();
        assert!(registry.lookup(&id).await.is_none());
        assert!(registry.public_key_of(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_sessions_have_distinct_ids_and_keys() {
        let registry = SessionRegistry::new(TTL);
        let a = registry.issue().await.unwrap();
        let b = registry.issue().await.unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.keys.public_key_der(), b.keys.public_key_der());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_after_ttl() {
        let registry = SessionRegistry::new(TTL);
        let session = registry.issue().await.unwrap();

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert!(registry.lookup(&session.id).await.is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(registry.lookup(&session.id).await.is_none());
        assert!(registry.public_key_of(&session.id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let registry = SessionRegistry::new(TTL);
        let old = registry.issue().await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        let young = registry.issue().await.unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;

        let swept = registry.sweep_expired().await;
        assert_eq!(swept, vec![old.id.clone()]);
        assert_eq!(registry.len().await, 1);
        assert!(registry.lookup(&young.id).await.is_some());
    }

    #[tokio::test]
    async fn test_expiry_timestamp_matches_ttl() {
        let registry = SessionRegistry::new(TTL);
        let session = registry.issue().await.unwrap();
        assert_eq!(
            session.expires_at_unix_ms() - session.issued_at.timestamp_millis(),
            300_000
        );
    }

    #[tokio::test]
    async fn test_session_key_signs_verifiably() {
        let registry = SessionRegistry::new(TTL);
        let session = registry.issue().await.unwrap();

        let digest = signer::digest(b"segment");
        let signature = signer::sign(&digest, session.keys.signing_key()).unwrap();
        let public_key = registry.public_key_of(&session.id).await.unwrap();
        assert!(signer::verify(&digest, &signature, &public_key));
    }

    #[tokio::test]
    async fn test_concurrent_issuance() {
        let registry = SessionRegistry::new(TTL);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.issue().await.unwrap().id.clone() }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_eq!(registry.len().await, 16);
    }
}
