//! Challenge-response authorization for API targets.
//!
//! The client proves possession of a target's shared secret without
//! transmitting it: the server hands out a random challenge, the client
//! answers with `hex(HMAC-SHA256(secret, challenge))`, and a correct
//! answer installs the target into the connection's target map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::session::Session;

use super::ApiError;

/// Challenge length in characters. The contract requires at least 16.
const CHALLENGE_LEN: usize = 24;

/// How long an unanswered challenge stays valid.
const CHALLENGE_TTL: Duration = Duration::from_secs(300);

type HmacSha256 = Hmac<Sha256>;

/// The expected answer to a challenge, for a given shared secret.
pub fn challenge_response(secret: &[u8], challenge: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn random_challenge() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHALLENGE_LEN)
        .map(char::from)
        .collect()
}

struct AuthEntry {
    secret: Vec<u8>,
    session: Arc<Session>,
}

/// Knows, per target ID, the shared secret and the target behind it.
/// Constructor-injected into the server; there is no global registry.
#[derive(Default)]
pub struct TargetAuthority {
    entries: RwLock<HashMap<String, AuthEntry>>,
}

impl TargetAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `session` reachable under `target_id` for holders of `secret`.
    pub async fn register(&self, target_id: &str, secret: &[u8], session: Arc<Session>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            target_id.to_string(),
            AuthEntry { secret: secret.to_vec(), session },
        );
    }

    pub async fn unregister(&self, target_id: &str) {
        self.entries.write().await.remove(target_id);
    }

    pub async fn knows(&self, target_id: &str) -> bool {
        self.entries.read().await.contains_key(target_id)
    }

    async fn resolve(&self, target_id: &str) -> Result<(Vec<u8>, Arc<Session>), ApiError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(target_id)
            .ok_or_else(|| ApiError::UnknownTarget(target_id.to_string()))?;
        Ok((entry.secret.clone(), entry.session.clone()))
    }
}

/// Per-connection table of outstanding challenges. Single-use, expiring.
pub(super) struct ChallengeTable {
    pending: HashMap<String, (String, Instant)>,
}

impl ChallengeTable {
    pub(super) fn new() -> Self {
        Self { pending: HashMap::new() }
    }

    /// Issue a fresh challenge for `target_id`. Unknown targets get no
    /// challenge.
    pub(super) async fn make_challenge(
        &mut self,
        authority: &TargetAuthority,
        target_id: &str,
    ) -> Result<String, ApiError> {
        if !authority.knows(target_id).await {
            return Err(ApiError::UnknownTarget(target_id.to_string()));
        }
        let challenge = random_challenge();
        self.pending
            .insert(challenge.clone(), (target_id.to_string(), Instant::now()));
        Ok(challenge)
    }

    /// Verify an answer. On success, returns the target to install.
    pub(super) async fn answer(
        &mut self,
        authority: &TargetAuthority,
        challenge: &str,
        response: &str,
    ) -> Result<(String, Arc<Session>), ApiError> {
        let (target_id, issued_at) = self
            .pending
            .remove(challenge)
            .ok_or_else(|| ApiError::BadValue("unknown challenge".into()))?;
        if issued_at.elapsed() > CHALLENGE_TTL {
            return Err(ApiError::BadValue("challenge expired".into()));
        }
        let (secret, session) = authority.resolve(&target_id).await?;
        if challenge_response(&secret, challenge) != response {
            return Err(ApiError::BadValue("challenge response mismatch".into()));
        }
        Ok((target_id, session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_response_deterministic() {
        let a = challenge_response(b"secret", "challenge-1");
        let b = challenge_response(b"secret", "challenge-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_challenge_response_varies() {
        let base = challenge_response(b"secret", "challenge-1");
        assert_ne!(base, challenge_response(b"secret", "challenge-2"));
        assert_ne!(base, challenge_response(b"other", "challenge-1"));
    }

    #[test]
    fn test_challenge_length() {
        let c = random_challenge();
        assert!(c.len() >= 16);
        assert!(c.chars().all(|ch| ch.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_unknown_target_gets_no_challenge() {
        let authority = TargetAuthority::new();
        let mut table = ChallengeTable::new();
        let err = table.make_challenge(&authority, "nobody").await.unwrap_err();
        assert!(matches!(err, ApiError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn test_challenge_single_use() {
        let authority = TargetAuthority::new();
        // An entry without a real document is enough to exercise the
        // challenge flow.
        let session = crate::doc::DocComplex::open_in_memory("doc-auth")
            .await
            .unwrap()
            .new_session("alice")
            .await
            .unwrap();
        authority.register("t1", b"key", session).await;

        let mut table = ChallengeTable::new();
        let challenge = table.make_challenge(&authority, "t1").await.unwrap();
        let answer = challenge_response(b"key", &challenge);

        table.answer(&authority, &challenge, &answer).await.unwrap();
        // Replaying the same challenge fails.
        assert!(table.answer(&authority, &challenge, &answer).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_response_rejected() {
        let authority = TargetAuthority::new();
        let session = crate::doc::DocComplex::open_in_memory("doc-auth2")
            .await
            .unwrap()
            .new_session("alice")
            .await
            .unwrap();
        authority.register("t1", b"key", session).await;

        let mut table = ChallengeTable::new();
        let challenge = table.make_challenge(&authority, "t1").await.unwrap();
        let bad = challenge_response(b"wrong-key", &challenge);
        assert!(table.answer(&authority, &challenge, &bad).await.is_err());
    }
}
