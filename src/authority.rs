//! The credential session authority.
//!
//! Owns every issuance session and is the only thing that moves one
//! forward: `Offered -> TokenIssued -> CredentialIssued`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, SecondsFormat, Utc};
use rocket::{
    fairing::AdHoc,
    tokio::{
        sync::{Mutex as AsyncMutex, OwnedMutexGuard},
        time::{interval, MissedTickBehavior},
    },
};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    credential::CredentialSigner,
    error::Error,
    session::{generate_secret, CredentialOffer, Session, SessionState, Transition},
    store::{SessionStore, StoreError},
    types::{Config, ReissuePolicy},
};

/// A freshly created offer: the code and the URI a wallet dereferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedOffer {
    pub code: String,
    pub offer_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct SessionAuthority {
    config: Arc<Config>,
    store: Arc<dyn SessionStore>,
    signer: Arc<dyn CredentialSigner>,
    issuance_locks: Arc<IssuanceLocks>,
}

impl SessionAuthority {
    pub fn new(
        config: Config,
        store: Arc<dyn SessionStore>,
        signer: Arc<dyn CredentialSigner>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            signer,
            issuance_locks: Arc::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a new issuance. `subject` defaults to the configured claims;
    /// an empty one is refused.
    #[instrument(level = "debug", skip_all)]
    pub fn create_offer(&self, subject: Option<Map<String, Value>>) -> Result<CreatedOffer, Error> {
        let subject = match subject {
            Some(subject) if subject.is_empty() => {
                return Err(Error::InvalidRequest("credential_subject must not be empty".into()))
            }
            Some(subject) => subject,
            None => self.config.default_subject.clone(),
        };

        let now = Utc::now();
        let code = generate_secret();
        let offer = CredentialOffer::new(&self.config, &code);

        self.store.insert(Session::offered(
            code.clone(),
            offer,
            subject,
            now,
            now + self.config.offer_ttl,
        ))?;

        let offer_uri = crate::offer::offer_uri(&self.config, &code);
        info!(expires_in = self.config.offer_ttl.num_seconds(), "credential offer created");

        Ok(CreatedOffer { code, offer_uri })
    }

    /// Returns the offer exactly as created. Never changes the session.
    #[instrument(level = "debug", skip_all)]
    pub fn resolve_offer(&self, code: &str) -> Result<CredentialOffer, Error> {
        match self.live_session(code)? {
            Some(session) => Ok(session.offer),
            None => {
                debug!("offer lookup for unknown or expired code");
                Err(Error::OfferNotFound)
            }
        }
    }

    /// Exchanges a pre-authorized code for an access token, exactly once.
    #[instrument(level = "debug", skip_all)]
    pub fn redeem_token(&self, code: &str) -> Result<AccessToken, Error> {
        let now = Utc::now();
        let token = generate_secret();
        let transition = Transition::RedeemToken {
            token: token.clone(),
            expires_at: now + self.config.token_ttl,
        };

        match self.store.transition(code, transition, now) {
            Ok(_) => {
                info!("pre-authorized code redeemed");
                Ok(AccessToken {
                    token,
                    expires_in: self.config.token_ttl.num_seconds(),
                })
            }
            Err(StoreError::NotFound) => {
                warn!("token requested for unknown or expired code");
                Err(Error::InvalidGrant)
            }
            Err(StoreError::Conflict { actual, .. }) => {
                warn!(state = %actual, "pre-authorized code replayed");
                Err(Error::AlreadyRedeemed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Exchanges an access token for the signed credential of its session.
    ///
    /// The signer runs at most once per session. Concurrent requests for the
    /// same session wait for the first one and then follow the re-issue
    /// policy.
    #[instrument(level = "debug", skip_all)]
    pub async fn issue_credential(&self, token: &str) -> Result<Value, Error> {
        if token.is_empty() {
            return Err(Error::InvalidToken);
        }

        let code = match self.live_session_by_token(token)? {
            Some(session) => session.code,
            None => {
                warn!("credential requested with unknown or expired token");
                return Err(Error::InvalidToken);
            }
        };

        let _guard = self.issuance_locks.acquire(&code).await?;

        // The session may have moved on while we waited.
        let session = match self.live_session(&code)? {
            Some(session) if session.token.as_deref() == Some(token) => session,
            _ => return Err(Error::InvalidToken),
        };

        match session.state {
            SessionState::Offered => Err(Error::InvalidToken),
            SessionState::CredentialIssued => self.reissue(session),
            SessionState::TokenIssued => {
                let now = Utc::now();
                let unsigned = self.unsigned_credential(&session, now);
                let credential = self.signer.sign(unsigned).await.map_err(|e| {
                    warn!(error = %e, "credential signing failed");
                    Error::SigningFailed(e.to_string())
                })?;

                let transition = Transition::IssueCredential {
                    credential: credential.clone(),
                };
                match self.store.transition(&code, transition, now) {
                    Ok(_) => {
                        info!("credential issued");
                        Ok(credential)
                    }
                    // Another process sharing the store got there first.
                    Err(StoreError::Conflict {
                        actual: SessionState::CredentialIssued,
                        ..
                    }) => match self.live_session(&code)? {
                        Some(session) => self.reissue(session),
                        None => Err(Error::InvalidToken),
                    },
                    Err(StoreError::NotFound) => Err(Error::InvalidToken),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Administrative removal of a session and its token binding.
    #[instrument(level = "debug", skip_all)]
    pub fn evict(&self, code: &str) -> Result<bool, Error> {
        let removed = self.store.remove(code)?;
        if removed {
            info!("session evicted");
        }
        Ok(removed)
    }

    pub fn evict_expired(&self) -> Result<usize, Error> {
        let evicted = self.store.evict_expired(Utc::now())?;
        if evicted > 0 {
            info!(evicted, "expired sessions evicted");
        }
        Ok(evicted)
    }

    fn reissue(&self, session: Session) -> Result<Value, Error> {
        match self.config.reissue_policy {
            ReissuePolicy::Redeliver => {
                debug!("re-delivering issued credential");
                session.credential.ok_or_else(|| {
                    Error::StorageUnavailable("issued session has no credential recorded".into())
                })
            }
            ReissuePolicy::Reject => {
                warn!("credential already issued for token");
                Err(Error::AlreadyIssued)
            }
        }
    }

    fn unsigned_credential(&self, session: &Session, now: DateTime<Utc>) -> Value {
        json!({
            "@context": ["https://www.w3.org/2018/credentials/v1"],
            "id": format!("urn:uuid:{}", Uuid::new_v4()),
            "type": self.config.credential_types,
            "issuer": self.signer.issuer(),
            "issuanceDate": now.to_rfc3339_opts(SecondsFormat::Secs, true),
            "credentialSubject": session.subject,
        })
    }

    fn live_session(&self, code: &str) -> Result<Option<Session>, Error> {
        let now = Utc::now();
        Ok(self.store.get(code)?.filter(|s| !s.is_expired(now)))
    }

    fn live_session_by_token(&self, token: &str) -> Result<Option<Session>, Error> {
        let now = Utc::now();
        Ok(self
            .store
            .get_by_token(token)?
            .filter(|s| !s.is_expired(now) && s.token.as_deref() == Some(token)))
    }
}

/// One async lock per session code, held across signing.
#[derive(Default)]
struct IssuanceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

struct IssuanceGuard<'a> {
    locks: &'a IssuanceLocks,
    code: String,
    guard: OwnedMutexGuard<()>,
}

impl IssuanceLocks {
    async fn acquire(&self, code: &str) -> Result<IssuanceGuard<'_>, Error> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|_| {
                Error::StorageUnavailable("issuance lock table poisoned".into())
            })?;
            locks.entry(code.to_string()).or_default().clone()
        };

        Ok(IssuanceGuard {
            locks: self,
            code: code.to_string(),
            guard: lock.lock_owned().await,
        })
    }
}

impl Drop for IssuanceGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.locks.lock() {
            // Only the table and this guard hold it: nobody is waiting.
            if Arc::strong_count(OwnedMutexGuard::mutex(&self.guard)) == 2 {
                locks.remove(&self.code);
            }
        }
    }
}

/// Periodically evicts expired sessions once the server is up.
pub fn eviction_fairing() -> AdHoc {
    AdHoc::on_liftoff("Session Eviction", |orbit| {
        Box::pin(async move {
            let authority = match orbit.state::<SessionAuthority>() {
                Some(authority) => authority.clone(),
                None => {
                    warn!("no session authority managed; eviction disabled");
                    return;
                }
            };

            let mut ticker = interval(authority.config().eviction_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            rocket::tokio::spawn(async move {
                loop {
                    ticker.tick().await;
                    if let Err(e) = authority.evict_expired() {
                        warn!(error = %e, "session eviction failed");
                    }
                }
            });
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use async_trait::async_trait;
    use chrono::Duration;
    use rocket::futures::future::join_all;

    use super::*;
    use crate::credential::SignerError;
    use crate::store::MemorySessionStore;

    #[derive(Default)]
    struct CountingSigner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialSigner for CountingSigner {
        fn issuer(&self) -> &str {
            "did:example:issuer"
        }

        async fn sign(&self, credential: Value) -> Result<Value, SignerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            rocket::tokio::task::yield_now().await;
            let mut credential = credential;
            credential["proof"] = json!({ "type": "TestSignature" });
            Ok(credential)
        }
    }

    struct FailingSigner;

    #[async_trait]
    impl CredentialSigner for FailingSigner {
        fn issuer(&self) -> &str {
            "did:example:issuer"
        }

        async fn sign(&self, _: Value) -> Result<Value, SignerError> {
            Err(SignerError::Signing("key unavailable".into()))
        }
    }

    fn authority_with(config: Config) -> (SessionAuthority, Arc<CountingSigner>) {
        let signer = Arc::new(CountingSigner::default());
        let authority =
            SessionAuthority::new(config, Arc::new(MemorySessionStore::new()), signer.clone());
        (authority, signer)
    }

    fn authority() -> (SessionAuthority, Arc<CountingSigner>) {
        authority_with(Config::default())
    }

    #[test]
    fn created_offer_resolves_to_its_own_code() {
        let (authority, _) = authority();
        let created = authority.create_offer(None).unwrap();

        let offer = authority.resolve_offer(&created.code).unwrap();
        assert_eq!(offer.pre_authorized_code(), created.code);
        assert!(created
            .offer_uri
            .starts_with("openid-credential-offer://?credential_offer_uri="));
    }

    #[test]
    fn codes_are_unique_across_offers() {
        let (authority, _) = authority();
        let a = authority.create_offer(None).unwrap();
        let b = authority.create_offer(None).unwrap();
        assert_ne!(a.code, b.code);
    }

    #[test]
    fn unknown_code_is_not_found_or_invalid_grant() {
        let (authority, _) = authority();
        assert_eq!(
            authority.resolve_offer("does-not-exist"),
            Err(Error::OfferNotFound)
        );
        assert_eq!(
            authority.redeem_token("does-not-exist"),
            Err(Error::InvalidGrant)
        );
    }

    #[test]
    fn second_redemption_is_rejected() {
        let (authority, _) = authority();
        let created = authority.create_offer(None).unwrap();

        let token = authority.redeem_token(&created.code).unwrap();
        assert_eq!(token.expires_in, Duration::days(1).num_seconds());
        assert_eq!(
            authority.redeem_token(&created.code),
            Err(Error::AlreadyRedeemed)
        );
    }

    #[test]
    fn concurrent_redemptions_have_exactly_one_winner() {
        let (authority, _) = authority();
        let code = authority.create_offer(None).unwrap().code;

        let results: Vec<Result<AccessToken, Error>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..100)
                .map(|_| scope.spawn(|| authority.redeem_token(&code)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| **r == Err(Error::AlreadyRedeemed))
                .count(),
            99
        );
    }

    #[test]
    fn expired_offer_cannot_be_resolved_or_redeemed() {
        let (authority, _) = authority_with(Config {
            offer_ttl: Duration::milliseconds(-1),
            ..Config::default()
        });
        let created = authority.create_offer(None).unwrap();

        assert_eq!(
            authority.resolve_offer(&created.code),
            Err(Error::OfferNotFound)
        );
        assert_eq!(
            authority.redeem_token(&created.code),
            Err(Error::InvalidGrant)
        );
        assert_eq!(authority.evict_expired(), Ok(1));
    }

    #[test]
    fn empty_subject_is_refused_at_offer_time() {
        let (authority, _) = authority();
        assert!(matches!(
            authority.create_offer(Some(Map::new())),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[rocket::async_test]
    async fn expired_token_is_invalid_and_evicted() {
        let store = Arc::new(MemorySessionStore::new());
        let signer = Arc::new(CountingSigner::default());
        let authority = SessionAuthority::new(
            Config {
                token_ttl: Duration::milliseconds(-1),
                ..Config::default()
            },
            store.clone(),
            signer.clone(),
        );
        let code = authority.create_offer(None).unwrap().code;
        let token = authority.redeem_token(&code).unwrap().token;

        assert_eq!(
            authority.issue_credential(&token).await,
            Err(Error::InvalidToken)
        );
        assert_eq!(authority.resolve_offer(&code), Err(Error::OfferNotFound));
        assert_eq!(
            authority.redeem_token(&code),
            Err(Error::InvalidGrant)
        );
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);

        assert!(store.get_by_token(&token).unwrap().is_some());
        assert_eq!(authority.evict_expired(), Ok(1));
        assert!(store.get_by_token(&token).unwrap().is_none());
        assert!(store.get(&code).unwrap().is_none());
    }

    #[rocket::async_test]
    async fn issues_credential_for_the_tokens_own_session() {
        let (authority, signer) = authority();

        let mut alice = Map::new();
        alice.insert("name".into(), json!("Alice"));
        let mut bob = Map::new();
        bob.insert("name".into(), json!("Bob"));

        let a = authority.create_offer(Some(alice)).unwrap();
        let b = authority.create_offer(Some(bob)).unwrap();
        let token_a = authority.redeem_token(&a.code).unwrap().token;
        let token_b = authority.redeem_token(&b.code).unwrap().token;
        assert_ne!(token_a, token_b);

        let credential = authority.issue_credential(&token_a).await.unwrap();
        assert_eq!(credential["credentialSubject"]["name"], "Alice");
        assert_eq!(credential["issuer"], "did:example:issuer");
        assert!(credential["id"].as_str().unwrap().starts_with("urn:uuid:"));

        let credential = authority.issue_credential(&token_b).await.unwrap();
        assert_eq!(credential["credentialSubject"]["name"], "Bob");
        assert_eq!(signer.calls.load(Ordering::SeqCst), 2);
    }

    #[rocket::async_test]
    async fn unknown_token_never_reaches_the_signer() {
        let (authority, signer) = authority();
        let created = authority.create_offer(None).unwrap();

        assert_eq!(
            authority.issue_credential("not-a-token").await,
            Err(Error::InvalidToken)
        );
        assert_eq!(authority.issue_credential("").await, Err(Error::InvalidToken));
        // The code itself is not a token.
        assert_eq!(
            authority.issue_credential(&created.code).await,
            Err(Error::InvalidToken)
        );
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }

    #[rocket::async_test]
    async fn repeat_issuance_redelivers_the_same_credential() {
        let (authority, signer) = authority();
        let code = authority.create_offer(None).unwrap().code;
        let token = authority.redeem_token(&code).unwrap().token;

        let first = authority.issue_credential(&token).await.unwrap();
        let second = authority.issue_credential(&token).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[rocket::async_test]
    async fn repeat_issuance_is_rejected_under_reject_policy() {
        let (authority, signer) = authority_with(Config {
            reissue_policy: ReissuePolicy::Reject,
            ..Config::default()
        });
        let code = authority.create_offer(None).unwrap().code;
        let token = authority.redeem_token(&code).unwrap().token;

        authority.issue_credential(&token).await.unwrap();
        assert_eq!(
            authority.issue_credential(&token).await,
            Err(Error::AlreadyIssued)
        );
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[rocket::async_test]
    async fn concurrent_issuance_signs_once() {
        let (authority, signer) = authority();
        let code = authority.create_offer(None).unwrap().code;
        let token = authority.redeem_token(&code).unwrap().token;

        let results = join_all((0..20).map(|_| authority.issue_credential(&token))).await;

        let first = results[0].clone().unwrap();
        assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
        assert!(authority.issuance_locks.locks.lock().unwrap().is_empty());
    }

    #[rocket::async_test]
    async fn signing_failure_leaves_session_redeemable_for_retry() {
        let store = Arc::new(MemorySessionStore::new());
        let failing = SessionAuthority::new(Config::default(), store.clone(), Arc::new(FailingSigner));
        let code = failing.create_offer(None).unwrap().code;
        let token = failing.redeem_token(&code).unwrap().token;

        assert!(matches!(
            failing.issue_credential(&token).await,
            Err(Error::SigningFailed(_))
        ));
        assert_eq!(
            store.get(&code).unwrap().unwrap().state,
            SessionState::TokenIssued
        );

        let working = SessionAuthority::new(
            Config::default(),
            store,
            Arc::new(CountingSigner::default()),
        );
        assert!(working.issue_credential(&token).await.is_ok());
    }

    #[rocket::async_test]
    async fn resolution_is_stable_across_states() {
        let (authority, _) = authority();
        let code = authority.create_offer(None).unwrap().code;
        let offered = authority.resolve_offer(&code).unwrap();

        let token = authority.redeem_token(&code).unwrap().token;
        assert_eq!(authority.resolve_offer(&code).unwrap(), offered);

        authority.issue_credential(&token).await.unwrap();
        assert_eq!(
            serde_json::to_string(&authority.resolve_offer(&code).unwrap()).unwrap(),
            serde_json::to_string(&offered).unwrap()
        );
    }

    #[rocket::async_test]
    async fn evicted_session_token_is_invalid() {
        let (authority, _) = authority();
        let code = authority.create_offer(None).unwrap().code;
        let token = authority.redeem_token(&code).unwrap().token;

        assert_eq!(authority.evict(&code), Ok(true));
        assert_eq!(
            authority.issue_credential(&token).await,
            Err(Error::InvalidToken)
        );
        assert_eq!(authority.resolve_offer(&code), Err(Error::OfferNotFound));
    }
}
