//! Session storage.
//!
//! Every state change goes through [`SessionStore::transition`], a
//! compare-and-transition keyed by the expected prior state. Implementations
//! must make it atomic with respect to every other call on the same session.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::{Session, SessionState, Transition};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no live session for the given key")]
    NotFound,

    #[error("session is {actual}, expected {expected}")]
    Conflict {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("a session with this code already exists")]
    Duplicate,

    #[error("{0}")]
    Unavailable(String),
}

pub trait SessionStore: Send + Sync {
    /// Stores a fresh session. Fails with `Duplicate` if the code is taken.
    fn insert(&self, session: Session) -> Result<(), StoreError>;

    /// Looks a session up by its pre-authorized code.
    fn get(&self, code: &str) -> Result<Option<Session>, StoreError>;

    /// Looks a session up by its bound access token.
    fn get_by_token(&self, token: &str) -> Result<Option<Session>, StoreError>;

    /// Applies `transition` if the session is live at `now` and sits in the
    /// transition's prior state. Returns the updated session.
    fn transition(
        &self,
        code: &str,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError>;

    /// Removes one session and its token binding.
    fn remove(&self, code: &str) -> Result<bool, StoreError>;

    /// Removes every session expired at `now`. Returns how many went.
    fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct Sessions {
    by_code: HashMap<String, Session>,
    codes_by_token: HashMap<String, String>,
}

impl Sessions {
    fn unbind(&mut self, session: &Session) {
        if let Some(token) = &session.token {
            self.codes_by_token.remove(token);
        }
    }
}

/// Process-local store. A single lock covers both indexes so a transition
/// and its token binding land together.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<Sessions>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Sessions>, StoreError> {
        self.sessions
            .lock()
            .map_err(|_| StoreError::Unavailable("session store lock poisoned".into()))
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut sessions = self.lock()?;
        if sessions.by_code.contains_key(&session.code) {
            return Err(StoreError::Duplicate);
        }
        sessions.by_code.insert(session.code.clone(), session);
        Ok(())
    }

    fn get(&self, code: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.lock()?.by_code.get(code).cloned())
    }

    fn get_by_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
        let sessions = self.lock()?;
        Ok(sessions
            .codes_by_token
            .get(token)
            .and_then(|code| sessions.by_code.get(code))
            .cloned())
    }

    fn transition(
        &self,
        code: &str,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.lock()?;
        let Sessions {
            by_code,
            codes_by_token,
        } = &mut *sessions;

        let session = match by_code.get_mut(code) {
            Some(session) if !session.is_expired(now) => session,
            _ => return Err(StoreError::NotFound),
        };

        let expected = transition.from_state();
        if session.state != expected {
            return Err(StoreError::Conflict {
                expected,
                actual: session.state,
            });
        }

        if let Transition::RedeemToken { token, .. } = &transition {
            if codes_by_token.contains_key(token) {
                return Err(StoreError::Duplicate);
            }
            codes_by_token.insert(token.clone(), code.to_string());
        }

        transition.apply(session);
        Ok(session.clone())
    }

    fn remove(&self, code: &str) -> Result<bool, StoreError> {
        let mut sessions = self.lock()?;
        match sessions.by_code.remove(code) {
            Some(session) => {
                sessions.unbind(&session);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sessions = self.lock()?;
        let expired: Vec<Session> = sessions
            .by_code
            .values()
            .filter(|session| session.is_expired(now))
            .cloned()
            .collect();

        for session in &expired {
            sessions.by_code.remove(&session.code);
            sessions.unbind(session);
        }

        Ok(expired.len())
    }
}
