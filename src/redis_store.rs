//! Redis-backed [`SessionStore`].
//!
//! A session is a hash under `<prefix>session:<code>`; the token index is a
//! plain key `<prefix>token:<token>` holding the code. Both carry a Redis
//! expiry matching the session's `expires_at`, so eviction is left to Redis.
//! Transitions run as Lua scripts so the state check and the write are one
//! atomic step on the server.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use redis::{Client, Connection, Script};

use crate::{
    session::{Session, SessionState, Transition},
    store::{SessionStore, StoreError},
};

pub const DEFAULT_PREFIX: &str = "preauth:";

const INSERT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 2))
redis.call('PEXPIREAT', KEYS[1], ARGV[1])
return 1
";

const TRANSITION: &str = r"
local fields = redis.call('HMGET', KEYS[1], 'state', 'expires_at')
if not fields[1] or tonumber(fields[2]) <= tonumber(ARGV[3]) then
    return 'missing'
end
if fields[1] ~= ARGV[1] then
    return fields[1]
end
if ARGV[4] == 'redeem' then
    if redis.call('EXISTS', KEYS[2]) == 1 then
        return 'duplicate'
    end
    redis.call('HSET', KEYS[1], 'state', ARGV[2], 'token', ARGV[5], 'expires_at', ARGV[6])
    redis.call('PEXPIREAT', KEYS[1], ARGV[6])
    redis.call('SET', KEYS[2], ARGV[7])
    redis.call('PEXPIREAT', KEYS[2], ARGV[6])
else
    redis.call('HSET', KEYS[1], 'state', ARGV[2], 'credential', ARGV[5])
end
return 'ok'
";

const REMOVE: &str = r"
local token = redis.call('HGET', KEYS[1], 'token')
local removed = redis.call('DEL', KEYS[1])
if token then
    redis.call('DEL', ARGV[1] .. token)
end
return removed
";

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        StoreError::Unavailable(error.to_string())
    }
}

pub struct RedisSessionStore {
    client: Client,
    prefix: String,
    insert: Script,
    transition: Script,
    remove: Script,
}

impl RedisSessionStore {
    pub fn new(client: Client) -> Self {
        Self::with_prefix(client, DEFAULT_PREFIX)
    }

    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(Client::open(url)?))
    }

    pub fn with_prefix(client: Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            insert: Script::new(INSERT),
            transition: Script::new(TRANSITION),
            remove: Script::new(REMOVE),
        }
    }

    fn session_key(&self, code: &str) -> String {
        format!("{}session:{}", self.prefix, code)
    }

    fn token_prefix(&self) -> String {
        format!("{}token:", self.prefix)
    }

    fn token_key(&self, token: &str) -> String {
        format!("{}{}", self.token_prefix(), token)
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        Ok(self.client.get_connection()?)
    }

    fn load(&self, conn: &mut Connection, code: &str) -> Result<Option<Session>, StoreError> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.session_key(code))
            .query(conn)?;
        if fields.is_empty() {
            return Ok(None);
        }
        from_fields(code, &fields).map(Some)
    }
}

impl SessionStore for RedisSessionStore {
    fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let mut invocation = self.insert.key(self.session_key(&session.code));
        invocation.arg(session.expires_at.timestamp_millis());
        for (field, value) in to_fields(&session)? {
            invocation.arg(field).arg(value);
        }

        let inserted: i64 = invocation.invoke(&mut conn)?;
        if inserted == 0 {
            return Err(StoreError::Duplicate);
        }
        Ok(())
    }

    fn get(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let mut conn = self.connection()?;
        self.load(&mut conn, code)
    }

    fn get_by_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
        let mut conn = self.connection()?;
        let code: Option<String> = redis::cmd("GET")
            .arg(self.token_key(token))
            .query(&mut conn)?;
        match code {
            Some(code) => self.load(&mut conn, &code),
            None => Ok(None),
        }
    }

    fn transition(
        &self,
        code: &str,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let mut conn = self.connection()?;
        let expected = transition.from_state();
        let next = transition.to_state();

        let mut invocation = match &transition {
            Transition::RedeemToken { token, .. } => {
                let mut invocation = self.transition.key(self.session_key(code));
                invocation.key(self.token_key(token));
                invocation
            }
            Transition::IssueCredential { .. } => {
                let session_key = self.session_key(code);
                let mut invocation = self.transition.key(&session_key);
                invocation.key(&session_key);
                invocation
            }
        };
        invocation
            .arg(expected.as_str())
            .arg(next.as_str())
            .arg(now.timestamp_millis());

        match transition {
            Transition::RedeemToken { token, expires_at } => {
                invocation
                    .arg("redeem")
                    .arg(token)
                    .arg(expires_at.timestamp_millis())
                    .arg(code);
            }
            Transition::IssueCredential { credential } => {
                invocation.arg("issue").arg(encode(&credential)?);
            }
        }

        let outcome: String = invocation.invoke(&mut conn)?;
        match outcome.as_str() {
            "ok" => self.load(&mut conn, code)?.ok_or(StoreError::NotFound),
            "missing" => Err(StoreError::NotFound),
            "duplicate" => Err(StoreError::Duplicate),
            actual => match SessionState::parse(actual) {
                Some(actual) => Err(StoreError::Conflict { expected, actual }),
                None => Err(StoreError::Unavailable(format!(
                    "unexpected session state '{}'",
                    actual
                ))),
            },
        }
    }

    fn remove(&self, code: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let removed: i64 = self
            .remove
            .key(self.session_key(code))
            .arg(self.token_prefix())
            .invoke(&mut conn)?;
        Ok(removed > 0)
    }

    fn evict_expired(&self, _now: DateTime<Utc>) -> Result<usize, StoreError> {
        // Key expiry is set on every write; Redis drops them itself.
        Ok(0)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn to_fields(session: &Session) -> Result<Vec<(&'static str, String)>, StoreError> {
    let mut fields = vec![
        ("state", session.state.as_str().to_string()),
        ("offer", encode(&session.offer)?),
        ("subject", encode(&session.subject)?),
        ("created_at", session.created_at.timestamp_millis().to_string()),
        ("expires_at", session.expires_at.timestamp_millis().to_string()),
    ];
    if let Some(token) = &session.token {
        fields.push(("token", token.clone()));
    }
    if let Some(credential) = &session.credential {
        fields.push(("credential", encode(credential)?));
    }
    Ok(fields)
}

fn from_fields(code: &str, fields: &HashMap<String, String>) -> Result<Session, StoreError> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Unavailable(format!("session {} lacks '{}'", code, name)))
    };
    let millis = |name: &str| -> Result<DateTime<Utc>, StoreError> {
        field(name)?
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| StoreError::Unavailable(format!("session {} has a bad '{}'", code, name)))
    };

    let state = SessionState::parse(field("state")?)
        .ok_or_else(|| StoreError::Unavailable(format!("session {} has a bad state", code)))?;

    Ok(Session {
        code: code.to_string(),
        state,
        offer: decode(field("offer")?)?,
        subject: decode(field("subject")?)?,
        token: fields.get("token").cloned(),
        credential: fields.get("credential").map(|c| decode(c)).transpose()?,
        created_at: millis("created_at")?,
        expires_at: millis("expires_at")?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::session::CredentialOffer;
    use crate::types::Config;

    fn session() -> Session {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let mut subject = serde_json::Map::new();
        subject.insert("seat".into(), json!("A1"));
        Session::offered(
            "c1".into(),
            CredentialOffer::new(&Config::default(), "c1"),
            subject,
            now,
            now + Duration::minutes(5),
        )
    }

    #[test]
    fn keys_are_prefixed() {
        let store = RedisSessionStore::with_prefix(
            Client::open("redis://127.0.0.1/").unwrap(),
            "test:",
        );
        assert_eq!(store.session_key("abc"), "test:session:abc");
        assert_eq!(store.token_key("xyz"), "test:token:xyz");
    }

    #[test]
    fn fields_round_trip_a_redeemed_session() {
        let mut session = session();
        Transition::RedeemToken {
            token: "t1".into(),
            expires_at: session.created_at + Duration::hours(1),
        }
        .apply(&mut session);
        Transition::IssueCredential {
            credential: json!("eyJ.jwt"),
        }
        .apply(&mut session);

        let fields: HashMap<String, String> = to_fields(&session)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(from_fields("c1", &fields).unwrap(), session);
    }

    /// A store on `REDIS_URL` under a prefix no other run shares.
    fn live_store() -> Option<RedisSessionStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!("preauth-test:{}:", crate::session::generate_secret());
        Some(RedisSessionStore::with_prefix(Client::open(url).unwrap(), &prefix))
    }

    fn fresh_session(code: &str) -> Session {
        let now = Utc::now();
        Session::offered(
            code.into(),
            CredentialOffer::new(&Config::default(), code),
            serde_json::Map::new(),
            now,
            now + Duration::minutes(5),
        )
    }

    fn redeem(token: &str) -> Transition {
        Transition::RedeemToken {
            token: token.into(),
            expires_at: Utc::now() + Duration::minutes(10),
        }
    }

    #[test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    fn live_second_redemption_conflicts() {
        let store = match live_store() {
            Some(store) => store,
            None => return,
        };
        store.insert(fresh_session("c1")).unwrap();
        assert!(matches!(store.insert(fresh_session("c1")), Err(StoreError::Duplicate)));

        let redeemed = store.transition("c1", redeem("t1"), Utc::now()).unwrap();
        assert_eq!(redeemed.state, SessionState::TokenIssued);
        assert_eq!(redeemed.token.as_deref(), Some("t1"));

        assert_eq!(
            store.transition("c1", redeem("t2"), Utc::now()),
            Err(StoreError::Conflict {
                expected: SessionState::Offered,
                actual: SessionState::TokenIssued,
            })
        );
        assert_eq!(store.get_by_token("t1").unwrap().unwrap().code, "c1");
        assert!(store.get_by_token("t2").unwrap().is_none());

        let issued = store
            .transition(
                "c1",
                Transition::IssueCredential {
                    credential: json!("eyJ.jwt"),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(issued.state, SessionState::CredentialIssued);
        assert_eq!(issued.credential, Some(json!("eyJ.jwt")));
        store.remove("c1").unwrap();
    }

    #[test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    fn live_expired_session_is_not_found() {
        let store = match live_store() {
            Some(store) => store,
            None => return,
        };
        let session = fresh_session("c2");
        let later = session.expires_at + Duration::seconds(1);
        store.insert(session).unwrap();

        assert_eq!(
            store.transition("c2", redeem("t3"), later),
            Err(StoreError::NotFound)
        );
        assert!(store.get_by_token("t3").unwrap().is_none());
        store.remove("c2").unwrap();
    }

    #[test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    fn live_remove_unbinds_token() {
        let store = match live_store() {
            Some(store) => store,
            None => return,
        };
        store.insert(fresh_session("c3")).unwrap();
        store.transition("c3", redeem("t4"), Utc::now()).unwrap();

        assert_eq!(store.remove("c3"), Ok(true));
        assert!(store.get("c3").unwrap().is_none());
        assert!(store.get_by_token("t4").unwrap().is_none());
        assert_eq!(store.remove("c3"), Ok(false));
    }

    #[test]
    fn missing_fields_are_reported() {
        let fields: HashMap<String, String> =
            HashMap::from([("state".to_string(), "offered".to_string())]);
        assert!(matches!(
            from_fields("c1", &fields),
            Err(StoreError::Unavailable(_))
        ));
    }
}
