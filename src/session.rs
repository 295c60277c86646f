//! Issuance sessions and the credential offer document they carry.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Config;

/// Bytes of OS randomness behind every code and token.
pub const SECRET_BYTES: usize = 32;

/// Generates an unguessable, URL-safe secret for use as a pre-authorized
/// code or access token.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

/// Session states. Only ever advance in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Offered,
    TokenIssued,
    CredentialIssued,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Offered => "offered",
            SessionState::TokenIssued => "token_issued",
            SessionState::CredentialIssued => "credential_issued",
        }
    }

    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "offered" => Some(SessionState::Offered),
            "token_issued" => Some(SessionState::TokenIssued),
            "credential_issued" => Some(SessionState::CredentialIssued),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferedCredential {
    pub format: String,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAuthorizedCodeGrant {
    pub pre_authorized_code: String,
    pub user_pin_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    #[serde(rename = "urn:ietf:params:oauth:grant-type:pre-authorized_code")]
    pub pre_authorized_code: PreAuthorizedCodeGrant,
}

/// The credential offer a wallet fetches through the offer URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialOffer {
    pub credential_issuer: String,
    pub credentials: Vec<OfferedCredential>,
    pub grants: Grants,
}

impl CredentialOffer {
    pub fn new(config: &Config, code: &str) -> Self {
        Self {
            credential_issuer: config.issuer.clone(),
            credentials: vec![OfferedCredential {
                format: config.format.as_str().to_string(),
                types: config.credential_types.clone(),
            }],
            grants: Grants {
                pre_authorized_code: PreAuthorizedCodeGrant {
                    pre_authorized_code: code.to_string(),
                    user_pin_required: false,
                },
            },
        }
    }

    pub fn pre_authorized_code(&self) -> &str {
        &self.grants.pre_authorized_code.pre_authorized_code
    }
}

/// One in-flight issuance, keyed by its pre-authorized code.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub code: String,
    pub state: SessionState,
    pub offer: CredentialOffer,
    pub subject: Map<String, Value>,
    pub token: Option<String>,
    pub credential: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn offered(
        code: String,
        offer: CredentialOffer,
        subject: Map<String, Value>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            state: SessionState::Offered,
            offer,
            subject,
            token: None,
            credential: None,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A single forward move of a session's state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `Offered -> TokenIssued`, binding `token` and moving the expiry.
    RedeemToken {
        token: String,
        expires_at: DateTime<Utc>,
    },

    /// `TokenIssued -> CredentialIssued`, recording the signed credential.
    IssueCredential { credential: Value },
}

impl Transition {
    pub fn from_state(&self) -> SessionState {
        match self {
            Transition::RedeemToken { .. } => SessionState::Offered,
            Transition::IssueCredential { .. } => SessionState::TokenIssued,
        }
    }

    pub fn to_state(&self) -> SessionState {
        match self {
            Transition::RedeemToken { .. } => SessionState::TokenIssued,
            Transition::IssueCredential { .. } => SessionState::CredentialIssued,
        }
    }

    /// Applies the transition to `session`. Callers check the prior state.
    pub fn apply(self, session: &mut Session) {
        session.state = self.to_state();
        match self {
            Transition::RedeemToken { token, expires_at } => {
                session.token = Some(token);
                session.expires_at = expires_at;
            }
            Transition::IssueCredential { credential } => {
                session.credential = Some(credential);
            }
        }
    }
}
