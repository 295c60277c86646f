use chrono::Duration;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use ssi::did::DIDMethods;
use thiserror::Error;

pub const PRE_AUTHORIZED_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:pre-authorized_code";

pub const DEFAULT_ISSUER: &str = "http://localhost:3000";

/// Upper bound for every configured TTL and interval: one year.
pub const MAX_SECONDS: i64 = 365 * 24 * 60 * 60;

lazy_static! {
    pub static ref DID_METHODS: DIDMethods<'static> = {
        let mut methods = DIDMethods::default();
        methods.insert(Box::new(did_method_key::DIDKey));
        methods.insert(Box::new(did_jwk::DIDJWK));
        methods
    };
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Hash, Eq)]
pub enum Method {
    #[serde(rename = "key")]
    Key,

    #[serde(rename = "jwk")]
    Jwk,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Key => "key",
            Method::Jwk => "jwk",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Hash, Eq)]
pub enum CredentialFormat {
    #[serde(rename = "jwt_vc_json")]
    JwtVcJson,

    #[serde(rename = "ldp_vc")]
    LdpVc,
}

impl CredentialFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialFormat::JwtVcJson => "jwt_vc_json",
            CredentialFormat::LdpVc => "ldp_vc",
        }
    }
}

/// What a repeated credential request with an already used token gets.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReissuePolicy {
    /// Hand back the credential recorded at issuance, unchanged.
    #[default]
    Redeliver,

    /// Fail with `already_issued`.
    Reject,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub issuer: String,
    pub method: Method,
    pub format: CredentialFormat,
    pub credential_types: Vec<String>,
    pub default_subject: Map<String, Value>,
    pub offer_ttl: Duration,
    pub token_ttl: Duration,
    pub eviction_interval: std::time::Duration,
    pub reissue_policy: ReissuePolicy,
    pub redis_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            method: Method::Jwk,
            format: CredentialFormat::JwtVcJson,
            credential_types: vec!["VerifiableCredential".into(), "TicketCredential".into()],
            default_subject: default_subject(),
            offer_ttl: Duration::minutes(5),
            token_ttl: Duration::days(1),
            eviction_interval: std::time::Duration::from_secs(60),
            reissue_policy: ReissuePolicy::Redeliver,
            redis_url: None,
        }
    }
}

fn default_subject() -> Map<String, Value> {
    let subject = json!({
        "id": "did:example:subject-did",
        "eventName": "Test Event",
        "ticketNumber": "12345",
        "seat": "A1"
    });

    match subject {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Config {
    /// Reads the process environment. Call `dotenv::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let issuer = lookup("ISSUER")
            .map(|issuer| issuer.trim_end_matches('/').to_string())
            .unwrap_or(defaults.issuer);
        if !(issuer.starts_with("http://") || issuer.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                var: "ISSUER",
                reason: format!("expected an http(s) URL, got '{}'", issuer),
            });
        }

        let method = match lookup("DID_METHOD") {
            Some(method) => serde_json::from_str(&format!("\"{}\"", method)).map_err(|_| {
                ConfigError::Invalid {
                    var: "DID_METHOD",
                    reason: "allowed values: 'key' or 'jwk'".into(),
                }
            })?,
            None => defaults.method,
        };

        let format = match lookup("CREDENTIAL_FORMAT") {
            Some(format) => serde_json::from_str(&format!("\"{}\"", format)).map_err(|_| {
                ConfigError::Invalid {
                    var: "CREDENTIAL_FORMAT",
                    reason: "allowed values: 'jwt_vc_json' or 'ldp_vc'".into(),
                }
            })?,
            None => defaults.format,
        };

        let credential_types = match lookup("CREDENTIAL_TYPES") {
            Some(types) => {
                let types: Vec<String> = types
                    .split(',')
                    .map(str::trim)
                    .filter(|ty| !ty.is_empty())
                    .map(String::from)
                    .collect();
                if types.is_empty() {
                    return Err(ConfigError::Invalid {
                        var: "CREDENTIAL_TYPES",
                        reason: "at least one type is required".into(),
                    });
                }
                types
            }
            None => defaults.credential_types,
        };

        let default_subject = match lookup("CREDENTIAL_SUBJECT") {
            Some(subject) => match serde_json::from_str(&subject) {
                Ok(Value::Object(map)) if !map.is_empty() => map,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "CREDENTIAL_SUBJECT",
                        reason: "expected a non-empty JSON object".into(),
                    })
                }
            },
            None => defaults.default_subject,
        };

        let offer_ttl = seconds(&lookup, "OFFER_TTL_SECS")?
            .map(Duration::seconds)
            .unwrap_or(defaults.offer_ttl);
        let token_ttl = seconds(&lookup, "TOKEN_TTL_SECS")?
            .map(Duration::seconds)
            .unwrap_or(defaults.token_ttl);
        let eviction_interval = seconds(&lookup, "EVICTION_INTERVAL_SECS")?
            .map(|secs| std::time::Duration::from_secs(secs as u64))
            .unwrap_or(defaults.eviction_interval);

        let reissue_policy = match lookup("REISSUE_POLICY") {
            Some(policy) => serde_json::from_str(&format!("\"{}\"", policy)).map_err(|_| {
                ConfigError::Invalid {
                    var: "REISSUE_POLICY",
                    reason: "allowed values: 'redeliver' or 'reject'".into(),
                }
            })?,
            None => defaults.reissue_policy,
        };

        let redis_url = lookup("REDIS_URL").filter(|url| !url.is_empty());

        Ok(Self {
            issuer,
            method,
            format,
            credential_types,
            default_subject,
            offer_ttl,
            token_ttl,
            eviction_interval,
            reissue_policy,
            redis_url,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.issuer, path.trim_start_matches('/'))
    }
}

fn seconds<F>(lookup: &F, var: &'static str) -> Result<Option<i64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => match value.parse::<i64>() {
            Ok(secs) if secs > 0 && secs <= MAX_SECONDS => Ok(Some(secs)),
            _ => Err(ConfigError::Invalid {
                var,
                reason: format!(
                    "expected between 1 and {} seconds, got '{}'",
                    MAX_SECONDS, value
                ),
            }),
        },
        None => Ok(None),
    }
}
