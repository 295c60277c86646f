//! Issuer discovery documents. Pure functions of [`Config`].

use rocket::{get, serde::json::Json, State};
use serde::{Deserialize, Serialize};

use crate::types::{Config, PRE_AUTHORIZED_CODE_GRANT};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuerMetadata {
    pub credential_issuer: String,
    pub credential_formats: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint: String,
    pub authorization_server: String,
    pub credential_endpoint: String,
}

impl IssuerMetadata {
    pub fn new(config: &Config) -> Self {
        Self {
            credential_issuer: config.issuer.clone(),
            credential_formats: vec![config.format.as_str().to_string()],
            grant_types_supported: vec![PRE_AUTHORIZED_CODE_GRANT.to_string()],
            token_endpoint: config.endpoint("token"),
            authorization_server: config.issuer.clone(),
            credential_endpoint: config.endpoint("credential"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryDocument {
    pub credential_issuer: String,
    pub token_endpoint: String,
    pub grant_types_supported: Vec<String>,
}

impl DiscoveryDocument {
    pub fn new(config: &Config) -> Self {
        Self {
            credential_issuer: config.issuer.clone(),
            token_endpoint: config.endpoint("token"),
            grant_types_supported: vec![PRE_AUTHORIZED_CODE_GRANT.to_string()],
        }
    }
}

#[get("/.well-known/openid-credential-issuer")]
pub fn openid_credential_issuer(config: &State<Config>) -> Json<IssuerMetadata> {
    Json(IssuerMetadata::new(config))
}

#[get("/.well-known/openid-configuration")]
pub fn openid_configuration(config: &State<Config>) -> Json<DiscoveryDocument> {
    Json(DiscoveryDocument::new(config))
}
