use async_trait::async_trait;
use rocket::{post, serde::json::Json, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ssi::{
    did::Source,
    jsonld::ContextLoader,
    jwk::{Algorithm, Params, JWK},
    vc::{get_verification_methods_for_purpose, Credential, LinkedDataProofOptions, ProofPurpose, URI},
};
use thiserror::Error;
use tracing::instrument;

use crate::{
    authorization::{BearerToken, NoStore},
    authority::SessionAuthority,
    error::Error,
    types::{CredentialFormat, Method, DID_METHODS},
};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("unsupported key: {0}")]
    UnsupportedKey(String),

    #[error("DID error: {0}")]
    Did(String),

    #[error("{0}")]
    Signing(String),
}

/// Turns an unsigned credential document into a signed one.
#[async_trait]
pub trait CredentialSigner: Send + Sync {
    /// Identifier placed in the credential's `issuer` field.
    fn issuer(&self) -> &str;

    async fn sign(&self, credential: Value) -> Result<Value, SignerError>;
}

/// Signs with an issuer JWK through `ssi`, under a `did:key` or `did:jwk`
/// identity derived from that key.
pub struct SsiSigner {
    jwk: JWK,
    method: Method,
    format: CredentialFormat,
    issuer: String,
    verification_method: String,
}

impl SsiSigner {
    pub async fn new(jwk: JWK, method: Method, format: CredentialFormat) -> Result<Self, SignerError> {
        let mut jwk = jwk;
        if jwk.algorithm.is_none() {
            jwk.algorithm = Some(algorithm(&jwk)?);
        }

        let did_method = DID_METHODS
            .get(method.name())
            .ok_or_else(|| SignerError::Did(format!("did:{} is not available", method.name())))?;
        let issuer = did_method
            .generate(&Source::Key(&jwk))
            .ok_or_else(|| SignerError::Did(format!("cannot derive a did:{} from key", method.name())))?;

        let verification_method = get_verification_methods_for_purpose(
            &issuer,
            did_method.to_resolver(),
            ProofPurpose::AssertionMethod,
        )
        .await
        .map_err(|e| SignerError::Did(e.to_string()))?
        .first()
        .cloned()
        .ok_or_else(|| SignerError::Did(format!("{} has no assertion method", issuer)))?;

        Ok(Self {
            jwk,
            method,
            format,
            issuer,
            verification_method,
        })
    }
}

fn algorithm(jwk: &JWK) -> Result<Algorithm, SignerError> {
    match &jwk.params {
        Params::OKP(_) => Ok(Algorithm::EdDSA),
        Params::EC(ec) => match ec.curve.as_deref() {
            Some("P-256") => Ok(Algorithm::ES256),
            Some("secp256k1") => Ok(Algorithm::ES256K),
            Some(curve) => Err(SignerError::UnsupportedKey(format!("curve {}", curve))),
            None => Err(SignerError::UnsupportedKey("missing curve".into())),
        },
        _ => Err(SignerError::UnsupportedKey(
            "only OKP and EC keys are supported".into(),
        )),
    }
}

#[async_trait]
impl CredentialSigner for SsiSigner {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn sign(&self, credential: Value) -> Result<Value, SignerError> {
        let did_method = DID_METHODS
            .get(self.method.name())
            .ok_or_else(|| SignerError::Did(format!("did:{} is not available", self.method.name())))?;
        let did_resolver = did_method.to_resolver();

        let credential = serde_json::to_string(&credential).map_err(|e| SignerError::Signing(e.to_string()))?;
        let mut credential =
            Credential::from_json_unsigned(&credential).map_err(|e| SignerError::Signing(e.to_string()))?;

        let options = LinkedDataProofOptions {
            proof_purpose: Some(ProofPurpose::AssertionMethod),
            verification_method: Some(URI::String(self.verification_method.clone())),
            ..LinkedDataProofOptions::default()
        };

        match self.format {
            CredentialFormat::JwtVcJson => {
                let options = LinkedDataProofOptions {
                    checks: None,
                    created: None,
                    ..options
                };
                let jwt = credential
                    .generate_jwt(Some(&self.jwk), &options, did_resolver)
                    .await
                    .map_err(|e| SignerError::Signing(e.to_string()))?;
                Ok(Value::String(jwt))
            }
            CredentialFormat::LdpVc => {
                let proof = credential
                    .generate_proof(&self.jwk, &options, did_resolver, &mut ContextLoader::default())
                    .await
                    .map_err(|e| SignerError::Signing(e.to_string()))?;
                credential.add_proof(proof);
                serde_json::to_value(&credential).map_err(|e| SignerError::Signing(e.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialResponse {
    pub format: String,
    pub credential: Value,
}

#[post("/credential")]
pub async fn post_credential(
    token: Result<BearerToken, Error>,
    authority: &State<SessionAuthority>,
) -> Result<NoStore<Json<CredentialResponse>>, Error> {
    let token = token?;
    issue(&token, authority.inner()).await.map(|r| NoStore(Json(r)))
}

#[instrument(level = "debug", skip_all)]
pub async fn issue(token: &BearerToken, authority: &SessionAuthority) -> Result<CredentialResponse, Error> {
    let credential = authority.issue_credential(&token.0).await?;

    Ok(CredentialResponse {
        format: authority.config().format.as_str().to_string(),
        credential,
    })
}
