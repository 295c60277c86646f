use lazy_static::lazy_static;
use rocket::{form::Form, post, serde::json::Json, FromForm, State};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::{
    authority::SessionAuthority, authorization::NoStore, error::Error,
    types::PRE_AUTHORIZED_CODE_GRANT,
};

#[derive(Debug, FromForm, Deserialize, Serialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,

    #[field(name = "pre-authorized_code")]
    #[serde(rename = "pre-authorized_code")]
    pub pre_authorized_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

lazy_static! {
    static ref SUPPORTED_TYPES: Vec<String> = vec![PRE_AUTHORIZED_CODE_GRANT.into()];
}

#[post("/token", data = "<request>", format = "form")]
pub fn post_token_form(
    request: Form<TokenRequest>,
    authority: &State<SessionAuthority>,
) -> Result<NoStore<Json<TokenResponse>>, Error> {
    post_token(request.into_inner(), authority.inner()).map(|r| NoStore(Json(r)))
}

#[post("/token", data = "<request>", format = "json", rank = 2)]
pub fn post_token_json(
    request: Json<TokenRequest>,
    authority: &State<SessionAuthority>,
) -> Result<NoStore<Json<TokenResponse>>, Error> {
    post_token(request.into_inner(), authority.inner()).map(|r| NoStore(Json(r)))
}

#[instrument(level = "debug", skip_all)]
pub fn post_token(
    TokenRequest {
        grant_type,
        pre_authorized_code,
    }: TokenRequest,
    authority: &SessionAuthority,
) -> Result<TokenResponse, Error> {
    if let Some(grant_type) = grant_type {
        if !SUPPORTED_TYPES.contains(&grant_type) {
            warn!(%grant_type, "unsupported grant type");
            return Err(Error::InvalidGrant);
        }
    }

    let code = match pre_authorized_code {
        Some(code) if !code.is_empty() => code,
        _ => return Err(Error::InvalidGrant),
    };

    let token = authority.redeem_token(&code)?;

    Ok(TokenResponse {
        access_token: token.token,
        token_type: "bearer".into(),
        expires_in: token.expires_in,
    })
}
