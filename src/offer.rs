use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rocket::{
    get, post,
    serde::json::{Error as JsonError, Json},
    State,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{authority::SessionAuthority, error::Error, session::CredentialOffer, types::Config};

pub const OFFER_SCHEME: &str = "openid-credential-offer://";

/// Characters left alone by a URI component encoder.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Where the wallet fetches the offer document for `code`.
pub fn offer_data_url(config: &Config, code: &str) -> String {
    config.endpoint(&format!("credential-offer-data/{}", code))
}

pub fn offer_uri(config: &Config, code: &str) -> String {
    format!(
        "{}?credential_offer_uri={}",
        OFFER_SCHEME,
        utf8_percent_encode(&offer_data_url(config, code), COMPONENT)
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct OfferRequest {
    #[serde(default)]
    pub credential_subject: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OfferResponse {
    #[serde(rename = "credentialOfferURI")]
    pub credential_offer_uri: String,
}

/// An empty body asks for the configured subject. Anything else must parse.
#[post("/credential-offer", data = "<request>")]
pub fn post_credential_offer(
    request: Result<Json<OfferRequest>, JsonError<'_>>,
    authority: &State<SessionAuthority>,
) -> Result<Json<OfferResponse>, Error> {
    let request = match request {
        Ok(Json(request)) => request,
        Err(JsonError::Parse(body, _)) if body.trim().is_empty() => OfferRequest::default(),
        Err(e) => {
            warn!(error = %e, "unparsable credential offer request");
            return Err(Error::InvalidRequest(e.to_string()));
        }
    };
    let created = authority.create_offer(request.credential_subject)?;

    Ok(Json(OfferResponse {
        credential_offer_uri: created.offer_uri,
    }))
}

#[get("/credential-offer-data/<code>")]
pub fn get_credential_offer_data(
    code: &str,
    authority: &State<SessionAuthority>,
) -> Result<Json<CredentialOffer>, Error> {
    authority.resolve_offer(code).map(Json)
}
