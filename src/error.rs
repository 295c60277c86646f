use std::io::Cursor;

use rocket::{
    catch,
    http::{ContentType, Status},
    response::{self, Responder},
    serde::json::Json,
    Request, Response,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Failures surfaced to wallet and backend callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("credential offer not found")]
    OfferNotFound,

    #[error("pre-authorized code is invalid or expired")]
    InvalidGrant,

    #[error("pre-authorized code has already been redeemed")]
    AlreadyRedeemed,

    #[error("authorization header missing")]
    MissingAuthorization,

    #[error("access token is invalid or expired")]
    InvalidToken,

    #[error("credential has already been issued for this token")]
    AlreadyIssued,

    #[error("session store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("credential signing failed: {0}")]
    SigningFailed(String),
}

impl Error {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::OfferNotFound => "offer_not_found",
            Error::InvalidGrant => "invalid_grant",
            Error::AlreadyRedeemed => "already_redeemed",
            Error::MissingAuthorization => "missing_authorization",
            Error::InvalidToken => "invalid_token",
            Error::AlreadyIssued => "already_issued",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::SigningFailed(_) => "signing_failed",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Error::InvalidRequest(_) => Status::BadRequest,
            Error::OfferNotFound => Status::NotFound,
            Error::InvalidGrant
            | Error::AlreadyRedeemed
            | Error::MissingAuthorization
            | Error::InvalidToken
            | Error::AlreadyIssued => Status::Unauthorized,
            Error::StorageUnavailable(_) => Status::ServiceUnavailable,
            Error::SigningFailed(_) => Status::InternalServerError,
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub error_description: String,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        Self {
            error: error.code().to_string(),
            error_description: error.to_string(),
        }
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Error::StorageUnavailable(error.to_string())
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'o> {
        let body =
            serde_json::to_string(&ErrorBody::from(&self)).map_err(|_| Status::InternalServerError)?;

        Response::build()
            .status(self.status())
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

#[catch(404)]
pub fn not_found(_: &Request) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: "not_found".into(),
        error_description: "route not found".into(),
    })
}

#[catch(default)]
pub fn default_catcher(status: Status, _: &Request) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: "invalid_request".into(),
        error_description: status.reason().unwrap_or("request failed").to_lowercase(),
    })
}
