//! Pre-authorized code credential issuer library

#![warn(unreachable_pub, unused_extern_crates, unused_import_braces, unused_lifetimes, unused_qualifications)]
#![deny(unsafe_code, unsafe_op_in_unsafe_fn)]

use rocket::{catchers, routes, Build, Rocket};
use rocket_dyn_templates::Template;

pub mod authority;
pub use authority::{eviction_fairing, AccessToken, CreatedOffer, SessionAuthority};

pub mod authorization;
pub use authorization::{BearerToken, NoStore};

pub mod configuration;
pub use configuration::{openid_configuration, openid_credential_issuer, DiscoveryDocument, IssuerMetadata};

pub mod credential;
pub use credential::{post_credential, CredentialResponse, CredentialSigner, SignerError, SsiSigner};

pub mod development;
pub use development::index;

pub mod error;
pub use error::{default_catcher, not_found, Error, ErrorBody};

pub mod offer;
pub use offer::{get_credential_offer_data, post_credential_offer, OfferResponse};

pub mod redis_store;
pub use redis_store::RedisSessionStore;

pub mod session;
pub use session::{CredentialOffer, Session, SessionState, Transition};

pub mod store;
pub use store::{MemorySessionStore, SessionStore, StoreError};

pub mod token;
pub use token::{post_token_form, post_token_json, TokenRequest, TokenResponse};

pub mod types;
pub use types::{Config, ConfigError, CredentialFormat, Method, ReissuePolicy, DID_METHODS};

/// Assembles the issuer around an authority. `config` backs the discovery
/// documents and should be the one the authority was built with.
pub fn build(config: Config, authority: SessionAuthority) -> Rocket<Build> {
    rocket::build()
        .manage(config)
        .manage(authority)
        .mount(
            "/",
            routes![
                development::index,
                configuration::openid_credential_issuer,
                configuration::openid_configuration,
                offer::post_credential_offer,
                offer::get_credential_offer_data,
                token::post_token_form,
                token::post_token_json,
                credential::post_credential,
            ],
        )
        .register("/", catchers![error::not_found, error::default_catcher])
        .attach(Template::fairing())
        .attach(authority::eviction_fairing())
}
