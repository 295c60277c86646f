use std::sync::Arc;

use ssi::jwk::JWK;
use tracing::info;
use tracing_subscriber::EnvFilter;

use preauth_issuer::*;

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let jwk = std::env::var("JWK").map_err(|_| ConfigError::Missing("JWK"))?;
    let jwk: JWK = serde_json::from_str(&jwk).map_err(|e| ConfigError::Invalid {
        var: "JWK",
        reason: e.to_string(),
    })?;
    let signer = SsiSigner::new(jwk, config.method, config.format).await?;
    info!(issuer = signer.issuer(), "credential signer ready");

    let store: Arc<dyn SessionStore> = match &config.redis_url {
        Some(url) => {
            info!("using redis session store");
            Arc::new(RedisSessionStore::open(url)?)
        }
        None => {
            info!("using in-memory session store");
            Arc::new(MemorySessionStore::new())
        }
    };

    let authority = SessionAuthority::new(config.clone(), store, Arc::new(signer));

    let _ = build(config, authority).launch().await?;
    Ok(())
}
