//! Demo server binary: serves the trusted-token endpoints over actix-web.

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use trustring::cache::{MemorySharedCache, SharedKeyCache};
use trustring::config::TokenConfig;
use trustring::server::{routes, AppState};
use trustring::service::TrustedTokenService;
use trustring::util::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "trustring", about = "Trusted-token authentication demo server")]
struct Args {
    /// Bind address.
    #[arg(long, env = "TRUSTRING_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Bind port.
    #[arg(long, env = "TRUSTRING_PORT", default_value_t = 8080)]
    port: u16,

    /// Optional JSON config file; `TRUSTRING_*` env vars override it.
    #[arg(long, env = "TRUSTRING_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL for the cluster key cache (requires the `cache-redis`
    /// feature); defaults to the in-process cache.
    #[arg(long, env = "TRUSTRING_REDIS_URL")]
    redis_url: Option<String>,
}

fn build_cache(redis_url: Option<&str>) -> anyhow::Result<Arc<dyn SharedKeyCache>> {
    match redis_url {
        #[cfg(feature = "cache-redis")]
        Some(url) => {
            let cache = trustring::cache::RedisSharedCache::new(url)
                .context("connecting to the redis key cache")?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "cache-redis"))]
        Some(_) => Err(anyhow::anyhow!(
            "redis URL given but this build lacks the cache-redis feature"
        )),
        None => Ok(Arc::new(MemorySharedCache::new())),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TokenConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TokenConfig::default(),
    }
    .apply_env_overrides();

    let cache = build_cache(args.redis_url.as_deref())?;
    let service = Arc::new(TrustedTokenService::new(config, cache)?);
    let state = web::Data::new(AppState { service });

    info!("listening on {}:{}", args.host, args.port);
    HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
        .bind((args.host.as_str(), args.port))?
        .run()
        .await?;
    Ok(())
}
