//! reply-audio-rs: audio reply delivery for a conversational web app.

mod api;
mod config;
mod delivery;
mod error;
mod rate_limit;
mod reply_cache;
mod retry;
mod speaker;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use delivery::store::ArtifactStore;
use delivery::{AudioDelivery, DeliverySettings};
use speaker::completion::ChatCompletionClient;
use speaker::synthesis::SpeechClient;

#[derive(Parser, Debug)]
#[command(name = "reply-audio-rs", about = "Reply audio delivery service")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Deployment mode: serverless or standalone (overrides config)
    #[arg(short, long)]
    mode: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,tower_http=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("reply-audio-rs starting");

    let mut config = config::Config::load(args.config.as_deref());
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(raw) = args.mode.as_deref() {
        match raw.parse::<config::DeploymentMode>() {
            Ok(mode) => config.storage.mode = mode,
            Err(e) => warn!("Ignoring --mode: {e}"),
        }
    }
    info!(
        "Mode: {} (ephemeral: {}, persistent: {})",
        config.storage.mode.as_str(),
        config.storage.ephemeral_dir.display(),
        config.storage.persistent_dir.display()
    );

    let cache = reply_cache::for_mode(config.storage.mode, &config.storage.cache_file);
    info!("Reply text cache backend: {}", cache.backend());

    let completion = Arc::new(ChatCompletionClient::new(config.completion.clone()));
    let synthesis = Arc::new(SpeechClient::new(config.synthesis.clone()));
    if config.completion.api_key.is_empty() {
        warn!("COMPLETION_API_KEY not set, artifacts without stored text cannot be regenerated");
    }
    if config.synthesis.api_key.is_empty() {
        warn!("SYNTHESIS_API_KEY not set, regeneration is disabled");
    }

    let shutdown = CancellationToken::new();
    let delivery = Arc::new(AudioDelivery::new(
        Arc::new(ArtifactStore::from_config(&config.storage)),
        cache,
        completion,
        synthesis,
        DeliverySettings::from_config(&config),
        shutdown.clone(),
    ));

    let limiter = config.rate_limit.enabled.then(|| {
        info!(
            "Rate limit: {} requests per {}s, {} tracked clients",
            config.rate_limit.max_requests, config.rate_limit.window_secs, config.rate_limit.capacity
        );
        Arc::new(rate_limit::RateLimiter::from_config(&config.rate_limit))
    });

    let state = api::ApiState {
        delivery,
        limiter,
        internal_token: Arc::from(config.server.internal_token.as_str()),
        mode: config.storage.mode,
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {e}");
                return;
            }
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    api::serve(state, &addr, shutdown).await?;

    Ok(())
}
