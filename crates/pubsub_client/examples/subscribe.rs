use pubsub_client::{
    AccessTokenCache, AccessTokenSource, AckRequest, ClientConfig, Error, PubsubClient,
    PullResponse, Subscriber, SubscriberConfig,
};

use async_trait::async_trait;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// --- Configuration Environment Variable Names ---
const ENV_ACCESS_TOKEN: &str = "PUBSUB_ACCESS_TOKEN";
const ENV_PROJECT_NAME: &str = "PUBSUB_PROJECT_NAME";
const ENV_SUBSCRIPTION_NAME: &str = "PUBSUB_SUBSCRIPTION_NAME";
const ENV_BASE_URL: &str = "PUBSUB_BASE_URL"; // Optional, e.g. an emulator

// Subscription tuning, all optional
const ENV_PULL_CONCURRENCY: &str = "PUBSUB_PULL_CONCURRENCY";
const ENV_PULL_BUFFER_SIZE: &str = "PUBSUB_PULL_BUFFER_SIZE";
const ENV_PULL_PERIOD_SECS: &str = "PUBSUB_PULL_PERIOD_SECS";
const ENV_RATE_LIMITER_SPEC: &str = "PUBSUB_RATE_LIMITER_SPEC";

fn get_env_var<T: FromStr + std::fmt::Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|val_str| match val_str.parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                warn!(
                    var_name,
                    value = %val_str,
                    error = ?e,
                    default = ?default_value,
                    "Failed to parse env var, using default"
                );
                None
            }
        })
        .unwrap_or(default_value)
}

fn required_env_var(var_name: &str) -> Result<String, Error> {
    env::var(var_name)
        .map_err(|_| format!("Required environment variable '{var_name}' not set").into())
}

/// Re-reads the token from the environment on every refresh, so an external process
/// (e.g. `gcloud auth print-access-token` in a loop) can rotate it.
struct EnvAccessTokenSource;

#[async_trait]
impl AccessTokenSource for EnvAccessTokenSource {
    async fn fetch_access_token(&self) -> Result<String, Error> {
        required_env_var(ENV_ACCESS_TOKEN)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let default_log_filter = "info,pubsub_client=info,staged_rate_limiter=info";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();

    if dotenvy::dotenv().is_ok() {
        info!(".env file loaded successfully.");
    }

    let project_name = required_env_var(ENV_PROJECT_NAME)?;
    let subscription_name = required_env_var(ENV_SUBSCRIPTION_NAME)?;

    let access_token = AccessTokenCache::start(EnvAccessTokenSource).await?;

    let client_config = ClientConfig::builder()
        .maybe_base_url(env::var(ENV_BASE_URL).ok())
        .build();
    let client = Arc::new(PubsubClient::new(client_config, Arc::new(access_token))?);

    let subscriber_config = SubscriberConfig::builder()
        .project_name(project_name)
        .subscription_name(subscription_name)
        .pull_concurrency(get_env_var(ENV_PULL_CONCURRENCY, 4))
        .pull_buffer_size(get_env_var(ENV_PULL_BUFFER_SIZE, 100))
        .pull_period(Duration::from_secs(get_env_var(ENV_PULL_PERIOD_SECS, 30)))
        .rate_limiter_spec(get_env_var(
            ENV_RATE_LIMITER_SPEC,
            "1/1m:, 1/30s:1/1m, 1/1s:2/1m, :1/3m".to_string(),
        ))
        .build();

    let consumer = |response: PullResponse| async move {
        for received in response.received_messages() {
            let message = received.message();
            info!(
                message_id = message.message_id(),
                publish_time = %message.publish_time(),
                payload = %String::from_utf8_lossy(message.payload()),
                "Received message"
            );
        }
        AckRequest::for_pull_response(&response).map_err(Error::from)
    };

    let subscriber = Subscriber::new(subscriber_config, client.clone(), client, Arc::new(consumer))?;
    let handle = subscriber.start();
    info!(
        sequence_count = handle.sequence_count(),
        "Subscribed, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
