//! A Pub/Sub REST client with a self-pacing subscription loop
//!
//! The [`subscriber::Subscriber`] runs a fixed number of independent sequences, each
//! pulling a batch, handing it to the application, acknowledging it and then waiting
//! for whatever a [`StagedRateController`](staged_rate_limiter::staged_rate_limit::StagedRateController)
//! prescribes. Failures anywhere in a round slow the subscription down, sustained
//! success speeds it up.
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//!
//! use pubsub_client::{
//!     AckRequest, ClientConfig, PubsubClient, PullResponse, StaticAccessToken, Subscriber,
//!     SubscriberConfig,
//! };
//!
//! # async fn run() -> Result<(), pubsub_client::Error> {
//! let client = Arc::new(PubsubClient::new(
//!     ClientConfig::default(),
//!     Arc::new(StaticAccessToken::new("ya29.token")),
//! )?);
//! let config = SubscriberConfig::builder()
//!     .project_name("my-project")
//!     .subscription_name("my-subscription")
//!     .build();
//! let consumer = |response: PullResponse| async move {
//!     AckRequest::for_pull_response(&response).map_err(pubsub_client::Error::from)
//! };
//!
//! let subscriber = Subscriber::new(config, client.clone(), client, Arc::new(consumer))?;
//! let handle = subscriber.start();
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Request latency and message counts are emitted through the `metrics` facade as
//! `pubsub_client_request_latency_seconds` and `pubsub_client_request_messages_total`.
pub mod access_token;
pub mod bounded_queue;
pub mod client;
mod internal_event;
pub mod model;
pub mod publisher;
pub mod subscriber;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use access_token::{AccessToken, AccessTokenCache, AccessTokenSource, StaticAccessToken};
pub use bounded_queue::{BoundedTaskQueue, QueueError, TaskHandle};
pub use client::{ClientConfig, ClientError, PubsubClient};
pub use model::{
    AckRequest, DraftedMessage, ModelError, PublishRequest, PublishResponse, PubsubMessage,
    PullRequest, PullResponse, ReceivedMessage,
};
pub use publisher::{Publisher, PublisherConfig, PublisherError, TopicPublisher};
pub use subscriber::{
    Acker, PullResponseConsumer, Puller, Subscriber, SubscriberConfig, SubscriberError,
    SubscriptionHandle,
};
