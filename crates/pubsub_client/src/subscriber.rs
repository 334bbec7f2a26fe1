//! The subscription loop: concurrent pull → consume → acknowledge sequences whose pace
//! is set by a [`StagedRateController`].

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use snafu::{ResultExt, Snafu, ensure};
use staged_rate_limiter::staged_rate_limit::{ConfigError, DEFAULT_SPEC, StagedRateController};
use tokio::{
    task::{self, JoinSet},
    time,
};

use crate::{
    Error,
    model::{AckRequest, ModelError, PullRequest, PullResponse},
};

pub const DEFAULT_PULL_CONCURRENCY: usize = 4;
pub const DEFAULT_PULL_BUFFER_SIZE: u32 = 100;
pub const DEFAULT_PULL_PERIOD: Duration = Duration::from_secs(30);

/// Fetches batches of messages from a subscription.
#[async_trait]
pub trait Puller: Send + Sync + 'static {
    async fn pull(
        &self,
        project_name: &str,
        subscription_name: &str,
        request: &PullRequest,
    ) -> Result<PullResponse, Error>;
}

/// Acknowledges consumed messages.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(
        &self,
        project_name: &str,
        subscription_name: &str,
        request: &AckRequest,
    ) -> Result<(), Error>;
}

/// Application callback turning a non-empty batch into the ids to acknowledge.
#[async_trait]
pub trait PullResponseConsumer: Send + Sync + 'static {
    async fn consume(&self, response: PullResponse) -> Result<AckRequest, Error>;
}

#[async_trait]
impl<F, Fut> PullResponseConsumer for F
where
    F: Fn(PullResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AckRequest, Error>> + Send + 'static,
{
    async fn consume(&self, response: PullResponse) -> Result<AckRequest, Error> {
        self(response).await
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubscriberError {
    #[snafu(display("invalid subscriber config: {message}"))]
    InvalidConfig { message: &'static str },

    #[snafu(display("invalid pull request: {source}"))]
    InvalidPullRequest { source: ModelError },

    #[snafu(display("invalid rate limiter: {source}"))]
    RateLimiter { source: ConfigError },
}

#[derive(Debug, Snafu)]
enum IterationError {
    #[snafu(display("pull failed: {source}"))]
    Pull { source: Error },

    #[snafu(display("consumer failed: {source}"))]
    Consume { source: Error },

    #[snafu(display("acknowledge failed: {source}"))]
    Ack { source: Error },
}

/// Settings of a [`Subscriber`].
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `pull_concurrency` | 4 | Number of independent pull sequences |
/// | `pull_buffer_size` | 100 | Maximum messages per pull |
/// | `pull_period` | 30s | Idle wait after an empty batch; zero long-polls instead |
/// | `rate_limiter_spec` | `1/1m:, 1/30s:1/1m, 1/1s:2/1m, :1/3m` | Stage ladder of the controller |
#[derive(Clone, Debug, Builder)]
pub struct SubscriberConfig {
    #[builder(into)]
    project_name: String,

    #[builder(into)]
    subscription_name: String,

    #[builder(default = DEFAULT_PULL_CONCURRENCY)]
    pull_concurrency: usize,

    #[builder(default = DEFAULT_PULL_BUFFER_SIZE)]
    pull_buffer_size: u32,

    #[builder(default = DEFAULT_PULL_PERIOD)]
    pull_period: Duration,

    #[builder(into, default = DEFAULT_SPEC.to_owned())]
    rate_limiter_spec: String,
}

impl SubscriberConfig {
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    pub const fn pull_concurrency(&self) -> usize {
        self.pull_concurrency
    }

    pub const fn pull_buffer_size(&self) -> u32 {
        self.pull_buffer_size
    }

    pub const fn pull_period(&self) -> Duration {
        self.pull_period
    }

    pub fn rate_limiter_spec(&self) -> &str {
        &self.rate_limiter_spec
    }
}

/// Owns the collaborators of one subscription and starts its sequences.
pub struct Subscriber {
    shared: Arc<Shared>,
}

struct Shared {
    config: SubscriberConfig,
    pull_request: PullRequest,
    controller: Arc<StagedRateController>,
    puller: Arc<dyn Puller>,
    acker: Arc<dyn Acker>,
    consumer: Arc<dyn PullResponseConsumer>,
}

impl Subscriber {
    pub fn new(
        config: SubscriberConfig,
        puller: Arc<dyn Puller>,
        acker: Arc<dyn Acker>,
        consumer: Arc<dyn PullResponseConsumer>,
    ) -> Result<Self, SubscriberError> {
        ensure!(
            config.pull_concurrency > 0,
            InvalidConfigSnafu {
                message: "was expecting a non-zero positive pull concurrency"
            }
        );
        ensure!(
            config.pull_buffer_size > 0,
            InvalidConfigSnafu {
                message: "was expecting a non-zero positive pull buffer size"
            }
        );

        let name = format!("{}/{}", config.project_name, config.subscription_name);
        let controller = StagedRateController::new(name, config.rate_limiter_spec.as_str())
            .context(RateLimiterSnafu)?;
        let pull_request = PullRequest::new(!config.pull_period.is_zero(), config.pull_buffer_size)
            .context(InvalidPullRequestSnafu)?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                pull_request,
                controller: Arc::new(controller),
                puller,
                acker,
                consumer,
            }),
        })
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.shared.config
    }

    pub fn controller(&self) -> &Arc<StagedRateController> {
        &self.shared.controller
    }

    /// Spawns `pull_concurrency` sequences on the current runtime.
    ///
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn start(&self) -> SubscriptionHandle {
        let sequence_count = self.shared.config.pull_concurrency;
        let mut sequences = JoinSet::new();
        for sequence_index in 0..sequence_count {
            sequences.spawn(Arc::clone(&self.shared).run_sequence(sequence_index));
        }
        info!(
            project_name = %self.shared.config.project_name,
            subscription_name = %self.shared.config.subscription_name,
            sequence_count,
            "Subscription started"
        );
        SubscriptionHandle {
            sequences,
            sequence_count,
        }
    }
}

impl Shared {
    async fn run_sequence(self: Arc<Self>, sequence_index: usize) {
        let project_name = self.config.project_name.as_str();
        let subscription_name = self.config.subscription_name.as_str();
        let mut previous_batch_empty = false;

        for request_index in 0u64.. {
            if previous_batch_empty && !self.config.pull_period.is_zero() {
                time::sleep(self.config.pull_period).await;
            }
            previous_batch_empty = false;

            match self.iterate().await {
                Ok(None) => {
                    trace!(sequence_index, request_index, "Empty pull response");
                    previous_batch_empty = true;
                }
                Ok(Some(wait)) => {
                    debug!(
                        target: "staged_rate_limiter::stats",
                        sequence_index,
                        request_index,
                        wait_ms = wait.as_millis(),
                        "Batch acknowledged"
                    );
                }
                Err(error) => {
                    error!(
                        project_name,
                        subscription_name,
                        request_index,
                        %error,
                        "failed consuming message"
                    );
                    self.controller.report_failure();
                }
            }

            // Collaborators may complete without ever suspending.
            task::yield_now().await;
        }
    }

    /// Runs one pull → consume → acknowledge round. Returns `None` for an empty batch,
    /// otherwise the rate limiting wait that was slept.
    async fn iterate(&self) -> Result<Option<Duration>, IterationError> {
        let project_name = self.config.project_name.as_str();
        let subscription_name = self.config.subscription_name.as_str();

        let response = self
            .puller
            .pull(project_name, subscription_name, &self.pull_request)
            .await
            .context(PullSnafu)?;
        if response.is_empty() {
            return Ok(None);
        }

        let ack_request = self.consumer.consume(response).await.context(ConsumeSnafu)?;
        self.acker
            .ack(project_name, subscription_name, &ack_request)
            .await
            .context(AckSnafu)?;

        let wait = self.controller.claim_permit();
        if !wait.is_zero() {
            time::sleep(wait).await;
        }
        Ok(Some(wait))
    }
}

/// Running sequences of a started [`Subscriber`]. Dropping the handle aborts them.
#[derive(Debug)]
pub struct SubscriptionHandle {
    sequences: JoinSet<()>,
    sequence_count: usize,
}

impl SubscriptionHandle {
    pub const fn sequence_count(&self) -> usize {
        self.sequence_count
    }

    /// Aborts every sequence at its current suspension point.
    pub fn cancel(&mut self) {
        self.sequences.abort_all();
    }

    /// Aborts every sequence and waits until all of them have stopped.
    pub async fn shutdown(mut self) {
        self.sequences.abort_all();
        while let Some(result) = self.sequences.join_next().await {
            if let Err(error) = result {
                if error.is_panic() {
                    error!(%error, "Subscription sequence panicked");
                }
            }
        }
        debug!("Subscription stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl Puller for Unreachable {
        async fn pull(&self, _: &str, _: &str, _: &PullRequest) -> Result<PullResponse, Error> {
            Err("unreachable".into())
        }
    }

    #[async_trait]
    impl Acker for Unreachable {
        async fn ack(&self, _: &str, _: &str, _: &AckRequest) -> Result<(), Error> {
            Err("unreachable".into())
        }
    }

    fn subscriber(config: SubscriberConfig) -> Result<Subscriber, SubscriberError> {
        let consumer = |response: PullResponse| async move {
            AckRequest::for_pull_response(&response).map_err(Error::from)
        };
        Subscriber::new(
            config,
            Arc::new(Unreachable),
            Arc::new(Unreachable),
            Arc::new(consumer),
        )
    }

    #[test]
    fn config_defaults() {
        let config = SubscriberConfig::builder()
            .project_name("project")
            .subscription_name("subscription")
            .build();
        assert_eq!(config.pull_concurrency(), 4);
        assert_eq!(config.pull_buffer_size(), 100);
        assert_eq!(config.pull_period(), Duration::from_secs(30));
        assert_eq!(config.rate_limiter_spec(), "1/1m:, 1/30s:1/1m, 1/1s:2/1m, :1/3m");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = SubscriberConfig::builder()
            .project_name("project")
            .subscription_name("subscription")
            .pull_concurrency(0)
            .build();
        let error = subscriber(config).err().unwrap();
        assert_eq!(
            error.to_string(),
            "invalid subscriber config: was expecting a non-zero positive pull concurrency"
        );
    }

    #[test]
    fn rejects_zero_buffer_size() {
        let config = SubscriberConfig::builder()
            .project_name("project")
            .subscription_name("subscription")
            .pull_buffer_size(0)
            .build();
        let error = subscriber(config).err().unwrap();
        assert_eq!(
            error.to_string(),
            "invalid subscriber config: was expecting a non-zero positive pull buffer size"
        );
    }

    #[test]
    fn rejects_malformed_rate_limiter_spec() {
        let config = SubscriberConfig::builder()
            .project_name("project")
            .subscription_name("subscription")
            .rate_limiter_spec("1/1s:")
            .build();
        let error = subscriber(config).err().unwrap();
        assert!(matches!(error, SubscriberError::RateLimiter { .. }));
    }

    #[test]
    fn names_controller_after_subscription() {
        let config = SubscriberConfig::builder()
            .project_name("project")
            .subscription_name("subscription")
            .build();
        let subscriber = subscriber(config).unwrap();
        assert_eq!(subscriber.controller().name(), "project/subscription");
        assert_eq!(subscriber.controller().active_failure_spec().as_deref(), Some("1/3m"));
    }

    #[test]
    fn zero_pull_period_long_polls() {
        let config = SubscriberConfig::builder()
            .project_name("project")
            .subscription_name("subscription")
            .pull_period(Duration::ZERO)
            .build();
        let subscriber = subscriber(config).unwrap();
        assert!(!subscriber.shared.pull_request.return_immediately());
        assert_eq!(subscriber.shared.pull_request.max_messages(), 100);
    }
}
