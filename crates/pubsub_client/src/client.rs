//! REST client for the pull, acknowledge and publish endpoints.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use http::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::time::Instant;

use crate::{
    Error,
    access_token::AccessToken,
    internal_event::{MessagesTransferred, RequestCompleted},
    model::{AckRequest, PublishRequest, PublishResponse, PullRequest, PullResponse},
    publisher::TopicPublisher,
    subscriber::{Acker, Puller},
};

pub const DEFAULT_BASE_URL: &str = "https://pubsub.googleapis.com:443";
pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Pull,
    Ack,
    Publish,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Ack => "acknowledge",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("invalid base URL: {base_url}"))]
    InvalidBaseUrl { base_url: String },

    #[snafu(display("failed to build HTTP client: {source}"))]
    Build { source: reqwest::Error },

    #[snafu(display("no access token available"))]
    MissingAccessToken,

    #[snafu(display("{operation} request failed: {source}"))]
    Request {
        operation: Operation,
        source: reqwest::Error,
    },

    #[snafu(display("{operation} request timed out after {timeout:?}"))]
    Timeout {
        operation: Operation,
        timeout: Duration,
    },

    #[snafu(display("{operation} request failed with status {status}: {body}"))]
    UnexpectedStatus {
        operation: Operation,
        status: StatusCode,
        body: String,
    },

    #[snafu(display("failed to decode {operation} response: {source}"))]
    Decode {
        operation: Operation,
        source: serde_json::Error,
    },
}

/// Connection settings of [`PubsubClient`].
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `base_url` | `https://pubsub.googleapis.com:443` | Scheme, host and port of the API |
/// | `pull_timeout` | 30s | Bound of pulls that return immediately |
/// | `publish_timeout` | 30s | Bound of publish requests |
/// | `ack_timeout` | 10s | Bound of acknowledge requests |
/// | `user_agent` | crate name and version | Sent with every request unless empty |
///
/// A zero timeout disables the bound. Pulls that do not return immediately are long
/// polls and are never bounded.
#[derive(Clone, Debug, Builder)]
pub struct ClientConfig {
    #[builder(into, default = DEFAULT_BASE_URL.to_owned())]
    base_url: String,

    #[builder(default = DEFAULT_PULL_TIMEOUT)]
    pull_timeout: Duration,

    #[builder(default = DEFAULT_PUBLISH_TIMEOUT)]
    publish_timeout: Duration,

    #[builder(default = DEFAULT_ACK_TIMEOUT)]
    ack_timeout: Duration,

    #[builder(into, default = DEFAULT_USER_AGENT.to_owned())]
    user_agent: String,
}

impl ClientConfig {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub const fn pull_timeout(&self) -> Duration {
        self.pull_timeout
    }

    pub const fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    pub const fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone)]
pub struct PubsubClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    access_token: Arc<dyn AccessToken>,
}

impl fmt::Debug for PubsubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubsubClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PubsubClient {
    pub fn new(config: ClientConfig, access_token: Arc<dyn AccessToken>) -> Result<Self, ClientError> {
        ensure!(
            reqwest::Url::parse(&config.base_url).is_ok(),
            InvalidBaseUrlSnafu {
                base_url: &config.base_url
            }
        );
        let mut builder = reqwest::Client::builder();
        if !config.user_agent.is_empty() {
            builder = builder.user_agent(config.user_agent.as_str());
        }
        let http = builder.build().context(BuildSnafu)?;
        Ok(Self {
            http,
            config: Arc::new(config),
            access_token,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn pull(
        &self,
        project_name: &str,
        subscription_name: &str,
        request: &PullRequest,
    ) -> Result<PullResponse, ClientError> {
        let url = self.subscription_url(project_name, subscription_name, "pull");
        let timeout = request
            .return_immediately()
            .then_some(self.config.pull_timeout);
        let response: PullResponse = self
            .post(Operation::Pull, project_name, &url, request, timeout)
            .await?;
        MessagesTransferred {
            operation: Operation::Pull,
            project_name,
            count: response.len(),
        }
        .emit();
        Ok(response)
    }

    pub async fn ack(
        &self,
        project_name: &str,
        subscription_name: &str,
        request: &AckRequest,
    ) -> Result<(), ClientError> {
        let url = self.subscription_url(project_name, subscription_name, "acknowledge");
        let timeout = Some(self.config.ack_timeout);
        let _: serde::de::IgnoredAny = self
            .post(Operation::Ack, project_name, &url, request, timeout)
            .await?;
        MessagesTransferred {
            operation: Operation::Ack,
            project_name,
            count: request.ack_ids().len(),
        }
        .emit();
        Ok(())
    }

    pub async fn publish(
        &self,
        project_name: &str,
        topic_name: &str,
        request: &PublishRequest,
    ) -> Result<PublishResponse, ClientError> {
        let url = format!(
            "{}/v1/projects/{project_name}/topics/{topic_name}:publish",
            self.base_url()
        );
        let timeout = Some(self.config.publish_timeout);
        let response: PublishResponse = self
            .post(Operation::Publish, project_name, &url, request, timeout)
            .await?;
        MessagesTransferred {
            operation: Operation::Publish,
            project_name,
            count: request.messages().len(),
        }
        .emit();
        Ok(response)
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn subscription_url(&self, project_name: &str, subscription_name: &str, action: &str) -> String {
        format!(
            "{}/v1/projects/{project_name}/subscriptions/{subscription_name}:{action}",
            self.base_url()
        )
    }

    async fn post<B, R>(
        &self,
        operation: Operation,
        project_name: &str,
        url: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let access_token = self
            .access_token
            .access_token()
            .context(MissingAccessTokenSnafu)?;
        let timeout = timeout.filter(|timeout| !timeout.is_zero());

        let mut request = self.http.post(url).bearer_auth(access_token).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let started = Instant::now();
        let result = Self::send(operation, request, timeout).await;
        RequestCompleted {
            operation,
            project_name,
            succeeded: result.is_ok(),
            latency: started.elapsed(),
        }
        .emit();
        result
    }

    async fn send<R: DeserializeOwned>(
        operation: Operation,
        request: reqwest::RequestBuilder,
        timeout: Option<Duration>,
    ) -> Result<R, ClientError> {
        let classify = |source: reqwest::Error| match timeout {
            Some(timeout) if source.is_timeout() => ClientError::Timeout { operation, timeout },
            _ => ClientError::Request { operation, source },
        };

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let body = response.bytes().await.map_err(classify)?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body).into_owned();
            warn!(%operation, status = status.as_u16(), %body, "Unexpected response status");
            return UnexpectedStatusSnafu {
                operation,
                status,
                body,
            }
            .fail();
        }
        // An empty success body decodes like an empty object.
        let body = if body.trim_ascii().is_empty() { &b"{}"[..] } else { &body[..] };
        serde_json::from_slice(body).context(DecodeSnafu { operation })
    }
}

#[async_trait]
impl Puller for PubsubClient {
    async fn pull(
        &self,
        project_name: &str,
        subscription_name: &str,
        request: &PullRequest,
    ) -> Result<PullResponse, Error> {
        Ok(PubsubClient::pull(self, project_name, subscription_name, request).await?)
    }
}

#[async_trait]
impl Acker for PubsubClient {
    async fn ack(
        &self,
        project_name: &str,
        subscription_name: &str,
        request: &AckRequest,
    ) -> Result<(), Error> {
        Ok(PubsubClient::ack(self, project_name, subscription_name, request).await?)
    }
}

#[async_trait]
impl TopicPublisher for PubsubClient {
    async fn publish(
        &self,
        project_name: &str,
        topic_name: &str,
        request: &PublishRequest,
    ) -> Result<PublishResponse, Error> {
        Ok(PubsubClient::publish(self, project_name, topic_name, request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_token::StaticAccessToken;

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url(), "https://pubsub.googleapis.com:443");
        assert_eq!(config.pull_timeout(), Duration::from_secs(30));
        assert_eq!(config.publish_timeout(), Duration::from_secs(30));
        assert_eq!(config.ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.user_agent(), DEFAULT_USER_AGENT);
    }

    #[test]
    fn builds_endpoint_urls() {
        let config = ClientConfig::builder().base_url("http://localhost:8085/").build();
        let client = PubsubClient::new(config, Arc::new(StaticAccessToken::new("token"))).unwrap();

        assert_eq!(
            client.subscription_url("project", "subscription", "pull"),
            "http://localhost:8085/v1/projects/project/subscriptions/subscription:pull"
        );
        assert_eq!(
            client.subscription_url("project", "subscription", "acknowledge"),
            "http://localhost:8085/v1/projects/project/subscriptions/subscription:acknowledge"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let config = ClientConfig::builder().base_url("not a url").build();
        let error = PubsubClient::new(config, Arc::new(StaticAccessToken::new("token"))).unwrap_err();
        assert!(matches!(error, ClientError::InvalidBaseUrl { .. }));
    }
}
