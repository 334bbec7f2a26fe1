use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use bytes::Bytes;
use snafu::{ResultExt, Snafu, ensure};

use crate::{
    Error,
    model::{DraftedMessage, PublishRequest, PublishResponse},
};

/// Sends publish requests to a topic.
#[async_trait]
pub trait TopicPublisher: Send + Sync + 'static {
    async fn publish(
        &self,
        project_name: &str,
        topic_name: &str,
        request: &PublishRequest,
    ) -> Result<PublishResponse, Error>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PublisherError {
    #[snafu(display("invalid publisher config: {message}"))]
    InvalidConfig { message: &'static str },

    #[snafu(display("nothing to publish"))]
    EmptyBatch,

    #[snafu(display("publishing {message_count} message(s) to {topic_name} failed: {source}"))]
    Publish {
        topic_name: String,
        message_count: usize,
        source: Error,
    },
}

#[derive(Clone, Debug, Builder)]
pub struct PublisherConfig {
    #[builder(into)]
    project_name: String,

    #[builder(into)]
    topic_name: String,
}

impl PublisherConfig {
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }
}

/// Publishes drafted messages to one topic.
pub struct Publisher {
    config: PublisherConfig,
    inner: Arc<dyn TopicPublisher>,
}

impl Publisher {
    pub fn new(config: PublisherConfig, inner: Arc<dyn TopicPublisher>) -> Result<Self, PublisherError> {
        ensure!(
            !config.project_name.is_empty(),
            InvalidConfigSnafu {
                message: "was expecting a non-empty project name"
            }
        );
        ensure!(
            !config.topic_name.is_empty(),
            InvalidConfigSnafu {
                message: "was expecting a non-empty topic name"
            }
        );
        Ok(Self { config, inner })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publishes a single payload without attributes and returns its message id.
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<Option<String>, PublisherError> {
        let response = self
            .publish_messages(vec![DraftedMessage::new(payload)])
            .await?;
        Ok(response.message_ids().first().cloned())
    }

    pub async fn publish_messages(
        &self,
        messages: Vec<DraftedMessage>,
    ) -> Result<PublishResponse, PublisherError> {
        ensure!(!messages.is_empty(), EmptyBatchSnafu);
        let message_count = messages.len();
        let request = PublishRequest::new(messages);

        let response = self
            .inner
            .publish(&self.config.project_name, &self.config.topic_name, &request)
            .await
            .context(PublishSnafu {
                topic_name: &self.config.topic_name,
                message_count,
            })?;
        trace!(
            topic_name = %self.config.topic_name,
            message_count,
            "Messages published"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingPublisher {
        requests: Mutex<Vec<(String, String, usize)>>,
        fail: bool,
    }

    #[async_trait]
    impl TopicPublisher for RecordingPublisher {
        async fn publish(
            &self,
            project_name: &str,
            topic_name: &str,
            request: &PublishRequest,
        ) -> Result<PublishResponse, Error> {
            if self.fail {
                return Err("topic not found".into());
            }
            self.requests.lock().unwrap().push((
                project_name.to_owned(),
                topic_name.to_owned(),
                request.messages().len(),
            ));
            let body = serde_json::json!({ "messageIds": ["m-1", "m-2"] });
            Ok(serde_json::from_value(body)?)
        }
    }

    fn config() -> PublisherConfig {
        PublisherConfig::builder()
            .project_name("project")
            .topic_name("topic")
            .build()
    }

    #[tokio::test]
    async fn publishes_to_configured_topic() {
        let inner = Arc::new(RecordingPublisher::default());
        let publisher = Publisher::new(config(), inner.clone()).unwrap();

        let message_id = publisher.publish("hello").await.unwrap();
        assert_eq!(message_id.as_deref(), Some("m-1"));
        assert_eq!(
            *inner.requests.lock().unwrap(),
            vec![("project".to_owned(), "topic".to_owned(), 1)]
        );
    }

    #[tokio::test]
    async fn rejects_empty_batch() {
        let publisher = Publisher::new(config(), Arc::new(RecordingPublisher::default())).unwrap();
        let error = publisher.publish_messages(Vec::new()).await.unwrap_err();
        assert!(matches!(error, PublisherError::EmptyBatch));
    }

    #[tokio::test]
    async fn wraps_publish_failures() {
        let inner = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let publisher = Publisher::new(config(), inner).unwrap();

        let error = publisher
            .publish_messages(vec![DraftedMessage::new("a"), DraftedMessage::new("b")])
            .await
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "publishing 2 message(s) to topic failed: topic not found"
        );
    }

    #[test]
    fn rejects_empty_topic_name() {
        let config = PublisherConfig::builder()
            .project_name("project")
            .topic_name("")
            .build();
        let error = Publisher::new(config, Arc::new(RecordingPublisher::default()))
            .err()
            .unwrap();
        assert!(matches!(error, PublisherError::InvalidConfig { .. }));
    }
}
