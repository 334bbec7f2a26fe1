//! JSON wire models of the Pub/Sub REST API.

use std::{collections::HashMap, fmt};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ResultExt, Snafu, ensure};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ModelError {
    #[snafu(display("was expecting a non-zero positive max message count"))]
    ZeroMaxMessages,

    #[snafu(display("empty ackIds"))]
    EmptyAckIds,

    #[snafu(display("both payload and attributes cannot be empty (message_id={message_id})"))]
    EmptyMessage { message_id: String },

    #[snafu(display("invalid base64 payload (message_id={message_id}): {source}"))]
    InvalidPayload {
        message_id: String,
        source: base64::DecodeError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    return_immediately: bool,
    max_messages: u32,
}

impl PullRequest {
    pub fn new(return_immediately: bool, max_messages: u32) -> Result<Self, ModelError> {
        ensure!(max_messages > 0, ZeroMaxMessagesSnafu);
        Ok(Self {
            return_immediately,
            max_messages,
        })
    }

    pub const fn return_immediately(&self) -> bool {
        self.return_immediately
    }

    pub const fn max_messages(&self) -> u32 {
        self.max_messages
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    received_messages: Vec<ReceivedMessage>,
}

impl PullResponse {
    pub const fn new(received_messages: Vec<ReceivedMessage>) -> Self {
        Self { received_messages }
    }

    pub fn received_messages(&self) -> &[ReceivedMessage] {
        &self.received_messages
    }

    pub fn into_received_messages(self) -> Vec<ReceivedMessage> {
        self.received_messages
    }

    pub fn is_empty(&self) -> bool {
        self.received_messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.received_messages.len()
    }
}

/// A pulled message together with the id needed to acknowledge it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

impl ReceivedMessage {
    pub fn new(ack_id: impl Into<String>, message: PubsubMessage) -> Self {
        Self {
            ack_id: ack_id.into(),
            message,
        }
    }

    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    pub const fn message(&self) -> &PubsubMessage {
        &self.message
    }
}

/// A published message as delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawPubsubMessage")]
pub struct PubsubMessage {
    message_id: String,
    publish_time: DateTime<Utc>,
    payload: Bytes,
    attributes: HashMap<String, String>,
}

impl PubsubMessage {
    pub fn new(
        message_id: impl Into<String>,
        publish_time: DateTime<Utc>,
        payload: impl Into<Bytes>,
        attributes: HashMap<String, String>,
    ) -> Result<Self, ModelError> {
        let message_id = message_id.into();
        let payload = payload.into();
        ensure!(
            !payload.is_empty() || !attributes.is_empty(),
            EmptyMessageSnafu { message_id }
        );
        Ok(Self {
            message_id,
            publish_time,
            payload,
            attributes,
        })
    }

    /// Id assigned by the server on publish, unique within the topic.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub const fn publish_time(&self) -> DateTime<Utc> {
        self.publish_time
    }

    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub const fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPubsubMessage {
    message_id: String,
    publish_time: DateTime<Utc>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    attributes: HashMap<String, String>,
}

impl TryFrom<RawPubsubMessage> for PubsubMessage {
    type Error = ModelError;

    fn try_from(raw: RawPubsubMessage) -> Result<Self, Self::Error> {
        let payload = match raw.data.as_deref() {
            None | Some("") => Vec::new(),
            Some(data) => BASE64.decode(data).context(InvalidPayloadSnafu {
                message_id: &raw.message_id,
            })?,
        };
        Self::new(raw.message_id, raw.publish_time, payload, raw.attributes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    ack_ids: Vec<String>,
}

impl AckRequest {
    pub fn new(ack_ids: Vec<String>) -> Result<Self, ModelError> {
        ensure!(!ack_ids.is_empty(), EmptyAckIdsSnafu);
        Ok(Self { ack_ids })
    }

    /// Acknowledges every message of `response`.
    pub fn for_pull_response(response: &PullResponse) -> Result<Self, ModelError> {
        Self::new(
            response
                .received_messages()
                .iter()
                .map(|message| message.ack_id().to_owned())
                .collect(),
        )
    }

    pub fn ack_ids(&self) -> &[String] {
        &self.ack_ids
    }
}

impl fmt::Display for AckRequest {
    /// Shows at most two ids, so batches of thousands stay readable in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX_VISIBLE_ACK_IDS: usize = 2;
        f.write_str("AckRequest{ackIds=[")?;
        for (index, ack_id) in self.ack_ids.iter().take(MAX_VISIBLE_ACK_IDS).enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            f.write_str(ack_id)?;
        }
        if self.ack_ids.len() > MAX_VISIBLE_ACK_IDS {
            write!(f, ", <{} more>", self.ack_ids.len() - MAX_VISIBLE_ACK_IDS)?;
        }
        f.write_str("]}")
    }
}

/// A message to be published.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DraftedMessage {
    #[serde(rename = "data", serialize_with = "serialize_base64")]
    payload: Bytes,
    attributes: HashMap<String, String>,
}

impl DraftedMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_attributes(payload, HashMap::new())
    }

    pub fn with_attributes(payload: impl Into<Bytes>, attributes: HashMap<String, String>) -> Self {
        Self {
            payload: payload.into(),
            attributes,
        }
    }

    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub const fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PublishRequest {
    messages: Vec<DraftedMessage>,
}

impl PublishRequest {
    pub const fn new(messages: Vec<DraftedMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[DraftedMessage] {
        &self.messages
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    message_ids: Vec<String>,
}

impl PublishResponse {
    pub fn message_ids(&self) -> &[String] {
        &self.message_ids
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn serialize_base64<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(payload))
}
