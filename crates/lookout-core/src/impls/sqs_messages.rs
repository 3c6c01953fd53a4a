//! SqsMessages - Amazon SQS を使う本番用の MessageSource
//!
//! - long polling（最大 20 秒）でバッチを受け取る
//! - complete は DeleteMessage
//! - retry は ChangeMessageVisibility（受信回数に応じた指数バックオフ）
//!
//! SDK クライアントは初回アクセス時に環境の AWS 設定から作ります。
//! そのため `SqsMessages::new` は同期的に呼べます。

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::types::{Message as SqsMessage, MessageSystemAttributeName};
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::domain::{Delivery, Message, MessageId};
use crate::error::QueueError;
use crate::ports::MessageSource;

/// SQS hands out at most this many messages per receive call.
pub const MAX_BATCH_SIZE: usize = 10;
/// Longest long-poll SQS accepts.
pub const MAX_WAIT: Duration = Duration::from_secs(20);
/// Upper bound of the retry back-off (12 hours, the SQS visibility limit).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

pub struct SqsMessages {
    queue_url: String,
    client: OnceCell<Client>,
}

impl SqsMessages {
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            client: OnceCell::new(),
        }
    }

    /// Use an already configured client (custom endpoint, LocalStack, ...).
    pub fn with_client(queue_url: impl Into<String>, client: Client) -> Self {
        Self {
            queue_url: queue_url.into(),
            client: OnceCell::new_with(Some(client)),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
                Client::new(&config)
            })
            .await
    }
}

#[async_trait]
impl MessageSource for SqsMessages {
    async fn wait_for(&self, limit: usize, timeout: Duration) -> Result<Vec<Message>, QueueError> {
        let limit = limit.clamp(1, MAX_BATCH_SIZE) as i32;
        let wait = timeout.min(MAX_WAIT).as_secs() as i32;

        let output = self
            .client()
            .await
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(limit)
            .wait_time_seconds(wait)
            .message_system_attribute_names(MessageSystemAttributeName::SentTimestamp)
            .message_system_attribute_names(
                MessageSystemAttributeName::ApproximateFirstReceiveTimestamp,
            )
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        let messages = output
            .messages()
            .iter()
            .map(to_message)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(queue_url = %self.queue_url, received = messages.len(), "received from sqs");
        Ok(messages)
    }

    async fn complete(&self, message: &Message) -> Result<(), QueueError> {
        self.client()
            .await
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(message.handle())
            .send()
            .await
            .map_err(|e| QueueError::Acknowledge {
                id: message.id().to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn retry(&self, message: &Message) -> Result<(), QueueError> {
        let visibility = retry_visibility_secs(message.delivery().receive_count);
        self.client()
            .await
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(message.handle())
            .visibility_timeout(visibility as i32)
            .send()
            .await
            .map_err(|e| QueueError::Acknowledge {
                id: message.id().to_string(),
                reason: e.to_string(),
            })?;
        debug!(message_id = %message.id(), visibility, "returned message to sqs");
        Ok(())
    }
}

/// Seconds a failed message stays hidden before it is handed out again:
/// `2^receive_count`, capped at the SQS maximum.
pub fn retry_visibility_secs(receive_count: u32) -> u64 {
    2u64.saturating_pow(receive_count)
        .min(MAX_VISIBILITY_TIMEOUT_SECS)
}

fn to_message(raw: &SqsMessage) -> Result<Message, QueueError> {
    let id = raw.message_id().ok_or_else(|| QueueError::Decode {
        id: "<unknown>".to_string(),
        reason: "missing MessageId".to_string(),
    })?;
    let handle = raw.receipt_handle().ok_or_else(|| QueueError::Decode {
        id: id.to_string(),
        reason: "missing ReceiptHandle".to_string(),
    })?;

    let attribute = |name: MessageSystemAttributeName| {
        raw.attributes()
            .and_then(|attrs| attrs.get(&name))
            .map(String::as_str)
    };
    let delivery = Delivery {
        sent_at: attribute(MessageSystemAttributeName::SentTimestamp).and_then(parse_epoch_millis),
        first_received_at: attribute(MessageSystemAttributeName::ApproximateFirstReceiveTimestamp)
            .and_then(parse_epoch_millis),
        receive_count: attribute(MessageSystemAttributeName::ApproximateReceiveCount)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
    };

    Ok(Message::new(MessageId::new(id), handle, raw.body().unwrap_or_default())
        .with_delivery(delivery))
}

fn parse_epoch_millis(value: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}
