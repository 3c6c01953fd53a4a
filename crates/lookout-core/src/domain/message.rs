//! Message - キューから受け取った 1 件の作業単位
//!
//! Message は不変の値です。ack（削除）や再配送は `MessageSource` 側の責務で、
//! Message 自身は「誰に返せばよいか」を示す handle を運ぶだけです。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery metadata reported by the queue alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub sent_at: Option<DateTime<Utc>>,
    pub first_received_at: Option<DateTime<Utc>>,
    /// How many times the queue has handed this message out, this time included.
    pub receive_count: u32,
}

/// SNS notification envelope. Messages fanned out from a topic arrive wrapped
/// in one of these; anything else is taken as the body verbatim.
#[derive(Deserialize)]
struct Notification {
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "Subject")]
    subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    body: String,
    subject: Option<String>,
    handle: String,
    delivery: Delivery,
}

impl Message {
    /// Build a message from the raw queue body, unwrapping an SNS envelope if
    /// there is one.
    pub fn new(id: MessageId, handle: impl Into<String>, raw_body: impl Into<String>) -> Self {
        let raw_body = raw_body.into();
        let (body, subject) = match serde_json::from_str::<Notification>(&raw_body) {
            Ok(n) => (n.message, n.subject),
            Err(_) => (raw_body, None),
        };

        Self {
            id,
            body,
            subject,
            handle: handle.into(),
            delivery: Delivery::default(),
        }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Opaque token the source needs to acknowledge this delivery.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Environment variables handed to the worker process.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("MessageId".to_string(), self.id.to_string()),
            ("Message".to_string(), self.body.clone()),
        ];
        if let Some(subject) = &self.subject {
            env.push(("Subject".to_string(), subject.clone()));
        }
        if let Some(sent_at) = self.delivery.sent_at {
            env.push(("SentTimestamp".to_string(), sent_at.to_rfc3339()));
        }
        if let Some(first) = self.delivery.first_received_at {
            env.push((
                "ApproximateFirstReceiveTimestamp".to_string(),
                first.to_rfc3339(),
            ));
        }
        env.push((
            "ApproximateReceiveCount".to_string(),
            self.delivery.receive_count.to_string(),
        ));
        env
    }
}
