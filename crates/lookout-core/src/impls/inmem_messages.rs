//! InMemoryMessages - 開発・テスト用のキュー
//!
//! # 実装詳細
//! - `tokio::sync::Mutex` で状態を保護
//! - `Notify` で push 時に待機中の `wait_for` を起こす
//! - 配送中のメッセージは receipt handle ごとに保持し、complete / retry で解放

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use ulid::Ulid;

use crate::domain::{Delivery, Message, MessageId};
use crate::error::QueueError;
use crate::ports::MessageSource;

#[derive(Debug, Clone)]
struct Pending {
    id: MessageId,
    raw_body: String,
    sent_at: DateTime<Utc>,
    first_received_at: Option<DateTime<Utc>>,
    receive_count: u32,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Pending>,
    /// receipt handle -> message handed out and not yet acknowledged
    in_flight: HashMap<String, Pending>,
    completed: Vec<MessageId>,
    retried: Vec<MessageId>,
}

impl State {
    fn take_batch(&mut self, limit: usize) -> Vec<Message> {
        let now = Utc::now();
        let n = limit.min(self.ready.len());
        let mut batch = Vec::with_capacity(n);
        for mut pending in self.ready.drain(..n) {
            pending.receive_count += 1;
            pending.first_received_at.get_or_insert(now);

            let handle = Ulid::new().to_string();
            let message = Message::new(pending.id.clone(), handle.clone(), pending.raw_body.clone())
                .with_delivery(Delivery {
                    sent_at: Some(pending.sent_at),
                    first_received_at: pending.first_received_at,
                    receive_count: pending.receive_count,
                });
            self.in_flight.insert(handle, pending);
            batch.push(message);
        }
        batch
    }

    fn release(&mut self, message: &Message) -> Result<Pending, QueueError> {
        self.in_flight
            .remove(message.handle())
            .ok_or_else(|| QueueError::Acknowledge {
                id: message.id().to_string(),
                reason: "unknown receipt handle".to_string(),
            })
    }
}

/// In-memory `MessageSource`.
///
/// # 使用例
/// ```ignore
/// let messages = InMemoryMessages::new();
/// messages.push("hello").await;
/// let batch = messages.wait_for(10, Duration::from_secs(1)).await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemoryMessages {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InMemoryMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw message body; returns the id it was assigned.
    pub async fn push(&self, raw_body: impl Into<String>) -> MessageId {
        let id = MessageId::new(Ulid::new().to_string());
        let pending = Pending {
            id: id.clone(),
            raw_body: raw_body.into(),
            sent_at: Utc::now(),
            first_received_at: None,
            receive_count: 0,
        };
        self.state.lock().await.ready.push_back(pending);
        self.notify.notify_one();
        id
    }

    /// Messages waiting to be handed out.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Messages handed out and not yet acknowledged.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn completed(&self) -> Vec<MessageId> {
        self.state.lock().await.completed.clone()
    }

    pub async fn retried(&self) -> Vec<MessageId> {
        self.state.lock().await.retried.clone()
    }
}

#[async_trait]
impl MessageSource for InMemoryMessages {
    async fn wait_for(&self, limit: usize, timeout: Duration) -> Result<Vec<Message>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.ready.is_empty() {
                    return Ok(state.take_batch(limit.max(1)));
                }
            }

            // push 前に notify_one されていても permit が残るので取りこぼさない
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn complete(&self, message: &Message) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let pending = state.release(message)?;
        state.completed.push(pending.id);
        Ok(())
    }

    async fn retry(&self, message: &Message) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let pending = state.release(message)?;
        state.retried.push(pending.id.clone());
        state.ready.push_back(pending);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }
}
