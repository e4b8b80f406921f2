//! Message-queue abstraction.
//!
//! The loader only depends on receive / ack / extend-visibility. Two
//! implementations ship: an SQS-compatible HTTP client (json protocol,
//! credential signing left to the deployment's proxy or an
//! unsigned-compatible endpoint) and an in-process queue for tests and
//! local runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::QueueError;

/// A received message. The receipt is an opaque handle for ack/extend.
#[derive(Debug, Clone)]
pub struct Message {
    pub body: String,
    pub receipt: String,
}

/// Queue operations the dispatch loop consumes.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receive one message, waiting at most `wait`. `None` on timeout.
    async fn receive(&self, wait: Duration) -> Result<Option<Message>, QueueError>;

    /// Delete a message; it will never be redelivered.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;

    /// Extend the message's visibility timeout.
    async fn extend(&self, receipt: &str, visibility: Duration) -> Result<(), QueueError>;
}

/// SQS-compatible queue client over the `x-amz-json-1.0` protocol.
pub struct SqsQueue {
    client: reqwest::Client,
    endpoint: String,
    queue_url: String,
}

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    #[serde(rename = "Messages", default)]
    messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "Body")]
    body: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
}

impl SqsQueue {
    /// `queue_url` is the full queue URL; requests go to its origin.
    pub fn new(queue_url: impl Into<String>) -> Self {
        let queue_url = queue_url.into();
        let endpoint = queue_url
            .find('/')
            .and_then(|scheme_end| {
                queue_url[scheme_end + 2..]
                    .find('/')
                    .map(|host_end| queue_url[..scheme_end + 2 + host_end].to_string())
            })
            .unwrap_or_else(|| queue_url.clone());
        Self {
            client: reqwest::Client::new(),
            endpoint,
            queue_url,
        }
    }

    async fn call(
        &self,
        action: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(&self.endpoint)
            .header("X-Amz-Target", format!("AmazonSQS.{action}"))
            .header("Content-Type", "application/x-amz-json-1.0")
            .json(&body)
            .send()
            .await?
            .error_for_status()
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<Message>, QueueError> {
        let response = self
            .call(
                "ReceiveMessage",
                json!({
                    "QueueUrl": self.queue_url,
                    "MaxNumberOfMessages": 1,
                    "WaitTimeSeconds": wait.as_secs(),
                }),
            )
            .await
            .map_err(|e| QueueError::Receive {
                message: e.to_string(),
            })?;
        let parsed: ReceiveResponse =
            response.json().await.map_err(|e| QueueError::Receive {
                message: e.to_string(),
            })?;
        Ok(parsed.messages.into_iter().next().map(|m| Message {
            body: m.body,
            receipt: m.receipt_handle,
        }))
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.call(
            "DeleteMessage",
            json!({
                "QueueUrl": self.queue_url,
                "ReceiptHandle": receipt,
            }),
        )
        .await
        .map_err(|e| QueueError::Ack {
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn extend(&self, receipt: &str, visibility: Duration) -> Result<(), QueueError> {
        self.call(
            "ChangeMessageVisibility",
            json!({
                "QueueUrl": self.queue_url,
                "ReceiptHandle": receipt,
                "VisibilityTimeout": visibility.as_secs(),
            }),
        )
        .await
        .map_err(|e| QueueError::Extend {
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// In-process queue with recorded acks and extensions.
#[derive(Default)]
pub struct InProcessQueue {
    pending: Mutex<VecDeque<Message>>,
    acked: Mutex<Vec<String>>,
    extended: Mutex<Vec<String>>,
}

impl InProcessQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a message body; the receipt is derived from the insertion
    /// order.
    pub async fn push(&self, body: impl Into<String>) {
        let mut pending = self.pending.lock().await;
        let receipt = format!("receipt-{}", pending.len());
        pending.push_back(Message {
            body: body.into(),
            receipt,
        });
    }

    /// Receipts acknowledged so far.
    pub async fn acked(&self) -> Vec<String> {
        self.acked.lock().await.clone()
    }

    /// Receipts whose visibility was extended, one entry per extension.
    pub async fn extended(&self) -> Vec<String> {
        self.extended.lock().await.clone()
    }
}

#[async_trait]
impl MessageQueue for InProcessQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<Message>, QueueError> {
        if let Some(message) = self.pending.lock().await.pop_front() {
            return Ok(Some(message));
        }
        tokio::time::sleep(wait).await;
        Ok(self.pending.lock().await.pop_front())
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.acked.lock().await.push(receipt.to_string());
        Ok(())
    }

    async fn extend(&self, receipt: &str, _visibility: Duration) -> Result<(), QueueError> {
        self.extended.lock().await.push(receipt.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_order_and_ack() {
        let queue = InProcessQueue::new();
        queue.push("first").await;
        queue.push("second").await;

        let first = queue
            .receive(Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body, "first");
        queue.ack(&first.receipt).await.unwrap();

        let second = queue
            .receive(Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.body, "second");

        assert_eq!(queue.acked().await, vec![first.receipt]);
    }

    #[test]
    fn test_sqs_endpoint_derivation() {
        let queue = SqsQueue::new("https://sqs.us-east-1.amazonaws.com/123456789/loader-queue");
        assert_eq!(queue.endpoint, "https://sqs.us-east-1.amazonaws.com");
        assert_eq!(
            queue.queue_url,
            "https://sqs.us-east-1.amazonaws.com/123456789/loader-queue"
        );
    }

    #[tokio::test]
    async fn test_receive_times_out_empty() {
        let queue = InProcessQueue::new();
        let result = queue.receive(Duration::from_millis(1)).await.unwrap();
        assert!(result.is_none());
    }
}
