use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lapin::options::{BasicAckOptions, BasicGetOptions};
use lapin::types::AMQPValue;
use lapin::Channel;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ProxyError;
use crate::types::{is_pass_through_header, ContentTypeKind};

/// Response shape for a single successful consume.
pub struct ConsumeOutcome {
    pub body: Vec<u8>,
    pub content_type: String,
    pub message_count: u32,
    pub pass_through_headers: HashMap<String, String>,
}

/// On-demand single-message pull with manual ack, on the shared regular
/// channel.
#[derive(Clone)]
pub struct Consumer {
    pub queue_name: String,
    allowed_identities: HashSet<String>,
    channel: Arc<Mutex<Channel>>,
}

impl Consumer {
    pub fn new(queue_name: String, allowed_identities: HashSet<String>, channel: Arc<Mutex<Channel>>) -> Self {
        Self { queue_name, allowed_identities, channel }
    }

    pub fn allowed_identities(&self) -> &HashSet<String> {
        &self.allowed_identities
    }

    /// Issue a single non-waiting `basic.get`. Returns `Ok(None)` when the
    /// queue is empty (mapped to `EMPTY`/423 by the router).
    pub async fn consume_one(&self) -> Result<Option<ConsumeOutcome>, ProxyError> {
        let channel = self.channel.lock().await;

        let get = channel
            .basic_get(&self.queue_name, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!(e)))?;

        let Some(get) = get else {
            return Ok(None);
        };

        let message_count = get.message_count;
        let delivery = get.delivery;

        let content_type = delivery
            .properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| ContentTypeKind::Binary.mime().to_string());

        let mut pass_through_headers = HashMap::new();
        if let Some(headers) = delivery.properties.headers() {
            for (name, value) in headers.into_iter() {
                let name = name.as_str();
                if is_pass_through_header(name)
                    && let AMQPValue::LongString(s) = value
                {
                    pass_through_headers.insert(name.to_string(), s.to_string());
                }
            }
        }

        let body = delivery.data.clone();
        let delivery_tag = delivery.delivery_tag;

        let outcome = ConsumeOutcome { body, content_type, message_count, pass_through_headers };

        // Ack after the response has been fully composed: if the ack
        // itself fails the message is lost-to-HTTP (broker will eventually
        // redeliver it to someone else), but the caller already has the
        // body in hand — at-least-once from broker to client.
        if let Err(e) = channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
            warn!(error = %e, delivery_tag, queue = %self.queue_name, "failed to ack consumed message");
        }

        Ok(Some(outcome))
    }
}
