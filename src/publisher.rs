use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lapin::options::BasicPublishOptions;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use tokio::sync::Mutex;

use crate::error::ProxyError;
use crate::identity::IdentityMap;
use crate::parser::ParserKind;
use crate::types::{is_pass_through_header, PublishOutcome, CORRELATION_HEADER};

/// Owns one queue's outbound path on either the confirm or the regular
/// channel. `messages_in_flight` tracks accepted-but-unresolved publishes
/// and is the coupling point the lifecycle coordinator reads during
/// drain.
#[derive(Clone)]
pub struct Publisher {
    pub queue_name: String,
    parser: ParserKind,
    confirm: bool,
    allowed_identities: HashSet<String>,
    channel: Arc<Mutex<Channel>>,
    messages_in_flight: Arc<AtomicU64>,
    publish_total: Arc<AtomicU64>,
    publish_confirmed_total: Arc<AtomicU64>,
}

impl Publisher {
    pub fn new(queue_name: String, parser: ParserKind, confirm: bool, allowed_identities: HashSet<String>, channel: Arc<Mutex<Channel>>) -> Self {
        Self {
            queue_name,
            parser,
            confirm,
            allowed_identities,
            channel,
            messages_in_flight: Arc::new(AtomicU64::new(0)),
            publish_total: Arc::new(AtomicU64::new(0)),
            publish_confirmed_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn allowed_identities(&self) -> &HashSet<String> {
        &self.allowed_identities
    }

    pub fn messages_in_flight(&self) -> u64 {
        self.messages_in_flight.load(Ordering::SeqCst)
    }

    pub fn publish_total(&self) -> u64 {
        self.publish_total.load(Ordering::SeqCst)
    }

    pub fn publish_confirmed_total(&self) -> u64 {
        self.publish_confirmed_total.load(Ordering::SeqCst)
    }

    /// Parse, construct AMQP properties, and publish one HTTP request body
    /// onto this publisher's queue.
    pub async fn send_message(
        &self,
        request_content_type: Option<&str>,
        correlation_id: Option<&str>,
        pass_through_headers: &[(String, String)],
        body: &[u8],
    ) -> Result<PublishOutcome, ProxyError> {
        let payload = self.parser.parse_inbound(request_content_type, body)?;

        let mut properties = BasicProperties::default().with_content_type(self.parser.content_type_kind().mime().into());

        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }

        let mut amqp_headers = FieldTable::default();
        for (name, value) in pass_through_headers {
            if is_pass_through_header(name) && name.to_ascii_lowercase() != CORRELATION_HEADER {
                amqp_headers.insert(name.to_ascii_lowercase().into(), AMQPValue::LongString(value.clone().into()));
            }
        }
        if !amqp_headers.is_empty() {
            properties = properties.with_headers(amqp_headers);
        }

        self.messages_in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.publish(&payload, properties).await;
        self.messages_in_flight.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            self.publish_total.fetch_add(1, Ordering::SeqCst);
        }
        if matches!(result, Ok(true)) {
            self.publish_confirmed_total.fetch_add(1, Ordering::SeqCst);
        }

        result.map(|confirmed| PublishOutcome { content_length_bytes: payload.len(), confirmed })
    }

    async fn publish(&self, payload: &[u8], properties: BasicProperties) -> Result<bool, ProxyError> {
        let channel = self.channel.lock().await;

        if self.confirm {
            let confirm = channel
                .basic_publish(
                    "",
                    &self.queue_name,
                    BasicPublishOptions { mandatory: false, ..Default::default() },
                    payload,
                    properties,
                )
                .await
                .map_err(|e| ProxyError::BrokerRejected(e.to_string()))?
                .await
                .map_err(|e| ProxyError::BrokerRejected(e.to_string()))?;

            if confirm.is_ack() {
                Ok(true)
            } else {
                Err(ProxyError::BrokerRejected("broker nacked the publish".to_string()))
            }
        } else {
            channel
                .basic_publish("", &self.queue_name, BasicPublishOptions::default(), payload, properties)
                .await
                .map_err(|e| ProxyError::BrokerRejected(e.to_string()))?;

            Ok(false)
        }
    }
}

/// Enforce the identity guard for a publisher before accepting a publish.
pub fn check_publisher_identity(
    identities: &IdentityMap,
    publisher: &Publisher,
    identity_header: Option<&str>,
    token_header: Option<&str>,
) -> Result<(), ProxyError> {
    identities.check(publisher.allowed_identities(), identity_header, token_header)
}
