use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{message::Delivery, Channel};
use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SubscriberSpec;
use crate::types::{is_pass_through_header, ContentTypeKind, CORRELATION_HEADER, REDELIVERED_HEADER};

/// `idle -> starting -> running -> stopping -> stopped`. `stopped` is
/// terminal for the process lifetime of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A long-lived pull loop pushing deliveries from one queue to one HTTP
/// target, with prefetch-bounded concurrency and per-delivery retry.
pub struct Subscriber {
    pub queue_name: String,
    spec: SubscriberSpec,
    channel: Channel,
    http_client: Client,
    status: RwLock<SubscriberStatus>,
    consumer_tag: AsyncMutex<Option<String>>,
    in_flight_push_requests: Arc<AtomicU64>,
    soft_cancel: CancellationToken,
    hard_cancel: CancellationToken,
}

impl Subscriber {
    pub fn new(spec: SubscriberSpec, channel: Channel) -> anyhow::Result<Arc<Self>> {
        let http_client = Client::builder().build()?;

        Ok(Arc::new(Self {
            queue_name: spec.queue_name.clone(),
            spec,
            channel,
            http_client,
            status: RwLock::new(SubscriberStatus::Idle),
            consumer_tag: AsyncMutex::new(None),
            in_flight_push_requests: Arc::new(AtomicU64::new(0)),
            soft_cancel: CancellationToken::new(),
            hard_cancel: CancellationToken::new(),
        }))
    }

    pub fn status(&self) -> SubscriberStatus {
        *self.status.read()
    }

    pub fn in_flight_push_requests(&self) -> u64 {
        self.in_flight_push_requests.load(Ordering::SeqCst)
    }

    /// Register a manual-ack consumer and begin the pull loop on a
    /// background task. Returns once the consumer is registered; the loop
    /// itself runs until `stop` is called or the channel closes.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        *self.status.write() = SubscriberStatus::Starting;

        let consumer_tag = format!("bunny-{}-{}", self.queue_name, Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(&self.queue_name, &consumer_tag, BasicConsumeOptions { no_ack: false, ..Default::default() }, FieldTable::default())
            .await?;

        *self.consumer_tag.lock().await = Some(consumer_tag.clone());
        *self.status.write() = SubscriberStatus::Running;
        info!(queue = %self.queue_name, consumer_tag, "subscriber started");

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.soft_cancel.cancelled() => {
                        debug!(queue = %this.queue_name, "pull loop stopping: soft cancel requested");
                        break;
                    }
                    next = consumer.next() => {
                        match next {
                            Some(Ok(delivery)) => {
                                let this = this.clone();
                                tokio::spawn(async move {
                                    this.handle_delivery(delivery).await;
                                });
                            }
                            Some(Err(e)) => {
                                warn!(queue = %this.queue_name, error = %e, "subscriber consumer stream error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            *this.status.write() = SubscriberStatus::Stopped;
            debug!(queue = %this.queue_name, "pull loop exited");
        });

        Ok(())
    }

    /// `hard=false`: cancel the AMQP consumer and let in-flight pushes
    /// finish naturally. `hard=true`: also cancel outstanding HTTP pushes
    /// and nack-requeue whatever they held.
    pub async fn stop(&self, hard: bool) {
        *self.status.write() = SubscriberStatus::Stopping;

        if let Some(tag) = self.consumer_tag.lock().await.take()
            && let Err(e) = self.channel.basic_cancel(&tag, BasicCancelOptions::default()).await
        {
            warn!(queue = %self.queue_name, error = %e, "failed to cancel AMQP consumer");
        }

        self.soft_cancel.cancel();

        if hard {
            self.hard_cancel.cancel();
        }
    }

    async fn handle_delivery(self: Arc<Self>, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let redelivered = delivery.redelivered;
        let content_type =
            delivery.properties.content_type().as_ref().map(|s| s.as_str().to_string()).unwrap_or_else(|| ContentTypeKind::Binary.mime().to_string());
        let correlation_id = delivery.properties.correlation_id().as_ref().map(|s| s.as_str().to_string());

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

        self.in_flight_push_requests.fetch_add(1, Ordering::SeqCst);

        let outcome = self
            .push_with_retry(&delivery.data, &content_type, correlation_id.as_deref(), &pass_through_headers, redelivered)
            .await;

        match outcome {
            PushOutcome::Ack => {
                if let Err(e) = self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
                    warn!(queue = %self.queue_name, delivery_tag, error = %e, "failed to ack delivered message");
                }
            }
            PushOutcome::NackRequeue => {
                if let Err(e) = self.channel.basic_nack(delivery_tag, BasicNackOptions { requeue: true, ..Default::default() }).await {
                    warn!(queue = %self.queue_name, delivery_tag, error = %e, "failed to nack-requeue message");
                }
            }
        }

        self.in_flight_push_requests.fetch_sub(1, Ordering::SeqCst);
    }

    /// Runs the RECEIVED -> POSTING -> (SUCCESS -> ACK) | (FAILURE -> WAIT
    /// -> POSTING | NACK_REQUEUE) state machine for one delivery.
    async fn push_with_retry(
        &self,
        body: &[u8],
        content_type: &str,
        correlation_id: Option<&str>,
        pass_through_headers: &HashMap<String, String>,
        redelivered: bool,
    ) -> PushOutcome {
        let mut attempt: u32 = 1;

        loop {
            if self.hard_cancel.is_cancelled() {
                return PushOutcome::NackRequeue;
            }

            let post = post_once(&self.http_client, &self.spec.target, self.spec.timeout, &self.queue_name, body, content_type, correlation_id, pass_through_headers, redelivered);

            let success = tokio::select! {
                _ = self.hard_cancel.cancelled() => false,
                result = post => result,
            };

            if success {
                return PushOutcome::Ack;
            }

            if attempt > self.spec.retries {
                return PushOutcome::NackRequeue;
            }

            let delay = self.spec.backoff_strategy.delay(self.spec.retry_delay, attempt);
            debug!(queue = %self.queue_name, attempt, delay_ms = delay.as_millis() as u64, "subscriber push failed, retrying");

            tokio::select! {
                _ = self.hard_cancel.cancelled() => return PushOutcome::NackRequeue,
                _ = sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

enum PushOutcome {
    Ack,
    NackRequeue,
}

/// One POST attempt with a deadline. Network error, timeout, or a
/// non-2xx status are all FAILURE. Free function (no `Subscriber` access
/// to a live AMQP channel needed) so it can be exercised directly against
/// a mock HTTP target.
#[allow(clippy::too_many_arguments)]
async fn post_once(
    http_client: &Client,
    target: &reqwest::Url,
    timeout: Duration,
    queue_name: &str,
    body: &[u8],
    content_type: &str,
    correlation_id: Option<&str>,
    pass_through_headers: &HashMap<String, String>,
    redelivered: bool,
) -> bool {
    let mut request = http_client
        .post(target.clone())
        .timeout(timeout)
        .header("Content-Type", content_type)
        .header(REDELIVERED_HEADER, if redelivered { "true" } else { "false" })
        .body(body.to_vec());

    if let Some(correlation_id) = correlation_id {
        request = request.header(CORRELATION_HEADER, correlation_id);
    }

    for (name, value) in pass_through_headers {
        request = request.header(name, value);
    }

    match request.send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            warn!(queue = queue_name, target = %target, error = %e, "subscriber push request failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::BackoffStrategy;

    #[test]
    fn status_starts_idle() {
        assert_eq!(SubscriberStatus::Idle, SubscriberStatus::Idle);
    }

    #[test]
    fn backoff_delay_matches_strategy() {
        assert_eq!(BackoffStrategy::Fixed.delay(Duration::from_millis(500), 3), Duration::from_millis(500));
        assert_eq!(BackoffStrategy::Linear.delay(Duration::from_millis(500), 3), Duration::from_millis(1500));
        assert_eq!(BackoffStrategy::Exponential.delay(Duration::from_millis(500), 3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn post_once_succeeds_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Bunny-Redelivered", "false"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let target: reqwest::Url = format!("{}/hook", server.uri()).parse().unwrap();
        let client = Client::new();
        let headers = HashMap::new();

        let ok = post_once(&client, &target, Duration::from_secs(1), "q", b"hello", "application/json", None, &headers, false).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn post_once_fails_on_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/hook")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

        let target: reqwest::Url = format!("{}/hook", server.uri()).parse().unwrap();
        let client = Client::new();
        let headers = HashMap::new();

        let ok = post_once(&client, &target, Duration::from_secs(1), "q", b"hello", "application/json", None, &headers, false).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn post_once_forwards_correlation_and_pass_through_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Bunny-CorrelationID", "abc-123"))
            .and(header("X-Bunny-Trace", "t1"))
            .and(header("X-Bunny-Redelivered", "true"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let target: reqwest::Url = format!("{}/hook", server.uri()).parse().unwrap();
        let client = Client::new();
        let mut headers = HashMap::new();
        headers.insert("X-Bunny-Trace".to_string(), "t1".to_string());

        let ok = post_once(&client, &target, Duration::from_secs(1), "q", b"hello", "application/json", Some("abc-123"), &headers, true).await;
        assert!(ok);
    }
}
