use std::fmt::Write as _;
use std::sync::Arc;

use crate::consumer::Consumer;
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;

/// Render the proxy's runtime counters as Prometheus text exposition
/// format. Stays reachable during `pendingShutdown` so an external
/// orchestrator can still scrape in-flight counts while draining.
pub fn render(publishers: &[Publisher], consumers: &[Consumer], subscribers: &[Arc<Subscriber>]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP bunny_messages_in_flight Publishes accepted but not yet resolved, by queue.");
    let _ = writeln!(out, "# TYPE bunny_messages_in_flight gauge");
    for publisher in publishers {
        let _ = writeln!(out, "bunny_messages_in_flight{{queue=\"{}\"}} {}", publisher.queue_name, publisher.messages_in_flight());
    }

    let _ = writeln!(out, "# HELP bunny_publish_total Publish attempts accepted by the broker, by queue.");
    let _ = writeln!(out, "# TYPE bunny_publish_total counter");
    for publisher in publishers {
        let _ = writeln!(out, "bunny_publish_total{{queue=\"{}\"}} {}", publisher.queue_name, publisher.publish_total());
    }

    let _ = writeln!(out, "# HELP bunny_publish_confirmed_total Publishes that received a broker ack, by queue.");
    let _ = writeln!(out, "# TYPE bunny_publish_confirmed_total counter");
    for publisher in publishers {
        let _ = writeln!(out, "bunny_publish_confirmed_total{{queue=\"{}\"}} {}", publisher.queue_name, publisher.publish_confirmed_total());
    }

    let _ = writeln!(out, "# HELP bunny_consumer_configured Consumer routes configured, by queue.");
    let _ = writeln!(out, "# TYPE bunny_consumer_configured gauge");
    for consumer in consumers {
        let _ = writeln!(out, "bunny_consumer_configured{{queue=\"{}\"}} 1", consumer.queue_name);
    }

    let _ = writeln!(out, "# HELP bunny_subscriber_inflight_pushes Subscriber HTTP pushes currently in flight, by queue.");
    let _ = writeln!(out, "# TYPE bunny_subscriber_inflight_pushes gauge");
    for subscriber in subscribers {
        let _ = writeln!(out, "bunny_subscriber_inflight_pushes{{queue=\"{}\"}} {}", subscriber.queue_name, subscriber.in_flight_push_requests());
    }

    out
}
