use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use bunny_rest_proxy::amqp::AmqpPane;
use bunny_rest_proxy::config::ProxyConfig;
use bunny_rest_proxy::consumer::Consumer;
use bunny_rest_proxy::lifecycle::{LifecycleCoordinator, ShutdownFlags};
use bunny_rest_proxy::publisher::Publisher;
use bunny_rest_proxy::router::{build_router, AppState};
use bunny_rest_proxy::subscriber::Subscriber;

/// HTTP-to-AMQP bridge: publish, consume, and push-subscribe over a REST surface.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML topology file, overriding BUNNY_CONFIG.
    #[clap(short, long, env = "BUNNY_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Some(config_path) = &args.config {
        // SAFETY: single-threaded at this point, before the tokio runtime has
        // spawned any other task that could race on the environment.
        unsafe { std::env::set_var("BUNNY_CONFIG", config_path) };
    }

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
    let pretty = std::env::var("LOG_PRETTY").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    let filter = build_tracing_filter(&log_level);

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_line_number(true);
    if pretty {
        subscriber.pretty().init();
    } else {
        subscriber.json().init();
    }

    info!("starting bunny-rest-proxy");

    let config = match ProxyConfig::load() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "bunny-rest-proxy exited with an error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config: ProxyConfig) -> Result<()> {
    let pane = AmqpPane::connect(&config.amqp_connection).await.context("failed to connect to the AMQP broker")?;

    for publisher in &config.publishers {
        pane.assert_queue_passive(&publisher.queue_name).await.with_context(|| format!("publisher queue {} is not reachable", publisher.queue_name))?;
    }
    for consumer in &config.consumers {
        pane.assert_queue_passive(&consumer.queue_name).await.with_context(|| format!("consumer queue {} is not reachable", consumer.queue_name))?;
    }
    for subscriber in &config.subscribers {
        pane.assert_queue_passive(&subscriber.queue_name).await.with_context(|| format!("subscriber queue {} is not reachable", subscriber.queue_name))?;
    }

    let mut publishers = HashMap::new();
    for spec in &config.publishers {
        let channel = if spec.confirm { pane.confirm_channel() } else { pane.regular_channel() };
        publishers.insert(spec.queue_name.clone(), Publisher::new(spec.queue_name.clone(), spec.parser.clone(), spec.confirm, spec.identities.clone(), channel));
    }

    let mut consumers = HashMap::new();
    for spec in &config.consumers {
        consumers.insert(spec.queue_name.clone(), Consumer::new(spec.queue_name.clone(), spec.identities.clone(), pane.regular_channel()));
    }

    let mut subscribers = Vec::new();
    for spec in &config.subscribers {
        let channel = pane.open_subscriber_channel(spec.prefetch).await.with_context(|| format!("failed to open channel for subscriber {}", spec.queue_name))?;
        let subscriber = Subscriber::new(spec.clone(), channel)?;
        subscriber.start().await.with_context(|| format!("failed to start subscriber {}", spec.queue_name))?;
        subscribers.push(subscriber);
    }

    let flags = Arc::new(ShutdownFlags::default());
    let lifecycle = Arc::new(LifecycleCoordinator::new(flags.clone(), subscribers.clone()));
    let shutdown_signal = lifecycle.shutdown_signal();

    let state = Arc::new(AppState {
        identities: config.identities,
        publishers,
        consumers,
        subscribers,
        flags: flags.clone(),
        consume_success_status: axum::http::StatusCode::from_u16(config.consume_success_status).unwrap_or(axum::http::StatusCode::RESET_CONTENT),
    });

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!(%addr, "HTTP listener bound");

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal.notified().await;
    });

    let pane = Arc::new(pane);

    let close_watcher = {
        let pane = pane.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            if let Some(event) = pane.next_close_event().await {
                warn!(resource = event.resource, reason = %event.reason, "AMQP resource closed");
                lifecycle.error_shutdown(&pane, &event.reason).await;
            }
        })
    };

    let shutdown_handler = {
        let pane = pane.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            lifecycle.graceful_shutdown(&pane).await;
        })
    };

    server.await.context("HTTP server error")?;

    close_watcher.abort();
    shutdown_handler.abort();

    info!("bunny-rest-proxy shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

fn build_tracing_filter(log_level: &str) -> String {
    let rust_level = match log_level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARNING" | "WARN" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    };
    let lapin_level = if rust_level == "debug" { "info" } else { "warn" };
    format!("bunny_rest_proxy={rust_level},lapin={lapin_level}")
}
