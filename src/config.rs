use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::identity::{Identity, IdentityMap};
use crate::parser::ParserKind;

/// How a subscriber backs off between retries of the same delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Fixed,
}

impl BackoffStrategy {
    /// Pure function of `(strategy, base, attempt)`, per the design note
    /// that the retry loop is a state machine and the backoff formula is
    /// a pure function behind it. `attempt` is 1-based.
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt),
            BackoffStrategy::Exponential => base.saturating_mul(1u32 << attempt.saturating_sub(1).min(31)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    name: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPublisher {
    queue_name: String,
    content_type: String,
    #[serde(default)]
    schema: Option<serde_json::Value>,
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    identities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConsumer {
    queue_name: String,
    #[serde(default)]
    identities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubscriber {
    queue_name: String,
    target: String,
    prefetch: u16,
    timeout: u64,
    backoff_strategy: BackoffStrategy,
    retries: u32,
    retry_delay: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawConfigFile {
    #[serde(default)]
    identities: Vec<RawIdentity>,
    #[serde(default)]
    publishers: Vec<RawPublisher>,
    #[serde(default)]
    consumers: Vec<RawConsumer>,
    #[serde(default)]
    subscribers: Vec<RawSubscriber>,
    consume_success_status: Option<u16>,
}

/// A publisher's fully validated, ready-to-run configuration.
#[derive(Clone)]
pub struct PublisherSpec {
    pub queue_name: String,
    pub parser: ParserKind,
    pub confirm: bool,
    pub identities: HashSet<String>,
}

/// A consumer's fully validated, ready-to-run configuration.
#[derive(Clone)]
pub struct ConsumerSpec {
    pub queue_name: String,
    pub identities: HashSet<String>,
}

/// A subscriber's fully validated, ready-to-run configuration.
#[derive(Clone)]
pub struct SubscriberSpec {
    pub queue_name: String,
    pub target: Url,
    pub prefetch: u16,
    pub timeout: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub retries: u32,
    pub retry_delay: Duration,
}

/// The proxy's full startup configuration: environment-derived connection
/// settings plus the validated YAML topology.
pub struct ProxyConfig {
    pub amqp_connection: String,
    pub http_port: u16,
    pub consume_success_status: u16,
    pub identities: IdentityMap,
    pub publishers: Vec<PublisherSpec>,
    pub consumers: Vec<ConsumerSpec>,
    pub subscribers: Vec<SubscriberSpec>,
}

impl ProxyConfig {
    /// Load configuration from the environment plus a YAML file.
    ///
    /// Mirrors the reference crate's `from_env` shape: required settings
    /// fail fast with context, optional settings fall back to documented
    /// defaults on a missing or unparsable value.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let amqp_connection = std::env::var("AMQP_CONNECTION").context("AMQP_CONNECTION environment variable is required")?;

        let config_path = std::env::var("BUNNY_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let http_port = std::env::var("HTTP_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);

        let raw = Self::read_yaml(Path::new(&config_path))?;

        Self::from_raw(amqp_connection, http_port, raw)
    }

    fn read_yaml(path: &Path) -> Result<RawConfigFile> {
        let builder = config::Config::builder().add_source(config::File::from(path));
        let loaded = builder.build().with_context(|| format!("failed to read configuration file {}", path.display()))?;
        loaded.try_deserialize().context("failed to parse configuration file")
    }

    fn from_raw(amqp_connection: String, http_port: u16, raw: RawConfigFile) -> Result<Self> {
        let identities = IdentityMap::new(raw.identities.into_iter().map(|i| Identity::new(i.name, i.token)).collect());

        let mut seen_publisher_queues = HashSet::new();
        let mut publishers = Vec::with_capacity(raw.publishers.len());
        for p in raw.publishers {
            if !seen_publisher_queues.insert(p.queue_name.clone()) {
                bail!("duplicate publisher queue name: {}", p.queue_name);
            }
            for name in &p.identities {
                if !identities.contains(name) {
                    bail!("publisher {} references unknown identity {}", p.queue_name, name);
                }
            }

            let parser = match p.content_type.to_uppercase().as_str() {
                "BINARY" => {
                    if p.schema.is_some() {
                        bail!("publisher {} is BINARY but declares a schema", p.queue_name);
                    }
                    ParserKind::Binary
                }
                "JSON" => ParserKind::compile_json(p.schema).with_context(|| format!("publisher {} has an invalid JSON schema", p.queue_name))?,
                other => bail!("publisher {} has unsupported contentType: {}", p.queue_name, other),
            };

            publishers.push(PublisherSpec {
                queue_name: p.queue_name,
                parser,
                confirm: p.confirm,
                identities: p.identities.into_iter().collect(),
            });
        }

        let mut seen_consumer_queues = HashSet::new();
        let mut consumers = Vec::with_capacity(raw.consumers.len());
        for c in raw.consumers {
            if !seen_consumer_queues.insert(c.queue_name.clone()) {
                bail!("duplicate consumer queue name: {}", c.queue_name);
            }
            for name in &c.identities {
                if !identities.contains(name) {
                    bail!("consumer {} references unknown identity {}", c.queue_name, name);
                }
            }
            consumers.push(ConsumerSpec { queue_name: c.queue_name, identities: c.identities.into_iter().collect() });
        }

        let mut seen_subscriber_queues = HashSet::new();
        let mut subscribers = Vec::with_capacity(raw.subscribers.len());
        for s in raw.subscribers {
            if !seen_subscriber_queues.insert(s.queue_name.clone()) {
                bail!("duplicate subscriber queue name: {}", s.queue_name);
            }
            if s.prefetch == 0 {
                bail!("subscriber {} must have prefetch >= 1", s.queue_name);
            }
            if s.timeout == 0 {
                bail!("subscriber {} must have timeout > 0", s.queue_name);
            }

            let target = Url::parse(&s.target).with_context(|| format!("subscriber {} has an invalid target URL", s.queue_name))?;

            subscribers.push(SubscriberSpec {
                queue_name: s.queue_name,
                target,
                prefetch: s.prefetch,
                timeout: Duration::from_millis(s.timeout),
                backoff_strategy: s.backoff_strategy,
                retries: s.retries,
                retry_delay: Duration::from_millis(s.retry_delay),
            });
        }

        let consume_success_status = raw.consume_success_status.unwrap_or(205);
        if consume_success_status != 200 && consume_success_status != 205 {
            bail!("consumeSuccessStatus must be 200 or 205, got {}", consume_success_status);
        }

        Ok(Self { amqp_connection, http_port, consume_success_status, identities, publishers, consumers, subscribers })
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("http_port", &self.http_port)
            .field("publishers", &self.publishers.len())
            .field("consumers", &self.consumers.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_raw(yaml: &str) -> RawConfigFile {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn backoff_fixed() {
        let s = BackoffStrategy::Fixed;
        assert_eq!(s.delay(Duration::from_millis(1000), 1), Duration::from_millis(1000));
        assert_eq!(s.delay(Duration::from_millis(1000), 5), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_linear() {
        let s = BackoffStrategy::Linear;
        assert_eq!(s.delay(Duration::from_millis(1000), 1), Duration::from_millis(1000));
        assert_eq!(s.delay(Duration::from_millis(1000), 3), Duration::from_millis(3000));
    }

    #[test]
    fn backoff_exponential() {
        let s = BackoffStrategy::Exponential;
        assert_eq!(s.delay(Duration::from_millis(1000), 1), Duration::from_millis(1000));
        assert_eq!(s.delay(Duration::from_millis(1000), 2), Duration::from_millis(2000));
        assert_eq!(s.delay(Duration::from_millis(1000), 3), Duration::from_millis(4000));
    }

    #[test]
    fn rejects_unknown_identity_reference() {
        let raw = parse_raw(
            r#"
identities: []
publishers:
  - queueName: jsonq
    contentType: JSON
    confirm: true
    identities: ["nobody"]
"#,
        );
        let err = ProxyConfig::from_raw("amqp://localhost".into(), 8080, raw).unwrap_err();
        assert!(err.to_string().contains("unknown identity"));
    }

    #[test]
    fn rejects_duplicate_queue_name_within_section() {
        let raw = parse_raw(
            r#"
identities: []
publishers:
  - queueName: jsonq
    contentType: JSON
    confirm: true
  - queueName: jsonq
    contentType: BINARY
    confirm: false
"#,
        );
        let err = ProxyConfig::from_raw("amqp://localhost".into(), 8080, raw).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn allows_same_queue_name_across_sections() {
        let raw = parse_raw(
            r#"
identities: []
publishers:
  - queueName: shared
    contentType: JSON
    confirm: true
consumers:
  - queueName: shared
"#,
        );
        let cfg = ProxyConfig::from_raw("amqp://localhost".into(), 8080, raw).unwrap();
        assert_eq!(cfg.publishers.len(), 1);
        assert_eq!(cfg.consumers.len(), 1);
    }

    #[test]
    fn rejects_binary_publisher_with_schema() {
        let raw = parse_raw(
            r#"
identities: []
publishers:
  - queueName: binq
    contentType: BINARY
    confirm: false
    schema:
      type: object
"#,
        );
        let err = ProxyConfig::from_raw("amqp://localhost".into(), 8080, raw).unwrap_err();
        assert!(err.to_string().contains("BINARY"));
    }

    #[test]
    fn rejects_subscriber_with_zero_prefetch() {
        let raw = parse_raw(
            r#"
identities: []
subscribers:
  - queueName: subq
    target: "http://example.com/hook"
    prefetch: 0
    timeout: 1000
    backoffStrategy: fixed
    retries: 0
    retryDelay: 0
"#,
        );
        let err = ProxyConfig::from_raw("amqp://localhost".into(), 8080, raw).unwrap_err();
        assert!(err.to_string().contains("prefetch"));
    }

    #[test]
    fn accepts_well_formed_subscriber() {
        let raw = parse_raw(
            r#"
identities: []
subscribers:
  - queueName: jsontest
    target: "http://example.com/hook"
    prefetch: 2
    timeout: 1000
    backoffStrategy: linear
    retries: 5
    retryDelay: 1000
"#,
        );
        let cfg = ProxyConfig::from_raw("amqp://localhost".into(), 8080, raw).unwrap();
        assert_eq!(cfg.subscribers.len(), 1);
        assert_eq!(cfg.subscribers[0].prefetch, 2);
        assert_eq!(cfg.subscribers[0].backoff_strategy, BackoffStrategy::Linear);
    }

    #[test]
    fn rejects_subscriber_with_invalid_target_url() {
        let raw = parse_raw(
            r#"
identities: []
subscribers:
  - queueName: subq
    target: "not a url"
    prefetch: 1
    timeout: 1000
    backoffStrategy: fixed
    retries: 0
    retryDelay: 0
"#,
        );
        let err = ProxyConfig::from_raw("amqp://localhost".into(), 8080, raw).unwrap_err();
        assert!(err.to_string().contains("target URL"));
    }

    #[test]
    fn rejects_invalid_consume_success_status() {
        let raw = parse_raw(
            r#"
identities: []
consumeSuccessStatus: 204
"#,
        );
        let err = ProxyConfig::from_raw("amqp://localhost".into(), 8080, raw).unwrap_err();
        assert!(err.to_string().contains("consumeSuccessStatus"));
    }

    // `ProxyConfig::load()` reads AMQP_CONNECTION/BUNNY_CONFIG/HTTP_PORT from
    // the process environment, the same drop-in-env-var shape as the
    // reference crate's `ExtractorConfig::from_env` tests; `#[serial]`
    // avoids races between tests mutating shared process env state.
    mod load_from_env {
        use std::env;

        use serial_test::serial;
        use tempfile::NamedTempFile;

        use super::*;

        fn write_config(contents: &str) -> NamedTempFile {
            use std::io::Write;
            let mut file = NamedTempFile::new().unwrap();
            file.write_all(contents.as_bytes()).unwrap();
            file
        }

        #[test]
        #[serial]
        fn load_fails_without_amqp_connection() {
            unsafe {
                env::remove_var("AMQP_CONNECTION");
            }
            let result = ProxyConfig::load();
            assert!(result.is_err());
        }

        #[test]
        #[serial]
        fn load_reads_yaml_file_named_by_bunny_config() {
            let file = write_config(
                r#"
identities:
  - name: Bob
    token: THISisBOBSsuperSECRETauthToken123
publishers:
  - queueName: jsonq
    contentType: JSON
    confirm: true
"#,
            );

            unsafe {
                env::set_var("AMQP_CONNECTION", "amqp://test:5672");
                env::set_var("BUNNY_CONFIG", file.path());
                env::remove_var("HTTP_PORT");
            }

            let config = ProxyConfig::load().unwrap();
            assert_eq!(config.amqp_connection, "amqp://test:5672");
            assert_eq!(config.http_port, 8080);
            assert_eq!(config.publishers.len(), 1);
            assert!(config.identities.contains("Bob"));

            unsafe {
                env::remove_var("AMQP_CONNECTION");
                env::remove_var("BUNNY_CONFIG");
            }
        }

        #[test]
        #[serial]
        fn load_honors_http_port_override() {
            let file = write_config("identities: []\n");

            unsafe {
                env::set_var("AMQP_CONNECTION", "amqp://test:5672");
                env::set_var("BUNNY_CONFIG", file.path());
                env::set_var("HTTP_PORT", "9999");
            }

            let config = ProxyConfig::load().unwrap();
            assert_eq!(config.http_port, 9999);

            unsafe {
                env::remove_var("AMQP_CONNECTION");
                env::remove_var("BUNNY_CONFIG");
                env::remove_var("HTTP_PORT");
            }
        }
    }

    // Backoff is specified as a pure function of (strategy, base, attempt);
    // these are the invariants that must hold for every input, not just the
    // worked examples above.
    mod backoff_properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn fixed_never_depends_on_attempt(base_ms in 1u64..10_000, attempt in 1u32..20) {
                let base = Duration::from_millis(base_ms);
                prop_assert_eq!(BackoffStrategy::Fixed.delay(base, attempt), base);
            }

            #[test]
            fn linear_is_base_times_attempt(base_ms in 1u64..10_000, attempt in 1u32..20) {
                let base = Duration::from_millis(base_ms);
                prop_assert_eq!(BackoffStrategy::Linear.delay(base, attempt), base.saturating_mul(attempt));
            }

            #[test]
            fn exponential_and_linear_agree_on_first_attempt(base_ms in 1u64..10_000) {
                let base = Duration::from_millis(base_ms);
                prop_assert_eq!(BackoffStrategy::Exponential.delay(base, 1), base);
                prop_assert_eq!(BackoffStrategy::Linear.delay(base, 1), base);
            }

            #[test]
            fn non_fixed_strategies_are_monotonically_nondecreasing(base_ms in 1u64..10_000, attempt in 1u32..15) {
                let base = Duration::from_millis(base_ms);
                let linear_now = BackoffStrategy::Linear.delay(base, attempt);
                let linear_next = BackoffStrategy::Linear.delay(base, attempt + 1);
                prop_assert!(linear_next >= linear_now);

                let exp_now = BackoffStrategy::Exponential.delay(base, attempt);
                let exp_next = BackoffStrategy::Exponential.delay(base, attempt + 1);
                prop_assert!(exp_next >= exp_now);
            }
        }
    }
}
