use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The two payload shapes the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentTypeKind {
    Binary,
    Json,
}

impl ContentTypeKind {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentTypeKind::Binary => "application/octet-stream",
            ContentTypeKind::Json => "application/json",
        }
    }
}

impl fmt::Display for ContentTypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime())
    }
}

/// A message as it exists between broker delivery and ack/nack.
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub content_type: ContentTypeKind,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    pub message_count: Option<u32>,
}

/// Result of a successful publish, returned to the HTTP caller.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    #[serde(rename = "contentLengthBytes")]
    pub content_length_bytes: usize,
    pub confirmed: bool,
}

/// Prefix that marks a header as pass-through between HTTP and AMQP.
pub const BUNNY_HEADER_PREFIX: &str = "x-bunny-";
pub const IDENTITY_HEADER: &str = "x-bunny-identity";
pub const TOKEN_HEADER: &str = "x-bunny-token";
pub const CORRELATION_HEADER: &str = "x-bunny-correlationid";
pub const MESSAGE_COUNT_HEADER: &str = "X-Bunny-Message-Count";
pub const REDELIVERED_HEADER: &str = "X-Bunny-Redelivered";

/// True if `name` is a pass-through candidate, i.e. begins with the
/// `X-Bunny-` prefix but is not the identity/token credential pair.
///
/// Per spec.md Open Question resolution, identity/token headers are always
/// stripped before forwarding to the broker or a subscriber target.
pub fn is_pass_through_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with(BUNNY_HEADER_PREFIX) && lower != IDENTITY_HEADER && lower != TOKEN_HEADER && lower != CORRELATION_HEADER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_mime() {
        assert_eq!(ContentTypeKind::Binary.mime(), "application/octet-stream");
        assert_eq!(ContentTypeKind::Json.mime(), "application/json");
    }

    #[test]
    fn pass_through_header_excludes_credentials() {
        assert!(!is_pass_through_header("X-Bunny-Identity"));
        assert!(!is_pass_through_header("x-bunny-token"));
        assert!(!is_pass_through_header("X-Bunny-CorrelationID"));
        assert!(is_pass_through_header("X-Bunny-Trace"));
        assert!(!is_pass_through_header("Content-Type"));
    }
}
