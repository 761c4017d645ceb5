use std::sync::Arc;

use jsonschema::Validator;
use serde_json::Value;

use crate::error::ProxyError;
use crate::types::ContentTypeKind;

/// Duck-typed "two shapes sharing parseInbound" from the design notes,
/// expressed as a tagged variant with a single dispatch point.
#[derive(Clone)]
pub enum ParserKind {
    Binary,
    Json { schema: Option<Arc<Validator>> },
}

impl ParserKind {
    pub fn content_type_kind(&self) -> ContentTypeKind {
        match self {
            ParserKind::Binary => ContentTypeKind::Binary,
            ParserKind::Json { .. } => ContentTypeKind::Json,
        }
    }

    /// Compile a JSON Schema document into a validator at config-load time.
    ///
    /// A schema that fails to compile is a startup-fatal error, same
    /// severity class as a reference to an unknown queue.
    pub fn compile_json(schema: Option<Value>) -> anyhow::Result<ParserKind> {
        let validator = match schema {
            Some(doc) => {
                let v = jsonschema::validator_for(&doc)?;
                Some(Arc::new(v))
            }
            None => None,
        };
        Ok(ParserKind::Json { schema: validator })
    }

    /// Validate and shape an inbound HTTP request body into the bytes that
    /// will be published to the broker.
    pub fn parse_inbound(&self, request_content_type: Option<&str>, body: &[u8]) -> Result<Vec<u8>, ProxyError> {
        match self {
            ParserKind::Binary => {
                if request_content_type != Some("application/octet-stream") {
                    return Err(ProxyError::UnsupportedContentType);
                }
                Ok(body.to_vec())
            }
            ParserKind::Json { schema } => {
                if request_content_type != Some("application/json") {
                    return Err(ProxyError::UnsupportedContentType);
                }

                let text = std::str::from_utf8(body).map_err(|e| ProxyError::InvalidPayload(e.to_string()))?;
                let value: Value = serde_json::from_str(text).map_err(|e| ProxyError::InvalidPayload(e.to_string()))?;

                if let Some(validator) = schema
                    && let Err(err) = validator.validate(&value)
                {
                    return Err(ProxyError::InvalidPayload(err.to_string()));
                }

                serde_json::to_vec(&value).map_err(|e| ProxyError::InvalidPayload(e.to_string()))
            }
        }
    }

    /// Invert `parse_inbound` for a delivery headed to a subscriber target:
    /// returns the outbound content-type and bytes to POST.
    pub fn render_outbound(&self, stored_bytes: &[u8]) -> (&'static str, Vec<u8>) {
        match self {
            ParserKind::Binary => (ContentTypeKind::Binary.mime(), stored_bytes.to_vec()),
            ParserKind::Json { .. } => (ContentTypeKind::Json.mime(), stored_bytes.to_vec()),
        }
    }
}
