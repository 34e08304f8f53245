use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Format version stamped on every frame.
pub const ENVELOPE_VERSION: &str = "1.0";

/// JSON wrapper around every published payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub data: Value,
    /// Unix seconds, fractional.
    pub timestamp: f64,
    pub version: String,
    /// Unit that published the frame.
    pub source: String,
}

impl MessageEnvelope {
    pub fn new(data: Value, timestamp: f64, source: impl Into<String>) -> Self {
        Self {
            data,
            timestamp,
            version: ENVELOPE_VERSION.to_string(),
            source: source.into(),
        }
    }

    /// Serializes to the wire frame.
    pub fn frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a wire frame.
    pub fn parse(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}
