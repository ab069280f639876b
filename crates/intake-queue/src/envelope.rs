//! Transport units handed out by a queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One delivery of one message.
///
/// The receipt authorizes the holder to acknowledge, extend or release this
/// delivery. A redelivery of the same message carries a new envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque handle for this delivery
    pub receipt: String,
    /// Stable id of the underlying message
    pub message_id: String,
    /// Transport-encoded job descriptor
    pub payload: String,
    /// Approximate receive count, 1 on first delivery
    pub delivery_count: u32,
    /// When the invisibility lease runs out
    pub lease_expires_at: DateTime<Utc>,
}

impl Envelope {
    /// Whether this is a redelivery.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// A message moved to the dead-letter destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub payload: String,
    pub error: String,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_envelope(envelope: &Envelope, error: impl Into<String>) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            payload: envelope.payload.clone(),
            error: error.into(),
            delivery_count: envelope.delivery_count,
            dead_lettered_at: Utc::now(),
        }
    }
}
