//! Alert record and single-line JSON wire codec.
//!
//! Every payload on the mesh is one UTF-8 JSON object with the fixed key
//! order `id`, `text`, `timestamp`, `ttl`. The encoder is hand-rolled so
//! the emitted bytes stay identical across versions; only `"` is escaped
//! in `text`. The decoder is field-order insensitive and tolerates the
//! standard JSON escapes on input.

use crate::types::INITIAL_TTL;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// A short emergency message flooded across the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Alert {
    /// Unique alert identifier; a lowercase hyphenated UUID on origination,
    /// opaque when decoded off the wire.
    pub id: String,
    /// Human-readable alert text.
    pub text: String,
    /// Origination time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Remaining hop budget.
    pub ttl: u32,
}

/// Errors returned when a wire payload cannot be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload was empty.
    #[error("payload is empty")]
    Empty,
    /// The payload was not a recognizable alert object, a required field
    /// was missing, or a numeric field failed to parse.
    #[error("malformed alert payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Alert {
    /// Creates a freshly originated alert with a new id, the current
    /// timestamp, and the initial hop budget.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            timestamp: Utc::now().timestamp_millis(),
            ttl: INITIAL_TTL,
        }
    }

    /// Copy of this alert with the hop budget reduced by one.
    #[must_use]
    pub fn forwarded(&self) -> Self {
        Self {
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }

    /// Serializes this alert into its single-line wire form.
    ///
    /// # Examples
    ///
    /// ```
    /// use flare_common::Alert;
    /// let alert = Alert {
    ///     id: "a".to_string(),
    ///     text: "move to higher ground".to_string(),
    ///     timestamp: 1_700_000_000_000,
    ///     ttl: 8,
    /// };
    /// let bytes = alert.encode();
    /// assert!(bytes.starts_with(b"{\"id\":\"a\""));
    /// ```
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{{\"id\":\"{}\",\"text\":\"{}\",\"timestamp\":{},\"ttl\":{}}}",
            self.id,
            escape_text(&self.text),
            self.timestamp,
            self.ttl
        )
        .into_bytes()
    }

    /// Parses an alert from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the payload is empty, required fields
    /// are missing, numeric fields fail to parse, or the envelope is not
    /// recognizable. Never panics on attacker-controlled input.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn escape_text(text: &str) -> String {
    text.replace('"', "\\\"")
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // Texts without control characters or backslashes: the deterministic
    // encoder escapes only `"`, so a literal backslash would be read back
    // as a JSON escape.
    fn arb_text() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[^\\x00-\\x1F\\\\]{0,200}").unwrap()
    }

    fn arb_id() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
            .unwrap()
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrip(
            id in arb_id(),
            text in arb_text(),
            timestamp in any::<i64>(),
            ttl in any::<u32>(),
        ) {
            let alert = Alert { id, text, timestamp, ttl };
            let decoded = Alert::decode(&alert.encode()).unwrap();
            prop_assert_eq!(decoded, alert);
        }

        #[test]
        fn encode_is_single_line_utf8(
            id in arb_id(),
            text in arb_text(),
            timestamp in any::<i64>(),
            ttl in any::<u32>(),
        ) {
            let bytes = Alert { id, text, timestamp, ttl }.encode();
            let wire = String::from_utf8(bytes).unwrap();
            prop_assert!(!wire.contains('\n'));
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = Alert::decode(&bytes);
        }
    }
}
