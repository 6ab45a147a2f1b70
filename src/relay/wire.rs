//! Relay wire protocol framing.
//!
//! Relays speak JSON arrays over WebSocket. Client → relay:
//! `["REQ", sub_id, filter]`, `["EVENT", envelope]`, `["CLOSE", sub_id]`.
//! Relay → client: `["EVENT", sub_id, envelope]`, `["OK", id, bool, msg]`,
//! `["EOSE", sub_id]`, `["CLOSED", sub_id, reason]`, `["NOTICE", msg]`,
//! `["AUTH", challenge]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Envelope;
use crate::error::{Error, Result};

/// A subscription filter.
///
/// Absent members do not constrain; `tag_p` matches events carrying any
/// of the listed recipients in a `p` tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event kinds to match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,

    /// Author public keys (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Only events with `created_at >= since`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Recipient filter on `p` tags
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub tag_p: Option<Vec<String>>,

    /// Cap on replayed stored events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    /// Filter for stream events addressed to `recipient` from now on.
    pub fn streams_to(recipient: &str, since: u64) -> Self {
        Self {
            kinds: Some(vec![crate::KIND_EPHEMERAL_STREAM]),
            since: Some(since),
            tag_p: Some(vec![recipient.to_string()]),
            ..Self::default()
        }
    }

    /// Filter for fresh presence announcements.
    pub fn recent_announcements(since: u64) -> Self {
        Self {
            kinds: Some(vec![crate::KIND_ANNOUNCE]),
            since: Some(since),
            ..Self::default()
        }
    }
}

/// Serializes a `["REQ", …]` client message.
pub fn req(sub_id: &str, filter: &Filter) -> Result<String> {
    serde_json::to_string(&("REQ", sub_id, filter)).map_err(|e| Error::malformed(e.to_string()))
}

/// Serializes an `["EVENT", …]` client message.
pub fn event(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(&("EVENT", envelope)).map_err(|e| Error::malformed(e.to_string()))
}

/// Serializes a `["CLOSE", …]` client message.
pub fn close(sub_id: &str) -> Result<String> {
    serde_json::to_string(&("CLOSE", sub_id)).map_err(|e| Error::malformed(e.to_string()))
}

/// One parsed relay → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// An event matching one of our subscriptions
    Event {
        /// Subscription the event answers
        sub_id: String,
        /// The event itself
        envelope: Envelope,
    },
    /// Result of a publish
    Ok {
        /// Id of the event the relay is answering about
        event_id: String,
        /// Whether the relay accepted it
        accepted: bool,
        /// Human-readable detail, often empty
        message: String,
    },
    /// End of stored events for a subscription
    Eose {
        /// Subscription that finished replaying
        sub_id: String,
    },
    /// The relay terminated a subscription
    Closed {
        /// Subscription that was closed
        sub_id: String,
        /// Reason string, e.g. `auth-required: …`
        reason: String,
    },
    /// Free-form relay notice
    Notice {
        /// Notice text
        message: String,
    },
    /// Authentication challenge (not supported, logged and skipped)
    Auth {
        /// Challenge string
        challenge: String,
    },
    /// Anything this client does not understand
    Unknown,
}

/// Parses one relay frame.
pub fn parse(text: &str) -> Result<RelayMessage> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| Error::malformed(format!("relay frame: {e}")))?;
    let items = value
        .as_array()
        .ok_or_else(|| Error::malformed("relay frame is not an array"))?;

    let label = items.first().and_then(Value::as_str).unwrap_or_default();
    match (label, items.len()) {
        ("EVENT", 3..) => Ok(RelayMessage::Event {
            sub_id: str_at(items, 1)?,
            envelope: serde_json::from_value(items[2].clone())
                .map_err(|e| Error::malformed(format!("event: {e}")))?,
        }),
        ("OK", 3..) => Ok(RelayMessage::Ok {
            event_id: str_at(items, 1)?,
            accepted: items[2].as_bool().unwrap_or(false),
            message: items
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        ("EOSE", 2..) => Ok(RelayMessage::Eose {
            sub_id: str_at(items, 1)?,
        }),
        ("CLOSED", 2..) => Ok(RelayMessage::Closed {
            sub_id: str_at(items, 1)?,
            reason: items
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        ("NOTICE", 2..) => Ok(RelayMessage::Notice {
            message: str_at(items, 1)?,
        }),
        ("AUTH", 2..) => Ok(RelayMessage::Auth {
            challenge: str_at(items, 1)?,
        }),
        _ => Ok(RelayMessage::Unknown),
    }
}

fn str_at(items: &[Value], idx: usize) -> Result<String> {
    items
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::malformed(format!("relay frame missing string at {idx}")))
}
