//! # Message Envelope
//!
//! The immutable wire-level record exchanged over the transport. Correlation
//! ties a reply back to its process; the idempotency key and inbox dedup
//! carry the exactly-once-effect guarantee on top of at-least-once delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Well-known header names carried on command and reply envelopes
pub mod headers {
    pub const MESSAGE_ID: &str = "messageId";
    pub const COMMAND_ID: &str = "commandId";
    pub const COMMAND_NAME: &str = "commandName";
    pub const BUSINESS_KEY: &str = "businessKey";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const CAUSATION_ID: &str = "causationId";
    pub const IDEMPOTENCY_KEY: &str = "idempotencyKey";
    pub const REPLY_TO: &str = "replyTo";
    pub const PARALLEL_BRANCH: &str = "parallelBranch";
    pub const PARENT_STEP: &str = "parentStep";
    pub const COMPENSATING: &str = "compensating";
}

/// Envelope category on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageCategory {
    Command,
    Reply,
    Event,
}

impl MessageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCategory::Command => "command",
            MessageCategory::Reply => "reply",
            MessageCategory::Event => "event",
        }
    }
}

impl std::fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" => Ok(MessageCategory::Command),
            "reply" => Ok(MessageCategory::Reply),
            "event" => Ok(MessageCategory::Event),
            other => Err(format!("unknown message category: {other}")),
        }
    }
}

impl TryFrom<String> for MessageCategory {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Immutable message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub category: MessageCategory,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub business_key: String,
    pub headers: HashMap<String, String>,
    /// Opaque JSON document
    pub payload: String,
}

impl Envelope {
    /// Build a command envelope
    pub fn command(
        message_type: impl Into<String>,
        command_id: Uuid,
        correlation_id: Uuid,
        business_key: impl Into<String>,
        headers: HashMap<String, String>,
        payload: String,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            category: MessageCategory::Command,
            message_type: message_type.into(),
            command_id: Some(command_id),
            correlation_id,
            causation_id: None,
            created_at: Utc::now(),
            business_key: business_key.into(),
            headers,
            payload,
        }
    }

    /// Build a reply envelope correlated to a command
    pub fn reply(
        message_type: impl Into<String>,
        command_id: Uuid,
        correlation_id: Uuid,
        business_key: impl Into<String>,
        payload: String,
    ) -> Self {
        let mut headers = HashMap::new();
        headers.insert(headers::COMMAND_ID.to_string(), command_id.to_string());
        headers.insert(
            headers::CORRELATION_ID.to_string(),
            correlation_id.to_string(),
        );
        Self {
            message_id: Uuid::now_v7(),
            category: MessageCategory::Reply,
            message_type: message_type.into(),
            command_id: Some(command_id),
            correlation_id,
            causation_id: None,
            created_at: Utc::now(),
            business_key: business_key.into(),
            headers,
            payload,
        }
    }

    /// Set the causation id, consuming self (envelopes stay immutable once shared)
    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Header lookup by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Reply queue for this envelope, with a fallback when `replyTo` is absent
    pub fn reply_to_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.header(headers::REPLY_TO).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_command() -> Envelope {
        let mut headers = HashMap::new();
        headers.insert(headers::IDEMPOTENCY_KEY.to_string(), "p1:Step".to_string());
        Envelope::command(
            "ReserveFunds",
            Uuid::now_v7(),
            Uuid::now_v7(),
            "ORDER-42",
            headers,
            r#"{"amount":100}"#.to_string(),
        )
    }

    #[test]
    fn test_command_envelope_fields() {
        let env = sample_command();
        assert_eq!(env.category, MessageCategory::Command);
        assert_eq!(env.message_type, "ReserveFunds");
        assert_eq!(env.business_key, "ORDER-42");
        assert!(env.command_id.is_some());
        assert!(env.causation_id.is_none());
    }

    #[test]
    fn test_unique_message_ids() {
        let a = sample_command();
        let b = sample_command();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_reply_envelope_carries_correlation_headers() {
        let command_id = Uuid::now_v7();
        let correlation_id = Uuid::now_v7();
        let env = Envelope::reply(
            "CommandCompleted",
            command_id,
            correlation_id,
            "ORDER-42",
            r#"{"status":"SUCCEEDED"}"#.to_string(),
        );
        assert_eq!(env.header(headers::COMMAND_ID), Some(command_id.to_string().as_str()));
        assert_eq!(
            env.header(headers::CORRELATION_ID),
            Some(correlation_id.to_string().as_str())
        );
    }

    #[test]
    fn test_reply_to_fallback() {
        let env = sample_command();
        assert_eq!(env.reply_to_or("APP.CMD.REPLY.Q"), "APP.CMD.REPLY.Q");

        let mut with_reply = sample_command();
        with_reply
            .headers
            .insert(headers::REPLY_TO.to_string(), "CUSTOM.REPLY.Q".to_string());
        assert_eq!(with_reply.reply_to_or("APP.CMD.REPLY.Q"), "CUSTOM.REPLY.Q");
    }

    #[test]
    fn test_with_causation() {
        let cause = Uuid::now_v7();
        let env = sample_command().with_causation(cause);
        assert_eq!(env.causation_id, Some(cause));
    }

    #[test]
    fn test_serde_roundtrip_renames_type() {
        let env = sample_command();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "ReserveFunds");
        assert_eq!(value["category"], "command");

        let parsed: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.message_id, env.message_id);
        assert_eq!(parsed.message_type, env.message_type);
        assert_eq!(parsed.payload, env.payload);
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!("command".parse::<MessageCategory>().unwrap(), MessageCategory::Command);
        assert_eq!("Reply".parse::<MessageCategory>().unwrap(), MessageCategory::Reply);
        assert_eq!("EVENT".parse::<MessageCategory>().unwrap(), MessageCategory::Event);
        assert!("query".parse::<MessageCategory>().is_err());
    }
}
