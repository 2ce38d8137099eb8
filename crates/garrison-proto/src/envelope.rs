use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const INBOX_PREFIX: &str = "inbox.";
pub const ERROR_SUBJECT: &str = "error";

const MAX_SUBJECT_LEN: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        reason: String,
        // Where an error reply should go, if the sender supplied a usable inbox.
        reply_to: Option<Subject>,
    },
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProtoError {
    fn malformed(reason: impl Into<String>, reply_to: Option<Subject>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
            reply_to,
        }
    }
}

pub fn is_valid_subject(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_SUBJECT_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// A routing key restricted to `[A-Za-z0-9._-]+`.
///
/// The only way to build one is through validation, so every outbound envelope
/// carries a well-formed subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    pub fn new(raw: impl Into<String>) -> Result<Self, ProtoError> {
        let raw = raw.into();
        if !is_valid_subject(&raw) {
            return Err(ProtoError::InvalidSubject(raw));
        }
        Ok(Self(raw))
    }

    /// Fresh one-shot reply subject.
    pub fn inbox() -> Self {
        Self(format!("{INBOX_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn error() -> Self {
        Self(ERROR_SUBJECT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_inbox(&self) -> bool {
        self.0.starts_with(INBOX_PREFIX)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub subject: Subject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<Subject>,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

// Inbound shape before validation; subjects are still untrusted strings here.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    subject: String,
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Envelope {
    pub fn new(subject: Subject, data: Value) -> Self {
        Self {
            subject,
            reply: None,
            data,
            timestamp: Some(now_unix_ms()),
        }
    }

    pub fn with_reply(mut self, reply: Subject) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn error(to: Subject, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            to,
            serde_json::json!({
                "error": { "code": code, "message": message.into() }
            }),
        )
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtoError> {
        let env: RawEnvelope = serde_json::from_str(raw)
            .map_err(|e| ProtoError::malformed(format!("invalid json: {e}"), None))?;

        // Validate the reply first so a bad subject can still be answered.
        let reply = match env.reply {
            None => None,
            Some(r) if r.is_empty() => None,
            Some(r) => Some(
                Subject::new(r)
                    .map_err(|e| ProtoError::malformed(format!("reply: {e}"), None))?,
            ),
        };

        let subject = Subject::new(env.subject)
            .map_err(|e| ProtoError::malformed(format!("subject: {e}"), reply.clone()))?;

        Ok(Self {
            subject,
            reply,
            data: env.data,
            timestamp: env.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_charset_is_enforced() {
        for ok in ["containers.list", "logs.line", "a-b_c.9", "inbox.abc123"] {
            assert!(Subject::new(ok).is_ok(), "{ok}");
        }
        for bad in ["", "has space", "slash/path", "star.*", "gt>", "ünï", "tab\t"] {
            assert!(
                matches!(Subject::new(bad), Err(ProtoError::InvalidSubject(_))),
                "{bad}"
            );
        }
        assert!(Subject::new("x".repeat(MAX_SUBJECT_LEN + 1)).is_err());
    }

    #[test]
    fn inbox_subjects_are_unique_and_valid() {
        let a = Subject::inbox();
        let b = Subject::inbox();
        assert_ne!(a, b);
        assert!(a.is_inbox());
        assert!(is_valid_subject(a.as_str()));
    }

    #[test]
    fn parse_rejects_bad_subject_but_keeps_reply() {
        let raw = r#"{"subject":"logs line","reply":"inbox.r1","data":{}}"#;
        match Envelope::parse(raw) {
            Err(ProtoError::MalformedEnvelope { reply_to, .. }) => {
                assert_eq!(reply_to.as_ref().map(Subject::as_str), Some("inbox.r1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_non_json_and_missing_subject() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(ProtoError::MalformedEnvelope { reply_to: None, .. })
        ));
        assert!(matches!(
            Envelope::parse(r#"{"data":1}"#),
            Err(ProtoError::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn parse_defaults_missing_data_to_null() {
        let env = Envelope::parse(r#"{"subject":"agent.heartbeat"}"#).unwrap();
        assert_eq!(env.data, Value::Null);
        assert!(env.reply.is_none());
        assert!(env.timestamp.is_none());
    }

    #[test]
    fn outbound_envelope_omits_empty_reply() {
        let env = Envelope::new(Subject::new("containers.list").unwrap(), serde_json::json!({}));
        let text = env.to_text().unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["subject"], "containers.list");
        assert!(v.get("reply").is_none());
        assert!(v["timestamp"].is_i64());
    }
}
