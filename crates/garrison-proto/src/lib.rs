// Wire protocol shared by the control plane and agents.
//
// Everything that crosses the agent WebSocket is an `Envelope` carrying JSON.
// The set of subjects is closed: outbound commands implement `AgentCall`, and
// inbound traffic is classified into `Inbound` before anything else looks at it.

pub mod envelope;
pub mod messages;

pub use envelope::{ERROR_SUBJECT, Envelope, INBOX_PREFIX, ProtoError, Subject, is_valid_subject};
pub use messages::{AgentCall, AgentEvent, Inbound, LogLine, LogStream, RemoteError};
