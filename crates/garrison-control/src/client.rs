use std::time::Duration;

use garrison_proto::{AgentCall, ProtoError, RemoteError, Subject};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ControlError, ControlResult};
use crate::hub::HubHandle;

/// Typed request/reply calls to one agent over its hub.
#[derive(Clone)]
pub struct AgentClient {
    hub: HubHandle,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(hub: HubHandle, timeout: Duration) -> Self {
        Self { hub, timeout }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            hub: self.hub.clone(),
            timeout,
        }
    }

    pub fn agent(&self) -> &str {
        self.hub.agent()
    }

    pub async fn call<C: AgentCall>(&self, req: &C) -> ControlResult<C::Reply> {
        let subject = Subject::new(C::SUBJECT)?;
        let data = serde_json::to_value(req).map_err(ProtoError::from)?;
        tracing::debug!(agent = self.agent(), subject = C::SUBJECT, "agent call");
        let reply = self.hub.request(subject, data, self.timeout).await?;
        decode_reply(C::SUBJECT, reply)
    }

    /// Fire a command without waiting for an answer.
    pub async fn notify<C: AgentCall>(&self, req: &C) -> ControlResult<()> {
        let subject = Subject::new(C::SUBJECT)?;
        let data = serde_json::to_value(req).map_err(ProtoError::from)?;
        self.hub.publish(subject, data).await
    }
}

fn decode_reply<T: DeserializeOwned>(subject: &str, data: Value) -> ControlResult<T> {
    if let Some(err) = RemoteError::from_reply(&data) {
        return Err(err.into());
    }
    // agents answer empty-bodied commands with no data at all
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| ControlError::MalformedEnvelope(format!("{subject} reply: {e}")))
}
