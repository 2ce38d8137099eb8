use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub caller: String,
    pub action: String,
    pub target: String,
    /// `ok`, or the error code the command failed with.
    pub outcome: String,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(caller: &str, action: &str, target: impl Into<String>, outcome: &str) -> Self {
        Self {
            caller: caller.to_string(),
            action: action.to_string(),
            target: target.into(),
            outcome: outcome.to_string(),
            at: Utc::now(),
        }
    }
}

/// Where audit events go. Persistence lives outside this service.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()>;
}

pub type SharedAudit = Arc<dyn AuditSink>;

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAudit;

#[async_trait::async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        tracing::info!(
            target: "audit",
            caller = %event.caller,
            action = %event.action,
            target_id = %event.target,
            outcome = %event.outcome,
            "audit"
        );
        Ok(())
    }
}

/// Fire and forget: a failing sink never fails the command.
pub fn emit(sink: &SharedAudit, event: AuditEvent) {
    let sink = sink.clone();
    tokio::spawn(async move {
        let action = event.action.clone();
        let target = event.target.clone();
        if let Err(err) = sink.record(event).await {
            tracing::warn!(%err, %action, %target, "failed to write audit event");
        }
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every event; optionally fails after storing.
    #[derive(Default)]
    pub(crate) struct MemoryAudit {
        pub events: Mutex<Vec<AuditEvent>>,
        pub fail: bool,
    }

    #[async_trait::async_trait]
    impl AuditSink for MemoryAudit {
        async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event);
            if self.fail {
                anyhow::bail!("audit store unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn emit_delivers_in_background() {
        let mem = Arc::new(MemoryAudit::default());
        let sink: SharedAudit = mem.clone();
        emit(&sink, AuditEvent::new("ops@example", "servers.stop", "srv-1", "ok"));

        for _ in 0..100 {
            if !mem.events.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let events = mem.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "servers.stop");
        assert_eq!(events[0].outcome, "ok");
    }

    #[tokio::test]
    async fn tracing_sink_accepts_events() {
        TracingAudit
            .record(AuditEvent::new("a", "b", "c", "ok"))
            .await
            .unwrap();
    }
}
