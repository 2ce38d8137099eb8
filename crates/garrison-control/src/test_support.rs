// Scripted agent attached to a real hub, for tests.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::ControlConfig;
use crate::hub::{HubHandle, HubRegistry, Outbound};
use crate::ledger::{AgentLocks, Ledger, MemoryLedger};
use crate::lifecycle::Lifecycle;

type Responder = dyn Fn(&str, &Value) -> Option<Value> + Send + Sync;

/// Answers every request through `respond`. Returning `None` leaves the
/// request unanswered so the caller runs into its deadline.
pub struct FakeAgent {
    hub: HubHandle,
    generation: u64,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeAgent {
    pub async fn attach<F>(hub: &HubHandle, respond: F) -> Self
    where
        F: Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        let respond: Arc<Responder> = Arc::new(respond);
        let (tx, mut rx) = mpsc::channel(64);
        let generation = hub.attach(tx).await.expect("attach fake agent");
        let calls = Arc::new(Mutex::new(Vec::new()));

        let task_calls = calls.clone();
        let task_hub = hub.clone();
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let Outbound::Text(text) = out else { break };
                let env: Value = serde_json::from_str(&text).expect("hub sent json");
                let subject = env["subject"].as_str().unwrap_or_default().to_string();
                let data = env["data"].clone();
                task_calls
                    .lock()
                    .unwrap()
                    .push((subject.clone(), data.clone()));

                let Some(reply) = env["reply"].as_str() else { continue };
                if let Some(answer) = respond(&subject, &data) {
                    let frame = json!({ "subject": reply, "data": answer });
                    task_hub.inbound(generation, frame.to_string()).await;
                }
            }
        });

        Self {
            hub: hub.clone(),
            generation,
            calls,
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(s, _)| s.clone())
            .collect()
    }

    pub fn calls_to(&self, subject: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Push an agent-originated envelope into the hub.
    pub async fn emit(&self, subject: &str, data: Value) {
        let frame = json!({ "subject": subject, "data": data });
        self.hub.inbound(self.generation, frame.to_string()).await;
    }

    pub async fn disconnect(&self) {
        self.hub.closed(self.generation, None).await;
    }
}

/// Typical answers for a healthy agent with no containers and free ports.
pub fn healthy_agent(subject: &str, data: &Value) -> Option<Value> {
    Some(match subject {
        "containers.list" => json!({ "containers": [] }),
        "ports.check" => json!({ "available": data["ports"].clone(), "unavailable": [] }),
        "servers.create" => json!({ "containerId": format!("c-{}", data["name"].as_str().unwrap_or("x")) }),
        "servers.rebuild" => json!({ "containerId": format!("r-{}", data["name"].as_str().unwrap_or("x")) }),
        "servers.inspect" => json!({ "servers": [] }),
        _ => json!({}),
    })
}

pub fn remote_error(code: &str, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}

/// Yield until the hub has drained everything queued before this call.
pub async fn settle(hub: &HubHandle) {
    let _ = hub.status().await;
}

/// One connected agent (`node-a`) over an in-memory ledger.
pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub hubs: HubRegistry,
    pub locks: AgentLocks,
    pub config: Arc<ControlConfig>,
    pub lifecycle: Lifecycle,
    pub agent: FakeAgent,
}

impl Harness {
    pub async fn new<F>(respond: F) -> Self
    where
        F: Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        let ledger = Arc::new(MemoryLedger::new());
        let config = Arc::new(ControlConfig::default());
        let hubs = HubRegistry::new(ledger.clone(), config.log_buffer_lines);
        let locks = AgentLocks::new();
        let link = hubs.get_or_spawn("node-a").await;
        let agent = FakeAgent::attach(&link.hub, respond).await;
        let lifecycle = Lifecycle::new(ledger.clone(), hubs.clone(), locks.clone(), config.clone());
        Self {
            ledger,
            hubs,
            locks,
            config,
            lifecycle,
            agent,
        }
    }

    pub async fn agent_id(&self) -> uuid::Uuid {
        self.ledger
            .find_agent("node-a")
            .await
            .unwrap()
            .expect("agent registered on attach")
            .id
    }
}
