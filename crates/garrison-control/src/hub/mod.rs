// Per-agent connection hub.
//
// Each agent identity gets one [`HubHandle`]. Behind it a single task owns the
// session: the live socket, the table of callers waiting for correlated
// replies, and the broadcast subscribers. Everything reaches that task through
// its mailbox, so commands toward one agent are processed in order without
// any shared locking.

use std::{collections::HashMap, sync::Arc, time::Duration};

use garrison_proto::{AgentEvent, Envelope, Subject};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::error::{ControlError, ControlResult};
use crate::ledger::SharedLedger;
use crate::logs::LogFanout;

mod session;

const MAILBOX_CAPACITY: usize = 256;
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Frames the hub asks the socket writer to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HubStatus {
    pub connected: bool,
    pub generation: u64,
    pub pending: usize,
    pub subscribers: usize,
}

type ReplyTx = oneshot::Sender<ControlResult<Option<Value>>>;

enum HubMsg {
    Attach {
        outbound: mpsc::Sender<Outbound>,
        done: oneshot::Sender<u64>,
    },
    Inbound {
        generation: u64,
        raw: String,
    },
    Closed {
        generation: u64,
        error: Option<String>,
    },
    Send {
        envelope: Envelope,
        expect: Option<(Subject, Duration)>,
        done: ReplyTx,
    },
    Expire {
        inbox: Subject,
        after: Duration,
    },
    Subscribe {
        subjects: Vec<String>,
        tx: mpsc::Sender<AgentEvent>,
    },
    Status {
        done: oneshot::Sender<HubStatus>,
    },
}

#[derive(Clone)]
pub struct HubHandle {
    agent: Arc<str>,
    tx: mpsc::Sender<HubMsg>,
}

impl HubHandle {
    pub fn spawn(agent: &str, ledger: SharedLedger) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let agent: Arc<str> = Arc::from(agent);
        let session = session::Session::new(agent.clone(), ledger, tx.downgrade());
        tokio::spawn(session.run(rx));
        Self { agent, tx }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Install a new socket writer, replacing any previous connection.
    /// Returns the connection generation the reader must tag traffic with.
    pub async fn attach(&self, outbound: mpsc::Sender<Outbound>) -> ControlResult<u64> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(HubMsg::Attach { outbound, done })
            .await
            .map_err(|_| ControlError::AgentUnavailable)?;
        rx.await.map_err(|_| ControlError::AgentUnavailable)
    }

    pub async fn inbound(&self, generation: u64, raw: String) {
        let _ = self.tx.send(HubMsg::Inbound { generation, raw }).await;
    }

    pub async fn closed(&self, generation: u64, error: Option<String>) {
        let _ = self.tx.send(HubMsg::Closed { generation, error }).await;
    }

    /// Transmit one envelope. With `expect_reply` the caller waits for the
    /// correlated reply or `timeout`, whichever comes first.
    pub async fn send(
        &self,
        subject: Subject,
        data: Value,
        expect_reply: bool,
        timeout: Duration,
    ) -> ControlResult<Option<Value>> {
        let mut envelope = Envelope::new(subject, data);
        let expect = if expect_reply {
            let inbox = Subject::inbox();
            envelope = envelope.with_reply(inbox.clone());
            Some((inbox, timeout))
        } else {
            None
        };

        let (done, rx) = oneshot::channel();
        self.tx
            .send(HubMsg::Send {
                envelope,
                expect,
                done,
            })
            .await
            .map_err(|_| ControlError::AgentUnavailable)?;
        rx.await.map_err(|_| ControlError::AgentUnavailable)?
    }

    pub async fn request(
        &self,
        subject: Subject,
        data: Value,
        timeout: Duration,
    ) -> ControlResult<Value> {
        let reply = self.send(subject, data, true, timeout).await?;
        Ok(reply.unwrap_or(Value::Null))
    }

    pub async fn publish(&self, subject: Subject, data: Value) -> ControlResult<()> {
        self.send(subject, data, false, Duration::ZERO).await.map(|_| ())
    }

    /// Receive broadcast events for `subject` from this agent only.
    pub async fn subscribe(&self, subject: &str) -> mpsc::Receiver<AgentEvent> {
        self.subscribe_all(&[subject]).await
    }

    /// One receiver for several subjects, preserving their relative order.
    pub async fn subscribe_all(&self, subjects: &[&str]) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let _ = self
            .tx
            .send(HubMsg::Subscribe {
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                tx,
            })
            .await;
        rx
    }

    pub async fn status(&self) -> HubStatus {
        let (done, rx) = oneshot::channel();
        if self.tx.send(HubMsg::Status { done }).await.is_err() {
            return HubStatus::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// The hub of one agent plus the log fanout it feeds.
#[derive(Clone)]
pub struct AgentLink {
    pub hub: HubHandle,
    pub logs: LogFanout,
}

/// Every agent hub known to this process, keyed by agent name.
#[derive(Clone)]
pub struct HubRegistry {
    inner: Arc<RwLock<HashMap<String, AgentLink>>>,
    ledger: SharedLedger,
    log_capacity: usize,
}

impl HubRegistry {
    pub fn new(ledger: SharedLedger, log_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ledger,
            log_capacity,
        }
    }

    pub async fn get(&self, agent: &str) -> Option<AgentLink> {
        self.inner.read().await.get(agent).cloned()
    }

    pub async fn get_or_spawn(&self, agent: &str) -> AgentLink {
        if let Some(link) = self.get(agent).await {
            return link;
        }
        let mut map = self.inner.write().await;
        if let Some(link) = map.get(agent) {
            return link.clone();
        }
        let hub = HubHandle::spawn(agent, self.ledger.clone());
        let logs = LogFanout::new(self.log_capacity);
        logs.feed_from(&hub).await;
        let link = AgentLink { hub, logs };
        map.insert(agent.to_string(), link.clone());
        tracing::debug!(agent, "hub spawned");
        link
    }

    pub async fn agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn connected(&self) -> Vec<AgentLink> {
        let links: Vec<AgentLink> = self.inner.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for link in links {
            if link.hub.status().await.connected {
                out.push(link);
            }
        }
        out
    }
}
