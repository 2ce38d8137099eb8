use std::{collections::HashMap, sync::Arc, time::Duration};

use garrison_proto::{AgentEvent, Envelope, Inbound, ProtoError, Subject};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::{HubMsg, HubStatus, Outbound, ReplyTx};
use crate::error::ControlError;
use crate::ledger::{AgentStatus, SharedLedger};

struct Socket {
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
}

pub(super) struct Session {
    agent: Arc<str>,
    ledger: SharedLedger,
    mailbox: mpsc::WeakSender<HubMsg>,
    socket: Option<Socket>,
    last_generation: u64,
    pending: HashMap<Subject, ReplyTx>,
    subscribers: HashMap<String, Vec<mpsc::Sender<AgentEvent>>>,
}

impl Session {
    pub(super) fn new(
        agent: Arc<str>,
        ledger: SharedLedger,
        mailbox: mpsc::WeakSender<HubMsg>,
    ) -> Self {
        Self {
            agent,
            ledger,
            mailbox,
            socket: None,
            last_generation: 0,
            pending: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<HubMsg>) {
        let span = tracing::info_span!("hub", agent = %self.agent);
        async move {
            while let Some(msg) = rx.recv().await {
                self.handle(msg).await;
            }
            self.release_pending();
        }
        .instrument(span)
        .await
    }

    async fn handle(&mut self, msg: HubMsg) {
        match msg {
            HubMsg::Attach { outbound, done } => {
                let generation = self.attach(outbound).await;
                let _ = done.send(generation);
            }
            HubMsg::Inbound { generation, raw } => {
                if self.is_current(generation) {
                    self.dispatch(&raw).await;
                } else {
                    tracing::debug!(generation, "dropping frame from replaced connection");
                }
            }
            HubMsg::Closed { generation, error } => {
                if self.is_current(generation) {
                    self.close(error).await;
                }
            }
            HubMsg::Send {
                envelope,
                expect,
                done,
            } => self.send(envelope, expect, done).await,
            HubMsg::Expire { inbox, after } => {
                if let Some(tx) = self.pending.remove(&inbox) {
                    tracing::warn!(%inbox, "agent reply timed out");
                    let _ = tx.send(Err(ControlError::Timeout(after)));
                }
            }
            HubMsg::Subscribe { subjects, tx } => {
                for subject in subjects {
                    self.subscribers.entry(subject).or_default().push(tx.clone());
                }
            }
            HubMsg::Status { done } => {
                let _ = done.send(HubStatus {
                    connected: self.socket.is_some(),
                    generation: self.socket.as_ref().map_or(0, |s| s.generation),
                    pending: self.pending.len(),
                    subscribers: self.subscribers.values().map(Vec::len).sum(),
                });
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    async fn attach(&mut self, outbound: mpsc::Sender<Outbound>) -> u64 {
        self.last_generation += 1;
        let generation = self.last_generation;

        if let Some(old) = self.socket.take() {
            tracing::info!(
                old = old.generation,
                new = generation,
                "replacing existing agent connection"
            );
            let _ = old.outbound.try_send(Outbound::Close);
            self.release_pending();
        }
        self.socket = Some(Socket {
            generation,
            outbound,
        });

        if let Err(err) = self.ledger.register_agent(&self.agent).await {
            tracing::warn!(%err, "failed to mark agent online");
        }
        tracing::info!(generation, "agent connected");
        generation
    }

    async fn close(&mut self, error: Option<String>) {
        self.socket = None;
        self.release_pending();
        match error {
            Some(err) => tracing::warn!(%err, "agent connection failed"),
            None => tracing::info!("agent disconnected"),
        }
        if let Err(err) = self
            .ledger
            .set_agent_status(&self.agent, AgentStatus::Offline)
            .await
        {
            tracing::warn!(%err, "failed to mark agent offline");
        }
    }

    // Every suspended caller learns the agent is gone instead of waiting out
    // its deadline.
    fn release_pending(&mut self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(ControlError::AgentUnavailable));
        }
    }

    async fn transmit(&mut self, envelope: &Envelope) -> Result<(), ControlError> {
        let Some(socket) = &self.socket else {
            return Err(ControlError::AgentUnavailable);
        };
        let text = envelope.to_text()?;
        socket
            .outbound
            .send(Outbound::Text(text))
            .await
            .map_err(|_| ControlError::AgentUnavailable)
    }

    async fn send(&mut self, envelope: Envelope, expect: Option<(Subject, Duration)>, done: ReplyTx) {
        if self.socket.is_none() {
            let _ = done.send(Err(ControlError::AgentUnavailable));
            return;
        }

        let Some((inbox, timeout)) = expect else {
            let res = self.transmit(&envelope).await.map(|_| None);
            let _ = done.send(res);
            return;
        };

        self.pending.insert(inbox.clone(), done);
        if let Err(err) = self.transmit(&envelope).await {
            if let Some(tx) = self.pending.remove(&inbox) {
                let _ = tx.send(Err(err));
            }
            return;
        }

        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx
                    .send(HubMsg::Expire {
                        inbox,
                        after: timeout,
                    })
                    .await;
            }
        });
    }

    async fn dispatch(&mut self, raw: &str) {
        let inbound = Envelope::parse(raw).and_then(Inbound::classify);
        let inbound = match inbound {
            Ok(v) => v,
            Err(ProtoError::MalformedEnvelope { reason, reply_to }) => {
                tracing::warn!(%reason, "malformed envelope from agent");
                let to = reply_to.unwrap_or_else(Subject::error);
                let reply = Envelope::error(to, "malformed_envelope", reason);
                // The session stays open regardless of whether this lands.
                let _ = self.transmit(&reply).await;
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to read envelope from agent");
                return;
            }
        };

        match inbound {
            Inbound::Reply { inbox, data } => match self.pending.remove(&inbox) {
                Some(tx) => {
                    let _ = tx.send(Ok(Some(data)));
                }
                None => tracing::debug!(%inbox, "reply for unknown or expired inbox"),
            },
            Inbound::Event(event) => {
                if let AgentEvent::Heartbeat(hb) = &event {
                    self.on_heartbeat(hb.metrics.clone()).await;
                }
                self.broadcast(event);
            }
            Inbound::Unrouted(env) => {
                tracing::trace!(subject = %env.subject, "no handler for subject");
            }
        }
    }

    async fn on_heartbeat(&self, metrics: Value) {
        if let Err(err) = self.ledger.record_heartbeat(&self.agent, metrics).await {
            tracing::warn!(%err, "failed to record agent heartbeat");
        }
    }

    fn broadcast(&mut self, event: AgentEvent) {
        let Some(subs) = self.subscribers.get_mut(event.subject()) else {
            return;
        };
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subject = event.subject(), "subscriber lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
