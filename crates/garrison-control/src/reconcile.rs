// Repair divergence between the ledger and what the agent actually runs.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use garrison_proto::messages::{ContainerInfo, InspectServers, ListContainers};
use serde::Serialize;
use uuid::Uuid;

use crate::client::AgentClient;
use crate::error::{ControlError, ControlResult};
use crate::hub::HubRegistry;
use crate::ledger::{AgentLocks, Intent, ServerRecord, ServerStatus, SharedLedger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    pub server_id: Uuid,
    pub name: String,
    pub from: ServerStatus,
    pub to: ServerStatus,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub agent: String,
    pub checked: usize,
    /// Rows with a transition still inside its grace period.
    pub in_flight: usize,
    pub changes: Vec<SyncChange>,
}

/// What the agent reported, indexed for matching ledger rows.
struct Observed {
    by_id: HashMap<String, ContainerInfo>,
    by_name: HashMap<String, ContainerInfo>,
    data_exists: HashMap<String, bool>,
}

impl Observed {
    fn container_for(&self, server: &ServerRecord) -> Option<&ContainerInfo> {
        server
            .container_id
            .as_deref()
            .and_then(|id| self.by_id.get(id))
            .or_else(|| self.by_name.get(&server.name))
    }
}

/// Status a present container implies. An agent that reports no state is
/// taken to mean the container is up.
fn observed_status(container: &ContainerInfo) -> ServerStatus {
    match container.state.as_str() {
        "" | "running" => ServerStatus::Running,
        _ => ServerStatus::Stopped,
    }
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: SharedLedger,
    locks: AgentLocks,
    grace: Duration,
    provision_grace: Duration,
}

impl Reconciler {
    /// `provision_grace` applies to create and rebuild intents, whose agent
    /// calls may legitimately run that long.
    pub fn new(
        ledger: SharedLedger,
        locks: AgentLocks,
        grace: Duration,
        provision_grace: Duration,
    ) -> Self {
        Self {
            ledger,
            locks,
            grace,
            provision_grace,
        }
    }

    fn abandoned(&self, server: &ServerRecord, now: DateTime<Utc>) -> bool {
        let Some(started) = server.intent_at else {
            return true;
        };
        let grace = match server.intent {
            Some(Intent::Create | Intent::Rebuild) => self.grace.max(self.provision_grace),
            _ => self.grace,
        };
        let age = now.signed_duration_since(started).to_std().unwrap_or_default();
        age >= grace
    }

    async fn observe(
        &self,
        client: &AgentClient,
        servers: &[ServerRecord],
    ) -> ControlResult<Observed> {
        let list = client.call(&ListContainers {}).await?;
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for c in list.containers {
            if !c.name.is_empty() {
                by_name.insert(c.name.clone(), c.clone());
            }
            by_id.insert(c.id.clone(), c);
        }

        let mut observed = Observed {
            by_id,
            by_name,
            data_exists: HashMap::new(),
        };

        let names: Vec<String> = servers
            .iter()
            .filter(|s| observed.container_for(s).is_none())
            .map(|s| s.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !names.is_empty() {
            let reply = client.call(&InspectServers { names }).await?;
            observed.data_exists = reply
                .servers
                .into_iter()
                .map(|s| (s.name, s.data_exists))
                .collect();
        }
        Ok(observed)
    }

    /// Compare the agent's containers against the ledger and heal what
    /// drifted.
    pub async fn sync(&self, client: &AgentClient) -> ControlResult<SyncReport> {
        let agent_name = client.agent();
        let agent = self
            .ledger
            .find_agent(agent_name)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("agent {agent_name}")))?;

        let snapshot = self.ledger.list_servers(agent.id).await?;
        let observed = self.observe(client, &snapshot).await?;
        let before: HashMap<Uuid, ServerRecord> =
            snapshot.into_iter().map(|s| (s.id, s)).collect();

        let _guard = self.locks.lock(agent.id).await;
        // re-read: rows may have moved while the agent was being asked
        let servers = self.ledger.list_servers(agent.id).await?;
        let now = Utc::now();
        let mut report = SyncReport {
            agent: agent.name.clone(),
            checked: servers.len(),
            ..Default::default()
        };

        for mut server in servers {
            // the observation predates whatever touched this row since
            if before.get(&server.id) != Some(&server) {
                report.in_flight += 1;
                continue;
            }

            let from = server.status;
            let container = observed
                .container_for(&server)
                .map(|c| (c.id.clone(), observed_status(c)));

            if server.intent.is_some() {
                if !self.abandoned(&server, now) {
                    report.in_flight += 1;
                    continue;
                }
                tracing::warn!(
                    server_id = %server.id,
                    intent = ?server.intent,
                    "resolving abandoned transition"
                );
                match container {
                    Some((id, status)) => {
                        server.container_id = Some(id);
                        server.settle(status);
                    }
                    None if server.intent == Some(Intent::Delete) => server.mark_deleted(),
                    None => self.mark_missing(&mut server, &observed),
                }
            } else {
                match (from, container) {
                    (ServerStatus::Running, None) => self.mark_missing(&mut server, &observed),
                    (ServerStatus::Missing, Some((id, status))) => {
                        server.container_id = Some(id);
                        server.settle(status);
                    }
                    _ => continue,
                }
            }

            let server = self.ledger.update_server(&server).await?;
            tracing::info!(
                server_id = %server.id,
                from = %from,
                to = %server.status,
                "reconciled server"
            );
            report.changes.push(SyncChange {
                server_id: server.id,
                name: server.name.clone(),
                from,
                to: server.status,
                container_id: server.container_id.clone(),
            });
        }

        Ok(report)
    }

    fn mark_missing(&self, server: &mut ServerRecord, observed: &Observed) {
        server.container_id = None;
        if let Some(exists) = observed.data_exists.get(&server.name) {
            server.data_exists = *exists;
        }
        server.settle(ServerStatus::Missing);
    }
}

/// Periodically syncs every connected agent.
#[derive(Clone)]
pub struct ReconcilePoller {
    reconciler: Reconciler,
    hubs: HubRegistry,
    interval: Duration,
    request_timeout: Duration,
}

impl ReconcilePoller {
    pub fn new(
        reconciler: Reconciler,
        hubs: HubRegistry,
        interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            reconciler,
            hubs,
            interval,
            request_timeout,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        for link in self.hubs.connected().await {
            let client = AgentClient::new(link.hub, self.request_timeout);
            match self.reconciler.sync(&client).await {
                Ok(report) if !report.changes.is_empty() => {
                    tracing::info!(
                        agent = %report.agent,
                        changes = report.changes.len(),
                        "periodic sync repaired drift"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(agent = client.agent(), %err, "periodic sync failed"),
            }
        }
    }
}
