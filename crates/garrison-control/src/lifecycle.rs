// Server lifecycle: create, start, stop, delete, rebuild, purge.
//
// Every transition is two-phase. Under the agent lock the row is loaded,
// checked, and written with an intent (and usually an intermediate status).
// The agent call runs without the lock. The outcome is then committed under
// the lock again, clearing the intent. Rows left with an intent by a crash
// between the phases are picked up by the reconciler.

use std::{collections::BTreeMap, sync::Arc};

use garrison_proto::{
    is_valid_subject,
    messages::{CreateServer, DeleteServer, RebuildServer, StartContainer, StopContainer},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::client::AgentClient;
use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};
use crate::hub::HubRegistry;
use crate::ledger::{
    AgentLocks, AgentRecord, Intent, NewServer, PortTriple, ServerRecord, ServerStatus,
    SharedLedger,
};
use crate::ports::PortAllocator;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServerRequest {
    pub name: String,
    #[serde(alias = "image")]
    pub image_tag: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub game_port: Option<u16>,
    #[serde(default)]
    pub udp_port: Option<u16>,
    #[serde(default)]
    pub rcon_port: Option<u16>,
}

impl NewServerRequest {
    fn validate(&self) -> ControlResult<Option<PortTriple>> {
        // the name doubles as the container name on the host
        if !is_valid_subject(&self.name) {
            return Err(ControlError::BadRequest(format!(
                "invalid server name: {:?}",
                self.name
            )));
        }
        if self.image_tag.trim().is_empty() {
            return Err(ControlError::BadRequest("imageTag is required".into()));
        }
        match (self.game_port, self.udp_port, self.rcon_port) {
            (None, None, None) => Ok(None),
            (Some(g), Some(u), Some(r)) => Ok(Some(PortTriple::new(g, u, r))),
            _ => Err(ControlError::BadRequest(
                "gamePort, udpPort and rconPort must be given together".into(),
            )),
        }
    }
}

fn create_call(server: &ServerRecord) -> CreateServer {
    CreateServer {
        server_id: server.id.to_string(),
        name: server.name.clone(),
        image: server.image_tag.clone(),
        config: server.config.clone(),
        game_port: server.ports.game_port,
        udp_port: server.ports.udp_port,
        rcon_port: server.ports.rcon_port,
    }
}

fn idle(server: &ServerRecord, op: &'static str) -> ControlResult<()> {
    match server.intent {
        Some(_) => Err(ControlError::InvalidTransition {
            op,
            status: server.status,
        }),
        None => Ok(()),
    }
}

#[derive(Clone)]
pub struct Lifecycle {
    ledger: SharedLedger,
    hubs: HubRegistry,
    locks: AgentLocks,
    config: Arc<ControlConfig>,
}

impl Lifecycle {
    pub fn new(
        ledger: SharedLedger,
        hubs: HubRegistry,
        locks: AgentLocks,
        config: Arc<ControlConfig>,
    ) -> Self {
        Self {
            ledger,
            hubs,
            locks,
            config,
        }
    }

    pub async fn agent(&self, name: &str) -> ControlResult<AgentRecord> {
        self.ledger
            .find_agent(name)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("agent {name}")))
    }

    /// Client for an agent that is connected right now.
    pub async fn client(&self, agent: &str) -> ControlResult<AgentClient> {
        let link = self
            .hubs
            .get(agent)
            .await
            .ok_or(ControlError::AgentUnavailable)?;
        if !link.hub.status().await.connected {
            return Err(ControlError::AgentUnavailable);
        }
        Ok(AgentClient::new(link.hub, self.config.request_timeout))
    }

    async fn load(&self, agent: &AgentRecord, id: Uuid) -> ControlResult<ServerRecord> {
        match self.ledger.get_server(id).await? {
            Some(s) if s.agent_id == agent.id => Ok(s),
            _ => Err(ControlError::NotFound(format!("server {id}"))),
        }
    }

    pub async fn list(&self, agent: &str) -> ControlResult<Vec<ServerRecord>> {
        let agent = self.agent(agent).await?;
        self.ledger.list_servers(agent.id).await
    }

    pub async fn get(&self, agent: &str, id: Uuid) -> ControlResult<ServerRecord> {
        let agent = self.agent(agent).await?;
        self.load(&agent, id).await
    }

    /// Phase one: check the row, make sure the agent is reachable, record
    /// the intent.
    async fn begin<F>(
        &self,
        agent: &AgentRecord,
        id: Uuid,
        op: &'static str,
        plan: F,
    ) -> ControlResult<(ServerRecord, AgentClient)>
    where
        F: FnOnce(&ServerRecord) -> ControlResult<(Intent, ServerStatus)>,
    {
        let _guard = self.locks.lock(agent.id).await;
        let mut server = self.load(agent, id).await?;
        idle(&server, op)?;
        let (intent, status) = plan(&server)?;
        let client = self.client(&agent.name).await?;
        server.begin(intent, status);
        let server = self.ledger.update_server(&server).await?;
        tracing::debug!(server_id = %server.id, op, status = %server.status, "intent recorded");
        Ok((server, client))
    }

    /// Phase two: commit the outcome of the agent call.
    async fn finish<T>(
        &self,
        mut server: ServerRecord,
        outcome: ControlResult<T>,
        apply: impl FnOnce(&mut ServerRecord, T),
        rollback: impl FnOnce(&mut ServerRecord),
    ) -> ControlResult<ServerRecord> {
        let _guard = self.locks.lock(server.agent_id).await;
        match outcome {
            Ok(v) => {
                apply(&mut server, v);
                let server = self.ledger.update_server(&server).await?;
                tracing::info!(server_id = %server.id, status = %server.status, "transition committed");
                Ok(server)
            }
            Err(err) => {
                rollback(&mut server);
                tracing::warn!(server_id = %server.id, %err, status = %server.status, "transition failed");
                if let Err(db) = self.ledger.update_server(&server).await {
                    tracing::warn!(server_id = %server.id, err = %db, "failed to record rollback");
                }
                Err(err)
            }
        }
    }

    pub async fn create(&self, agent: &str, req: NewServerRequest) -> ControlResult<ServerRecord> {
        let explicit = req.validate()?;
        let agent = self.agent(agent).await?;
        let client = self.client(&agent.name).await?;

        let server = {
            let _guard = self.locks.lock(agent.id).await;
            let rows = self.ledger.list_unpurged_servers(agent.id).await?;
            if rows.iter().any(|s| !s.is_deleted() && s.name == req.name) {
                return Err(ControlError::NameTaken(req.name));
            }
            let seed: Vec<ServerRecord> = if self.config.release_ports_on_delete {
                rows.into_iter().filter(|s| !s.is_deleted()).collect()
            } else {
                rows
            };

            let mut ports = PortAllocator::new(self.config.ports.clone(), &seed);
            let triple = match explicit {
                Some(t) => {
                    ports.validate(t, &client).await?;
                    t
                }
                None => ports
                    .allocate(1, &client)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(ControlError::NoPortsAvailable)?,
            };

            self.ledger
                .insert_server(NewServer {
                    agent_id: agent.id,
                    name: req.name,
                    image_tag: req.image_tag,
                    config: req.config,
                    ports: triple,
                    status: ServerStatus::Creating,
                    intent: Some(Intent::Create),
                })
                .await?
        };
        tracing::info!(
            agent = %agent.name,
            server_id = %server.id,
            game_port = server.ports.game_port,
            "creating server"
        );

        let outcome = client
            .with_timeout(self.config.provision_timeout)
            .call(&create_call(&server))
            .await;
        self.finish(
            server,
            outcome,
            |s, p| {
                s.container_id = Some(p.container_id);
                s.data_exists = true;
                s.settle(ServerStatus::Running);
            },
            |s| s.settle(ServerStatus::Failed),
        )
        .await
    }

    pub async fn start(&self, agent: &str, id: Uuid) -> ControlResult<ServerRecord> {
        let agent = self.agent(agent).await?;
        let (server, client) = self
            .begin(&agent, id, "start", |s| match (s.status, &s.container_id) {
                (ServerStatus::Stopped, Some(_)) => Ok((Intent::Start, ServerStatus::Stopped)),
                (ServerStatus::Missing, _) if s.data_exists => {
                    Ok((Intent::Start, ServerStatus::Creating))
                }
                (ServerStatus::Missing, _) => Err(ControlError::OrphanedServer(s.id)),
                (status, _) => Err(ControlError::InvalidTransition { op: "start", status }),
            })
            .await?;

        match server.container_id.clone() {
            Some(container_id) => {
                let outcome = client.call(&StartContainer { container_id }).await;
                self.finish(
                    server,
                    outcome,
                    |s, _| s.settle(ServerStatus::Running),
                    |s| s.settle(ServerStatus::Stopped),
                )
                .await
            }
            None => {
                // recreate from the last known config over the surviving data
                tracing::info!(server_id = %server.id, "recreating missing server");
                let outcome = client
                    .with_timeout(self.config.provision_timeout)
                    .call(&create_call(&server))
                    .await;
                self.finish(
                    server,
                    outcome,
                    |s, p| {
                        s.container_id = Some(p.container_id);
                        s.settle(ServerStatus::Running);
                    },
                    |s| s.settle(ServerStatus::Failed),
                )
                .await
            }
        }
    }

    pub async fn stop(&self, agent: &str, id: Uuid) -> ControlResult<ServerRecord> {
        let agent = self.agent(agent).await?;
        let (server, client) = self
            .begin(&agent, id, "stop", |s| match (s.status, &s.container_id) {
                (ServerStatus::Running, Some(_)) => Ok((Intent::Stop, ServerStatus::Running)),
                (status, _) => Err(ControlError::InvalidTransition { op: "stop", status }),
            })
            .await?;

        let container_id = server.container_id.clone().unwrap_or_default();
        let outcome = client.call(&StopContainer { container_id }).await;
        self.finish(
            server,
            outcome,
            |s, _| s.settle(ServerStatus::Stopped),
            |s| s.settle(ServerStatus::Running),
        )
        .await
    }

    /// Soft-delete a server. Rows without a container are removed without
    /// contacting the agent.
    pub async fn delete(
        &self,
        agent: &str,
        id: Uuid,
        remove_volumes: bool,
        expected_container: Option<&str>,
    ) -> ControlResult<ServerRecord> {
        let agent = self.agent(agent).await?;

        let (server, client) = {
            let _guard = self.locks.lock(agent.id).await;
            let mut server = self.load(&agent, id).await?;
            idle(&server, "delete")?;
            if let Some(expected) = expected_container {
                if server.container_id.as_deref() != Some(expected) {
                    return Err(ControlError::BadRequest(format!(
                        "container {expected} does not belong to server {id}"
                    )));
                }
            }

            if server.container_id.is_none() {
                server.mark_deleted();
                let server = self.ledger.update_server(&server).await?;
                tracing::info!(server_id = %server.id, "server removed, no container to delete");
                return Ok(server);
            }

            let client = self.client(&agent.name).await?;
            server.begin(Intent::Delete, ServerStatus::Deleting);
            (self.ledger.update_server(&server).await?, client)
        };

        let container_id = server.container_id.clone().unwrap_or_default();
        let outcome = client
            .call(&DeleteServer {
                container_id: container_id.clone(),
                remove_volumes,
            })
            .await;
        let server = self
            .finish(
                server,
                outcome,
                |s, _| s.mark_deleted(),
                |s| s.settle(ServerStatus::Failed),
            )
            .await?;
        // the container is gone, so is its log history
        if let Some(link) = self.hubs.get(&agent.name).await {
            link.logs.reset(&container_id);
        }
        Ok(server)
    }

    /// Pull the image again and recreate the container. Identity, ports and
    /// data survive; only the container id changes.
    pub async fn rebuild(&self, agent: &str, id: Uuid) -> ControlResult<ServerRecord> {
        let agent = self.agent(agent).await?;
        let (server, client) = self
            .begin(&agent, id, "rebuild", |s| match (s.status, &s.container_id) {
                (
                    ServerStatus::Running | ServerStatus::Stopped | ServerStatus::Failed,
                    Some(_),
                ) => Ok((Intent::Rebuild, ServerStatus::Rebuilding)),
                (status, _) => Err(ControlError::InvalidTransition {
                    op: "rebuild",
                    status,
                }),
            })
            .await?;

        let call = RebuildServer {
            container_id: server.container_id.clone().unwrap_or_default(),
            server_id: server.id.to_string(),
            name: server.name.clone(),
            image: server.image_tag.clone(),
            config: server.config.clone(),
            game_port: server.ports.game_port,
            udp_port: server.ports.udp_port,
            rcon_port: server.ports.rcon_port,
        };
        let outcome = client
            .with_timeout(self.config.provision_timeout)
            .call(&call)
            .await;
        self.finish(
            server,
            outcome,
            |s, p| {
                s.container_id = Some(p.container_id);
                s.settle(ServerStatus::Running);
            },
            |s| s.settle(ServerStatus::Failed),
        )
        .await
    }

    /// Hard-delete soft-deleted rows, releasing their ports.
    pub async fn purge(&self, agent: &str) -> ControlResult<u64> {
        let agent = self.agent(agent).await?;
        let _guard = self.locks.lock(agent.id).await;
        let purged = self.ledger.purge_deleted(agent.id).await?;
        tracing::info!(agent = %agent.name, purged, "purged deleted servers");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::ledger::{Ledger, MemoryLedger};
    use crate::test_support::{Harness, healthy_agent, remote_error};

    fn req(name: &str) -> NewServerRequest {
        NewServerRequest {
            name: name.to_string(),
            image_tag: "ghcr.io/acme/game:1".to_string(),
            config: BTreeMap::from([("MAX_PLAYERS".to_string(), "16".to_string())]),
            game_port: None,
            udp_port: None,
            rcon_port: None,
        }
    }

    /// Put a row straight into the ledger in the given state.
    async fn seed(
        ledger: &MemoryLedger,
        agent_id: Uuid,
        name: &str,
        status: ServerStatus,
        container: Option<&str>,
        data_exists: bool,
    ) -> ServerRecord {
        let mut s = ledger
            .insert_server(NewServer {
                agent_id,
                name: name.to_string(),
                image_tag: "img:1".into(),
                config: BTreeMap::new(),
                ports: PortTriple::new(27101, 27102, 28101),
                status,
                intent: None,
            })
            .await
            .unwrap();
        s.container_id = container.map(str::to_string);
        s.data_exists = data_exists;
        ledger.put_server(s.clone());
        s
    }

    #[tokio::test]
    async fn create_allocates_ports_and_ends_running() {
        let h = Harness::new(healthy_agent).await;
        let server = h.lifecycle.create("node-a", req("alpha")).await.unwrap();

        assert_eq!(server.status, ServerStatus::Running);
        assert_eq!(server.container_id.as_deref(), Some("c-alpha"));
        assert_eq!(server.ports, PortTriple::new(27015, 27016, 28015));
        assert!(server.intent.is_none());
        assert!(server.data_exists);

        assert_eq!(h.agent.subjects(), vec!["ports.check", "servers.create"]);
        let sent = &h.agent.calls_to("servers.create")[0];
        assert_eq!(sent["serverId"], server.id.to_string());
        assert_eq!(sent["gamePort"], 27015);
        assert_eq!(sent["config"]["MAX_PLAYERS"], "16");
    }

    #[tokio::test]
    async fn failed_create_keeps_the_row() {
        let h = Harness::new(|subject, data| match subject {
            "servers.create" => Some(remote_error("image_pull_failed", "manifest unknown")),
            _ => healthy_agent(subject, data),
        })
        .await;

        let err = h.lifecycle.create("node-a", req("alpha")).await.unwrap_err();
        assert!(matches!(err, ControlError::Remote { ref code, .. } if code == "image_pull_failed"));

        let rows = h.lifecycle.list("node-a").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ServerStatus::Failed);
        assert!(rows[0].container_id.is_none());
        assert!(rows[0].intent.is_none());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let h = Harness::new(healthy_agent).await;
        h.lifecycle.create("node-a", req("alpha")).await.unwrap();
        assert!(matches!(
            h.lifecycle.create("node-a", req("alpha")).await,
            Err(ControlError::NameTaken(_))
        ));
        assert!(matches!(
            h.lifecycle.create("node-b", req("alpha")).await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_creates_get_disjoint_ports() {
        let h = Harness::new(healthy_agent).await;
        let creates = (0..8).map(|n| {
            let lifecycle = h.lifecycle.clone();
            async move { lifecycle.create("node-a", req(&format!("srv-{n}"))).await }
        });
        let servers: Vec<ServerRecord> = join_all(creates)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        let mut seen = std::collections::HashSet::new();
        for s in &servers {
            for p in s.ports.ports() {
                assert!(seen.insert(p), "port {p} allocated twice");
            }
        }
        assert_eq!(seen.len(), 24);
    }

    #[tokio::test]
    async fn explicit_ports_conflicting_with_ledger_are_rejected() {
        let h = Harness::new(healthy_agent).await;
        let first = h.lifecycle.create("node-a", req("alpha")).await.unwrap();
        let mut second = req("beta");
        second.game_port = Some(27200);
        second.udp_port = Some(27201);
        second.rcon_port = Some(first.ports.rcon_port);

        match h.lifecycle.create("node-a", second).await {
            Err(ControlError::PortConflict { port, .. }) => {
                assert_eq!(port, first.ports.rcon_port)
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.lifecycle.list("node-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_missing_with_data_recreates() {
        let h = Harness::new(healthy_agent).await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Missing, None, true).await;

        let started = h.lifecycle.start("node-a", s.id).await.unwrap();
        assert_eq!(started.status, ServerStatus::Running);
        assert_eq!(started.container_id.as_deref(), Some("c-alpha"));
        assert_eq!(started.ports, s.ports);
        assert_eq!(h.agent.calls_to("servers.create")[0]["serverId"], s.id.to_string());
    }

    #[tokio::test]
    async fn start_missing_with_data_fails_cleanly() {
        let h = Harness::new(|subject, data| match subject {
            "servers.create" => Some(remote_error("create_failed", "disk full")),
            _ => healthy_agent(subject, data),
        })
        .await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Missing, None, true).await;

        assert!(h.lifecycle.start("node-a", s.id).await.is_err());
        let row = h.ledger.raw_server(s.id).unwrap();
        assert_eq!(row.status, ServerStatus::Failed);
        assert!(row.intent.is_none());
    }

    #[tokio::test]
    async fn start_missing_without_data_is_orphaned() {
        let h = Harness::new(healthy_agent).await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Missing, None, false).await;

        let err = h.lifecycle.start("node-a", s.id).await.unwrap_err();
        assert!(matches!(err, ControlError::OrphanedServer(id) if id == s.id));
        let row = h.ledger.raw_server(s.id).unwrap();
        assert_eq!(row.status, ServerStatus::Missing);
        assert!(row.intent.is_none());
        assert!(h.agent.subjects().is_empty());
    }

    #[tokio::test]
    async fn start_and_stop_follow_the_state_machine() {
        let h = Harness::new(healthy_agent).await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Stopped, Some("c1"), true).await;

        assert!(matches!(
            h.lifecycle.stop("node-a", s.id).await,
            Err(ControlError::InvalidTransition { status: ServerStatus::Stopped, .. })
        ));
        let running = h.lifecycle.start("node-a", s.id).await.unwrap();
        assert_eq!(running.status, ServerStatus::Running);
        assert!(matches!(
            h.lifecycle.start("node-a", s.id).await,
            Err(ControlError::InvalidTransition { status: ServerStatus::Running, .. })
        ));
        let stopped = h.lifecycle.stop("node-a", s.id).await.unwrap();
        assert_eq!(stopped.status, ServerStatus::Stopped);
        assert_eq!(stopped.container_id.as_deref(), Some("c1"));
        assert_eq!(
            h.agent.subjects(),
            vec!["containers.start", "containers.stop"]
        );
    }

    #[tokio::test]
    async fn failed_stop_rolls_back_to_running() {
        let h = Harness::new(|subject, data| match subject {
            "containers.stop" => Some(remote_error("stop_failed", "timeout")),
            _ => healthy_agent(subject, data),
        })
        .await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Running, Some("c1"), true).await;

        assert!(h.lifecycle.stop("node-a", s.id).await.is_err());
        let row = h.ledger.raw_server(s.id).unwrap();
        assert_eq!(row.status, ServerStatus::Running);
        assert!(row.intent.is_none());
    }

    #[tokio::test]
    async fn command_on_row_with_intent_is_rejected() {
        let h = Harness::new(healthy_agent).await;
        let mut s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Running, Some("c1"), true).await;
        s.begin(Intent::Rebuild, ServerStatus::Rebuilding);
        h.ledger.put_server(s.clone());

        for err in [
            h.lifecycle.stop("node-a", s.id).await.unwrap_err(),
            h.lifecycle.delete("node-a", s.id, false, None).await.unwrap_err(),
            h.lifecycle.rebuild("node-a", s.id).await.unwrap_err(),
        ] {
            assert!(matches!(
                err,
                ControlError::InvalidTransition { status: ServerStatus::Rebuilding, .. }
            ));
        }
        assert!(h.agent.subjects().is_empty());
    }

    #[tokio::test]
    async fn delete_without_container_skips_the_agent() {
        // no hub at all for this agent
        let ledger = Arc::new(MemoryLedger::new());
        let agent = ledger.register_agent("node-a").await.unwrap();
        let s = seed(&ledger, agent.id, "alpha", ServerStatus::Failed, None, false).await;
        let lifecycle = Lifecycle::new(
            ledger.clone(),
            HubRegistry::new(ledger.clone(), 100),
            AgentLocks::new(),
            Arc::new(ControlConfig::default()),
        );

        let removed = lifecycle.delete("node-a", s.id, true, None).await.unwrap();
        assert_eq!(removed.status, ServerStatus::Deleted);
        assert!(ledger.get_server(s.id).await.unwrap().is_none());
        assert!(ledger.raw_server(s.id).unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn delete_with_container_calls_agent() {
        let h = Harness::new(healthy_agent).await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Stopped, Some("c1"), true).await;

        assert!(matches!(
            h.lifecycle.delete("node-a", s.id, false, Some("other")).await,
            Err(ControlError::BadRequest(_))
        ));
        let logs = h.hubs.get("node-a").await.unwrap().logs;
        logs.append(garrison_proto::LogLine {
            container_id: "c1".to_string(),
            timestamp: String::new(),
            stream: Default::default(),
            message: "bye".to_string(),
        });
        let removed = h.lifecycle.delete("node-a", s.id, true, Some("c1")).await.unwrap();
        assert!(logs.snapshot("c1").is_empty());
        assert_eq!(removed.status, ServerStatus::Deleted);
        assert!(removed.container_id.is_none());
        assert_eq!(
            h.agent.calls_to("servers.delete"),
            vec![json!({ "containerId": "c1", "removeVolumes": true })]
        );
        assert!(h.lifecycle.list("node-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_delete_marks_failed() {
        let h = Harness::new(|subject, data| match subject {
            "servers.delete" => Some(remote_error("busy", "volume in use")),
            _ => healthy_agent(subject, data),
        })
        .await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Running, Some("c1"), true).await;

        assert!(h.lifecycle.delete("node-a", s.id, false, None).await.is_err());
        let row = h.ledger.raw_server(s.id).unwrap();
        assert_eq!(row.status, ServerStatus::Failed);
        assert!(row.deleted_at.is_none());
    }

    #[tokio::test]
    async fn rebuild_changes_only_container_and_status() {
        let h = Harness::new(healthy_agent).await;
        let before = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Stopped, Some("c1"), true).await;

        let after = h.lifecycle.rebuild("node-a", before.id).await.unwrap();
        assert_eq!(after.container_id.as_deref(), Some("r-alpha"));
        assert_eq!(after.status, ServerStatus::Running);

        let mut expected = before.clone();
        expected.container_id = after.container_id.clone();
        expected.status = after.status;
        expected.updated_at = after.updated_at;
        assert_eq!(after, expected);

        let sent = &h.agent.calls_to("servers.rebuild")[0];
        assert_eq!(sent["containerId"], "c1");
        assert_eq!(sent["rconPort"], 28101);
    }

    #[tokio::test]
    async fn rebuild_requires_a_container() {
        let h = Harness::new(healthy_agent).await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Failed, None, true).await;
        assert!(matches!(
            h.lifecycle.rebuild("node-a", s.id).await,
            Err(ControlError::InvalidTransition { op: "rebuild", .. })
        ));
    }

    #[tokio::test]
    async fn soft_deleted_ports_stay_reserved_until_purge() {
        let h = Harness::new(healthy_agent).await;
        let first = h.lifecycle.create("node-a", req("alpha")).await.unwrap();
        h.lifecycle.delete("node-a", first.id, false, None).await.unwrap();

        let second = h.lifecycle.create("node-a", req("beta")).await.unwrap();
        assert_ne!(second.ports, first.ports);

        assert_eq!(h.lifecycle.purge("node-a").await.unwrap(), 1);
        let third = h.lifecycle.create("node-a", req("gamma")).await.unwrap();
        assert_eq!(third.ports, first.ports);
    }

    #[tokio::test]
    async fn disconnected_agent_leaves_ledger_untouched() {
        let h = Harness::new(healthy_agent).await;
        let s = seed(&h.ledger, h.agent_id().await, "alpha", ServerStatus::Running, Some("c1"), true).await;
        h.agent.disconnect().await;

        assert!(matches!(
            h.lifecycle.stop("node-a", s.id).await,
            Err(ControlError::AgentUnavailable)
        ));
        assert!(matches!(
            h.lifecycle.create("node-a", req("beta")).await,
            Err(ControlError::AgentUnavailable)
        ));
        let row = h.ledger.raw_server(s.id).unwrap();
        assert_eq!(row.status, ServerStatus::Running);
        assert!(row.intent.is_none());
        assert_eq!(h.lifecycle.list("node-a").await.unwrap().len(), 1);
    }

    #[test]
    fn request_validation() {
        let mut r = req("bad name");
        assert!(r.validate().is_err());
        r.name = "ok".into();
        r.game_port = Some(1);
        assert!(r.validate().is_err());
        r.udp_port = Some(2);
        r.rcon_port = Some(3);
        assert_eq!(r.validate().unwrap(), Some(PortTriple::new(1, 2, 3)));

        let parsed: NewServerRequest =
            serde_json::from_value(json!({ "name": "x", "image": "img:2" })).unwrap();
        assert_eq!(parsed.image_tag, "img:2");
        assert_eq!(parsed.config, BTreeMap::new());
    }
}
