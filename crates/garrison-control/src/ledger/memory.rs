use std::{collections::HashMap, sync::Mutex};

use chrono::Utc;
use uuid::Uuid;

use super::{AgentRecord, AgentStatus, Ledger, NewServer, ServerRecord};
use crate::error::{ControlError, ControlResult};

#[derive(Default)]
struct Tables {
    agents: HashMap<Uuid, AgentRecord>,
    servers: HashMap<Uuid, ServerRecord>,
}

/// In-process ledger for tests and single-node runs without Postgres.
#[derive(Default)]
pub struct MemoryLedger {
    tables: Mutex<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Row lookup that ignores soft deletion.
    pub fn raw_server(&self, id: Uuid) -> Option<ServerRecord> {
        self.tables().servers.get(&id).cloned()
    }

    /// Overwrite a row as-is, bypassing `updated_at` bookkeeping.
    pub fn put_server(&self, server: ServerRecord) {
        self.tables().servers.insert(server.id, server);
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    async fn register_agent(&self, name: &str) -> ControlResult<AgentRecord> {
        let now = Utc::now();
        let mut t = self.tables();
        if let Some(agent) = t.agents.values_mut().find(|a| a.name == name) {
            agent.status = AgentStatus::Online;
            agent.last_seen = Some(now);
            agent.updated_at = now;
            return Ok(agent.clone());
        }
        let agent = AgentRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: AgentStatus::Online,
            last_seen: Some(now),
            metadata: None,
            created_at: now,
            updated_at: now,
        };
        t.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn set_agent_status(&self, name: &str, status: AgentStatus) -> ControlResult<()> {
        let now = Utc::now();
        let mut t = self.tables();
        let agent = t
            .agents
            .values_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| ControlError::NotFound(format!("agent {name}")))?;
        agent.status = status;
        agent.last_seen = Some(now);
        agent.updated_at = now;
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        name: &str,
        metadata: serde_json::Value,
    ) -> ControlResult<()> {
        let now = Utc::now();
        let mut t = self.tables();
        let agent = t
            .agents
            .values_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| ControlError::NotFound(format!("agent {name}")))?;
        agent.metadata = Some(metadata);
        agent.last_seen = Some(now);
        agent.updated_at = now;
        Ok(())
    }

    async fn find_agent(&self, name: &str) -> ControlResult<Option<AgentRecord>> {
        Ok(self.tables().agents.values().find(|a| a.name == name).cloned())
    }

    async fn list_agents(&self) -> ControlResult<Vec<AgentRecord>> {
        let mut out: Vec<_> = self.tables().agents.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn list_servers(&self, agent_id: Uuid) -> ControlResult<Vec<ServerRecord>> {
        let mut out: Vec<_> = self
            .tables()
            .servers
            .values()
            .filter(|s| s.agent_id == agent_id && !s.is_deleted())
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn list_unpurged_servers(&self, agent_id: Uuid) -> ControlResult<Vec<ServerRecord>> {
        Ok(self
            .tables()
            .servers
            .values()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn get_server(&self, id: Uuid) -> ControlResult<Option<ServerRecord>> {
        Ok(self
            .tables()
            .servers
            .get(&id)
            .filter(|s| !s.is_deleted())
            .cloned())
    }

    async fn insert_server(&self, new: NewServer) -> ControlResult<ServerRecord> {
        let now = Utc::now();
        let mut t = self.tables();
        if t
            .servers
            .values()
            .any(|s| s.agent_id == new.agent_id && s.name == new.name && !s.is_deleted())
        {
            return Err(ControlError::NameTaken(new.name));
        }
        let server = ServerRecord {
            id: Uuid::new_v4(),
            agent_id: new.agent_id,
            name: new.name,
            container_id: None,
            config: new.config,
            image_tag: new.image_tag,
            ports: new.ports,
            status: new.status,
            data_exists: false,
            intent: new.intent,
            intent_at: new.intent.map(|_| now),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        t.servers.insert(server.id, server.clone());
        Ok(server)
    }

    async fn update_server(&self, server: &ServerRecord) -> ControlResult<ServerRecord> {
        let mut t = self.tables();
        let slot = t
            .servers
            .get_mut(&server.id)
            .ok_or_else(|| ControlError::NotFound(format!("server {}", server.id)))?;
        *slot = server.clone();
        slot.updated_at = Utc::now();
        Ok(slot.clone())
    }

    async fn purge_deleted(&self, agent_id: Uuid) -> ControlResult<u64> {
        let mut t = self.tables();
        let before = t.servers.len();
        t.servers
            .retain(|_, s| !(s.agent_id == agent_id && s.is_deleted()));
        Ok((before - t.servers.len()) as u64)
    }
}
