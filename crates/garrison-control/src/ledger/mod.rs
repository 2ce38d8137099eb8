// Persistent records of agents and servers.
//
// The ledger is the source of truth the lifecycle and the reconciler
// read-modify-write. Writes for one agent go through [`AgentLocks`] so that
// only one writer touches an agent's rows (and port set) at a time.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ControlResult;

pub mod memory;
pub mod sea;

pub use memory::MemoryLedger;
pub use sea::SeaLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Creating,
    Running,
    Stopped,
    Missing,
    Failed,
    Deleting,
    Deleted,
    Rebuilding,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Missing => "missing",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Rebuilding => "rebuilding",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "creating" => Self::Creating,
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "missing" => Self::Missing,
            "failed" => Self::Failed,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            "rebuilding" => Self::Rebuilding,
            _ => return None,
        })
    }

    /// Written optimistically before an agent round trip.
    pub fn is_intermediate(self) -> bool {
        matches!(self, Self::Creating | Self::Deleting | Self::Rebuilding)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition a row is in the middle of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Create,
    Start,
    Stop,
    Delete,
    Rebuild,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
            Self::Rebuild => "rebuild",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "create" => Self::Create,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "delete" => Self::Delete,
            "rebuild" => Self::Rebuild,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortTriple {
    pub game_port: u16,
    pub udp_port: u16,
    pub rcon_port: u16,
}

impl PortTriple {
    pub fn new(game_port: u16, udp_port: u16, rcon_port: u16) -> Self {
        Self {
            game_port,
            udp_port,
            rcon_port,
        }
    }

    pub fn ports(&self) -> [u16; 3] {
        [self.game_port, self.udp_port, self.rcon_port]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    pub status: AgentStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub container_id: Option<String>,
    pub config: BTreeMap<String, String>,
    pub image_tag: String,
    #[serde(flatten)]
    pub ports: PortTriple,
    pub status: ServerStatus,
    pub data_exists: bool,
    pub intent: Option<Intent>,
    pub intent_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Phase one of a transition: record what is about to be attempted.
    pub fn begin(&mut self, intent: Intent, status: ServerStatus) {
        self.intent = Some(intent);
        self.intent_at = Some(Utc::now());
        self.status = status;
    }

    /// Phase two: commit the outcome and clear the intent.
    pub fn settle(&mut self, status: ServerStatus) {
        self.intent = None;
        self.intent_at = None;
        self.status = status;
    }

    pub fn mark_deleted(&mut self) {
        self.settle(ServerStatus::Deleted);
        self.container_id = None;
        self.deleted_at = Some(Utc::now());
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub agent_id: Uuid,
    pub name: String,
    pub image_tag: String,
    pub config: BTreeMap<String, String>,
    pub ports: PortTriple,
    pub status: ServerStatus,
    pub intent: Option<Intent>,
}

#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Create the agent on first sight, mark it online either way.
    async fn register_agent(&self, name: &str) -> ControlResult<AgentRecord>;
    async fn set_agent_status(&self, name: &str, status: AgentStatus) -> ControlResult<()>;
    async fn record_heartbeat(&self, name: &str, metadata: serde_json::Value)
    -> ControlResult<()>;
    async fn find_agent(&self, name: &str) -> ControlResult<Option<AgentRecord>>;
    async fn list_agents(&self) -> ControlResult<Vec<AgentRecord>>;

    /// Servers that are not soft-deleted.
    async fn list_servers(&self, agent_id: Uuid) -> ControlResult<Vec<ServerRecord>>;
    /// Every row still present, soft-deleted ones included.
    async fn list_unpurged_servers(&self, agent_id: Uuid) -> ControlResult<Vec<ServerRecord>>;
    /// Lookup among servers that are not soft-deleted.
    async fn get_server(&self, id: Uuid) -> ControlResult<Option<ServerRecord>>;
    async fn insert_server(&self, new: NewServer) -> ControlResult<ServerRecord>;
    async fn update_server(&self, server: &ServerRecord) -> ControlResult<ServerRecord>;
    /// Hard-delete soft-deleted rows, releasing their ports.
    async fn purge_deleted(&self, agent_id: Uuid) -> ControlResult<u64>;
}

pub type SharedLedger = Arc<dyn Ledger>;

/// One async mutex per agent: the single-writer point for its ledger rows.
#[derive(Clone, Default)]
pub struct AgentLocks {
    inner: Arc<std::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, agent_id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let m = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(agent_id).or_default().clone()
        };
        m.lock_owned().await
    }
}
