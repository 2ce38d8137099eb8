use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use garrison_db::entities::{agents, servers};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::OnConflict,
};
use uuid::Uuid;

use super::{AgentRecord, AgentStatus, Intent, Ledger, NewServer, PortTriple, ServerRecord, ServerStatus};
use crate::error::{ControlError, ControlResult};

/// Ledger backed by Postgres through sea-orm.
#[derive(Clone)]
pub struct SeaLedger {
    db: Arc<DatabaseConnection>,
}

impl SeaLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn utc(ts: sea_orm::prelude::DateTimeWithTimeZone) -> DateTime<Utc> {
    ts.with_timezone(&Utc)
}

fn port(v: i32, column: &str) -> ControlResult<u16> {
    u16::try_from(v).map_err(|_| ControlError::Ledger(format!("{column} out of range: {v}")))
}

fn agent_from_model(m: agents::Model) -> ControlResult<AgentRecord> {
    let status = AgentStatus::parse(&m.status)
        .ok_or_else(|| ControlError::Ledger(format!("unknown agent status: {}", m.status)))?;
    Ok(AgentRecord {
        id: m.id,
        name: m.name,
        status,
        last_seen: m.last_seen_at.map(utc),
        metadata: m.metadata,
        created_at: utc(m.created_at),
        updated_at: utc(m.updated_at),
    })
}

fn server_from_model(m: servers::Model) -> ControlResult<ServerRecord> {
    let status = ServerStatus::parse(&m.status)
        .ok_or_else(|| ControlError::Ledger(format!("unknown server status: {}", m.status)))?;
    let intent = match m.intent.as_deref() {
        None => None,
        Some(raw) => Some(
            Intent::parse(raw)
                .ok_or_else(|| ControlError::Ledger(format!("unknown intent: {raw}")))?,
        ),
    };
    let config: BTreeMap<String, String> = serde_json::from_value(m.config)
        .map_err(|e| ControlError::Ledger(format!("server {} config: {e}", m.id)))?;

    Ok(ServerRecord {
        id: m.id,
        agent_id: m.agent_id,
        name: m.name,
        container_id: m.container_id,
        config,
        image_tag: m.image_tag,
        ports: PortTriple {
            game_port: port(m.game_port, "game_port")?,
            udp_port: port(m.udp_port, "udp_port")?,
            rcon_port: port(m.rcon_port, "rcon_port")?,
        },
        status,
        data_exists: m.data_exists,
        intent,
        intent_at: m.intent_at.map(utc),
        deleted_at: m.deleted_at.map(utc),
        created_at: utc(m.created_at),
        updated_at: utc(m.updated_at),
    })
}

fn config_json(config: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        config
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

impl SeaLedger {
    async fn agent_model(&self, name: &str) -> ControlResult<Option<agents::Model>> {
        Ok(agents::Entity::find()
            .filter(agents::Column::Name.eq(name))
            .one(&*self.db)
            .await?)
    }

    async fn require_agent_model(&self, name: &str) -> ControlResult<agents::Model> {
        self.agent_model(name)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("agent {name}")))
    }
}

#[async_trait::async_trait]
impl Ledger for SeaLedger {
    async fn register_agent(&self, name: &str) -> ControlResult<AgentRecord> {
        let now = Utc::now();
        agents::Entity::insert(agents::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            status: Set(AgentStatus::Online.as_str().to_string()),
            last_seen_at: Set(Some(now.into())),
            metadata: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        })
        .on_conflict(
            OnConflict::columns([agents::Column::Name])
                .update_columns([
                    agents::Column::Status,
                    agents::Column::LastSeenAt,
                    agents::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(&*self.db)
        .await?;
        agent_from_model(self.require_agent_model(name).await?)
    }

    async fn set_agent_status(&self, name: &str, status: AgentStatus) -> ControlResult<()> {
        let now = Utc::now();
        let mut update: agents::ActiveModel = self.require_agent_model(name).await?.into();
        update.status = Set(status.as_str().to_string());
        update.last_seen_at = Set(Some(now.into()));
        update.updated_at = Set(now.into());
        update.update(&*self.db).await?;
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        name: &str,
        metadata: serde_json::Value,
    ) -> ControlResult<()> {
        let now = Utc::now();
        let mut update: agents::ActiveModel = self.require_agent_model(name).await?.into();
        update.metadata = Set(Some(metadata));
        update.last_seen_at = Set(Some(now.into()));
        update.updated_at = Set(now.into());
        update.update(&*self.db).await?;
        Ok(())
    }

    async fn find_agent(&self, name: &str) -> ControlResult<Option<AgentRecord>> {
        self.agent_model(name).await?.map(agent_from_model).transpose()
    }

    async fn list_agents(&self) -> ControlResult<Vec<AgentRecord>> {
        agents::Entity::find()
            .order_by_asc(agents::Column::Name)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(agent_from_model)
            .collect()
    }

    async fn list_servers(&self, agent_id: Uuid) -> ControlResult<Vec<ServerRecord>> {
        servers::Entity::find()
            .filter(servers::Column::AgentId.eq(agent_id))
            .filter(servers::Column::DeletedAt.is_null())
            .order_by_asc(servers::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(server_from_model)
            .collect()
    }

    async fn list_unpurged_servers(&self, agent_id: Uuid) -> ControlResult<Vec<ServerRecord>> {
        servers::Entity::find()
            .filter(servers::Column::AgentId.eq(agent_id))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(server_from_model)
            .collect()
    }

    async fn get_server(&self, id: Uuid) -> ControlResult<Option<ServerRecord>> {
        servers::Entity::find_by_id(id)
            .filter(servers::Column::DeletedAt.is_null())
            .one(&*self.db)
            .await?
            .map(server_from_model)
            .transpose()
    }

    async fn insert_server(&self, new: NewServer) -> ControlResult<ServerRecord> {
        let taken = servers::Entity::find()
            .filter(servers::Column::AgentId.eq(new.agent_id))
            .filter(servers::Column::Name.eq(new.name.as_str()))
            .filter(servers::Column::DeletedAt.is_null())
            .one(&*self.db)
            .await?;
        if taken.is_some() {
            return Err(ControlError::NameTaken(new.name));
        }

        let now = Utc::now();
        let model = servers::ActiveModel {
            id: Set(Uuid::new_v4()),
            agent_id: Set(new.agent_id),
            name: Set(new.name),
            container_id: Set(None),
            config: Set(config_json(&new.config)),
            image_tag: Set(new.image_tag),
            game_port: Set(i32::from(new.ports.game_port)),
            udp_port: Set(i32::from(new.ports.udp_port)),
            rcon_port: Set(i32::from(new.ports.rcon_port)),
            status: Set(new.status.as_str().to_string()),
            data_exists: Set(false),
            intent: Set(new.intent.map(|i| i.as_str().to_string())),
            intent_at: Set(new.intent.map(|_| now.into())),
            deleted_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
        .insert(&*self.db)
        .await?;
        server_from_model(model)
    }

    async fn update_server(&self, server: &ServerRecord) -> ControlResult<ServerRecord> {
        let model = servers::ActiveModel {
            id: Set(server.id),
            agent_id: Set(server.agent_id),
            name: Set(server.name.clone()),
            container_id: Set(server.container_id.clone()),
            config: Set(config_json(&server.config)),
            image_tag: Set(server.image_tag.clone()),
            game_port: Set(i32::from(server.ports.game_port)),
            udp_port: Set(i32::from(server.ports.udp_port)),
            rcon_port: Set(i32::from(server.ports.rcon_port)),
            status: Set(server.status.as_str().to_string()),
            data_exists: Set(server.data_exists),
            intent: Set(server.intent.map(|i| i.as_str().to_string())),
            intent_at: Set(server.intent_at.map(Into::into)),
            deleted_at: Set(server.deleted_at.map(Into::into)),
            created_at: Set(server.created_at.into()),
            updated_at: Set(Utc::now().into()),
        }
        .update(&*self.db)
        .await?;
        server_from_model(model)
    }

    async fn purge_deleted(&self, agent_id: Uuid) -> ControlResult<u64> {
        let res = servers::Entity::delete_many()
            .filter(servers::Column::AgentId.eq(agent_id))
            .filter(servers::Column::DeletedAt.is_not_null())
            .exec(&*self.db)
            .await?;
        Ok(res.rows_affected)
    }
}
