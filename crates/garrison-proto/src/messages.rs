use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::envelope::{Envelope, ProtoError, Subject};

pub const LOG_LINE: &str = "logs.line";
pub const LOG_END: &str = "logs.end";
pub const HEARTBEAT: &str = "agent.heartbeat";

/// A command the control plane sends to an agent and expects one reply for.
pub trait AgentCall: Serialize {
    const SUBJECT: &'static str;
    type Reply: DeserializeOwned;
}

/// Error body an agent puts in reply data: `{"error":{"code":..,"message":..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn from_reply(data: &Value) -> Option<Self> {
        let err = data.get("error")?;
        serde_json::from_value(err.clone()).ok()
    }
}

/// Empty success reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListContainers {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerList {
    #[serde(default)]
    pub containers: Vec<ContainerInfo>,
}

impl AgentCall for ListContainers {
    const SUBJECT: &'static str = "containers.list";
    type Reply = ContainerList;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartContainer {
    pub container_id: String,
}

impl AgentCall for StartContainer {
    const SUBJECT: &'static str = "containers.start";
    type Reply = Ack;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopContainer {
    pub container_id: String,
}

impl AgentCall for StopContainer {
    const SUBJECT: &'static str = "containers.stop";
    type Reply = Ack;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartContainer {
    pub container_id: String,
}

impl AgentCall for RestartContainer {
    const SUBJECT: &'static str = "containers.restart";
    type Reply = Ack;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckPorts {
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortUnavailable {
    pub port: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCheckReply {
    #[serde(default)]
    pub available: Vec<u16>,
    #[serde(default)]
    pub unavailable: Vec<PortUnavailable>,
}

impl AgentCall for CheckPorts {
    const SUBJECT: &'static str = "ports.check";
    type Reply = PortCheckReply;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServer {
    pub server_id: String,
    pub name: String,
    pub image: String,
    pub config: BTreeMap<String, String>,
    pub game_port: u16,
    pub udp_port: u16,
    pub rcon_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provisioned {
    pub container_id: String,
}

impl AgentCall for CreateServer {
    const SUBJECT: &'static str = "servers.create";
    type Reply = Provisioned;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteServer {
    pub container_id: String,
    #[serde(default)]
    pub remove_volumes: bool,
}

impl AgentCall for DeleteServer {
    const SUBJECT: &'static str = "servers.delete";
    type Reply = Ack;
}

// Pull the latest image and recreate the container; the data volume survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildServer {
    pub container_id: String,
    pub server_id: String,
    pub name: String,
    pub image: String,
    pub config: BTreeMap<String, String>,
    pub game_port: u16,
    pub udp_port: u16,
    pub rcon_port: u16,
}

impl AgentCall for RebuildServer {
    const SUBJECT: &'static str = "servers.rebuild";
    type Reply = Provisioned;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectServers {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDataInfo {
    pub name: String,
    pub data_exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectReply {
    #[serde(default)]
    pub servers: Vec<ServerDataInfo>,
}

impl AgentCall for InspectServers {
    const SUBJECT: &'static str = "servers.inspect";
    type Reply = InspectReply;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachLogs {
    pub container_id: String,
}

impl AgentCall for AttachLogs {
    const SUBJECT: &'static str = "logs.attach";
    type Reply = Ack;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachLogs {
    pub container_id: String,
}

impl AgentCall for DetachLogs {
    const SUBJECT: &'static str = "logs.detach";
    type Reply = Ack;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub container_id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub stream: LogStream,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEnd {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub metrics: Value,
}

/// Typed agent-originated traffic that is not a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    LogLine(LogLine),
    LogEnd(LogEnd),
    Heartbeat(Heartbeat),
}

impl AgentEvent {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::LogLine(_) => LOG_LINE,
            Self::LogEnd(_) => LOG_END,
            Self::Heartbeat(_) => HEARTBEAT,
        }
    }
}

/// A validated inbound envelope, classified by subject.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply { inbox: Subject, data: Value },
    Event(AgentEvent),
    /// Well-formed but not part of the known subject set.
    Unrouted(Envelope),
}

fn payload<T: DeserializeOwned>(env: &Envelope, subject: &str) -> Result<T, ProtoError> {
    serde_json::from_value(env.data.clone()).map_err(|e| ProtoError::MalformedEnvelope {
        reason: format!("{subject} payload: {e}"),
        reply_to: env.reply.clone(),
    })
}

impl Inbound {
    pub fn classify(env: Envelope) -> Result<Self, ProtoError> {
        if env.subject.is_inbox() {
            return Ok(Self::Reply {
                inbox: env.subject,
                data: env.data,
            });
        }

        let event = match env.subject.as_str() {
            LOG_LINE => AgentEvent::LogLine(payload(&env, LOG_LINE)?),
            LOG_END => AgentEvent::LogEnd(payload(&env, LOG_END)?),
            HEARTBEAT => {
                let hb = if env.data.is_null() {
                    Heartbeat::default()
                } else {
                    payload(&env, HEARTBEAT)?
                };
                AgentEvent::Heartbeat(hb)
            }
            _ => return Ok(Self::Unrouted(env)),
        };
        Ok(Self::Event(event))
    }
}
