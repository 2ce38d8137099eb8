// Operator-facing HTTP surface.
//
// Authentication happens upstream; mutating requests arrive with the
// verified caller in `x-garrison-caller` and are rejected without it.

use axum::{
    Extension, Json, Router,
    extract::{
        Path, Query, Request, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use garrison_proto::messages::{
    AttachLogs, CheckPorts, ContainerList, DetachLogs, ListContainers, PortCheckReply,
    RestartContainer, StartContainer, StopContainer,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent_tunnel;
use crate::audit::{self, AuditEvent};
use crate::client::AgentClient;
use crate::error::{ControlError, ControlResult};
use crate::ledger::{AgentRecord, ServerRecord};
use crate::lifecycle::NewServerRequest;
use crate::logs::{LogFanout, LogSubscription};
use crate::reconcile::SyncReport;
use crate::state::AppState;

pub const CALLER_HEADER: &str = "x-garrison-caller";

/// Identity of whoever issued a mutating request.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

async fn require_caller(mut req: Request, next: Next) -> Response {
    if !is_unsafe_method(req.method()) {
        return next.run(req).await;
    }
    let caller = req
        .headers()
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let Some(caller) = caller else {
        return ControlError::Unauthorized.into_response();
    };
    req.extensions_mut().insert(Caller(caller));
    next.run(req).await
}

fn audited<T>(state: &AppState, caller: &Caller, action: &str, target: &str, res: &ControlResult<T>) {
    let outcome = match res {
        Ok(_) => "ok",
        Err(err) => err.code(),
    };
    audit::emit(&state.audit, AuditEvent::new(&caller.0, action, target, outcome));
}

pub fn router(state: AppState) -> Router {
    let agent_routes = Router::new()
        .route("/agents/:name/containers", get(list_containers))
        .route("/agents/:name/containers/:id/:action", post(container_action))
        .route("/agents/:name/ports/check", post(check_ports))
        .route("/agents/:name/servers", get(list_servers).post(create_server))
        .route("/agents/:name/servers/sync", post(sync_servers))
        .route("/agents/:name/servers/purge", post(purge_servers))
        .route(
            "/agents/:name/servers/:id",
            get(get_server).delete(delete_server),
        )
        .route("/agents/:name/servers/:id/start", post(start_server))
        .route("/agents/:name/servers/:id/stop", post(stop_server))
        .route("/agents/:name/servers/:id/rebuild", post(rebuild_server))
        .route("/agents/:name/logs/ws", get(logs_ws))
        .layer(middleware::from_fn(require_caller));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/agents", get(list_agents))
        .route("/ws", get(agent_tunnel::agent_ws))
        .merge(agent_routes)
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    agents_known: usize,
    agents_connected: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        agents_known: state.hubs.agents().await.len(),
        agents_connected: state.hubs.connected().await.len(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentView {
    #[serde(flatten)]
    record: AgentRecord,
    connected: bool,
    pending_requests: usize,
}

async fn list_agents(State(state): State<AppState>) -> ControlResult<Json<Vec<AgentView>>> {
    let mut out = Vec::new();
    for record in state.ledger.list_agents().await? {
        let status = match state.hubs.get(&record.name).await {
            Some(link) => link.hub.status().await,
            None => Default::default(),
        };
        out.push(AgentView {
            record,
            connected: status.connected,
            pending_requests: status.pending,
        });
    }
    Ok(Json(out))
}

async fn list_containers(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<ContainerList>> {
    let client = state.lifecycle.client(&name).await?;
    Ok(Json(client.call(&ListContainers {}).await?))
}

async fn container_action(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((name, id, action)): Path<(String, String, String)>,
) -> ControlResult<StatusCode> {
    let res = async {
        let client = state.lifecycle.client(&name).await?;
        let container_id = id.clone();
        match action.as_str() {
            "start" => client.call(&StartContainer { container_id }).await?,
            "stop" => client.call(&StopContainer { container_id }).await?,
            "restart" => client.call(&RestartContainer { container_id }).await?,
            other => return Err(ControlError::NotFound(format!("container action {other}"))),
        };
        Ok(StatusCode::NO_CONTENT)
    }
    .await;
    audited(&state, &caller, &format!("containers.{action}"), &id, &res);
    res
}

async fn check_ports(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<CheckPorts>, JsonRejection>,
) -> ControlResult<Json<PortCheckReply>> {
    let Json(req) = body.map_err(|e| ControlError::BadRequest(e.body_text()))?;
    let client = state.lifecycle.client(&name).await?;
    Ok(Json(client.call(&req).await?))
}

async fn list_servers(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ControlResult<Json<Vec<ServerRecord>>> {
    Ok(Json(state.lifecycle.list(&name).await?))
}

async fn get_server(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, Uuid)>,
) -> ControlResult<Json<ServerRecord>> {
    Ok(Json(state.lifecycle.get(&name, id).await?))
}

async fn create_server(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
    body: Result<Json<NewServerRequest>, JsonRejection>,
) -> ControlResult<(StatusCode, Json<ServerRecord>)> {
    let Json(req) = body.map_err(|e| ControlError::BadRequest(e.body_text()))?;
    let target = format!("{name}/{}", req.name);
    let res = state.lifecycle.create(&name, req).await;
    audited(&state, &caller, "servers.create", &target, &res);
    Ok((StatusCode::CREATED, Json(res?)))
}

async fn start_server(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((name, id)): Path<(String, Uuid)>,
) -> ControlResult<Json<ServerRecord>> {
    let res = state.lifecycle.start(&name, id).await;
    audited(&state, &caller, "servers.start", &id.to_string(), &res);
    Ok(Json(res?))
}

async fn stop_server(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((name, id)): Path<(String, Uuid)>,
) -> ControlResult<Json<ServerRecord>> {
    let res = state.lifecycle.stop(&name, id).await;
    audited(&state, &caller, "servers.stop", &id.to_string(), &res);
    Ok(Json(res?))
}

async fn rebuild_server(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((name, id)): Path<(String, Uuid)>,
) -> ControlResult<Json<ServerRecord>> {
    let res = state.lifecycle.rebuild(&name, id).await;
    audited(&state, &caller, "servers.rebuild", &id.to_string(), &res);
    Ok(Json(res?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody {
    #[serde(default)]
    container_id: Option<String>,
    #[serde(default)]
    remove_volumes: bool,
}

async fn delete_server(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((name, id)): Path<(String, Uuid)>,
    body: Option<Json<DeleteBody>>,
) -> ControlResult<Json<ServerRecord>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let res = state
        .lifecycle
        .delete(&name, id, body.remove_volumes, body.container_id.as_deref())
        .await;
    audited(&state, &caller, "servers.delete", &id.to_string(), &res);
    Ok(Json(res?))
}

async fn sync_servers(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> ControlResult<Json<SyncReport>> {
    let res = async {
        let client = state.lifecycle.client(&name).await?;
        state.reconciler.sync(&client).await
    }
    .await;
    audited(&state, &caller, "servers.sync", &name, &res);
    Ok(Json(res?))
}

#[derive(Debug, Serialize)]
struct PurgeResponse {
    purged: u64,
}

async fn purge_servers(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> ControlResult<Json<PurgeResponse>> {
    let res = state.lifecycle.purge(&name).await;
    audited(&state, &caller, "servers.purge", &name, &res);
    Ok(Json(PurgeResponse { purged: res? }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    container_id: String,
}

async fn logs_ws(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
    ws: WebSocketUpgrade,
) -> ControlResult<Response> {
    let link = state
        .hubs
        .get(&name)
        .await
        .ok_or_else(|| ControlError::NotFound(format!("agent {name}")))?;
    let client = AgentClient::new(link.hub, state.config.request_timeout);
    let logs = link.logs;
    Ok(ws
        .on_upgrade(move |socket| stream_logs(socket, logs, client, query.container_id))
        .into_response())
}

async fn stream_logs(socket: WebSocket, logs: LogFanout, client: AgentClient, container_id: String) {
    let span = tracing::info_span!("logs_ws", agent = client.agent(), container = %container_id);
    async move {
        let (mut sender, mut receiver) = socket.split();
        let LogSubscription {
            backlog,
            mut live,
            first_viewer,
            epoch,
        } = logs.subscribe(&container_id);

        if first_viewer {
            let attach = AttachLogs {
                container_id: container_id.clone(),
            };
            if let Err(err) = client.call(&attach).await {
                tracing::warn!(%err, "agent did not start streaming logs");
                let body = serde_json::json!({ "error": { "code": err.code(), "message": err.to_string() } });
                let _ = sender.send(Message::Text(body.to_string())).await;
            }
        }

        let mut open = true;
        for line in backlog {
            if send_line(&mut sender, &line).await.is_err() {
                open = false;
                break;
            }
        }

        while open {
            tokio::select! {
                next = live.recv() => match next {
                    Ok(line) => open = send_line(&mut sender, &line).await.is_ok(),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "log viewer lagging");
                    }
                    Err(RecvError::Closed) => {
                        let _ = sender.send(Message::Close(None)).await;
                        open = false;
                    }
                },
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => open = false,
                    Some(Ok(_)) => {}
                },
            }
        }

        if logs.unsubscribe(&container_id, epoch) {
            let detach = DetachLogs {
                container_id: container_id.clone(),
            };
            if let Err(err) = client.notify(&detach).await {
                tracing::debug!(%err, "log detach failed");
            }
        }
    }
    .instrument(span)
    .await
}

async fn send_line<S>(sender: &mut S, line: &garrison_proto::LogLine) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(line).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}
