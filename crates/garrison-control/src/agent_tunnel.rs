use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use garrison_proto::is_valid_subject;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::error::ControlError;
use crate::hub::{HubHandle, Outbound};
use crate::state::AppState;

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub name: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

fn auth_ok(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    bearer_token(headers).is_some_and(|got| got == expected)
}

/// `GET /ws?name=<agent>`: an agent dials in.
pub async fn agent_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Option<Query<ConnectQuery>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !auth_ok(state.config.agent_token.as_deref(), &headers) {
        return ControlError::Unauthorized.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            return ControlError::BadRequest(format!("websocket upgrade required: {rejection}"))
                .into_response();
        }
    };
    let Some(Query(query)) = query else {
        return ControlError::BadRequest("missing agent name".into()).into_response();
    };
    let name = query.name.trim().to_string();
    if !is_valid_subject(&name) {
        return ControlError::BadRequest(format!("invalid agent name: {name:?}")).into_response();
    }

    let link = state.hubs.get_or_spawn(&name).await;
    ws.on_upgrade(move |socket| handle_agent_socket(link.hub, socket))
        .into_response()
}

async fn handle_agent_socket(hub: HubHandle, socket: WebSocket) {
    let span = tracing::info_span!("agent_ws", agent = %hub.agent());
    async move {
        let (mut sender, mut receiver) = socket.split();

        let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
        let generation = match hub.attach(tx).await {
            Ok(g) => g,
            Err(err) => {
                tracing::warn!(%err, "hub refused connection");
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        };

        let writer = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outbound::Text(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let mut error = None;
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => hub.inbound(generation, text).await,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => hub.inbound(generation, text).await,
                    Err(_) => tracing::debug!("ignoring non-utf8 binary frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    error = Some(err.to_string());
                    break;
                }
            }
        }

        hub.closed(generation, error).await;
        writer.abort();
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(auth).unwrap(),
        );
        h
    }

    #[test]
    fn token_is_optional_until_configured() {
        assert!(auth_ok(None, &HeaderMap::new()));
        assert!(!auth_ok(Some("s3cret"), &HeaderMap::new()));
        assert!(auth_ok(Some("s3cret"), &headers("Bearer s3cret")));
        assert!(!auth_ok(Some("s3cret"), &headers("Bearer nope")));
        assert!(!auth_ok(Some("s3cret"), &headers("Basic s3cret")));
        assert!(!auth_ok(Some("s3cret"), &headers("Bearer ")));
    }
}
