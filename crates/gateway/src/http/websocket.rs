use axum::Extension;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rpb_contracts::ErrorKind;
use serde::Deserialize;

use super::{RequestId, json_error};
use crate::Gateway;
use crate::messaging::{SubscriberRegistry, Subscription};

pub(super) async fn generate_ticket(State(gateway): State<Gateway>) -> String {
    gateway.tickets.issue()
}

#[derive(Debug, Deserialize)]
pub(super) struct TicketQuery {
    #[serde(rename = "session-ticket")]
    session_ticket: Option<String>,
}

/// Admits a side-channel connection on a single-use ticket. Only a valid
/// upgrade request consumes the ticket, and a rejected caller never gets a
/// socket.
pub(super) async fn upgrade(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<TicketQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let ticket = query.session_ticket.unwrap_or_default();
    if !gateway.tickets.validate(ticket.trim()) {
        tracing::info!("side channel rejected: invalid or expired ticket");
        return json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_TICKET_REJECTED",
            ErrorKind::AuthRejected,
            "session ticket is invalid, expired or already used",
            &request_id,
            false,
        )
        .into_response();
    }

    let subscription = gateway.subscribers.register();
    let registry = gateway.subscribers.clone();
    ws.on_upgrade(move |socket| serve_subscriber(socket, subscription, registry))
}

async fn serve_subscriber(
    mut socket: WebSocket,
    mut subscription: Subscription,
    registry: SubscriberRegistry,
) {
    tracing::info!(subscriber_id = %subscription.id, "side channel opened");

    loop {
        tokio::select! {
            outbound = subscription.receiver.recv() => {
                let Some(payload) = outbound else {
                    break;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }

            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                    let close = CloseFrame {
                        code: close_code::UNSUPPORTED,
                        reason: "not supported".into(),
                    };
                    let _ = socket.send(Message::Close(Some(close))).await;
                    break;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    registry.deregister(&subscription.id);
    tracing::info!(subscriber_id = %subscription.id, "side channel closed");
}
