use std::sync::Arc;

use async_stream::stream;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::{IntoResponse, Response},
    Extension,
};
use common::protocol::{ClientRequest, ServerMessage};
use futures::{pin_mut, SinkExt, StreamExt};
use hyper::StatusCode;
use serde::Deserialize;
use tokio::{join, select, sync::{mpsc, oneshot}};
use tracing::{debug, warn};

use crate::{hub::Hub, multiplexer::ClientId, router};

#[derive(Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

pub async fn connect(ws: WebSocketUpgrade, query: Query<ConnectQuery>, hub: Extension<Arc<Hub>>) -> Response {
    if !hub.authorize(query.token.as_deref()) {
        warn!("Rejected a websocket connection with a bad access token");
        return (StatusCode::UNAUTHORIZED, "Invalid access token").into_response();
    }
    let hub = hub.0;
    ws.on_upgrade(move |socket| async move {
        let (client, outbound) = hub.connect();
        serve(&hub, client, socket, outbound).await;
        hub.disconnect(client);
    })
}

async fn serve(hub: &Hub, client: ClientId, socket: WebSocket, mut outbound: mpsc::UnboundedReceiver<ServerMessage>) {
    let (mut writer, mut reader) = socket.split();
    let (closer, mut close_listen) = oneshot::channel::<()>();
    let messages = stream! {
        while let Some(message) = outbound.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => yield Message::Text(text),
                Err(error) => warn!("Failed to serialize {:?}: {}", message, error),
            }
        }
    };
    let (writer, reader) = join! {
        async move {
            pin_mut!(messages);
            loop {
                select! {
                    next = messages.next() => match next {
                        Some(message) => if writer.send(message).await.is_err() {
                            break
                        },
                        None => break,
                    },
                    _ = &mut close_listen => break,
                }
            }
            writer
        },
        async move {
            while let Some(Ok(message)) = reader.next().await {
                match message {
                    Message::Text(text) => match ClientRequest::parse(&text) {
                        Ok(request) => router::dispatch(hub, client, request).await,
                        Err(error) => {
                            debug!("Client {} sent a malformed request: {}", client, error);
                            hub.multiplexer.send_to(client, ServerMessage::error(None, format!("malformed request: {}", error)));
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            drop(closer.send(()));
            reader
        }
    };
    if let Ok(together) = reader.reunite(writer) {
        drop(together.close().await);
    }
}
