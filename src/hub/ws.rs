//! Websocket delivery of hub events.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use super::HubHandle;
use crate::project::ProjectId;

/// Serves one observer until either side goes away.
pub async fn observe(socket: WebSocket, hub: HubHandle, filter: Option<ProjectId>) {
    let mut observer = match hub.connect(filter).await {
        Ok(observer) => observer,
        Err(e) => {
            log::error!("Unable to register observer: {e}");
            return;
        }
    };
    let id = observer.id;
    let (mut sender, mut receiver) = socket.split();

    let writer = async {
        while let Some(event) = observer.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Unable to encode event: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    };

    // Incoming messages are ignored; reading keeps ping/pong and close
    // handling alive.
    let reader = async {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    hub.disconnect(id);
    log::debug!("Observer {id} session closed");
}
