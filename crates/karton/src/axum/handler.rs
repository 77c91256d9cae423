use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::future;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::protocol::Frame;
use crate::server::KartonServer;

/// Feeds one upgraded WebSocket into a [`KartonServer`] session
pub struct WebSocketHandler {
    socket: WebSocket,
    server: KartonServer,
}

impl WebSocketHandler {
    /// Create a new WebSocket handler
    pub fn new(socket: WebSocket, server: KartonServer) -> Self {
        Self { socket, server }
    }

    /// Run the session until the connection closes
    pub async fn handle(self) {
        let (ws_sender, ws_receiver) = self.socket.split();

        let sink = ws_sender.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_ws_message(frame))));
        let stream = ws_receiver.filter_map(|message| {
            future::ready(match message {
                Ok(message) => from_ws_message(message).map(Ok),
                Err(e) => Some(Err(e)),
            })
        });

        let session = match self.server.accept(sink, stream) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to start session for WebSocket connection: {}", e);
                return;
            }
        };

        info!(
            "New WebSocket connection established for session {}",
            session.id()
        );
        session.transport().closed().await;
        info!("WebSocket connection ended for session {}", session.id());
    }
}

fn to_ws_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Close(reason) => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: reason.unwrap_or_default().into(),
        })),
    }
}

fn from_ws_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
        Message::Close(frame) => Some(Frame::Close(
            frame.map(|frame| frame.reason.as_str().to_owned()),
        )),
        Message::Ping(_) => {
            // Axum handles pong responses automatically
            debug!("Received ping");
            None
        }
        Message::Pong(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_map_onto_websocket_messages() {
        let text = to_ws_message(Frame::Text("{}".to_string()));
        assert_eq!(from_ws_message(text), Some(Frame::Text("{}".to_string())));

        let binary = to_ws_message(Frame::Binary(vec![1, 2, 3]));
        assert_eq!(from_ws_message(binary), Some(Frame::Binary(vec![1, 2, 3])));

        let close = to_ws_message(Frame::Close(None));
        assert_eq!(from_ws_message(close), Some(Frame::Close(Some(String::new()))));
    }
}
