use futures_util::future::{self, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};

use super::{Connector, SocketSink, SocketStream};
use crate::protocol::Frame;
use crate::{KartonError, KartonResult};

/// Dials a karton server over websocket, e.g. `ws://localhost:3000/karton`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Create a connector for a `ws://` or `wss://` url
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Get the server url
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'static, KartonResult<(SocketSink, SocketStream)>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| KartonError::WebSocket(e.to_string()))?;
            info!("WebSocket connected to {}", url);

            let (sink, stream) = socket.split();
            let sink = sink
                .sink_map_err(|e| KartonError::WebSocket(e.to_string()))
                .with(|frame: Frame| future::ready(Ok::<_, KartonError>(to_ws_message(frame))));
            let stream = stream.filter_map(|message| {
                future::ready(match message {
                    Ok(message) => from_ws_message(message).map(Ok),
                    Err(e) => Some(Err(KartonError::WebSocket(e.to_string()))),
                })
            });

            let sink: SocketSink = Box::pin(sink);
            let stream: SocketStream = Box::pin(stream);
            Ok((sink, stream))
        })
    }
}

fn to_ws_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Binary(data) => WsMessage::Binary(data),
        Frame::Close(reason) => WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Owned(reason.unwrap_or_default()),
        })),
    }
}

fn from_ws_message(message: WsMessage) -> Option<Frame> {
    match message {
        WsMessage::Text(text) => Some(Frame::Text(text)),
        WsMessage::Binary(data) => Some(Frame::Binary(data)),
        WsMessage::Close(frame) => Some(Frame::Close(
            frame.map(|frame| frame.reason.into_owned()),
        )),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {
            debug!("Ignoring websocket control frame");
            None
        }
    }
}
