//! Duplex text-frame streams: the WebSocket used in production and an
//! in-process channel pair for loopback.

use super::SessionError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use secrecy::{ExposeSecret, SecretBox};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[async_trait]
pub trait FrameWriter: Send {
    async fn send(&mut self, text: String) -> Result<(), SessionError>;
    async fn close(&mut self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait FrameReader: Send {
    /// Next text frame, `None` once the stream has ended. Cancel-safe.
    async fn receive(&mut self) -> Option<Result<String, SessionError>>;
}

/// Opens one duplex stream per call
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>), SessionError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketConnector {
    url: String,
    api_key: SecretBox<String>,
}

impl WebSocketConnector {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: SecretBox::new(Box::new(api_key.to_string())),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>), SessionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Connect(e.to_string()))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose_secret()))
            .map_err(|e| SessionError::Connect(format!("invalid API key header: {}", e)))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        log::info!("🔌 Connecting to {}", self.url);
        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        log::debug!("🔌 Handshake complete ({})", response.status());

        let (sink, stream) = ws_stream.split();
        Ok((
            Box::new(WebSocketWriter { sink }),
            Box::new(WebSocketReader { stream }),
        ))
    }
}

struct WebSocketWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send(&mut self, text: String) -> Result<(), SessionError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.sink
            .close()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn receive(&mut self) -> Option<Result<String, SessionError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => {
                    log::debug!("Ignoring binary frame ({} bytes)", data.len());
                }
                Ok(Message::Close(frame)) => {
                    log::info!("🔌 Server closed connection: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(SessionError::Transport(e.to_string()))),
            }
        }
    }
}

/// In-process connector. Frames written by the session show up at the
/// [`RemoteEnd`]; frames pushed there are read by the session.
pub struct ChannelConnector {
    ends: Mutex<Option<(ChannelWriter, ChannelReader)>>,
}

impl ChannelConnector {
    pub fn pair() -> (Self, RemoteEnd) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let connector = Self {
            ends: Mutex::new(Some((
                ChannelWriter {
                    tx: Some(outbound_tx),
                },
                ChannelReader { rx: inbound_rx },
            ))),
        };
        let remote = RemoteEnd {
            sent: outbound_rx,
            inbound: Some(inbound_tx),
        };
        (connector, remote)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn open(&self) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>), SessionError> {
        let (writer, reader) = self
            .ends
            .lock()
            .await
            .take()
            .ok_or_else(|| SessionError::Connect("channel already opened".to_string()))?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

struct ChannelWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn send(&mut self, text: String) -> Result<(), SessionError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SessionError::Transport("writer closed".to_string()))?;
        tx.send(text)
            .map_err(|_| SessionError::Transport("remote end dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.tx = None;
        Ok(())
    }
}

struct ChannelReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn receive(&mut self) -> Option<Result<String, SessionError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// The agent's side of a [`ChannelConnector`]
pub struct RemoteEnd {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<String>>,
}

impl RemoteEnd {
    /// Next frame written by the session, `None` once its writer is closed
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Next frame written by the session, parsed as JSON
    pub async fn next_event(&mut self) -> Option<Value> {
        let text = self.next_sent().await?;
        serde_json::from_str(&text).ok()
    }

    /// Frames already written, without waiting
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            frames.push(text);
        }
        frames
    }

    pub fn push(&self, event: Value) -> bool {
        self.push_text(event.to_string())
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(text.into()).is_ok())
            .unwrap_or(false)
    }

    /// End the inbound stream
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_roundtrip() {
        let (connector, mut remote) = ChannelConnector::pair();
        let (mut writer, mut reader) = connector.open().await.unwrap();

        writer.send(r#"{"type":"response.create"}"#.to_string()).await.unwrap();
        assert_eq!(remote.next_event().await, Some(json!({"type": "response.create"})));

        assert!(remote.push(json!({"type": "response.done"})));
        assert_eq!(
            reader.receive().await.unwrap().unwrap(),
            r#"{"type":"response.done"}"#
        );

        remote.hang_up();
        assert!(reader.receive().await.is_none());

        writer.close().await.unwrap();
        assert!(remote.next_sent().await.is_none());
        assert!(writer.send("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_opens_once() {
        let (connector, _remote) = ChannelConnector::pair();
        assert!(connector.open().await.is_ok());
        assert!(matches!(
            connector.open().await,
            Err(SessionError::Connect(_))
        ));
    }
}
