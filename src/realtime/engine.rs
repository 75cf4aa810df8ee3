use super::events::{decode, ClientEvent, Decoded, Intent, Occurrence};
use super::transport::{Connector, FrameReader, FrameWriter};
use super::{SessionConfig, SessionError};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EngineState {
    Disconnected,
    Connecting,
    Configuring,
    Active,
    Closing,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Connecting,
            2 => EngineState::Configuring,
            3 => EngineState::Active,
            4 => EngineState::Closing,
            _ => EngineState::Disconnected,
        }
    }
}

#[derive(Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: EngineState) {
        log::debug!("Engine state -> {}", state);
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

type Outbound = Arc<Mutex<Option<Box<dyn FrameWriter>>>>;

/// Cloneable handle for sending intents from other tasks. All senders share
/// one writer; frames go out whole and in call order.
#[derive(Clone)]
pub struct IntentSender {
    outbound: Outbound,
    state: SharedState,
}

impl IntentSender {
    pub async fn send(&self, intent: &Intent) -> Result<(), SessionError> {
        self.ensure_active()?;
        let text = ClientEvent::from(intent)
            .to_text()
            .map_err(|e| SessionError::Protocol(e.to_string()))?;

        let mut outbound = self.outbound.lock().await;
        // close() may have won the lock while we waited
        self.ensure_active()?;
        let writer = outbound.as_mut().ok_or(SessionError::StreamClosed)?;
        writer.send(text).await
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.state.get() {
            EngineState::Active => Ok(()),
            state => Err(SessionError::NotReady { state }),
        }
    }
}

/// One realtime session over one duplex stream. Not restartable: a new
/// engine is needed for every session.
pub struct SessionEngine {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    state: SharedState,
    outbound: Outbound,
    reader: Option<Box<dyn FrameReader>>,
    pending: VecDeque<Occurrence>,
    stream_ended: bool,
    used: bool,
    session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

impl SessionEngine {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            state: SharedState(Arc::new(AtomicU8::new(EngineState::Disconnected as u8))),
            outbound: Arc::new(Mutex::new(None)),
            reader: None,
            pending: VecDeque::new(),
            stream_ended: false,
            used: false,
            session_id: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn sender(&self) -> IntentSender {
        IntentSender {
            outbound: Arc::clone(&self.outbound),
            state: self.state.clone(),
        }
    }

    /// Open the stream, send `session.update` and wait for the agent to
    /// confirm. Ends in `Active` on success and `Disconnected` otherwise.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.used {
            return Err(SessionError::NotReady {
                state: self.state.get(),
            });
        }
        self.used = true;

        self.state.set(EngineState::Connecting);
        let (writer, reader) = match self.connector.open().await {
            Ok(ends) => ends,
            Err(e) => {
                self.state.set(EngineState::Disconnected);
                return Err(e);
            }
        };
        *self.outbound.lock().await = Some(writer);
        self.reader = Some(reader);
        self.state.set(EngineState::Configuring);

        match self.configure().await {
            Ok(()) => {
                self.started_at = Some(Utc::now());
                self.state.set(EngineState::Active);
                log::info!(
                    "✅ Session active (id: {})",
                    self.session_id.as_deref().unwrap_or("unknown")
                );
                Ok(())
            }
            Err(e) => {
                log::error!("❌ Session configuration failed: {}", e);
                self.close().await;
                Err(e)
            }
        }
    }

    async fn configure(&mut self) -> Result<(), SessionError> {
        let update = ClientEvent::SessionUpdate {
            session: self.config.to_session_object(),
        }
        .to_text()
        .map_err(|e| SessionError::Protocol(e.to_string()))?;

        {
            let mut outbound = self.outbound.lock().await;
            let writer = outbound
                .as_mut()
                .ok_or_else(|| SessionError::Connect("writer missing".to_string()))?;
            writer
                .send(update)
                .await
                .map_err(|e| SessionError::Connect(e.to_string()))?;
        }
        log::info!(
            "📤 Sent session.update ({} tools, voice {})",
            self.config.tools.len(),
            self.config.voice
        );

        let timeout = self.config.configuration_timeout;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SessionError::Connect("reader missing".to_string()))?;

        let received = tokio::time::timeout(timeout, reader.receive()).await;
        let text = match received {
            Err(_) => return Err(SessionError::ConfigurationTimeout(timeout)),
            Ok(None) => {
                self.stream_ended = true;
                return Err(SessionError::Connect(
                    "stream closed during configuration".to_string(),
                ));
            }
            Ok(Some(Err(e))) => return Err(SessionError::Connect(e.to_string())),
            Ok(Some(Ok(text))) => text,
        };

        let decoded = decode(&text);
        if let Some(Occurrence::ProtocolError(reason)) = &decoded.occurrence {
            return Err(SessionError::Protocol(reason.clone()));
        }
        self.absorb(decoded);
        Ok(())
    }

    /// Send one intent. Rejected with `NotReady` outside `Active`.
    pub async fn send(&self, intent: &Intent) -> Result<(), SessionError> {
        self.sender().send(intent).await
    }

    /// Next inbound occurrence in receive order, except that a pending tool
    /// call is delivered before a pending turn-complete. Yields
    /// `StreamClosed` forever once the stream has ended. Cancel-safe.
    pub async fn next_occurrence(&mut self) -> Occurrence {
        loop {
            if let Some(occurrence) = self.take_pending() {
                return occurrence;
            }
            if self.stream_ended {
                return Occurrence::StreamClosed;
            }

            let received = match self.reader.as_mut() {
                Some(reader) => reader.receive().await,
                None => None,
            };
            self.handle_received(received);
        }
    }

    /// Close the stream. Safe to call any number of times.
    pub async fn close(&mut self) {
        if self.state.get() == EngineState::Disconnected && self.reader.is_none() {
            return;
        }
        self.state.set(EngineState::Closing);

        let writer = self.outbound.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Error closing realtime stream: {}", e),
                Err(_) => log::warn!("Timed out closing realtime stream"),
            }
        }
        self.reader = None;
        self.stream_ended = true;
        self.state.set(EngineState::Disconnected);
        log::info!("🔌 Realtime stream closed");
    }

    fn take_pending(&mut self) -> Option<Occurrence> {
        if matches!(self.pending.front(), Some(Occurrence::TurnComplete)) {
            self.drain_ready();
            if let Some(index) = self
                .pending
                .iter()
                .position(|o| matches!(o, Occurrence::ToolCallReady(_)))
            {
                return self.pending.remove(index);
            }
        }
        self.pending.pop_front()
    }

    fn drain_ready(&mut self) {
        while !self.stream_ended {
            let Some(reader) = self.reader.as_mut() else {
                self.stream_ended = true;
                break;
            };
            let ready = reader.receive().now_or_never();
            match ready {
                Some(received) => self.handle_received(received),
                None => break,
            }
        }
    }

    fn handle_received(&mut self, received: Option<Result<String, SessionError>>) {
        match received {
            Some(Ok(text)) => {
                log::trace!("📥 {}", text);
                let decoded = decode(&text);
                self.absorb(decoded);
            }
            Some(Err(e)) => {
                log::warn!("Realtime stream failed: {}", e);
                self.stream_ended = true;
            }
            None => {
                log::info!("Realtime stream ended");
                self.stream_ended = true;
            }
        }
    }

    fn absorb(&mut self, decoded: Decoded) {
        if let Some(id) = decoded.session_id {
            log::debug!("Session id: {}", id);
            self.session_id = Some(id);
        }
        if let Some(occurrence) = decoded.occurrence {
            if let Occurrence::ProtocolError(reason) = &occurrence {
                log::warn!("⚠️ Protocol error: {}", reason);
            }
            self.pending.push_back(occurrence);
        }
    }
}
