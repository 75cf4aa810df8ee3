use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod engine;
pub mod events;
pub mod transport;

pub use config::{SessionConfig, TurnDetection};
pub use engine::{EngineState, IntentSender, SessionEngine};
pub use events::{Intent, Occurrence, Speaker};
pub use transport::{ChannelConnector, Connector, FrameReader, FrameWriter, RemoteEnd, WebSocketConnector};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("No confirmation from the agent within {0:?}")]
    ConfigurationTimeout(Duration),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Stream closed by remote")]
    StreamClosed,
    #[error("Session not ready to send (state: {state})")]
    NotReady { state: EngineState },
    #[error("Transport error: {0}")]
    Transport(String),
}
