use thiserror::Error;

use crate::audio::DeviceError;
use crate::config::ConfigError;
use crate::realtime::SessionError;
use crate::tools::ToolError;
use crate::wake::WakeError;

pub type Result<T> = std::result::Result<T, EdgeError>;

#[derive(Error, Debug)]
pub enum EdgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Wake word error: {0}")]
    Wake(#[from] WakeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refuse() -> Result<()> {
        let polled: std::result::Result<(), WakeError> = Err(WakeError::Disconnected);
        polled?;
        Ok(())
    }

    #[test]
    fn test_module_errors_convert() {
        match refuse() {
            Err(EdgeError::Wake(WakeError::Disconnected)) => {}
            other => panic!("Expected wake error, got {:?}", other),
        }
        let e: EdgeError = ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()).into();
        assert!(e.to_string().starts_with("Configuration error"));
    }
}
