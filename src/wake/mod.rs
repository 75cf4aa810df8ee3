//! Outer loop: wait for the wake word, run one session, cool down, repeat.

use crate::session::SessionRunner;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod tcp;

pub use tcp::TcpWakeDetector;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);
/// Upper bound on how long a shutdown request waits for a pending detection
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum WakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Wakeword protocol error: {0}")]
    Protocol(String),
    #[error("Wakeword subscription failed: {0}")]
    Subscribe(String),
    #[error("Wakeword server disconnected")]
    Disconnected,
    #[error("Wake detection task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WakeEvent {
    pub model_name: String,
    pub confidence: f32,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub client_id: String,
}

/// A blocking wake word source. Runs on a blocking thread, never on the
/// async runtime.
pub trait WakeDetector: Send {
    /// Wait up to `timeout` for a detection
    fn poll(&mut self, timeout: Duration) -> Result<Option<WakeEvent>, WakeError>;

    /// Forget detections that arrived while nobody was waiting
    fn reset(&mut self) -> Result<(), WakeError> {
        Ok(())
    }

    /// Block until the wake word is heard (`true`) or `cancel` fires (`false`)
    fn block_until_detected(&mut self, cancel: &CancellationToken) -> Result<bool, WakeError> {
        while !cancel.is_cancelled() {
            if let Some(event) = self.poll(POLL_INTERVAL)? {
                log::info!(
                    "🎯 Wake word '{}' detected (confidence {:.3})",
                    event.model_name,
                    event.confidence
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub sessions_run: usize,
    pub detector_errors: usize,
}

pub struct WakeLoop {
    detector: Option<Box<dyn WakeDetector>>,
    runner: Arc<dyn SessionRunner>,
    cooldown: Duration,
    shutdown: CancellationToken,
}

impl WakeLoop {
    pub fn new(
        detector: Box<dyn WakeDetector>,
        runner: Arc<dyn SessionRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            detector: Some(detector),
            runner,
            cooldown: DEFAULT_COOLDOWN,
            shutdown,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Run until shutdown. Session outcomes and detector errors never end the
    /// loop; only a lost detector task does.
    pub async fn run(mut self) -> Result<LoopSummary, WakeError> {
        let mut summary = LoopSummary::default();

        while !self.shutdown.is_cancelled() {
            log::info!("👂 Listening for wake word...");
            match self.wait_for_wake().await? {
                Ok(false) => break,
                Ok(true) => {
                    summary.sessions_run += 1;
                    let report = self.runner.run_session(self.shutdown.child_token()).await;
                    report.log_summary();
                }
                Err(e) => {
                    summary.detector_errors += 1;
                    log::error!("❌ Wake detection failed: {}", e);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cooldown) => {}
            }
        }

        log::info!(
            "🛑 Wake loop stopped after {} session(s)",
            summary.sessions_run
        );
        Ok(summary)
    }

    /// Hand the detector to a blocking thread and take it back afterwards
    async fn wait_for_wake(&mut self) -> Result<Result<bool, WakeError>, WakeError> {
        let mut detector = self
            .detector
            .take()
            .ok_or_else(|| WakeError::Task("detector lost".to_string()))?;
        let cancel = self.shutdown.clone();

        let (detector, detected) = tokio::task::spawn_blocking(move || {
            let detected = detector
                .reset()
                .and_then(|()| detector.block_until_detected(&cancel));
            (detector, detected)
        })
        .await
        .map_err(|e| WakeError::Task(e.to_string()))?;

        self.detector = Some(detector);
        Ok(detected)
    }
}
