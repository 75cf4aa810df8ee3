//! Drives one voice session from connect to teardown.

use crate::audio::{AudioDevices, AudioPump, DEFAULT_QUEUE_DEPTH};
use crate::realtime::{
    Connector, Intent, IntentSender, Occurrence, SessionConfig, SessionEngine, SessionError,
    Speaker,
};
use crate::tools::{ToolCallResult, ToolRegistry};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod report;

pub use report::{EndReason, SessionReport};

/// Said by the user, these end the conversation
const TERMINATION_PHRASES: [&str; 5] = ["goodbye", "bye", "stop", "exit", "end"];

pub const DEFAULT_MAX_SESSION: Duration = Duration::from_secs(5 * 60);

/// Case-insensitive containment, so "okay, goodbye now" and "weekend" both match
pub fn is_termination_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    TERMINATION_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// `None` lets a session run until the user or the agent ends it
    pub max_duration: Option<Duration>,
    pub queue_depth: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_duration: Some(DEFAULT_MAX_SESSION),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Anything that can run one session to completion
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn run_session(&self, cancel: CancellationToken) -> SessionReport;
}

#[derive(Default)]
struct Counts {
    tool_calls: usize,
    results_sent: usize,
}

/// Owns everything a live session holds. `run` stops the pump and closes the
/// stream; the second call is a no-op. Dropping it un-run aborts the audio
/// tasks.
struct Teardown {
    engine: SessionEngine,
    pump: AudioPump,
    done: bool,
}

impl Teardown {
    async fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        log::info!("🧹 Tearing down session");
        // Neither step can fail the other; both log their own problems
        self.pump.stop().await;
        self.engine.close().await;
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.done {
            log::warn!("Session dropped without teardown, aborting audio tasks");
        }
    }
}

pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    devices: Arc<dyn AudioDevices>,
    registry: Arc<ToolRegistry>,
    session_config: SessionConfig,
    settings: SessionSettings,
    live: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        devices: Arc<dyn AudioDevices>,
        registry: Arc<ToolRegistry>,
        session_config: SessionConfig,
        settings: SessionSettings,
    ) -> Self {
        let session_config = session_config.with_tools(registry.descriptors());
        Self {
            connector,
            devices,
            registry,
            session_config,
            settings,
            live: Mutex::new(()),
        }
    }

    /// Run one session. Never fails: every outcome is described by the
    /// returned report. Sessions never overlap; a second call waits for the
    /// first to tear down.
    pub async fn run_session(&self, cancel: CancellationToken) -> SessionReport {
        let _live = self.live.lock().await;
        let report = SessionReport::new(Utc::now());

        log::info!("📞 Starting voice session");
        let mut engine = SessionEngine::new(Arc::clone(&self.connector), self.session_config.clone());
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(None),
            result = engine.connect() => result.map_err(Some),
        };
        match connected {
            Ok(()) => {}
            Err(None) => {
                engine.close().await;
                return report.ended(EndReason::Cancelled, None);
            }
            Err(Some(e)) => {
                log::error!("❌ Could not open session: {}", e);
                let reason = match e {
                    SessionError::Protocol(_) => EndReason::ProtocolError,
                    _ => EndReason::ConnectFailed,
                };
                return report.ended(reason, Some(e.to_string()));
            }
        }

        let mut report = report;
        report.session_id = engine.session_id().map(str::to_string);
        if let Some(started_at) = engine.started_at() {
            report.started_at = started_at;
        }

        let (source, sink) = match self.devices.open().await {
            Ok(devices) => devices,
            Err(e) => {
                log::error!("❌ Audio devices unavailable: {}", e);
                engine.close().await;
                return report.ended(EndReason::DeviceFailed, Some(e.to_string()));
            }
        };

        let pump = AudioPump::start(
            source,
            sink,
            Arc::new(engine.sender()),
            self.settings.queue_depth,
        );
        let stats = pump.stats();
        let mut session = Teardown {
            engine,
            pump,
            done: false,
        };

        let mut counts = Counts::default();
        let (reason, detail) = self.converse(&mut session, &cancel, &mut counts).await;

        session.run().await;

        report.tool_calls_executed = counts.tool_calls;
        report.results_sent = counts.results_sent;
        report.frames_captured = stats.frames_captured();
        report.frames_sent = stats.frames_sent();
        report.frames_played = stats.frames_played();
        report.ended(reason, detail)
    }

    async fn converse(
        &self,
        session: &mut Teardown,
        cancel: &CancellationToken,
        counts: &mut Counts,
    ) -> (EndReason, Option<String>) {
        let sender = session.engine.sender();
        let mut tools = ToolBatch::default();
        let (reason, detail) = self
            .consume(session, cancel, counts, &sender, &mut tools)
            .await;

        // Calls already dispatched still owe the agent a result
        if !tools.in_flight.is_empty() {
            log::info!(
                "🔧 Waiting for {} tool call(s) before ending the session",
                tools.in_flight.len()
            );
            while let Some(result) = tools.in_flight.next().await {
                if let Err(e) = submit(&sender, result, counts).await {
                    log::warn!("Tool result not delivered: {}", e);
                }
            }
        }
        (reason, detail)
    }

    async fn consume(
        &self,
        session: &mut Teardown,
        cancel: &CancellationToken,
        counts: &mut Counts,
        sender: &IntentSender,
        tools: &mut ToolBatch,
    ) -> (EndReason, Option<String>) {
        let deadline = self.settings.max_duration.map(|d| Instant::now() + d);
        let uplink_failed = session.pump.uplink_failed();

        loop {
            let occurrence = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (EndReason::Cancelled, None),
                _ = uplink_failed.cancelled() => {
                    return (EndReason::WriteFailed, Some("audio uplink failed".to_string()))
                }
                _ = deadline_elapsed(deadline) => {
                    log::info!("⏰ Maximum session duration reached");
                    return (EndReason::MaxDuration, None);
                }
                Some(result) = tools.in_flight.next(), if !tools.in_flight.is_empty() => {
                    let sent = match submit(sender, result, counts).await {
                        Ok(()) => {
                            tools.answered += 1;
                            tools.request_next_turn(sender).await
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        log::error!("❌ Failed to send tool results: {}", e);
                        return (EndReason::WriteFailed, Some(e.to_string()));
                    }
                    continue;
                }
                occurrence = session.engine.next_occurrence() => occurrence,
            };
            log::trace!("Occurrence: {}", occurrence.kind());

            match occurrence {
                Occurrence::AudioDelta(audio) => {
                    session.pump.play(audio);
                }
                Occurrence::TranscriptCompleted { speaker, text } => {
                    match speaker {
                        Speaker::User => log::info!("👤 User: {}", text),
                        Speaker::Agent => log::info!("🤖 Agent: {}", text),
                    }
                    if speaker == Speaker::User && is_termination_phrase(&text) {
                        log::info!("👋 User ended the conversation");
                        return (EndReason::UserTerminated, None);
                    }
                }
                Occurrence::ToolCallReady(request) => {
                    log::info!("🔧 Dispatching {} ({})", request.name, request.call_id);
                    tools.response_open = true;
                    let registry = Arc::clone(&self.registry);
                    tools
                        .in_flight
                        .push(async move { registry.invoke(&request).await }.boxed());
                }
                Occurrence::TurnComplete => {
                    log::debug!("Agent turn complete");
                    tools.response_open = false;
                    if let Err(e) = tools.request_next_turn(sender).await {
                        log::error!("❌ Failed to request next turn: {}", e);
                        return (EndReason::WriteFailed, Some(e.to_string()));
                    }
                }
                Occurrence::ProtocolError(reason) => {
                    return (EndReason::ProtocolError, Some(reason));
                }
                Occurrence::StreamClosed => {
                    log::info!("🔌 Agent closed the session");
                    return (EndReason::RemoteClosed, None);
                }
            }
        }
    }
}

/// Tool calls of the current agent response. Results go out as each call
/// completes; `response.create` waits until every call is answered and the
/// response that issued them is done.
#[derive(Default)]
struct ToolBatch {
    in_flight: FuturesUnordered<BoxFuture<'static, ToolCallResult>>,
    /// Results sent since the last `response.create`
    answered: usize,
    /// A response has issued calls and not yet completed
    response_open: bool,
}

impl ToolBatch {
    async fn request_next_turn(&mut self, sender: &IntentSender) -> Result<(), SessionError> {
        if self.answered == 0 || self.response_open || !self.in_flight.is_empty() {
            return Ok(());
        }
        log::info!("🔧 {} tool result(s) sent, requesting next turn", self.answered);
        self.answered = 0;
        sender.send(&Intent::RequestNextTurn).await
    }
}

async fn submit(
    sender: &IntentSender,
    result: ToolCallResult,
    counts: &mut Counts,
) -> Result<(), SessionError> {
    counts.tool_calls += 1;
    log::info!(
        "🔧 Result for {}: success={} ({})",
        result.call_id,
        result.success,
        result.message
    );
    sender.send(&Intent::SubmitToolResult(result)).await?;
    counts.results_sent += 1;
    Ok(())
}

#[async_trait]
impl SessionRunner for Orchestrator {
    async fn run_session(&self, cancel: CancellationToken) -> SessionReport {
        Orchestrator::run_session(self, cancel).await
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
