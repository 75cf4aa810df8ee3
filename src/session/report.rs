use chrono::{DateTime, Utc};
use std::time::Duration;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum EndReason {
    UserTerminated,
    RemoteClosed,
    ProtocolError,
    WriteFailed,
    MaxDuration,
    Cancelled,
    ConnectFailed,
    DeviceFailed,
}

impl EndReason {
    /// Ended before any conversation could happen
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            EndReason::ConnectFailed
                | EndReason::DeviceFailed
                | EndReason::ProtocolError
                | EndReason::WriteFailed
        )
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub end_reason: EndReason,
    /// Last error seen on the way out, if any
    pub detail: Option<String>,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub tool_calls_executed: usize,
    pub results_sent: usize,
    pub frames_captured: usize,
    pub frames_sent: usize,
    pub frames_played: usize,
}

impl SessionReport {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            end_reason: EndReason::Cancelled,
            detail: None,
            session_id: None,
            started_at,
            duration: Duration::ZERO,
            tool_calls_executed: 0,
            results_sent: 0,
            frames_captured: 0,
            frames_sent: 0,
            frames_played: 0,
        }
    }

    pub(crate) fn ended(mut self, reason: EndReason, detail: Option<String>) -> Self {
        self.end_reason = reason;
        self.detail = detail;
        self.duration = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        self
    }

    pub fn log_summary(&self) {
        let summary = format!(
            "session {} ended: {} after {:.1}s ({} tool calls, {} results, {}/{} frames up, {} chunks down)",
            self.session_id.as_deref().unwrap_or("-"),
            self.end_reason,
            self.duration.as_secs_f32(),
            self.tool_calls_executed,
            self.results_sent,
            self.frames_sent,
            self.frames_captured,
            self.frames_played
        );
        match (&self.detail, self.end_reason.is_failure()) {
            (Some(detail), true) => log::warn!("⚠️ {}: {}", summary, detail),
            (_, true) => log::warn!("⚠️ {}", summary),
            _ => log::info!("📋 {}", summary),
        }
    }
}
