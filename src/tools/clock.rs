use super::{ToolDescriptor, ToolError, ToolExecutor, ToolOutcome, ToolRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Reports the device's local time
pub struct GetTime;

#[async_trait]
impl ToolExecutor for GetTime {
    async fn execute(&self, _arguments: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        Ok(describe(Local::now()))
    }
}

fn describe(now: DateTime<Local>) -> ToolOutcome {
    // Natural form without the leading zero, e.g. "3:05 PM"
    let time_str = now.format("%I:%M %p").to_string();
    let time_str = time_str.trim_start_matches('0');

    ToolOutcome::success(
        json!({
            "current_time": time_str,
            "timestamp": now.timestamp(),
            "hour": now.hour(),
            "minute": now.minute(),
            "period": now.format("%p").to_string()
        }),
        format!("It's {}", time_str),
    )
}

pub fn register(registry: &mut ToolRegistry) {
    registry.register(
        ToolDescriptor::new("get_time", "Get the current local time on the device"),
        Arc::new(GetTime),
    );
}
