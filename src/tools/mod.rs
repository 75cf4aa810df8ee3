use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod clock;
pub mod descriptor;
pub mod hotel;

pub use descriptor::{ParamKind, ParameterSpec, ToolDescriptor};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),
    #[error("Tool timeout: {0}")]
    Timeout(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A single agent-issued invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// What an executor reports back; the registry attaches the call id
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Value,
    pub message: String,
}

impl ToolOutcome {
    pub fn success(result: Value, message: impl Into<String>) -> Self {
        Self {
            success: true,
            result,
            message: message.into(),
        }
    }

    pub fn failure(result: Value, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result,
            message: message.into(),
        }
    }
}

/// Outcome of one request, correlated by call id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResult {
    #[serde(skip)]
    pub call_id: String,
    pub success: bool,
    pub result: Value,
    pub message: String,
}

impl ToolCallResult {
    pub fn from_outcome(call_id: &str, outcome: ToolOutcome) -> Self {
        Self {
            call_id: call_id.to_string(),
            success: outcome.success,
            result: outcome.result,
            message: outcome.message,
        }
    }

    pub fn failed(call_id: &str, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.to_string(),
            success: false,
            result: Value::Null,
            message: message.into(),
        }
    }

    /// Text submitted as the function call output
    pub fn output_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            json!({"success": self.success, "message": self.message}).to_string()
        })
    }
}

/// A device action the agent may call by name
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<ToolOutcome, ToolError>;
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    executor: Arc<dyn ToolExecutor>,
}

pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a tool. A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, descriptor: ToolDescriptor, executor: Arc<dyn ToolExecutor>) {
        self.tools.retain(|t| t.descriptor.name != descriptor.name);
        self.tools.push(RegisteredTool {
            descriptor,
            executor,
        });
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|t| t.descriptor.clone()).collect()
    }

    fn find(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|t| t.descriptor.name == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run a request to completion. Never fails: unknown tools, bad arguments,
    /// executor errors and timeouts all come back as `success == false`.
    pub async fn invoke(&self, request: &ToolCallRequest) -> ToolCallResult {
        let Some(tool) = self.find(&request.name) else {
            log::warn!("🔧 Agent called unknown tool '{}'", request.name);
            return ToolCallResult::failed(
                &request.call_id,
                format!("unknown tool: {}", request.name),
            );
        };

        if let Err(e) = tool.descriptor.validate(&request.arguments) {
            log::warn!("🔧 Rejected call {} to '{}': {}", request.call_id, request.name, e);
            return ToolCallResult::failed(
                &request.call_id,
                format!("invalid arguments for {}: {}", request.name, e),
            );
        }

        log::info!(
            "🔧 Calling tool '{}' ({}) with {}",
            request.name,
            request.call_id,
            Value::Object(request.arguments.clone())
        );

        let executor = Arc::clone(&tool.executor);
        let outcome =
            match tokio::time::timeout(self.timeout, executor.execute(&request.arguments)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    log::error!("🔧 Tool '{}' failed: {}", request.name, e);
                    ToolOutcome::failure(json!({"error": e.to_string()}), e.to_string())
                }
                Err(_) => {
                    let e = ToolError::Timeout(format!(
                        "{} did not finish within {:?}",
                        request.name, self.timeout
                    ));
                    log::error!("🔧 {}", e);
                    ToolOutcome::failure(Value::Null, e.to_string())
                }
            };

        log::debug!(
            "🔧 Tool '{}' ({}) finished, success={}",
            request.name,
            request.call_id,
            outcome.success
        );
        ToolCallResult::from_outcome(&request.call_id, outcome)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the device tools: hotel lighting over MCP plus the local clock
pub fn create_default_registry(mcp: Arc<hotel::McpClient>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    hotel::register(&mut registry, mcp);
    clock::register(&mut registry);
    registry
}
