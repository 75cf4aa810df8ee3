//! Hotel room controls reached through the MCP bridge's HTTP surface.
//!
//! The bridge exposes `GET /health` and `POST /call-tool` taking
//! `{"tool": <name>, "parameters": {...}}`. Lighting is WLED behind MQTT, so
//! the lighting tool turns the agent's intent into an `mqtt_publish` call.

use super::{
    ParamKind, ParameterSpec, ToolDescriptor, ToolError, ToolExecutor, ToolOutcome, ToolRegistry,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_ROOM: &str = "room1";

/// WLED effect presets by mood
const EFFECTS: [(&str, &str); 8] = [
    ("colorful", "FX=9"),
    ("romantic", "FX=88"),
    ("relaxing", "FX=2"),
    ("rainbow", "FX=73"),
    ("party", "FX=23"),
    ("bright", "FX=0"),
    ("energetic", "FX=97"),
    ("calm", "FX=38"),
];

pub struct McpClient {
    client: Client,
    base_url: String,
}

impl McpClient {
    pub fn new(base_url: &str) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("Pi-Voice-Assistant/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True when `/health` answers 200
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => {
                log::info!("MCP server connection test: {}", response.status());
                response.status() == StatusCode::OK
            }
            Err(e) => {
                log::error!("MCP server connection failed: {}", e);
                false
            }
        }
    }

    /// Call a tool on the bridge. Non-200 answers are reported as failed
    /// outcomes; transport failures are errors.
    pub async fn call_tool(&self, tool: &str, parameters: Value) -> Result<ToolOutcome, ToolError> {
        log::info!("Calling MCP tool: {} with params: {}", tool, parameters);

        let response = self
            .client
            .post(format!("{}/call-tool", self.base_url))
            .json(&json!({ "tool": tool, "parameters": parameters }))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("MCP tool call failed: {} - {}", status.as_u16(), body);
            return Ok(ToolOutcome::failure(
                json!({ "error": format!("HTTP {}: {}", status.as_u16(), body) }),
                format!("Failed to call {}", tool),
            ));
        }

        let result: Value = response.json().await?;
        log::info!("MCP tool result: {}", result);
        Ok(ToolOutcome::success(
            result,
            format!("Successfully called {}", tool),
        ))
    }
}

/// MQTT topic and payload for a lighting request. Brightness wins over an
/// effect, which wins over a plain on/off.
pub fn lighting_command(arguments: &Map<String, Value>) -> (String, String) {
    let room = arguments
        .get("room")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_ROOM);
    let action = arguments
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("on");

    let mut topic = room.to_string();
    let mut payload = action.to_uppercase();

    if let Some(effect) = arguments.get("effect").and_then(Value::as_str) {
        let effect = effect.to_lowercase();
        payload = EFFECTS
            .iter()
            .find(|(name, _)| *name == effect)
            .map(|(_, fx)| fx.to_string())
            .unwrap_or_else(|| format!("FX={}", effect));
    }

    if let Some(brightness) = arguments.get("brightness").and_then(Value::as_i64) {
        topic = format!("{}/api", room);
        payload = json!({ "bri": brightness.clamp(0, 255) }).to_string();
    }

    (topic, payload)
}

pub struct ControlLighting {
    mcp: Arc<McpClient>,
}

#[async_trait]
impl ToolExecutor for ControlLighting {
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        let (topic, message) = lighting_command(arguments);
        self.mcp
            .call_tool(
                "mqtt_publish",
                json!({
                    "topic": topic,
                    "message": message,
                    "qos": 0,
                    "retain": false
                }),
            )
            .await
    }
}

pub struct LightingStatus {
    mcp: Arc<McpClient>,
}

#[async_trait]
impl ToolExecutor for LightingStatus {
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        let room = arguments
            .get("room")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_ROOM);
        self.mcp
            .call_tool(
                "mqtt_read_messages",
                json!({ "topic": format!("{}/status", room), "max_messages": 1 }),
            )
            .await
    }
}

/// Pass-through for bridge tools the agent knows about but we don't model
pub struct CallMcpTool {
    mcp: Arc<McpClient>,
}

#[async_trait]
impl ToolExecutor for CallMcpTool {
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<ToolOutcome, ToolError> {
        let tool_name = arguments
            .get("tool_name")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParameters("tool_name is required".to_string()))?;
        let parameters = arguments
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({}));
        self.mcp.call_tool(tool_name, parameters).await
    }
}

pub fn register(registry: &mut ToolRegistry, mcp: Arc<McpClient>) {
    let effects: Vec<&str> = EFFECTS.iter().map(|(name, _)| *name).collect();

    registry.register(
        ToolDescriptor::new(
            "control_hotel_lighting",
            "Control hotel room lighting via MCP MQTT server. This connects to the hotel's MQTT \
             system to control WLED lighting effects, colors, and brightness.",
        )
        .param(
            ParameterSpec::new("room", ParamKind::String, "Room identifier (e.g., room1, room2)")
                .default_value(json!(DEFAULT_ROOM)),
        )
        .param(
            ParameterSpec::new(
                "action",
                ParamKind::String,
                "Basic lighting action - turn lights on or off",
            )
            .one_of(&["on", "off"]),
        )
        .param(
            ParameterSpec::new(
                "effect",
                ParamKind::String,
                "Lighting effect to apply - creates different visual patterns and moods",
            )
            .one_of(&effects),
        )
        .param(
            ParameterSpec::new(
                "brightness",
                ParamKind::Integer,
                "Brightness level from 0 (off) to 255 (maximum brightness)",
            ),
        ),
        Arc::new(ControlLighting {
            mcp: Arc::clone(&mcp),
        }),
    );

    registry.register(
        ToolDescriptor::new(
            "get_lighting_status",
            "Get current status of hotel room lighting system via MCP MQTT server",
        )
        .param(
            ParameterSpec::new("room", ParamKind::String, "Room identifier to check status for")
                .default_value(json!(DEFAULT_ROOM)),
        ),
        Arc::new(LightingStatus {
            mcp: Arc::clone(&mcp),
        }),
    );

    registry.register(
        ToolDescriptor::new(
            "call_mcp_tool",
            "Call any available MCP tool on the hotel's MCP server. Use this for advanced hotel \
             system controls beyond basic lighting.",
        )
        .param(
            ParameterSpec::new(
                "tool_name",
                ParamKind::String,
                "Name of the MCP tool to call (e.g., mqtt_publish, mqtt_subscribe, mqtt_read_messages)",
            )
            .required(),
        )
        .param(ParameterSpec::new(
            "parameters",
            ParamKind::Object,
            "Parameters to pass to the MCP tool",
        )),
        Arc::new(CallMcpTool { mcp }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    /// Answer a single HTTP request with the given status and JSON body,
    /// handing back the raw request text.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if raw.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });

        (url, handle)
    }

    #[test]
    fn test_lighting_on_off() {
        assert_eq!(
            lighting_command(&args(json!({"action": "off"}))),
            ("room1".to_string(), "OFF".to_string())
        );
        assert_eq!(
            lighting_command(&args(json!({"room": "room2"}))),
            ("room2".to_string(), "ON".to_string())
        );
    }

    #[test]
    fn test_lighting_effects() {
        assert_eq!(
            lighting_command(&args(json!({"effect": "Romantic"}))).1,
            "FX=88"
        );
        assert_eq!(lighting_command(&args(json!({"effect": "calm"}))).1, "FX=38");
        assert_eq!(
            lighting_command(&args(json!({"effect": "strobe"}))).1,
            "FX=strobe"
        );
    }

    #[test]
    fn test_lighting_brightness_uses_json_api() {
        let (topic, payload) =
            lighting_command(&args(json!({"room": "room3", "effect": "party", "brightness": 300})));
        assert_eq!(topic, "room3/api");
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed, json!({"bri": 255}));
    }

    #[test]
    fn test_out_of_range_brightness_is_clamped_not_rejected() {
        let mut registry = ToolRegistry::new();
        register(&mut registry, Arc::new(McpClient::new("http://localhost:1").unwrap()));
        let lighting = registry
            .descriptors()
            .into_iter()
            .find(|d| d.name == "control_hotel_lighting")
            .unwrap();

        let arguments = args(json!({"room": "room2", "brightness": -20}));
        assert!(lighting.validate(&arguments).is_ok());
        assert_eq!(lighting_command(&arguments).1, r#"{"bri":0}"#);
    }

    #[test]
    fn test_register_advertises_three_tools() {
        let mut registry = ToolRegistry::new();
        register(&mut registry, Arc::new(McpClient::new("http://localhost:1").unwrap()));

        let names: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["control_hotel_lighting", "get_lighting_status", "call_mcp_tool"]
        );
    }

    #[tokio::test]
    async fn test_call_tool_success() {
        let (url, server) = serve_once("200 OK", r#"{"published":true}"#).await;
        let mcp = McpClient::new(&url).unwrap();

        let outcome = mcp
            .call_tool("mqtt_publish", json!({"topic": "room1", "message": "ON"}))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.result, json!({"published": true}));
        assert_eq!(outcome.message, "Successfully called mqtt_publish");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /call-tool"));
        assert!(request.contains(r#""tool":"mqtt_publish""#));
    }

    #[tokio::test]
    async fn test_call_tool_http_error_is_failed_outcome() {
        let (url, server) = serve_once("500 Internal Server Error", r#"{"error":"broker down"}"#).await;
        let mcp = McpClient::new(&url).unwrap();

        let outcome = mcp.call_tool("mqtt_publish", json!({})).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Failed to call mqtt_publish");
        assert!(outcome.result["error"].as_str().unwrap().starts_with("HTTP 500"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check() {
        let (url, server) = serve_once("200 OK", "{}").await;
        let mcp = McpClient::new(&format!("{}/", url)).unwrap();
        assert!(mcp.health_check().await);
        assert!(server.await.unwrap().starts_with("GET /health"));
    }

    #[tokio::test]
    async fn test_call_mcp_tool_requires_name() {
        let tool = CallMcpTool {
            mcp: Arc::new(McpClient::new("http://localhost:1").unwrap()),
        };
        assert!(matches!(
            tool.execute(&Map::new()).await,
            Err(ToolError::InvalidParameters(_))
        ));
    }
}
