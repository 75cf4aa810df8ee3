use crate::tools::ToolDescriptor;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_INSTRUCTIONS: &str = "You are LIMI AI, a helpful hotel room assistant. You can control the room \
lighting and provide information about hotel services.

For lighting control, you have access to these effects:
- colorful: Fun colorful patterns
- romantic: Soft romantic lighting
- relaxing: Calm, soothing effects
- rainbow: Rainbow patterns
- party: Energetic party lighting
- bright: Bright white light
- energetic: High-energy effects
- calm: Peaceful effects

You can also set brightness levels (0-255).

Be conversational and helpful. When controlling lights, describe what you're doing.";

/// Server-side voice activity detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 200,
        }
    }
}

/// Snapshot sent once as `session.update` when a session opens
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_transcription_model: String,
    pub turn_detection: TurnDetection,
    pub tools: Vec<ToolDescriptor>,
    pub tool_choice: String,
    pub temperature: f32,
    pub max_response_tokens: u32,
    /// How long to wait for the first inbound event after `session.update`
    pub configuration_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: crate::config::DEFAULT_VOICE.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetection::default(),
            tools: Vec::new(),
            tool_choice: "auto".to_string(),
            temperature: 0.8,
            max_response_tokens: 4096,
            configuration_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn with_voice(mut self, voice: &str) -> Self {
        self.voice = voice.to_string();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }

    /// The `session` object of a `session.update` event
    pub fn to_session_object(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(ToolDescriptor::to_function_definition)
            .collect();

        json!({
            "modalities": self.modalities,
            "instructions": self.instructions,
            "voice": self.voice,
            "input_audio_format": self.input_audio_format,
            "output_audio_format": self.output_audio_format,
            "input_audio_transcription": { "model": self.input_transcription_model },
            "turn_detection": self.turn_detection,
            "tools": tools,
            "tool_choice": self.tool_choice,
            "temperature": self.temperature,
            "max_response_output_tokens": self.max_response_tokens
        })
    }
}
