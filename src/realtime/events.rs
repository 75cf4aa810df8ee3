//! Realtime wire events and their typed counterparts.
//!
//! Outbound intents are encoded as [`ClientEvent`]s, inbound frames are
//! decoded as [`ServerEvent`]s and mapped onto [`Occurrence`]s.

use crate::audio::AudioFrame;
use crate::tools::{ToolCallRequest, ToolCallResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// Something that happened on the inbound side of a session
#[derive(Debug, Clone, PartialEq)]
pub enum Occurrence {
    /// PCM16 mono 24 kHz bytes to play
    AudioDelta(Vec<u8>),
    TranscriptCompleted { speaker: Speaker, text: String },
    ToolCallReady(ToolCallRequest),
    TurnComplete,
    ProtocolError(String),
    StreamClosed,
}

impl Occurrence {
    pub fn kind(&self) -> &'static str {
        match self {
            Occurrence::AudioDelta(_) => "audio-delta",
            Occurrence::TranscriptCompleted { .. } => "transcript-completed",
            Occurrence::ToolCallReady(_) => "tool-call-ready",
            Occurrence::TurnComplete => "turn-complete",
            Occurrence::ProtocolError(_) => "protocol-error",
            Occurrence::StreamClosed => "stream-closed",
        }
    }
}

/// Something the device wants the agent to know
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    AppendAudio(AudioFrame),
    SubmitToolResult(ToolCallResult),
    RequestNextTurn,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: Value },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

impl From<&Intent> for ClientEvent {
    fn from(intent: &Intent) -> Self {
        match intent {
            Intent::AppendAudio(frame) => ClientEvent::InputAudioBufferAppend {
                audio: BASE64.encode(frame.as_bytes()),
            },
            Intent::SubmitToolResult(result) => ClientEvent::ConversationItemCreate {
                item: ConversationItem::FunctionCallOutput {
                    call_id: result.call_id.clone(),
                    output: result.output_text(),
                },
            },
            Intent::RequestNextTurn => ClientEvent::ResponseCreate,
        }
    }
}

impl ClientEvent {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.code
                .as_deref()
                .or(self.kind.as_deref())
                .unwrap_or("error"),
            self.message.as_deref().unwrap_or("no message")
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetail,
    },
    #[serde(other)]
    Other,
}

/// Result of decoding one inbound text frame
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    /// Session identity carried by `session.created` / `session.updated`
    pub session_id: Option<String>,
    pub occurrence: Option<Occurrence>,
}

/// Decode an inbound frame. Never fails: malformed frames come back as a
/// protocol-error occurrence.
pub fn decode(text: &str) -> Decoded {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            return Decoded {
                occurrence: Some(Occurrence::ProtocolError(format!(
                    "malformed frame: {}",
                    e
                ))),
                ..Default::default()
            }
        }
    };

    let occurrence = |o: Occurrence| Decoded {
        occurrence: Some(o),
        ..Default::default()
    };

    match event {
        ServerEvent::SessionCreated { session } | ServerEvent::SessionUpdated { session } => {
            Decoded {
                session_id: session.id,
                ..Default::default()
            }
        }
        ServerEvent::AudioDelta { delta } => match BASE64.decode(delta.as_bytes()) {
            Ok(bytes) => occurrence(Occurrence::AudioDelta(bytes)),
            Err(e) => occurrence(Occurrence::ProtocolError(format!(
                "undecodable audio delta: {}",
                e
            ))),
        },
        ServerEvent::InputTranscriptionCompleted { transcript } => {
            occurrence(Occurrence::TranscriptCompleted {
                speaker: Speaker::User,
                text: transcript,
            })
        }
        ServerEvent::AudioTranscriptDone { transcript } => {
            occurrence(Occurrence::TranscriptCompleted {
                speaker: Speaker::Agent,
                text: transcript,
            })
        }
        ServerEvent::FunctionCallArgumentsDone {
            call_id,
            name,
            arguments,
        } => match parse_arguments(&arguments) {
            Ok(arguments) => occurrence(Occurrence::ToolCallReady(ToolCallRequest {
                call_id,
                name,
                arguments,
            })),
            Err(reason) => occurrence(Occurrence::ProtocolError(format!(
                "unparsable arguments for call {} to {}: {}",
                call_id, name, reason
            ))),
        },
        ServerEvent::ResponseDone => occurrence(Occurrence::TurnComplete),
        ServerEvent::Error { error } => occurrence(Occurrence::ProtocolError(error.to_string())),
        ServerEvent::Other => Decoded::default(),
    }
}

/// Tool arguments arrive as JSON text; an empty string means no arguments
fn parse_arguments(arguments: &str) -> Result<Map<String, Value>, String> {
    if arguments.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected an object, got {}", other)),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_intents() {
        let frame = AudioFrame::new(vec![1, 0, 2, 0]);
        let append: Value = serde_json::from_str(
            &ClientEvent::from(&Intent::AppendAudio(frame)).to_text().unwrap(),
        )
        .unwrap();
        assert_eq!(
            append,
            json!({"type": "input_audio_buffer.append", "audio": BASE64.encode([1, 0, 2, 0])})
        );

        let next: Value =
            serde_json::from_str(&ClientEvent::from(&Intent::RequestNextTurn).to_text().unwrap())
                .unwrap();
        assert_eq!(next, json!({"type": "response.create"}));
    }

    #[test]
    fn test_encode_tool_result() {
        let result = ToolCallResult::failed("c1", "unknown tool: set_brightness");
        let event: Value = serde_json::from_str(
            &ClientEvent::from(&Intent::SubmitToolResult(result))
                .to_text()
                .unwrap(),
        )
        .unwrap();

        assert_eq!(event["type"], "conversation.item.create");
        assert_eq!(event["item"]["type"], "function_call_output");
        assert_eq!(event["item"]["call_id"], "c1");
        let output: Value = serde_json::from_str(event["item"]["output"].as_str().unwrap()).unwrap();
        assert_eq!(output["success"], false);
        assert_eq!(output["message"], "unknown tool: set_brightness");
    }

    #[test]
    fn test_decode_session_created() {
        let decoded = decode(r#"{"type":"session.created","event_id":"e1","session":{"id":"sess_42","object":"realtime.session"}}"#);
        assert_eq!(decoded.session_id.as_deref(), Some("sess_42"));
        assert!(decoded.occurrence.is_none());
    }

    #[test]
    fn test_decode_audio_and_transcripts() {
        let delta = BASE64.encode([9u8, 8, 7, 6]);
        assert_eq!(
            decode(&json!({"type": "response.audio.delta", "delta": delta}).to_string()).occurrence,
            Some(Occurrence::AudioDelta(vec![9, 8, 7, 6]))
        );
        assert_eq!(
            decode(r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hi"}"#)
                .occurrence,
            Some(Occurrence::TranscriptCompleted {
                speaker: Speaker::User,
                text: "hi".to_string()
            })
        );
        assert_eq!(
            decode(r#"{"type":"response.audio_transcript.done","transcript":"hello"}"#).occurrence,
            Some(Occurrence::TranscriptCompleted {
                speaker: Speaker::Agent,
                text: "hello".to_string()
            })
        );
        assert_eq!(
            decode(r#"{"type":"response.done","response":{}}"#).occurrence,
            Some(Occurrence::TurnComplete)
        );
    }

    #[test]
    fn test_decode_tool_call() {
        let decoded = decode(
            r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"set_brightness","arguments":"{\"level\":150}"}"#,
        );
        match decoded.occurrence {
            Some(Occurrence::ToolCallReady(request)) => {
                assert_eq!(request.call_id, "c1");
                assert_eq!(request.name, "set_brightness");
                assert_eq!(request.arguments["level"], 150);
            }
            other => panic!("Expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_frames() {
        for text in [
            "not json",
            r#"{"type":"response.audio.delta"}"#,
            r#"{"type":"response.audio.delta","delta":"***"}"#,
            r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"x","arguments":"{oops"}"#,
        ] {
            assert!(
                matches!(decode(text).occurrence, Some(Occurrence::ProtocolError(_))),
                "{} should be a protocol error",
                text
            );
        }
    }

    #[test]
    fn test_decode_error_and_unknown() {
        let decoded = decode(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"bad_voice","message":"Unknown voice"}}"#,
        );
        assert_eq!(
            decoded.occurrence,
            Some(Occurrence::ProtocolError("bad_voice: Unknown voice".to_string()))
        );

        assert_eq!(
            decode(r#"{"type":"rate_limits.updated","rate_limits":[]}"#),
            Decoded::default()
        );
    }
}
