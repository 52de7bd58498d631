use crate::item::{ContentPart, Item};
use serde::Deserialize;
use serde_json::Value;

/// Error payload of an `error` event.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Messages received from the realtime service.
///
/// Only the events this client reacts to are typed; everything else parses as
/// [`ServerEvent::Other`] and is still visible through the raw [`InboundMessage`].
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(rename = "session.created")]
    SessionCreated { session: Value },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Value },
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        previous_item_id: Option<String>,
        item: Item,
    },
    #[serde(rename = "conversation.item.deleted")]
    ConversationItemDeleted { item_id: String },
    #[serde(rename = "conversation.item.truncated")]
    ConversationItemTruncated {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        audio_end_ms: u32,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        transcript: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u32,
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u32,
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        previous_item_id: Option<String>,
        item_id: String,
    },
    #[serde(rename = "response.created")]
    ResponseCreated { response: Value },
    #[serde(rename = "response.done")]
    ResponseDone { response: Value },
    #[serde(rename = "response.output_item.added")]
    ResponseOutputItemAdded {
        #[serde(default)]
        response_id: Option<String>,
        item: Item,
    },
    #[serde(rename = "response.output_item.done")]
    ResponseOutputItemDone {
        #[serde(default)]
        response_id: Option<String>,
        item: Item,
    },
    #[serde(rename = "response.content_part.added")]
    ResponseContentPartAdded {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        part: ContentPart,
    },
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta { item_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { item_id: String, delta: String },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    ResponseFunctionCallArgumentsDelta { item_id: String, delta: String },
    #[serde(other)]
    Other,
}

/// A single inbound frame, kept as raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub raw: Value,
}

impl InboundMessage {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// Parses a text frame. Fails only when the frame is not JSON at all.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self::new)
    }

    /// The wire `type` tag, or an empty string when missing.
    pub fn kind(&self) -> &str {
        self.raw.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    /// Interprets the frame as a typed event.
    pub fn event(&self) -> Result<ServerEvent, serde_json::Error> {
        serde_json::from_value(self.raw.clone())
    }
}
