//! Authoritative, ordered list of conversation items.
//!
//! Server events are first translated into [`ItemUpdate`]s, then applied to
//! the [`ConversationReconciler`]. Applying an update may produce an
//! [`ItemEffect`] the session has to carry out: playing an audio delta or
//! running a tool call.

use oracle_native_utils::{DecodedAudio, pcm};
use oracle_realtime::types::{ContentType, Item, ItemRole, ItemStatus, ItemType, ServerEvent};
use tracing::{debug, warn};

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// Display-ready payload of an item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedItem {
    pub text: String,
    pub transcript: String,
    /// PCM16 at 24 kHz, accumulated from audio deltas.
    pub audio: Vec<i16>,
    /// Set once the item is completed and has audio.
    pub file: Option<DecodedAudio>,
    pub tool: Option<FunctionCall>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationItem {
    pub id: String,
    pub kind: ItemType,
    pub role: Option<ItemRole>,
    pub status: ItemStatus,
    pub formatted: FormattedItem,
    tool_dispatched: bool,
}

impl ConversationItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ItemType::Message,
            role: None,
            status: ItemStatus::InProgress,
            formatted: FormattedItem::default(),
            tool_dispatched: false,
        }
    }

    pub fn is_assistant_message(&self) -> bool {
        self.kind == ItemType::Message && self.role == Some(ItemRole::Assistant)
    }

    /// Merges a wire snapshot of this item.
    fn merge(&mut self, item: &Item) {
        if let Some(kind) = item.kind {
            self.kind = kind;
        }
        if item.role.is_some() {
            self.role = item.role;
        }
        if let Some(status) = item.status {
            self.status = status;
        }
        // Snapshot text is complete, so it replaces whatever deltas built up.
        let mut text = String::new();
        for part in item.content.iter().flatten() {
            match part.kind {
                ContentType::InputText | ContentType::Text => {
                    text.push_str(part.text.as_deref().unwrap_or_default());
                }
                ContentType::InputAudio | ContentType::Audio => {
                    if let Some(transcript) = part.transcript.as_deref().filter(|t| !t.is_empty()) {
                        self.formatted.transcript = transcript.to_string();
                    }
                }
            }
        }
        if !text.is_empty() {
            self.formatted.text = text;
        }
        if self.kind == ItemType::FunctionCall {
            let tool = self.formatted.tool.get_or_insert_with(|| FunctionCall {
                call_id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(call_id) = &item.call_id {
                tool.call_id = call_id.clone();
            }
            if let Some(name) = &item.name {
                tool.name = name.clone();
            }
            if let Some(arguments) = item.arguments.as_ref().filter(|a| !a.is_empty()) {
                tool.arguments = arguments.clone();
            }
        }
        if let Some(output) = &item.output {
            self.formatted.output = Some(output.clone());
        }
    }
}

/// A streamed fragment addressed to one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemDelta {
    Text(String),
    Transcript(String),
    Audio(Vec<i16>),
    Arguments(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemChange {
    /// A full or partial wire snapshot of the item.
    Snapshot(Box<Item>),
    Delta(ItemDelta),
    /// Transcription of the user's audio finished.
    Transcribed(String),
    /// The server cut the item's audio at `audio_end_ms`.
    Truncated { audio_end_ms: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemUpdate {
    Replace(Vec<ConversationItem>),
    Update { item_id: String, change: ItemChange },
    Remove { item_id: String },
}

impl ItemUpdate {
    /// The item update carried by a server event, if any.
    pub fn from_server_event(event: ServerEvent) -> Option<Self> {
        let update = |item_id: String, change: ItemChange| Some(ItemUpdate::Update { item_id, change });
        match event {
            ServerEvent::ConversationItemCreated { item, .. }
            | ServerEvent::ResponseOutputItemAdded { item, .. }
            | ServerEvent::ResponseOutputItemDone { item, .. } => {
                let item_id = item.id.clone()?;
                update(item_id, ItemChange::Snapshot(Box::new(item)))
            }
            ServerEvent::ConversationItemDeleted { item_id } => Some(ItemUpdate::Remove { item_id }),
            ServerEvent::ConversationItemTruncated {
                item_id, audio_end_ms, ..
            } => update(item_id, ItemChange::Truncated { audio_end_ms }),
            ServerEvent::InputAudioTranscriptionCompleted { item_id, transcript, .. } => {
                update(item_id, ItemChange::Transcribed(transcript))
            }
            ServerEvent::ResponseTextDelta { item_id, delta } => update(item_id, ItemChange::Delta(ItemDelta::Text(delta))),
            ServerEvent::ResponseAudioTranscriptDelta { item_id, delta } => {
                update(item_id, ItemChange::Delta(ItemDelta::Transcript(delta)))
            }
            ServerEvent::ResponseAudioDelta { item_id, delta, .. } => {
                update(item_id, ItemChange::Delta(ItemDelta::Audio(pcm::decode_i16(&delta))))
            }
            ServerEvent::ResponseFunctionCallArgumentsDelta { item_id, delta } => {
                update(item_id, ItemChange::Delta(ItemDelta::Arguments(delta)))
            }
            _ => None,
        }
    }
}

/// Work the session must do after an update was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEffect {
    PlayAudio { track_id: String, samples: Vec<i16> },
    CallTool(FunctionCall),
}

#[derive(Debug, Clone, Default)]
pub struct ConversationReconciler {
    items: Vec<ConversationItem>,
}

impl ConversationReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<ConversationItem> {
        self.items.clone()
    }

    pub fn get(&self, item_id: &str) -> Option<&ConversationItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.get(item_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn apply(&mut self, update: ItemUpdate) -> Option<ItemEffect> {
        match update {
            ItemUpdate::Replace(items) => {
                self.items = items;
                for item in &mut self.items {
                    decode_if_completed(item);
                }
                None
            }
            ItemUpdate::Remove { item_id } => {
                self.items.retain(|item| item.id != item_id);
                None
            }
            ItemUpdate::Update { item_id, change } => {
                let index = match self.items.iter().position(|item| item.id == item_id) {
                    Some(index) => index,
                    None => {
                        debug!(item_id, "Tracking new conversation item");
                        self.items.push(ConversationItem::new(item_id.clone()));
                        self.items.len() - 1
                    }
                };
                let item = &mut self.items[index];
                let effect = apply_change(item, change);
                decode_if_completed(item);
                effect
            }
        }
    }
}

fn apply_change(item: &mut ConversationItem, change: ItemChange) -> Option<ItemEffect> {
    match change {
        ItemChange::Snapshot(snapshot) => {
            item.merge(&snapshot);
            let call_ready = item.kind == ItemType::FunctionCall
                && item.status == ItemStatus::Completed
                && !item.tool_dispatched;
            if !call_ready {
                return None;
            }
            let call = item.formatted.tool.clone()?;
            item.tool_dispatched = true;
            Some(ItemEffect::CallTool(call))
        }
        ItemChange::Delta(ItemDelta::Text(delta)) => {
            item.formatted.text.push_str(&delta);
            None
        }
        ItemChange::Delta(ItemDelta::Transcript(delta)) => {
            item.formatted.transcript.push_str(&delta);
            None
        }
        ItemChange::Delta(ItemDelta::Arguments(delta)) => {
            if let Some(tool) = item.formatted.tool.as_mut() {
                tool.arguments.push_str(&delta);
            }
            None
        }
        ItemChange::Delta(ItemDelta::Audio(samples)) => {
            if samples.is_empty() {
                return None;
            }
            item.formatted.audio.extend_from_slice(&samples);
            Some(ItemEffect::PlayAudio {
                track_id: item.id.clone(),
                samples,
            })
        }
        ItemChange::Transcribed(transcript) => {
            item.formatted.transcript = if transcript.is_empty() {
                " ".to_string()
            } else {
                transcript
            };
            None
        }
        ItemChange::Truncated { audio_end_ms } => {
            let end = (u64::from(audio_end_ms) * u64::from(pcm::REALTIME_SAMPLE_RATE) / 1000) as usize;
            item.formatted.audio.truncate(end);
            item.formatted.transcript.clear();
            None
        }
    }
}

fn decode_if_completed(item: &mut ConversationItem) {
    if item.status != ItemStatus::Completed || item.formatted.audio.is_empty() || item.formatted.file.is_some() {
        return;
    }
    match DecodedAudio::from_pcm16(&item.formatted.audio, pcm::REALTIME_SAMPLE_RATE) {
        Ok(file) => item.formatted.file = Some(file),
        Err(e) => warn!(item_id = %item.id, error = %e, "Failed to decode item audio"),
    }
}
