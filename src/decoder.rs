//! Folds upstream stream records into one growing response.
//!
//! The decoder does no I/O. Each call to [`StreamDecoder::decode`] consumes one
//! record payload (an event's data, with or without a leading `data:`) and
//! returns a full copy of the aggregate, so the same recorded payloads always
//! produce the same sequence of snapshots.
//!
//! Two record shapes are accepted:
//! - retrieval-augmented: `choices[0].messages[0].delta`
//! - plain chat: `choices[0].delta`

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DONE_MARKER: &str = "[DONE]";
const DATA_PREFIX: &str = "data:";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("upstream record is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("upstream record is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantTurn {
    pub role: String,
    pub content: String,
}

impl AssistantTurn {
    fn empty() -> Self {
        Self {
            role: "assistant".to_string(),
            content: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageEntry {
    Assistant(AssistantTurn),
    /// Tool-call deltas, kept exactly as the upstream sent them.
    Tool(Value),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AggregatedChoice {
    pub messages: Vec<MessageEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResponse {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub object: String,
    pub choices: Vec<AggregatedChoice>,
}

impl Default for AggregatedResponse {
    fn default() -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            created: 0,
            object: String::new(),
            choices: vec![AggregatedChoice::default()],
        }
    }
}

impl AggregatedResponse {
    pub fn messages(&self) -> &[MessageEntry] {
        self.choices
            .first()
            .map(|c| c.messages.as_slice())
            .unwrap_or(&[])
    }

    fn messages_mut(&mut self) -> &mut Vec<MessageEntry> {
        if self.choices.is_empty() {
            self.choices.push(AggregatedChoice::default());
        }
        &mut self.choices[0].messages
    }

    fn append_text(&mut self, text: &str) {
        let messages = self.messages_mut();
        let last_assistant = messages.iter_mut().rev().find_map(|entry| match entry {
            MessageEntry::Assistant(turn) => Some(turn),
            MessageEntry::Tool(_) => None,
        });
        match last_assistant {
            Some(turn) => turn.content.push_str(text),
            // Continuation before any assistant marker: open the turn ourselves.
            None => messages.push(MessageEntry::Assistant(AssistantTurn {
                role: "assistant".to_string(),
                content: text.to_string(),
            })),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeltaRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    choices: Option<Vec<RecordChoice>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RecordChoice {
    #[serde(default)]
    messages: Option<Vec<RecordMessage>>,
    #[serde(default)]
    delta: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RecordMessage {
    delta: Value,
}

impl RecordChoice {
    fn into_delta(self) -> Option<Value> {
        match self.messages {
            Some(messages) => messages.into_iter().next().map(|m| m.delta),
            None => self.delta,
        }
    }
}

/// Output of one decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// The whole record when it carried an `error` field.
    pub upstream_error: Option<Value>,
    pub snapshot: AggregatedResponse,
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    response: AggregatedResponse,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response(&self) -> &AggregatedResponse {
        &self.response
    }

    /// True once the bare `[DONE]` marker was seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns `Ok(None)` for blank payloads and the bare terminal marker.
    pub fn decode(&mut self, raw: &str) -> Result<Option<Decoded>, DecodeError> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let payload = line.strip_prefix(DATA_PREFIX).unwrap_or(line).trim_start();
        if payload == DONE_MARKER {
            self.finished = true;
            return Ok(None);
        }

        let value: Value = serde_json::from_str(payload)?;
        let record: DeltaRecord = serde_json::from_value(value.clone())?;

        if record.error.is_some() {
            return Ok(Some(Decoded {
                upstream_error: Some(value),
                snapshot: self.response.clone(),
            }));
        }

        if let Some(id) = record.id {
            self.response.id = id;
        }
        if let Some(model) = record.model {
            self.response.model = model;
        }
        if let Some(created) = record.created {
            self.response.created = created;
        }
        if let Some(object) = record.object {
            self.response.object = object;
        }

        let choices = record.choices.ok_or(DecodeError::MissingField("choices"))?;
        if let Some(choice) = choices.into_iter().next() {
            let delta = choice
                .into_delta()
                .ok_or(DecodeError::MissingField("delta"))?;
            self.fold_delta(delta);
        }

        Ok(Some(Decoded {
            upstream_error: None,
            snapshot: self.response.clone(),
        }))
    }

    fn fold_delta(&mut self, delta: Value) {
        match delta.get("role").and_then(Value::as_str) {
            Some("tool") => self.response.messages_mut().push(MessageEntry::Tool(delta)),
            Some("assistant") => self
                .response
                .messages_mut()
                .push(MessageEntry::Assistant(AssistantTurn::empty())),
            _ => {
                let text = delta.get("content").and_then(Value::as_str).unwrap_or("");
                if !text.is_empty() && text != DONE_MARKER {
                    self.response.append_text(text);
                }
            }
        }
    }
}
