use super::actions::{Action, ActionBody};
use serde::Serialize;
use thiserror::Error;

/// Non-fatal parse failure, collected on the message it occurred in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseError {
    /// A `<...>` delimiter whose tag name could not be extracted.
    #[error("unexpected data: {fragment}")]
    UnexpectedData { fragment: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub subject: String,
    pub context: String,
}

/// Result of parsing one candidate document. Each assembly tick produces a
/// fresh value; consumers replace the previous one wholesale.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedMessage {
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub actions: Vec<Action>,
    pub errors: Vec<ParseError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Tags discarded because a required field was missing.
    pub dropped: usize,
}

impl ParsedMessage {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Self::default()
        }
    }

    pub fn with_ids(mut self, worker_id: Option<String>, msg_id: Option<String>) -> Self {
        self.worker_id = worker_id;
        self.msg_id = msg_id;
        self
    }

    /// Free-text reply segments in document order.
    pub fn replies(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|a| match &a.body {
            ActionBody::Reply { content } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Everything that is not a reply segment.
    pub fn tool_actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| !a.is_reply())
    }

    pub(crate) fn merge_thinking(&mut self, text: &str) {
        match &mut self.thinking {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(text);
            }
            None => self.thinking = Some(text.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.thinking.is_none() && self.annotation.is_none()
    }
}
