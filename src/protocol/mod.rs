//! Tag protocol parser.
//!
//! A document is free text interleaved with top-level `<name>...</name>` tags.
//! Closing tags are optional at the end of input, so a document can be
//! re-parsed on every streaming tick.

pub mod actions;
pub mod message;
mod scanner;

pub use actions::{Action, ActionBody, FileOpKind, LifecycleOp};
pub use message::{ParseError, ParsedMessage};

use actions::Classified;
use scanner::{find_opener, snap, withhold_dangling_opener, MAX_SCAN_ITERATIONS};

const TOOL_RESULT_PLACEHOLDERS: [&str; 2] = ["<--[tool-result]-->", "<!-- [tool-result] -->"];

/// Parse one candidate document. Pure; never fails.
pub fn parse(document: &str) -> ParsedMessage {
    let mut message = ParsedMessage::new(document);
    let mut left = document.trim();
    let mut attempt = 0;

    while !left.is_empty() && attempt < MAX_SCAN_ITERATIONS {
        attempt += 1;

        let Some(opener) = find_opener(left) else {
            if !left.starts_with('<') {
                push_reply(&mut message, withhold_dangling_opener(left), false);
            }
            break;
        };

        push_reply(&mut message, &left[..opener.start], true);

        let Some(name) = opener.name() else {
            let delimiter = opener.delimiter(left);
            if !TOOL_RESULT_PLACEHOLDERS.contains(&delimiter) {
                message.errors.push(ParseError::UnexpectedData {
                    fragment: delimiter.to_string(),
                });
            }
            left = left[opener.end..].trim();
            continue;
        };

        let snapped = snap(left, &opener, name);
        match actions::classify(name, snapped.inner, snapped.closed) {
            Classified::Thinking(text) => message.merge_thinking(&text),
            Classified::Annotation(annotation) => message.annotation = Some(annotation),
            Classified::Action(action) => message.actions.push(action),
            Classified::Dropped => {
                message.dropped += 1;
                tracing::debug!(tag = name, closed = snapped.closed, "Dropped tag missing required field");
            }
        }
        left = left[snapped.end..].trim();
    }

    message
}

fn push_reply(message: &mut ParsedMessage, raw: &str, closed: bool) {
    let text = trim_reply(raw);
    if !text.is_empty() {
        message.actions.push(Action::reply(text, closed));
    }
}

fn trim_reply(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_suffix("```xml") {
        text = stripped.trim_end();
    }
    if let Some(stripped) = text.strip_prefix("```") {
        text = stripped.trim_start();
    }
    if TOOL_RESULT_PLACEHOLDERS.contains(&text) {
        return "";
    }
    text
}
