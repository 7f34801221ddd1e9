//! Tag scanning primitives shared by the document parser and the child-tag
//! extractor. Nothing here is exported outside `protocol`.

use regex::Regex;
use std::sync::OnceLock;

/// Upper bound on tag extractions per scanning loop.
pub(crate) const MAX_SCAN_ITERATIONS: usize = 10;

fn opener_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^/>]+)>").expect("opener pattern is valid"))
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.:-]*").expect("name pattern is valid"))
}

/// `<...>` delimiter located in a text. Offsets are byte positions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Opener<'a> {
    pub start: usize,
    pub end: usize,
    pub raw: &'a str,
}

impl<'a> Opener<'a> {
    /// Leading tag name of the delimiter, `None` when nothing name-like follows `<`.
    pub fn name(&self) -> Option<&'a str> {
        name_re().find(self.raw).map(|m| m.as_str())
    }

    pub fn delimiter(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

pub(crate) fn find_opener(text: &str) -> Option<Opener<'_>> {
    let caps = opener_re().captures(text)?;
    let whole = caps.get(0)?;
    let raw = caps.get(1)?;
    Some(Opener {
        start: whole.start(),
        end: whole.end(),
        raw: raw.as_str(),
    })
}

/// A tag cut out of its surrounding text.
#[derive(Debug)]
pub(crate) struct Snapped<'a> {
    pub inner: &'a str,
    /// Byte offset just past the closing tag, or the end of input.
    pub end: usize,
    pub closed: bool,
}

/// Cut the tag starting at `opener` up to the first `</name>` or, when the
/// tag is still streaming, to the end of `text`. Non-nested by construction.
pub(crate) fn snap<'a>(text: &'a str, opener: &Opener<'_>, name: &str) -> Snapped<'a> {
    let close = format!("</{name}>");
    let body = &text[opener.end..];
    match body.find(&close) {
        Some(pos) => Snapped {
            inner: &body[..pos],
            end: opener.end + pos + close.len(),
            closed: true,
        },
        None => Snapped {
            inner: body,
            end: text.len(),
            closed: false,
        },
    }
}

/// Drop an opener that is still being typed at the very end of the text
/// (`"see <comp"`), so a later fragment cannot turn visible text into a tag.
pub(crate) fn withhold_dangling_opener(text: &str) -> &str {
    let Some(pos) = text.rfind('<') else {
        return text;
    };
    let tail = &text[pos + 1..];
    if tail.is_empty() || name_re().find(tail).is_some_and(|m| m.end() == tail.len()) {
        &text[..pos]
    } else {
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldValue {
    One(String),
    Many(Vec<String>),
}

/// Ordered child-tag mapping of a tag body. Repeated children accumulate.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct TagBody {
    fields: Vec<(String, FieldValue)>,
}

impl TagBody {
    /// Text without any child tag becomes the single `content` field; text
    /// between child tags is discarded.
    pub fn extract(text: &str) -> TagBody {
        let mut body = TagBody::default();
        let mut left = text.trim().to_string();
        let mut attempt = 0;
        while !left.is_empty() && attempt < MAX_SCAN_ITERATIONS {
            attempt += 1;
            let Some(opener) = find_opener(&left) else {
                if attempt == 1 {
                    body.push("content", left.clone());
                }
                break;
            };
            let Some(name) = opener.name() else {
                left = format!("{}{}", &left[..opener.start], &left[opener.end..])
                    .trim()
                    .to_string();
                continue;
            };
            let name = name.to_string();
            let snapped = snap(&left, &opener, &name);
            let value = snapped.inner.to_string();
            let rest = format!("{}{}", &left[..opener.start], &left[snapped.end..]);
            body.push(&name, value);
            left = rest.trim().to_string();
        }
        body
    }

    fn push(&mut self, name: &str, value: String) {
        let Some(idx) = self.fields.iter().position(|(k, _)| k == name) else {
            self.fields.push((name.to_string(), FieldValue::One(value)));
            return;
        };
        let existing = &mut self.fields[idx].1;
        let replacement = match existing {
            FieldValue::Many(values) => {
                values.push(value);
                return;
            }
            FieldValue::One(first) => FieldValue::Many(vec![std::mem::take(first), value]),
        };
        *existing = replacement;
    }

    /// First value of `name`, trimmed; `None` when absent or blank.
    pub fn text(&self, name: &str) -> Option<&str> {
        let value = self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)?;
        let first = match value {
            FieldValue::One(v) => v.as_str(),
            FieldValue::Many(vs) => vs.first()?.as_str(),
        };
        let trimmed = first.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn owned(&self, name: &str) -> Option<String> {
        self.text(name).map(str::to_string)
    }

    /// Every value of `name` in document order, trimmed.
    pub fn all(&self, name: &str) -> Vec<String> {
        match self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v) {
            Some(FieldValue::One(v)) => vec![v.trim().to_string()],
            Some(FieldValue::Many(vs)) => vs.iter().map(|v| v.trim().to_string()).collect(),
            None => Vec::new(),
        }
    }

    /// Remaining fields, skipping `except`, as JSON (repeated children become arrays).
    pub fn extras(&self, except: &[&str]) -> serde_json::Map<String, serde_json::Value> {
        let mut out = serde_json::Map::new();
        for (name, value) in &self.fields {
            if except.contains(&name.as_str()) {
                continue;
            }
            let json = match value {
                FieldValue::One(v) => serde_json::Value::String(v.trim().to_string()),
                FieldValue::Many(vs) => serde_json::Value::Array(
                    vs.iter()
                        .map(|v| serde_json::Value::String(v.trim().to_string()))
                        .collect(),
                ),
            };
            out.insert(name.clone(), json);
        }
        out
    }
}
