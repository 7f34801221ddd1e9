use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    /// The run keeps going; nothing is surfaced.
    Transient,
    /// The run stops and the message is shown.
    Terminal,
}

/// An application error pushed by the backend as `"<Code>:<freeform>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamError {
    pub code: String,
    pub detail: String,
    pub kind: UpstreamErrorKind,
}

const TRANSIENT_CODES: [&str; 2] = ["emptyllmresponse", "noresultpresent"];

impl UpstreamError {
    pub fn parse(raw: &str) -> Self {
        let (code, detail) = match raw.split_once(':') {
            Some((code, detail)) => (code.trim(), detail.trim()),
            None => (raw.trim(), ""),
        };
        let kind = if TRANSIENT_CODES.contains(&normalize(code).as_str()) {
            UpstreamErrorKind::Transient
        } else {
            UpstreamErrorKind::Terminal
        };
        Self {
            code: code.to_string(),
            detail: detail.to_string(),
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == UpstreamErrorKind::Terminal
    }

    /// Text for the rendering layer.
    pub fn message(&self) -> String {
        if self.detail.is_empty() {
            self.code.clone()
        } else {
            format!("{}: {}", self.code, self.detail)
        }
    }
}

fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}
