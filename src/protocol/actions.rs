use super::message::Annotation;
use super::scanner::TagBody;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Top-level tag names of the agent protocol.
pub mod tags {
    pub const THINKING: &str = "thinking";
    pub const ANNOTATE: &str = "annotate";
    pub const COMPLETE: &str = "complete";
    pub const MAKE_ASK: &str = "make-ask";
    pub const REQUEST: &str = "request";
    pub const EXECUTE_COMMAND: &str = "execute-command";
    pub const START_ASYNC_CMD: &str = "start-async-cmd";
    pub const QUERY_ASYNC_CMD: &str = "query-async-cmd";
    pub const ABORT_ASYNC_CMD: &str = "abort-async-cmd";
    pub const START_SUBTASK: &str = "start-subtask";
    pub const QUERY_SUBTASK: &str = "query-subtask";
    pub const ABORT_SUBTASK: &str = "abort-subtask";
    pub const PATH_LIST_FILES: &str = "path-list-files";
    pub const FILE_GET_CONTENT: &str = "file-get-content";
    pub const FILE_PUT_CONTENT: &str = "file-put-content";
    pub const FILE_REPLACE_TEXT: &str = "file-replace-text";
    pub const USE_MCP_TOOL: &str = "use-mcp-tool";
    pub const USE_BUILTIN_TOOL: &str = "use-builtin-tool";
    /// Type tag given to free-text segments.
    pub const REPLY: &str = "reply";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleOp {
    Start,
    Query,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOpKind {
    ListFiles,
    GetContent,
    PutContent,
    ReplaceText,
}

/// Variant-specific payload of an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum ActionBody {
    Reply {
        content: String,
    },
    Complete {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        botname: Option<String>,
    },
    Question {
        question: String,
        options: Vec<String>,
        multiple: bool,
    },
    ShellCommand {
        command: String,
    },
    AsyncCommand {
        op: LifecycleOp,
        session: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    Subtask {
        op: LifecycleOp,
        session: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sub_agent: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_desc: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        require: Option<String>,
    },
    FileOp {
        op: FileOpKind,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
    },
    McpTool {
        tool: String,
        server: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        desc: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<String>,
    },
    BuiltinTool {
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        desc: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<String>,
    },
    Generic {
        content: String,
        #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
        extra: serde_json::Map<String, serde_json::Value>,
    },
}

/// One validated unit of agent behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    /// Protocol tag name (`execute-command`, `reply`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Stable identity of the semantic action, used by history dedup.
    pub hash: String,
    pub hide: bool,
    pub checked: bool,
    /// Whether the closing tag was seen (replies: whether a tag followed).
    pub closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(flatten)]
    pub body: ActionBody,
}

impl Action {
    pub fn new(kind: impl Into<String>, body: ActionBody, closed: bool) -> Self {
        let kind = kind.into();
        let hash = content_hash(&kind, &body);
        Self {
            kind,
            hash,
            hide: false,
            checked: false,
            closed,
            msg_id: None,
            body,
        }
    }

    pub fn reply(content: impl Into<String>, closed: bool) -> Self {
        Self::new(
            tags::REPLY,
            ActionBody::Reply {
                content: content.into(),
            },
            closed,
        )
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.body, ActionBody::Reply { .. })
    }
}

/// Outcome of mapping one top-level tag.
#[derive(Debug)]
pub(crate) enum Classified {
    Thinking(String),
    Annotation(Annotation),
    Action(Action),
    /// A required field was missing; the tag produces nothing.
    Dropped,
}

pub(crate) fn classify(name: &str, inner: &str, closed: bool) -> Classified {
    let body = TagBody::extract(inner);
    match classify_body(name, &body) {
        Some(Mapped::Thinking(text)) => Classified::Thinking(text),
        Some(Mapped::Annotation(a)) => Classified::Annotation(a),
        Some(Mapped::Body(b)) => Classified::Action(Action::new(name, b, closed)),
        None => Classified::Dropped,
    }
}

enum Mapped {
    Thinking(String),
    Annotation(Annotation),
    Body(ActionBody),
}

fn classify_body(name: &str, body: &TagBody) -> Option<Mapped> {
    let mapped = match name {
        tags::THINKING => Mapped::Thinking(body.owned("content")?),
        tags::ANNOTATE => {
            let subject = body.text("subject").or_else(|| body.text("summary"));
            let context = body.text("context").or_else(|| body.text("todo-list"));
            if subject.is_none() && context.is_none() {
                return None;
            }
            Mapped::Annotation(Annotation {
                subject: subject.unwrap_or_default().to_string(),
                context: context.unwrap_or_default().to_string(),
            })
        }
        tags::COMPLETE => Mapped::Body(ActionBody::Complete {
            content: body.owned("content")?,
            botname: body.owned("botname"),
        }),
        tags::MAKE_ASK | tags::REQUEST => {
            let question = body.owned("question")?;
            let options = body
                .text("options")
                .map(|raw| TagBody::extract(raw).all("option"))
                .unwrap_or_default()
                .into_iter()
                .filter(|o| !o.is_empty())
                .collect();
            let multiple = body
                .text("multiple")
                .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1"));
            Mapped::Body(ActionBody::Question {
                question,
                options,
                multiple,
            })
        }
        tags::EXECUTE_COMMAND => Mapped::Body(ActionBody::ShellCommand {
            command: body.owned("command")?,
        }),
        tags::START_ASYNC_CMD | tags::QUERY_ASYNC_CMD | tags::ABORT_ASYNC_CMD => {
            Mapped::Body(ActionBody::AsyncCommand {
                op: lifecycle_op(name),
                session: body.owned("session")?,
                command: body.owned("command"),
            })
        }
        tags::START_SUBTASK | tags::QUERY_SUBTASK | tags::ABORT_SUBTASK => {
            Mapped::Body(ActionBody::Subtask {
                op: lifecycle_op(name),
                session: body.owned("session")?,
                sub_agent: body.owned("sub-agent"),
                task_desc: body.owned("task-desc"),
                context: body.owned("context"),
                require: body.owned("require"),
            })
        }
        tags::PATH_LIST_FILES | tags::FILE_GET_CONTENT | tags::FILE_PUT_CONTENT
        | tags::FILE_REPLACE_TEXT => {
            let op = match name {
                tags::PATH_LIST_FILES => FileOpKind::ListFiles,
                tags::FILE_GET_CONTENT => FileOpKind::GetContent,
                tags::FILE_PUT_CONTENT => FileOpKind::PutContent,
                _ => FileOpKind::ReplaceText,
            };
            Mapped::Body(ActionBody::FileOp {
                op,
                path: body.owned("path")?,
                content: body.owned("content"),
                diff: body.owned("diff"),
            })
        }
        tags::USE_MCP_TOOL => Mapped::Body(ActionBody::McpTool {
            tool: body.owned("tool")?,
            server: body.owned("server")?,
            desc: body.owned("desc"),
            args: body.owned("args"),
        }),
        tags::USE_BUILTIN_TOOL => Mapped::Body(ActionBody::BuiltinTool {
            tool: body.owned("tool")?,
            desc: body.owned("title").or_else(|| body.owned("desc")),
            args: body.owned("args"),
        }),
        _ => Mapped::Body(ActionBody::Generic {
            content: body.owned("content")?,
            extra: body.extras(&["content"]),
        }),
    };
    Some(mapped)
}

fn lifecycle_op(name: &str) -> LifecycleOp {
    if name.starts_with("start-") {
        LifecycleOp::Start
    } else if name.starts_with("query-") {
        LifecycleOp::Query
    } else {
        LifecycleOp::Abort
    }
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Identical semantic action => identical hash. Only the identifying fields
/// take part, so a re-emitted command hashes the same whatever its extras.
pub fn content_hash(kind: &str, body: &ActionBody) -> String {
    let identifier = match body {
        ActionBody::Reply { content } => format!("{}:{}", tags::REPLY, content),
        ActionBody::Complete { content, .. } => format!("{}:{}", tags::COMPLETE, content),
        ActionBody::Question { question, .. } => format!("{kind}:{question}"),
        ActionBody::ShellCommand { command } => format!("{kind}:{command}"),
        ActionBody::AsyncCommand { session, .. } | ActionBody::Subtask { session, .. } => {
            format!("{kind}:{session}")
        }
        ActionBody::FileOp { path, .. } => format!("{kind}:{path}"),
        ActionBody::McpTool {
            tool,
            server,
            desc,
            args,
        } => format!(
            "{kind}:{server}:{tool}:{}:{}",
            desc.as_deref().unwrap_or_default(),
            sha256_hex(args.as_deref().unwrap_or_default())
        ),
        ActionBody::BuiltinTool { tool, desc, args } => format!(
            "{kind}:{tool}:{}:{}",
            desc.as_deref().unwrap_or_default(),
            sha256_hex(args.as_deref().unwrap_or_default())
        ),
        ActionBody::Generic { content, .. } => format!("{kind}:{content}"),
    };
    sha256_hex(&identifier)
}
