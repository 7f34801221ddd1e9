use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A decoded frame from the backend socket.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(from = "WireFrame")]
pub struct InboundFrame {
    pub method: String,
    pub action: String,
    pub task_id: Option<String>,
    pub detail: Value,
}

/// Older backends spell the task id `chatid`; some send both keys.
#[derive(Deserialize)]
struct WireFrame {
    #[serde(default)]
    method: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    taskid: Option<String>,
    #[serde(default)]
    chatid: Option<String>,
    #[serde(default)]
    detail: Value,
}

impl From<WireFrame> for InboundFrame {
    fn from(wire: WireFrame) -> Self {
        Self {
            method: wire.method,
            action: wire.action,
            task_id: wire.taskid.or(wire.chatid),
            detail: wire.detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    UserInput,
    Control,
    Respond,
    Stream,
    Errors,
    Change,
    Other(String),
}

impl InboundFrame {
    pub fn kind(&self) -> FrameAction {
        match self.action.as_str() {
            "user-input" => FrameAction::UserInput,
            "control" => FrameAction::Control,
            "respond" => FrameAction::Respond,
            "stream" => FrameAction::Stream,
            "errors" => FrameAction::Errors,
            "change" => FrameAction::Change,
            other => FrameAction::Other(other.to_string()),
        }
    }

    /// `detail` when it is a plain string.
    pub fn detail_str(&self) -> Option<&str> {
        self.detail.as_str()
    }
}

/// Payload of a `stream` frame.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamDetail {
    pub idx: u64,
    #[serde(rename = "str", default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutboundFrame {
    pub method: String,
    pub action: String,
    #[serde(rename = "chatid", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub detail: Value,
}

impl OutboundFrame {
    /// Handshake sent shortly after the socket opens.
    pub fn hello(app: &str) -> Self {
        Self {
            method: "system".to_string(),
            action: "hello".to_string(),
            task_id: None,
            detail: Value::String(format!("hi,{app}")),
        }
    }

    pub fn user_input(task_id: Option<&str>, content: &str, new_task: bool) -> Self {
        Self {
            method: "message".to_string(),
            action: "user-input".to_string(),
            task_id: task_id.map(str::to_string),
            detail: json!({
                "content": content,
                "uploads": [],
                "newTask": if new_task { "yes" } else { "" },
            }),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_accepts_either_task_id_spelling() {
        let a: InboundFrame =
            serde_json::from_str(r#"{"method":"message","action":"stream","taskid":"t1","detail":{"idx":1,"str":"hi"}}"#)
                .unwrap();
        let b: InboundFrame =
            serde_json::from_str(r#"{"method":"message","action":"respond","chatid":"t2"}"#).unwrap();
        assert_eq!(a.task_id.as_deref(), Some("t1"));
        assert_eq!(a.kind(), FrameAction::Stream);
        let detail: StreamDetail = serde_json::from_value(a.detail).unwrap();
        assert_eq!(detail, StreamDetail { idx: 1, text: "hi".into() });
        assert_eq!(b.task_id.as_deref(), Some("t2"));
        assert_eq!(b.detail, Value::Null);
    }

    #[test]
    fn taskid_wins_when_both_spellings_are_present() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"method":"message","action":"respond","taskid":"t1","chatid":"legacy"}"#,
        )
        .unwrap();
        assert_eq!(frame.task_id.as_deref(), Some("t1"));

        let frame: InboundFrame =
            serde_json::from_str(r#"{"method":"message","action":"respond","taskid":null,"chatid":"c1"}"#)
                .unwrap();
        assert_eq!(frame.task_id.as_deref(), Some("c1"));
    }

    #[test]
    fn unknown_actions_are_preserved() {
        let frame: InboundFrame = serde_json::from_str(r#"{"method":"system","action":"pong"}"#).unwrap();
        assert_eq!(frame.kind(), FrameAction::Other("pong".into()));
    }

    #[test]
    fn hello_frame_shape() {
        let text = OutboundFrame::hello("tagstream").to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"method": "system", "action": "hello", "detail": "hi,tagstream"})
        );
    }

    #[test]
    fn user_input_frame_shape() {
        let frame = OutboundFrame::user_input(Some("t9"), "hello", true);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["chatid"], "t9");
        assert_eq!(value["detail"]["newTask"], "yes");
        assert_eq!(value["detail"]["uploads"], json!([]));
    }
}
