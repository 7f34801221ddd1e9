use super::fragments::FragmentStore;
use super::throttle::Throttle;
use super::upstream::UpstreamError;
use crate::config::StreamConfig;
use crate::connection::{FrameAction, InboundFrame, StreamDetail};
use crate::protocol::{self, ParsedMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const RUNNING: &str = "running";

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub tick_interval: Duration,
    pub grace_delay: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            grace_delay: config.grace_delay(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AssemblerEvent {
    UserInput { task: Option<String> },
    Respond { task: Option<String> },
    /// A freshly materialized message; replaces any earlier one.
    Message { task: String, message: Arc<ParsedMessage> },
    /// The in-flight message was discarded.
    Cleared { task: Option<String> },
    Control { task: Option<String>, state: String },
    RunFailed { task: Option<String>, error: UpstreamError },
    FileChange { task: Option<String>, detail: serde_json::Value },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub ticks: u64,
    pub materialized: u64,
    /// Tags removed by the required-field gate, summed over materializations.
    pub dropped_tags: u64,
}

#[derive(Debug)]
struct PendingClear {
    task: Option<String>,
    due: Instant,
}

/// Turns indexed stream fragments into parsed messages.
///
/// Clock-explicit: callers pass `now` and drive [`StreamAssembler::on_timer`]
/// at [`StreamAssembler::next_deadline`].
#[derive(Debug)]
pub struct StreamAssembler {
    primary: Option<String>,
    subtasks: Vec<String>,
    fragments: FragmentStore,
    running: bool,
    current: Option<Arc<ParsedMessage>>,
    error_message: Option<String>,
    throttle: Throttle,
    grace_delay: Duration,
    grace: Option<PendingClear>,
    stats: AssemblerStats,
}

impl StreamAssembler {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            primary: None,
            subtasks: Vec::new(),
            fragments: FragmentStore::new(),
            running: false,
            current: None,
            error_message: None,
            throttle: Throttle::new(settings.tick_interval),
            grace_delay: settings.grace_delay,
            grace: None,
            stats: AssemblerStats::default(),
        }
    }

    pub fn handle_frame(&mut self, frame: &InboundFrame, now: Instant) -> Vec<AssemblerEvent> {
        let task = frame.task_id.clone();
        let mut events = Vec::new();
        match frame.kind() {
            FrameAction::UserInput => {
                self.current = Some(Arc::new(ParsedMessage::default()));
                if let Some(id) = self.task_or_primary(&task) {
                    self.fragments.reset(&id);
                }
                events.push(AssemblerEvent::UserInput { task });
            }
            FrameAction::Control => {
                let state = match frame.detail_str() {
                    Some(s) => s.to_string(),
                    None => frame.detail.to_string(),
                };
                events.push(AssemblerEvent::Control {
                    task: task.clone(),
                    state: state.clone(),
                });
                if state == RUNNING {
                    self.running = true;
                    self.grace = None;
                } else {
                    info!("Run finished for {:?}: {}", task, state);
                    self.running = false;
                    self.current = None;
                    self.throttle.cancel();
                    if let Some(id) = self.task_or_primary(&task) {
                        self.fragments.evict(&id);
                    }
                    events.push(AssemblerEvent::Cleared { task: task.clone() });
                    self.grace = Some(PendingClear {
                        task,
                        due: now + self.grace_delay,
                    });
                }
            }
            FrameAction::Respond => {
                self.error_message = None;
                self.current = Some(Arc::new(ParsedMessage::default()));
                if self.primary.is_none() {
                    self.primary = task.clone();
                }
                if let Some(id) = self.task_or_primary(&task) {
                    self.fragments.evict(&id);
                }
                events.push(AssemblerEvent::Respond { task });
                events.extend(self.request_tick(now));
            }
            FrameAction::Stream => {
                self.error_message = None;
                match serde_json::from_value::<StreamDetail>(frame.detail.clone()) {
                    Ok(detail) => match self.task_or_primary(&task) {
                        Some(id) => {
                            self.ingest(&id, detail.idx, detail.text);
                            events.extend(self.request_tick(now));
                        }
                        None => warn!("Dropping stream fragment {} without task id", detail.idx),
                    },
                    Err(e) => warn!("Malformed stream detail: {}", e),
                }
            }
            FrameAction::Errors => {
                let raw = match frame.detail_str() {
                    Some(s) => s.to_string(),
                    None => frame.detail.to_string(),
                };
                let error = UpstreamError::parse(&raw);
                if error.is_terminal() {
                    warn!("Run failed for {:?}: {}", task, error.message());
                    self.current = None;
                    self.running = false;
                    self.throttle.cancel();
                    self.error_message = Some(error.message());
                    events.push(AssemblerEvent::RunFailed { task, error });
                } else {
                    debug!("Ignoring transient upstream error {}", error.code);
                }
            }
            FrameAction::Change => {
                events.push(AssemblerEvent::FileChange {
                    task,
                    detail: frame.detail.clone(),
                });
            }
            FrameAction::Other(action) => debug!("Ignoring frame action {}", action),
        }
        events
    }

    /// Run whatever timer work is due at `now`.
    pub fn on_timer(&mut self, now: Instant) -> Vec<AssemblerEvent> {
        let mut events = Vec::new();
        if self.throttle.fire(now) {
            events.extend(self.tick());
        }
        if self.grace.as_ref().is_some_and(|g| g.due <= now) {
            if let Some(pending) = self.grace.take() {
                if !self.running {
                    self.current = None;
                    if let Some(id) = self.task_or_primary(&pending.task) {
                        self.fragments.evict(&id);
                    }
                    events.push(AssemblerEvent::Cleared { task: pending.task });
                }
            }
        }
        events
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let grace = self.grace.as_ref().map(|g| g.due);
        match (self.throttle.deadline(), grace) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn ingest(&mut self, task: &str, index: u64, chunk: impl Into<String>) {
        self.fragments.insert(task, index, chunk);
    }

    /// Materialize the current candidate document. Sub-tasks with pending
    /// data take priority over the primary task.
    pub fn tick(&mut self) -> Option<AssemblerEvent> {
        if !self.running {
            return None;
        }
        self.stats.ticks += 1;
        let task = self
            .subtasks
            .iter()
            .find(|id| self.fragments.has_data(id))
            .cloned()
            .or_else(|| self.primary.clone())?;
        let body = self.fragments.contiguous_body(&task)?;
        let (worker, msg_id) = match self.fragments.control_header(&task) {
            Some(header) => (Some(header.worker), Some(header.msg_id)),
            None => (None, None),
        };
        let message = Arc::new(protocol::parse(&body).with_ids(worker, msg_id));
        self.stats.materialized += 1;
        self.stats.dropped_tags += message.dropped as u64;
        self.current = Some(message.clone());
        Some(AssemblerEvent::Message { task, message })
    }

    pub fn set_primary(&mut self, task: Option<String>) {
        self.primary = task;
    }

    pub fn primary(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    pub fn set_subtasks(&mut self, ids: Vec<String>) {
        self.subtasks = ids;
    }

    pub fn current(&self) -> Option<Arc<ParsedMessage>> {
        self.current.clone()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    fn request_tick(&mut self, now: Instant) -> Option<AssemblerEvent> {
        if self.throttle.request(now) {
            self.tick()
        } else {
            None
        }
    }

    fn task_or_primary(&self, task: &Option<String>) -> Option<String> {
        task.clone().or_else(|| self.primary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MS: Duration = Duration::from_millis(1);

    fn settings() -> StreamSettings {
        StreamSettings {
            tick_interval: 180 * MS,
            grace_delay: 500 * MS,
        }
    }

    fn frame(action: &str, task: &str, detail: serde_json::Value) -> InboundFrame {
        InboundFrame {
            method: "message".to_string(),
            action: action.to_string(),
            task_id: Some(task.to_string()),
            detail,
        }
    }

    fn chunk(task: &str, idx: u64, text: &str) -> InboundFrame {
        frame("stream", task, json!({"idx": idx, "str": text}))
    }

    fn messages(events: &[AssemblerEvent]) -> Vec<Arc<ParsedMessage>> {
        events
            .iter()
            .filter_map(|e| match e {
                AssemblerEvent::Message { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn started(now: Instant) -> StreamAssembler {
        let mut assembler = StreamAssembler::new(settings());
        assembler.handle_frame(&frame("control", "t1", json!("running")), now);
        assembler.handle_frame(&frame("respond", "t1", json!(null)), now);
        assembler
    }

    #[test]
    fn fragments_materialize_on_throttled_ticks() {
        let t0 = Instant::now();
        let mut assembler = started(t0);
        assert_eq!(assembler.primary(), Some("t1"));

        let events = assembler.handle_frame(&chunk("t1", 0, "data:w1:m1"), t0 + 200 * MS);
        assert!(messages(&events).is_empty());

        let events = assembler.handle_frame(&chunk("t1", 1, "Checking <exec"), t0 + 210 * MS);
        assert!(messages(&events).is_empty());
        assert_eq!(assembler.next_deadline(), Some(t0 + 380 * MS));

        let events = assembler.on_timer(t0 + 380 * MS);
        let first = messages(&events).remove(0);
        assert_eq!(first.replies().collect::<Vec<_>>(), vec!["Checking"]);
        assert_eq!(first.msg_id.as_deref(), Some("m1"));
        assert_eq!(first.worker_id.as_deref(), Some("w1"));

        assembler.handle_frame(
            &chunk("t1", 2, "ute-command><command>ls</command></execute-command>"),
            t0 + 400 * MS,
        );
        let events = assembler.on_timer(t0 + 560 * MS);
        let second = messages(&events).remove(0);
        assert_eq!(second.tool_actions().count(), 1);
        assert!(Arc::ptr_eq(&second, &assembler.current().unwrap()));
        assert_eq!(assembler.stats().materialized, 2);
    }

    #[test]
    fn gap_holds_back_later_fragments() {
        let t0 = Instant::now();
        let mut assembler = started(t0);
        assembler.ingest("t1", 1, "a");
        assembler.ingest("t1", 3, "c");
        let Some(AssemblerEvent::Message { message, .. }) = assembler.tick() else {
            panic!("expected a message");
        };
        assert_eq!(message.origin, "a");
        assembler.ingest("t1", 2, "b");
        let Some(AssemblerEvent::Message { message, .. }) = assembler.tick() else {
            panic!("expected a message");
        };
        assert_eq!(message.origin, "abc");
    }

    #[test]
    fn subtask_with_data_takes_priority() {
        let t0 = Instant::now();
        let mut assembler = started(t0);
        assembler.set_subtasks(vec!["idle-sub".into(), "sub".into()]);
        assembler.ingest("t1", 1, "primary text");
        assembler.ingest("sub", 1, "sub text");
        match assembler.tick() {
            Some(AssemblerEvent::Message { task, message }) => {
                assert_eq!(task, "sub");
                assert_eq!(message.origin, "sub text");
            }
            other => panic!("unexpected {other:?}"),
        }

        assembler.set_subtasks(Vec::new());
        match assembler.tick() {
            Some(AssemblerEvent::Message { task, .. }) => assert_eq!(task, "t1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nothing_materializes_while_not_running() {
        let t0 = Instant::now();
        let mut assembler = StreamAssembler::new(settings());
        assembler.set_primary(Some("t1".into()));
        let events = assembler.handle_frame(&chunk("t1", 1, "hello"), t0);
        assert!(messages(&events).is_empty());
        assert!(assembler.tick().is_none());
        assert_eq!(assembler.stats().ticks, 0);
    }

    #[test]
    fn terminal_control_clears_now_and_after_grace() {
        let t0 = Instant::now();
        let mut assembler = started(t0);
        assembler.handle_frame(&chunk("t1", 1, "partial"), t0 + 200 * MS);
        assert!(assembler.current().is_some());

        let events = assembler.handle_frame(&frame("control", "t1", json!("done")), t0 + 300 * MS);
        assert!(events.iter().any(|e| matches!(e, AssemblerEvent::Cleared { .. })));
        assert!(assembler.current().is_none());
        assert!(!assembler.fragments.has_data("t1"));
        assert_eq!(assembler.next_deadline(), Some(t0 + 800 * MS));

        // A fragment still in flight lands after completion.
        assembler.handle_frame(&chunk("t1", 2, "late"), t0 + 350 * MS);
        assert!(assembler.fragments.has_data("t1"));

        let events = assembler.on_timer(t0 + 800 * MS);
        assert!(matches!(events.as_slice(), [AssemblerEvent::Cleared { .. }]));
        assert!(!assembler.fragments.has_data("t1"));
        assert_eq!(assembler.next_deadline(), None);
    }

    #[test]
    fn restart_within_grace_cancels_clear() {
        let t0 = Instant::now();
        let mut assembler = started(t0);
        assembler.handle_frame(&frame("control", "t1", json!("done")), t0);
        assembler.handle_frame(&frame("control", "t1", json!("running")), t0 + 100 * MS);
        assert!(assembler.on_timer(t0 + 600 * MS).is_empty());
    }

    #[test]
    fn upstream_errors_are_classified() {
        let t0 = Instant::now();
        let mut assembler = started(t0);

        let events = assembler.handle_frame(&frame("errors", "t1", json!("EmptyLlmResponse:retrying")), t0);
        assert!(events.is_empty());
        assert!(assembler.is_running());

        let events = assembler.handle_frame(
            &frame("errors", "t1", json!("ExceededMaximumTurns:limit 30")),
            t0,
        );
        assert!(matches!(events.as_slice(), [AssemblerEvent::RunFailed { .. }]));
        assert!(!assembler.is_running());
        assert!(assembler.current().is_none());
        assert_eq!(assembler.error_message(), Some("ExceededMaximumTurns: limit 30"));

        assembler.handle_frame(&chunk("t1", 1, "x"), t0);
        assert_eq!(assembler.error_message(), None);
    }

    #[test]
    fn user_input_and_change_are_forwarded() {
        let t0 = Instant::now();
        let mut assembler = started(t0);
        assembler.ingest("t1", 1, "old");
        let events = assembler.handle_frame(&frame("user-input", "t1", json!("hi")), t0);
        assert!(matches!(events.as_slice(), [AssemblerEvent::UserInput { .. }]));
        assert!(!assembler.fragments.has_data("t1"));
        assert!(assembler.current().unwrap().is_empty());

        let events = assembler.handle_frame(&frame("change", "t1", json!({"path": "a.rs"})), t0);
        match events.as_slice() {
            [AssemblerEvent::FileChange { detail, .. }] => assert_eq!(detail["path"], "a.rs"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dropped_tags_are_counted() {
        let t0 = Instant::now();
        let mut assembler = started(t0);
        assembler.ingest("t1", 1, "<execute-command></execute-command><file-get-content></file-get-content>");
        assembler.tick();
        assert_eq!(assembler.stats().dropped_tags, 2);
    }
}
