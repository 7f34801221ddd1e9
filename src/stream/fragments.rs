use std::collections::{BTreeMap, HashMap};

/// Correlation ids carried by fragment 0 as `data:<worker>:<msgid>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlHeader {
    pub worker: String,
    pub msg_id: String,
}

impl ControlHeader {
    pub fn parse(chunk: &str) -> Option<Self> {
        let rest = chunk.trim().strip_prefix("data:")?;
        let (worker, msg_id) = rest.split_once(':')?;
        Some(Self {
            worker: worker.to_string(),
            msg_id: msg_id.to_string(),
        })
    }
}

/// Indexed stream chunks per task. Index 0 is the control header, body text
/// starts at 1.
#[derive(Debug, Default)]
pub struct FragmentStore {
    tasks: HashMap<String, BTreeMap<u64, String>>,
}

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repeated index overwrites the earlier chunk.
    pub fn insert(&mut self, task: &str, index: u64, chunk: impl Into<String>) {
        self.tasks
            .entry(task.to_string())
            .or_default()
            .insert(index, chunk.into());
    }

    pub fn has_data(&self, task: &str) -> bool {
        self.tasks.get(task).is_some_and(|m| !m.is_empty())
    }

    /// Forget everything buffered for `task` but keep it known.
    pub fn reset(&mut self, task: &str) {
        if let Some(map) = self.tasks.get_mut(task) {
            map.clear();
        }
    }

    pub fn evict(&mut self, task: &str) {
        self.tasks.remove(task);
    }

    /// Chunks 1..N concatenated while the indices are contiguous; `None`
    /// when index 1 has not arrived yet.
    pub fn contiguous_body(&self, task: &str) -> Option<String> {
        let map = self.tasks.get(task)?;
        let mut body = String::new();
        let mut expected = 1;
        for (&index, chunk) in map.range(1..) {
            if index != expected {
                break;
            }
            body.push_str(chunk);
            expected += 1;
        }
        (expected > 1).then_some(body)
    }

    pub fn control_header(&self, task: &str) -> Option<ControlHeader> {
        self.tasks
            .get(task)
            .and_then(|m| m.get(&0))
            .and_then(|chunk| ControlHeader::parse(chunk))
    }
}
