use super::frame::InboundFrame;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type FrameHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

/// Frame callbacks keyed by frame `method`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<Mutex<HashMap<String, Vec<FrameHandler>>>>,
}

impl HandlerRegistry {
    pub fn register(&self, method: &str, handler: FrameHandler) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(method.to_string()).or_default().push(handler);
    }

    /// Call every handler for the frame's method, synchronously, in
    /// registration order. Returns how many ran.
    pub fn dispatch(&self, frame: &InboundFrame) -> usize {
        // Snapshot so a handler may register more handlers.
        let handlers = {
            let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&frame.method).cloned().unwrap_or_default()
        };
        for handler in &handlers {
            handler(frame);
        }
        handlers.len()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("HandlerRegistry")
            .field("methods", &map.keys().collect::<Vec<_>>())
            .finish()
    }
}
