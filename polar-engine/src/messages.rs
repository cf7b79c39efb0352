use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Print,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub msg: String,
}

impl Message {
    pub fn warning(msg: String) -> Self {
        Self {
            kind: MessageKind::Warning,
            msg,
        }
    }
}

/// Out-of-band output (`print`, log lines, load warnings) the host drains between events.
///
/// Clones share the same underlying queue.
#[derive(Clone, Debug, Default)]
pub struct MessageQueue {
    messages: Arc<Mutex<VecDeque<Message>>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Option<Message> {
        if let Ok(mut messages) = self.messages.lock() {
            messages.pop_front()
        } else {
            None
        }
    }

    pub fn push(&self, kind: MessageKind, msg: String) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push_back(Message { kind, msg });
        }
    }

    pub fn extend<T: IntoIterator<Item = Message>>(&self, iter: T) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.extend(iter)
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
