//! Bounded per-node command queue
//!
//! A ring buffer behind a mutex: pushes never block, overflow drops the
//! oldest pending message with a warning. The stream send task is the sole
//! consumer; delivery order is FIFO.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

use crate::proto::ControlMessage;

/// Default queue capacity per node
pub const COMMAND_QUEUE_CAPACITY: usize = 32;

pub struct CommandQueue {
    inner: Mutex<VecDeque<ControlMessage>>,
    notify: Notify,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a message, dropping the oldest pending one at capacity.
    /// Returns the dropped message, if any.
    pub fn push(&self, node_id: &str, msg: ControlMessage) -> Option<ControlMessage> {
        let mut queue = self.inner.lock().expect("command queue poisoned");
        let dropped = if queue.len() >= self.capacity {
            let head = queue.pop_front();
            warn!(
                node_id,
                capacity = self.capacity,
                "command queue full, dropping oldest pending command"
            );
            head
        } else {
            None
        };
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
        dropped
    }

    /// Take the next message, waiting until one is available
    pub async fn pop(&self) -> ControlMessage {
        loop {
            {
                let mut queue = self.inner.lock().expect("command queue poisoned");
                if let Some(msg) = queue.pop_front() {
                    return msg;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking take
    pub fn try_pop(&self) -> Option<ControlMessage> {
        self.inner
            .lock()
            .expect("command queue poisoned")
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("command queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(COMMAND_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::proto::{Command, CommandKind};

    fn cmd(id: &str) -> ControlMessage {
        ControlMessage::Command(Command {
            command_id: id.to_string(),
            kind: CommandKind::HealthCheck,
            payload: serde_json::Value::Null,
            deadline_secs: None,
        })
    }

    fn id_of(msg: &ControlMessage) -> &str {
        match msg {
            ControlMessage::Command(c) => &c.command_id,
            ControlMessage::ConfigUpdate(_) => "<config>",
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = CommandQueue::new(4);
        queue.push("n", cmd("a"));
        queue.push("n", cmd("b"));
        queue.push("n", cmd("c"));

        assert_eq!(id_of(&queue.try_pop().unwrap()), "a");
        assert_eq!(id_of(&queue.try_pop().unwrap()), "b");
        assert_eq!(id_of(&queue.try_pop().unwrap()), "c");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = CommandQueue::new(COMMAND_QUEUE_CAPACITY);
        for i in 0..COMMAND_QUEUE_CAPACITY {
            assert!(queue.push("n", cmd(&format!("c{i}"))).is_none());
        }

        // The 33rd enqueue drops the head and still succeeds
        let dropped = queue.push("n", cmd("c32"));
        assert_eq!(id_of(dropped.as_ref().unwrap()), "c0");
        assert_eq!(queue.len(), COMMAND_QUEUE_CAPACITY);
        assert_eq!(id_of(&queue.try_pop().unwrap()), "c1");
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(CommandQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("n", cmd("late"));

        let msg = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop timed out")
            .unwrap();
        assert_eq!(id_of(&msg), "late");
    }
}
