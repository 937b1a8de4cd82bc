//! Bounded recent-output buffers, one per session.
//!
//! Not the primary log stream — just enough recent lines for the public
//! API to surface without tailing a file.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

const CAPACITY: usize = 100;

#[derive(Default)]
pub struct RingLogs {
    buffers: Mutex<HashMap<String, VecDeque<String>>>,
}

impl RingLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, session_id: &str, line: &str) {
        let mut buffers = self.buffers.lock();
        let buf = buffers.entry(session_id.to_string()).or_default();
        if buf.len() == CAPACITY {
            buf.pop_front();
        }
        buf.push_back(line.to_string());
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn recent(&self, session_id: &str) -> Vec<String> {
        self.buffers
            .lock()
            .get(session_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a session's buffer (teardown).
    pub fn remove(&self, session_id: &str) {
        self.buffers.lock().remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_last_hundred_lines() {
        let logs = RingLogs::new();
        for i in 0..250 {
            logs.push("s1", &format!("line {i}"));
        }
        let recent = logs.recent("s1");
        assert_eq!(recent.len(), CAPACITY);
        assert_eq!(recent.first().map(String::as_str), Some("line 150"));
        assert_eq!(recent.last().map(String::as_str), Some("line 249"));
    }

    #[test]
    fn sessions_are_independent() {
        let logs = RingLogs::new();
        logs.push("a", "from a");
        logs.push("b", "from b");
        assert_eq!(logs.recent("a"), vec!["from a"]);
        assert_eq!(logs.recent("b"), vec!["from b"]);
        assert!(logs.recent("c").is_empty());

        logs.remove("a");
        assert!(logs.recent("a").is_empty());
        assert_eq!(logs.session_count(), 1);
    }
}
