//! Durable mirror of agent output into the shared store.

use std::sync::Arc;

use async_trait::async_trait;

use sb_store::StateStore;
use sb_supervisor::{LogSink, OutputChannel};

/// Forwards each pumped line into the capped `agent:{id}:logs` list.
/// Best-effort: a store hiccup loses log lines, never agent output
/// handling.
pub struct StoreLogSink {
    store: Arc<dyn StateStore>,
}

impl StoreLogSink {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LogSink for StoreLogSink {
    async fn append(&self, session_id: &str, channel: OutputChannel, line: &str) {
        let entry = match channel {
            OutputChannel::Out => line.to_string(),
            OutputChannel::Err => format!("[stderr] {line}"),
        };
        if let Err(e) = self.store.append_log(session_id, &entry).await {
            tracing::debug!(session_id = %session_id, error = %e, "log mirror write failed");
        }
    }
}
