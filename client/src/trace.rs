//! Line-level traffic trace for debugging sessions.

use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared log of traffic exchanged with the SCI server.
///
/// Control lines read from or written to the server are recorded with
/// a direction prefix. Body bytes are not traced.
#[derive(Clone, Default)]
pub struct TraceLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a line received from the server.
    pub async fn recv(&self, line: &str) {
        let mut entries = self.entries.lock().await;
        entries.push(format!("recv: {}", line));
    }

    /// Record data about to be sent to the server.
    pub async fn send(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let mut entries = self.entries.lock().await;
        entries.push(format!("send: {}", text.trim_end_matches("\r\n")));
    }

    /// Drain the recorded entries.
    pub async fn take(&self) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        std::mem::take(&mut *entries)
    }
}
