//! `MessageStore`: append-only per-query log of user-visible messages
//! (spec.md section 2). Backs the `message_<userQueryId>` table mentioned in
//! spec.md section 6 and the `GET /queries/:id` admin endpoint.

use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryMessage {
    pub severity: Severity,
    pub chunk_id: Option<i32>,
    pub code: i32,
    pub text: String,
    pub timestamp_millis: u128,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Mutex<Vec<QueryMessage>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, severity: Severity, chunk_id: Option<i32>, code: i32, text: impl Into<String>) {
        let timestamp_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        self.messages.lock().push(QueryMessage {
            severity,
            chunk_id,
            code,
            text: text.into(),
            timestamp_millis,
        });
    }

    pub fn info(&self, chunk_id: Option<i32>, code: i32, text: impl Into<String>) {
        self.add(Severity::Info, chunk_id, code, text);
    }

    pub fn warn(&self, chunk_id: Option<i32>, code: i32, text: impl Into<String>) {
        self.add(Severity::Warn, chunk_id, code, text);
    }

    pub fn error(&self, chunk_id: Option<i32>, code: i32, text: impl Into<String>) {
        self.add(Severity::Error, chunk_id, code, text);
    }

    /// The first ERROR-severity message, if any — used to surface the
    /// "first fatal error wins" rule from spec.md section 7.
    pub fn first_error(&self) -> Option<QueryMessage> {
        self.messages
            .lock()
            .iter()
            .find(|m| m.severity == Severity::Error)
            .cloned()
    }

    pub fn all(&self) -> Vec<QueryMessage> {
        self.messages.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let store = MessageStore::new();
        store.info(Some(1), 0, "chunk 1 started");
        store.error(Some(2), 500, "chunk 2 sql error");
        store.error(Some(3), 501, "chunk 3 sql error");
        let first = store.first_error().unwrap();
        assert_eq!(first.code, 500);
        assert_eq!(store.all().len(), 3);
    }
}
