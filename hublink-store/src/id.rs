//! Record id generation.
//!
//! Ids look like `"<unix-millis>-<sequence>"`. The timestamp keeps them
//! roughly sortable by creation time; the atomic sequence makes them unique
//! even when many records land in the same millisecond.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

#[derive(Debug, Default)]
pub struct IdGenerator {
    sequence: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next id. Never returns the same value twice.
    pub fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", Utc::now().timestamp_millis())
    }
}
