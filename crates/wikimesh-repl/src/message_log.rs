//! Message log: the dedup ledger of every message this node stored, sent,
//! received or handled.
//!
//! A receiver records an inbound id with [`MessageLog::save_if_absent`] before
//! queueing it for processing, and deletes the record again if queueing fails
//! so that a redelivery is not dropped forever.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::message::MessageHeader;
use crate::store::{MemoryTable, Table};

/// Lifecycle status of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Produced locally and queued for sending.
    Stored,
    /// Delivered to at least one target.
    Sent,
    /// Received from a peer, not yet handled.
    Received,
    /// Received and processed by its receiver.
    Handled,
}

/// One row of the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedMessage {
    /// Message id (unique key).
    pub id: String,
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Origin instance uri.
    pub source: String,
    /// Date of the message at its origin.
    pub date: DateTime<Utc>,
    /// Current status.
    pub status: MessageStatus,
    /// When this row was last written.
    pub updated_at: DateTime<Utc>,
}

impl LoggedMessage {
    fn from_header(header: &MessageHeader, status: MessageStatus) -> Self {
        Self {
            id: header.id.clone(),
            kind: header.kind.clone(),
            source: header.source.clone(),
            date: header.date,
            status,
            updated_at: Utc::now(),
        }
    }
}

/// Durable per-message log with an existence check.
pub struct MessageLog {
    table: Arc<dyn Table<LoggedMessage>>,
    guard: Mutex<()>,
}

impl MessageLog {
    /// Log backed by the given table.
    pub fn new(table: Arc<dyn Table<LoggedMessage>>) -> Self {
        Self {
            table,
            guard: Mutex::new(()),
        }
    }

    /// Log backed by an in-memory table.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTable::new()))
    }

    /// Returns true if a row exists for `id`.
    pub fn exist(&self, id: &str) -> Result<bool> {
        self.table.contains(id)
    }

    /// Insert or overwrite the row for `header.id`.
    pub fn save(&self, header: &MessageHeader, status: MessageStatus) -> Result<()> {
        let _guard = self.guard.lock();
        self.table.put(&header.id, LoggedMessage::from_header(header, status))
    }

    /// Atomically check and save. Returns false if the id was already logged,
    /// in which case nothing is written.
    pub fn save_if_absent(&self, header: &MessageHeader, status: MessageStatus) -> Result<bool> {
        let _guard = self.guard.lock();
        if self.table.contains(&header.id)? {
            debug!(id = %header.id, "message already logged");
            return Ok(false);
        }
        self.table.put(&header.id, LoggedMessage::from_header(header, status))?;
        Ok(true)
    }

    /// Update the status of an existing row. Returns false if the id is unknown.
    pub fn mark(&self, id: &str, status: MessageStatus) -> Result<bool> {
        let _guard = self.guard.lock();
        let Some(mut row) = self.table.get(id)? else {
            return Ok(false);
        };
        row.status = status;
        row.updated_at = Utc::now();
        self.table.put(id, row)?;
        Ok(true)
    }

    /// Remove the row for `id`. Returns true if it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.guard.lock();
        self.table.delete(id)
    }

    /// Current status of `id`.
    pub fn status(&self, id: &str) -> Result<Option<MessageStatus>> {
        Ok(self.table.get(id)?.map(|row| row.status))
    }

    /// Full row for `id`.
    pub fn get(&self, id: &str) -> Result<Option<LoggedMessage>> {
        self.table.get(id)
    }

    /// Number of rows.
    pub fn len(&self) -> Result<usize> {
        Ok(self.table.values()?.len())
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn header(id: &str) -> MessageHeader {
        MessageHeader::new(id, "update", "http://origin")
    }

    #[test]
    fn test_save_then_exist() {
        let log = MessageLog::in_memory();
        assert!(!log.exist("m1").unwrap());
        log.save(&header("m1"), MessageStatus::Received).unwrap();
        assert!(log.exist("m1").unwrap());
        assert_eq!(log.status("m1").unwrap(), Some(MessageStatus::Received));
    }

    #[test]
    fn test_delete_then_not_exist() {
        let log = MessageLog::in_memory();
        log.save(&header("m1"), MessageStatus::Stored).unwrap();
        assert!(log.delete("m1").unwrap());
        assert!(!log.exist("m1").unwrap());
        assert!(!log.delete("m1").unwrap());
    }

    #[test]
    fn test_save_if_absent_rejects_second() {
        let log = MessageLog::in_memory();
        assert!(log.save_if_absent(&header("m1"), MessageStatus::Received).unwrap());
        assert!(!log.save_if_absent(&header("m1"), MessageStatus::Received).unwrap());
        assert_eq!(log.len().unwrap(), 1);
    }

    #[test]
    fn test_mark_updates_status() {
        let log = MessageLog::in_memory();
        log.save(&header("m1"), MessageStatus::Received).unwrap();
        assert!(log.mark("m1", MessageStatus::Handled).unwrap());
        assert_eq!(log.status("m1").unwrap(), Some(MessageStatus::Handled));
        assert!(!log.mark("missing", MessageStatus::Handled).unwrap());
    }

    #[test]
    fn test_row_records_header_fields() {
        let log = MessageLog::in_memory();
        log.save(&header("m1"), MessageStatus::Stored).unwrap();
        let row = log.get("m1").unwrap().unwrap();
        assert_eq!(row.kind, "update");
        assert_eq!(row.source, "http://origin");
    }

    #[test]
    fn test_concurrent_save_if_absent_single_winner() {
        let log = Arc::new(MessageLog::in_memory());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let log = log.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if log.save_if_absent(&header("race"), MessageStatus::Received).unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(log.len().unwrap(), 1);
    }

    proptest! {
        #[test]
        fn prop_exist_tracks_last_operation(ops in prop::collection::vec((0u8..8, any::<bool>()), 1..64)) {
            let log = MessageLog::in_memory();
            let mut model = std::collections::HashSet::new();
            for (n, save) in ops {
                let id = format!("m{}", n);
                if save {
                    log.save(&header(&id), MessageStatus::Received).unwrap();
                    model.insert(id.clone());
                } else {
                    log.delete(&id).unwrap();
                    model.remove(&id);
                }
                prop_assert_eq!(log.exist(&id).unwrap(), model.contains(&id));
            }
        }
    }
}
