//! Dual-sided call logger.
//!
//! Every call produces exactly two denormalized history rows, one per
//! participant, each naming the *other* party, so either user's call history
//! is queryable without a join. Rows are created when the call starts
//! ringing and updated in place at termination.

use std::sync::Arc;

use log::debug;

use crate::store::traits::{CallLogSink, CallLogStore, Result, WatchHandle};
use crate::types::call::{CallDirection, CallLogEntry, CallRecord};

pub struct CallLogger {
    store: Arc<dyn CallLogStore>,
}

impl CallLogger {
    pub fn new(store: Arc<dyn CallLogStore>) -> Self {
        Self { store }
    }

    /// Write or update both participants' rows for this call.
    ///
    /// Safe to call more than once per call id: the second write updates
    /// status and duration on the existing rows instead of duplicating them.
    pub async fn log_call(&self, record: &CallRecord) -> Result<()> {
        let sides = [
            (&record.caller, &record.receiver, CallDirection::Outgoing),
            (&record.receiver, &record.caller, CallDirection::Incoming),
        ];
        for (owner, contact, direction) in sides {
            let entry = CallLogEntry {
                owner_id: owner.user_id.clone(),
                call_id: record.call_id.clone(),
                contact: contact.clone(),
                call_type: record.call_type,
                direction,
                status: record.status,
                // The call's start time, not the write time, so a terminal
                // update never moves the row in the history ordering.
                timestamp: record.start_time,
                duration_secs: record.duration_secs,
            };
            self.store.upsert_log(&entry).await?;
        }
        debug!(
            "logged call {} for {} and {} ({})",
            record.call_id, record.caller.user_id, record.receiver.user_id, record.status
        );
        Ok(())
    }

    /// One user's history, newest first.
    pub async fn call_history(&self, user_id: &str, limit: usize) -> Result<Vec<CallLogEntry>> {
        self.store.logs_for_user(user_id, limit).await
    }

    /// Incremental history subscription with the same newest-first ordering.
    pub fn subscribe_history(&self, user_id: &str, limit: usize, sink: CallLogSink) -> WatchHandle {
        self.store.watch_logs(user_id, limit, sink)
    }
}
