//! Request id to cancellation trigger mapping
//!
//! The registry is shared by every in-flight call on a server and by the
//! cancel service. All operations take the same mutex; triggers are invoked
//! after the entry has been removed and the lock released.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::rpc::envelope::RequestId;

/// Identifies the accepted connection that owns a registry entry.
pub type ConnectionId = u64;

#[derive(Debug)]
struct Entry {
    connection: Option<ConnectionId>,
    trigger: CancellationToken,
}

#[derive(Debug, Default)]
pub struct CancelRegistry {
    entries: Mutex<HashMap<RequestId, Entry>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `trigger` under `id`. A previous entry for the same id is
    /// replaced without being cancelled.
    pub fn register(&self, id: RequestId, trigger: CancellationToken) {
        self.insert(id, None, trigger);
    }

    pub(crate) fn register_for(
        &self,
        connection: ConnectionId,
        id: RequestId,
        trigger: CancellationToken,
    ) {
        self.insert(id, Some(connection), trigger);
    }

    fn insert(&self, id: RequestId, connection: Option<ConnectionId>, trigger: CancellationToken) {
        let entry = Entry {
            connection,
            trigger,
        };
        let replaced = self.entries.lock().insert(id.clone(), entry).is_some();

        if replaced {
            debug!(request_id = %id, "replaced existing cancellation trigger");
        }
    }

    /// Removes the entry for `id`; absent ids are ignored.
    pub fn unregister(&self, id: &RequestId) {
        self.entries.lock().remove(id);
    }

    /// Removes the entry for `id` only while `connection` still owns it, so a
    /// finished call cannot drop a newer registration that reused its id.
    pub(crate) fn unregister_for(&self, connection: ConnectionId, id: &RequestId) {
        let mut entries = self.entries.lock();
        if entries
            .get(id)
            .is_some_and(|entry| entry.connection == Some(connection))
        {
            entries.remove(id);
        }
    }

    /// Cancels the call registered under `id`.
    ///
    /// Returns a confirmation message, or an empty string when no such call is
    /// in flight. Cancelling an unknown or already finished call is not an
    /// error since it routinely races with normal completion.
    pub fn cancel(&self, id: &RequestId) -> String {
        let entry = self.entries.lock().remove(id);

        match entry {
            Some(entry) => {
                entry.trigger.cancel();
                debug!(request_id = %id, "cancellation triggered");
                format!("request {id} canceled")
            }
            None => {
                debug!(request_id = %id, "cancel for unknown request ignored");
                String::new()
            }
        }
    }

    /// Removes every entry owned by `connection`, cancelling each one.
    pub(crate) fn sweep(&self, connection: ConnectionId) -> usize {
        let swept: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, entry)| entry.connection == Some(connection))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        for entry in &swept {
            entry.trigger.cancel();
        }
        swept.len()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
