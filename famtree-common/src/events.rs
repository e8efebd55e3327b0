//! Event types for the famtree event system
//!
//! Provides shared event definitions and the EventBus used to fan out import
//! progress to SSE clients and any other in-process listener.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// famtree event types
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FamtreeEvent {
    /// Upload accepted and import session created
    ///
    /// Triggers:
    /// - SSE: Show import progress UI
    ImportSessionStarted {
        /// Upload identifier
        upload_id: Uuid,
        /// Original file name as supplied by the caller
        file_name: String,
        /// When session started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Import progress checkpoint
    ///
    /// Emitted at coarse checkpoints only (parse start/end, resolution
    /// batches, commit start/end).
    ImportProgressUpdate {
        /// Upload identifier
        upload_id: Uuid,
        /// Current session state
        state: String,
        /// Current phase
        phase: String,
        /// Progress percentage (0-100)
        percentage: u8,
        /// Estimated remaining time in seconds (if available)
        estimated_remaining_seconds: Option<u64>,
        /// When progress updated
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Parsing and matching finished, preview available
    ImportPreviewReady {
        /// Upload identifier
        upload_id: Uuid,
        /// Individuals parsed from the file
        individuals: usize,
        /// Relationships synthesized from the file
        relationships: usize,
        /// Individuals with a duplicate candidate (decision required)
        candidates: usize,
        /// Recoverable parse errors
        errors: usize,
        /// When preview became available
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Import committed to the tree
    ImportSessionCommitted {
        /// Upload identifier
        upload_id: Uuid,
        persons_added: usize,
        persons_updated: usize,
        persons_skipped: usize,
        relationships_created: usize,
        /// Commit duration in milliseconds
        duration_millis: u64,
        /// When commit finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Import session failed (decode failure, storage failure, cancellation)
    ImportSessionFailed {
        /// Upload identifier
        upload_id: Uuid,
        /// Error message details
        error_message: String,
        /// When session failed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session evicted after the retention window without being committed
    ImportSessionExpired {
        /// Upload identifier
        upload_id: Uuid,
        /// When session was evicted
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl FamtreeEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &str {
        match self {
            FamtreeEvent::ImportSessionStarted { .. } => "ImportSessionStarted",
            FamtreeEvent::ImportProgressUpdate { .. } => "ImportProgressUpdate",
            FamtreeEvent::ImportPreviewReady { .. } => "ImportPreviewReady",
            FamtreeEvent::ImportSessionCommitted { .. } => "ImportSessionCommitted",
            FamtreeEvent::ImportSessionFailed { .. } => "ImportSessionFailed",
            FamtreeEvent::ImportSessionExpired { .. } => "ImportSessionExpired",
        }
    }

    /// Upload the event refers to
    pub fn upload_id(&self) -> Uuid {
        match self {
            FamtreeEvent::ImportSessionStarted { upload_id, .. }
            | FamtreeEvent::ImportProgressUpdate { upload_id, .. }
            | FamtreeEvent::ImportPreviewReady { upload_id, .. }
            | FamtreeEvent::ImportSessionCommitted { upload_id, .. }
            | FamtreeEvent::ImportSessionFailed { upload_id, .. }
            | FamtreeEvent::ImportSessionExpired { upload_id, .. } => *upload_id,
        }
    }
}

/// Broadcast bus for [`FamtreeEvent`]s
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FamtreeEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    ///
    /// # Examples
    ///
    /// ```
    /// use famtree_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<FamtreeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: FamtreeEvent,
    ) -> Result<usize, broadcast::error::SendError<FamtreeEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: FamtreeEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_err() {
        let bus = EventBus::new(10);
        let result = bus.emit(FamtreeEvent::ImportSessionExpired {
            upload_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        });
        assert!(result.is_err());

        // Lossy variant must not panic
        bus.emit_lossy(FamtreeEvent::ImportSessionExpired {
            upload_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let upload_id = Uuid::new_v4();

        bus.emit(FamtreeEvent::ImportSessionFailed {
            upload_id,
            error_message: "storage unavailable".to_string(),
            timestamp: chrono::Utc::now(),
        })
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "ImportSessionFailed");
        assert_eq!(event.upload_id(), upload_id);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = FamtreeEvent::ImportProgressUpdate {
            upload_id: Uuid::nil(),
            state: "PARSING".to_string(),
            phase: "parse".to_string(),
            percentage: 10,
            estimated_remaining_seconds: None,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ImportProgressUpdate");
        assert_eq!(json["percentage"], 10);
    }
}
