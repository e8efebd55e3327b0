//! Progress & error reporter
//!
//! Owns the rules for [`ImportProgress`]:
//! - percentage never decreases
//! - percentage reaches 100 only when the session is committed or failed
//! - remaining time is estimated from the rate within the current phase
//!
//! Each phase covers a fixed slice of the bar (see [`phase_range`]). Progress
//! for sessions being committed is also kept in a live map, because the
//! session row cannot be rewritten while the commit transaction holds the
//! database write lock.

use chrono::Utc;
use famtree_common::events::{EventBus, FamtreeEvent};
use famtree_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{ImportError, ImportPhase, ImportProgress, ImportSession};

/// CSV header for error exports
pub const CSV_HEADER: [&str; 3] = ["phase", "reference", "reason"];

/// Percentage range covered by each phase
pub fn phase_range(phase: ImportPhase) -> (u8, u8) {
    match phase {
        ImportPhase::Upload => (0, 5),
        ImportPhase::Parse => (5, 40),
        ImportPhase::Match => (40, 60),
        ImportPhase::Review => (60, 70),
        ImportPhase::Commit => (70, 99),
        ImportPhase::Complete => (100, 100),
    }
}

/// Publishes progress checkpoints and error log entries
pub struct ProgressReporter {
    event_bus: Arc<EventBus>,
    live: RwLock<HashMap<Uuid, ImportProgress>>,
}

impl ProgressReporter {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            event_bus,
            live: RwLock::new(HashMap::new()),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Record a checkpoint
    ///
    /// `work` is `(done, total)` within the phase; when given, the percentage
    /// is interpolated across the phase range and `percentage` is ignored.
    pub async fn checkpoint(
        &self,
        session: &mut ImportSession,
        phase: ImportPhase,
        percentage: u8,
        operation: impl Into<String>,
        work: Option<(usize, usize)>,
    ) {
        let (start, end) = phase_range(phase);
        let requested = match work {
            Some((done, total)) if total > 0 => {
                let fraction = done.min(total) as f64 / total as f64;
                start + ((end - start) as f64 * fraction).floor() as u8
            }
            _ => percentage,
        };

        let progress = &mut session.progress;
        let now = Utc::now();
        if progress.phase != phase {
            progress.phase = phase;
            progress.phase_started_at = now;
        }

        // Monotonic, and below 100 until the session is terminal
        progress.percentage = progress.percentage.max(requested.min(99));
        progress.current_operation = operation.into();
        progress.estimated_remaining_seconds = estimate_remaining(progress, start, end, now);

        tracing::debug!(
            upload_id = %session.upload_id,
            phase = phase.as_str(),
            percentage = progress.percentage,
            operation = %progress.current_operation,
            "Import checkpoint"
        );

        self.publish(session).await;
    }

    /// Final checkpoint for a committed or failed session
    pub async fn finish(&self, session: &mut ImportSession) {
        if !session.is_terminal() {
            tracing::warn!(
                upload_id = %session.upload_id,
                state = session.state.as_str(),
                "Refusing to complete progress of a non-terminal session"
            );
            return;
        }

        let progress = &mut session.progress;
        progress.phase = ImportPhase::Complete;
        progress.percentage = 100;
        progress.estimated_remaining_seconds = Some(0);
        progress.phase_started_at = Utc::now();
        progress.current_operation = format!("Import {}", session.state.as_str().to_lowercase());

        self.publish(session).await;
        self.forget(session.upload_id).await;
    }

    /// Append to the session's error log
    pub fn log_error(&self, session: &mut ImportSession, error: ImportError) {
        tracing::warn!(
            upload_id = %session.upload_id,
            phase = error.phase.as_str(),
            reference = %error.reference,
            reason = %error.reason,
            "Import error recorded"
        );
        session.add_error(error);
    }

    /// Live progress, if a checkpoint is newer than the stored session
    pub async fn current(&self, upload_id: Uuid) -> Option<ImportProgress> {
        self.live.read().await.get(&upload_id).cloned()
    }

    pub async fn forget(&self, upload_id: Uuid) {
        self.live.write().await.remove(&upload_id);
    }

    async fn publish(&self, session: &ImportSession) {
        self.live
            .write()
            .await
            .insert(session.upload_id, session.progress.clone());

        self.event_bus.emit_lossy(FamtreeEvent::ImportProgressUpdate {
            upload_id: session.upload_id,
            state: session.state.as_str().to_string(),
            phase: session.progress.phase.as_str().to_string(),
            percentage: session.progress.percentage,
            estimated_remaining_seconds: session.progress.estimated_remaining_seconds,
            timestamp: Utc::now(),
        });
    }
}

/// Remaining seconds for the current phase from the rate observed so far
fn estimate_remaining(progress: &ImportProgress, start: u8, end: u8, now: chrono::DateTime<Utc>) -> Option<u64> {
    let done = progress.percentage.saturating_sub(start);
    let left = end.saturating_sub(progress.percentage);
    if done == 0 {
        return None;
    }

    let elapsed = (now - progress.phase_started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let rate = done as f64 / elapsed.max(0.001);
    Some((left as f64 / rate).ceil() as u64)
}

/// Render error log entries as CSV with a `phase,reference,reason` header
pub fn errors_to_csv(errors: &[ImportError]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());

    writer
        .write_record(CSV_HEADER)
        .map_err(|e| Error::Internal(format!("CSV write failed: {}", e)))?;
    for error in errors {
        writer
            .write_record([error.phase.as_str(), &error.reference, &error.reason])
            .map_err(|e| Error::Internal(format!("CSV write failed: {}", e)))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Internal(format!("CSV flush failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::Internal(format!("CSV is not UTF-8: {}", e)))
}

/// Download name for an error export, stamped with the export time (UTC)
pub fn csv_file_name(upload_id: Uuid, at: chrono::DateTime<Utc>) -> String {
    format!("import-errors-{}-{}.csv", upload_id, at.format("%Y%m%dT%H%M%SZ"))
}
