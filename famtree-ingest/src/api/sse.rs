//! Server-Sent Events (SSE) for import progress streaming

use crate::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Optional filter for a single upload
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(alias = "upload_id")]
    pub upload_id: Option<Uuid>,
}

/// GET /import/events[?uploadId=...] - SSE event stream for import progress
///
/// Streams events:
/// - ImportSessionStarted
/// - ImportProgressUpdate
/// - ImportPreviewReady
/// - ImportSessionCommitted
/// - ImportSessionFailed
/// - ImportSessionExpired
pub async fn import_event_stream(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(upload_id = ?filter.upload_id, "New SSE client connected to import events");

    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!("SSE: client lagged, {} events dropped", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if filter.upload_id.is_some_and(|id| id != event.upload_id()) {
                continue;
            }

            let event_type = event.event_type();
            match serde_json::to_string(&event) {
                Ok(event_json) => {
                    debug!("SSE: Broadcasting import event: {}", event_type);
                    yield Ok(Event::default().event(event_type).data(event_json));
                }
                Err(e) => {
                    warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                }
            }
        }
        info!("SSE: Import event stream closed");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
