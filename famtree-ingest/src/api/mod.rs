//! HTTP API handlers for famtree-ingest
//!
//! REST endpoints for the import workflow plus an SSE event stream.

pub mod health;
pub mod import_workflow;
pub mod sse;

pub use health::health_routes;
pub use import_workflow::{import_routes, PreviewEntry, SessionSnapshot};
pub use sse::import_event_stream;
