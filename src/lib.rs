//! Async layer: renders visual surfaces on background queues.
//!
//! Requests are gated by a per-layer generation token so a newer request
//! silently supersedes older in-flight renders, and display requests made
//! during one control-loop cycle are coalesced into a single render at the
//! next idle point.

pub mod cancellation;
pub mod canvas;
pub mod config;
pub mod display_task;
pub mod error;
pub mod layer;
pub mod metrics;
pub mod queue_pool;
pub mod run_loop;
pub mod scheduler;
pub mod state_machine;
pub mod transaction;

pub use cancellation::{CancelCheck, GenerationGuard, GenerationToken, NeverCancelled};
pub use canvas::{BitmapCanvasProvider, Canvas, CanvasProvider, Color, Rect, RenderedImage, Size};
pub use config::RenderConfig;
pub use display_task::DisplayTask;
pub use error::{RenderError, RenderResult};
pub use layer::{AsyncLayer, AsyncLayerDelegate, LayerId, LayerProps};
pub use metrics::{MetricSummary, MetricsRegistry};
pub use queue_pool::{ReleaseQueue, WorkerQueuePool};
pub use run_loop::{ControlLoop, MainHandle, RunLoopActivity, RunLoopHost};
pub use scheduler::RenderScheduler;
pub use state_machine::RenderPhase;
pub use transaction::{Coalescer, Transaction};

/// Install the fmt subscriber, filtered by `RUST_LOG` or `async_layer=debug`.
/// Later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("async_layer=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

/// Same as [`init_tracing`] but emits one JSON object per event.
pub fn init_json_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("async_layer=debug"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .try_init();
}
