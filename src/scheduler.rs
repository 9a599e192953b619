//! Render scheduler: turns display requests into background render jobs.
//!
//! Each request advances the layer's generation token, so anything still
//! running for an older request sees itself cancelled at its next check.
//! Paint runs on a pool worker; the result is marshaled back to the control
//! thread, checked once more, and only then applied to the layer.

use std::sync::{Arc, Weak};

use tracing::{debug, debug_span, info, warn, Span};

use crate::cancellation::{GenerationGuard, NeverCancelled};
use crate::canvas::{BitmapCanvasProvider, Canvas, CanvasProvider, Color, Size};
use crate::config::RenderConfig;
use crate::display_task::DisplayTask;
use crate::error::RenderResult;
use crate::layer::AsyncLayer;
use crate::metrics::{metric_names, MetricsRegistry, RenderIds, TimingSpan};
use crate::queue_pool::{ReleaseQueue, WorkerQueuePool};
use crate::run_loop::MainHandle;
use crate::state_machine::RenderPhase;
use crate::transaction::{Coalescer, Transaction};

/// Action name under which coalesced display requests are committed.
pub const DISPLAY_ACTION: &str = "display";

/// Layer properties frozen at submission time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSnapshot {
    pub size: Size,
    pub opaque: bool,
    pub scale: f64,
    /// Only captured when the layer is opaque.
    pub background: Option<Color>,
    pub asynchronous: bool,
}

impl RenderSnapshot {
    /// A non-positive or non-finite layer scale falls back to `default_scale`.
    pub fn capture(layer: &AsyncLayer, asynchronous: bool, default_scale: f64) -> Self {
        let props = layer.props();
        let scale = if props.contents_scale.is_finite() && props.contents_scale > 0.0 {
            props.contents_scale
        } else {
            default_scale
        };
        Self {
            size: props.bounds,
            opaque: props.opaque,
            scale,
            background: if props.opaque {
                props.background_color
            } else {
                None
            },
            asynchronous,
        }
    }
}

/// Opaque layers get a white backing when the background is missing or
/// translucent, then the background color itself.
pub fn fill_background(canvas: &mut Canvas, snapshot: &RenderSnapshot) {
    if !snapshot.opaque {
        return;
    }
    if snapshot.background.map_or(true, |c| !c.is_opaque()) {
        canvas.fill(Color::WHITE);
    }
    if let Some(background) = snapshot.background {
        canvas.fill(background);
    }
}

pub struct RenderScheduler {
    pool: Arc<WorkerQueuePool>,
    release: ReleaseQueue,
    main: MainHandle,
    coalescer: Coalescer,
    canvas: Arc<dyn CanvasProvider>,
    metrics: Arc<MetricsRegistry>,
    default_scale: f64,
}

impl RenderScheduler {
    pub fn new(
        pool: Arc<WorkerQueuePool>,
        main: MainHandle,
        config: &RenderConfig,
    ) -> RenderResult<Arc<Self>> {
        let canvas = Arc::new(BitmapCanvasProvider::new(config.max_canvas_pixels));
        Self::with_canvas_provider(pool, main, config, canvas)
    }

    pub fn with_canvas_provider(
        pool: Arc<WorkerQueuePool>,
        main: MainHandle,
        config: &RenderConfig,
        canvas: Arc<dyn CanvasProvider>,
    ) -> RenderResult<Arc<Self>> {
        config.validate()?;
        let release = ReleaseQueue::new(config)?;
        let coalescer = Coalescer::new(Arc::new(main.clone()));
        info!(queues = pool.len(), "render scheduler ready");
        Ok(Arc::new(Self {
            pool,
            release,
            main,
            coalescer,
            canvas,
            metrics: Arc::new(MetricsRegistry::new()),
            default_scale: config.default_scale,
        }))
    }

    /// Scheduler on the process-wide pool, configured from the environment.
    pub fn shared(main: MainHandle) -> RenderResult<Arc<Self>> {
        Self::new(WorkerQueuePool::shared()?, main, &RenderConfig::from_env())
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<WorkerQueuePool> {
        &self.pool
    }

    pub fn coalescer(&self) -> &Coalescer {
        &self.coalescer
    }

    /// Supersede in-flight work now and display once before the control loop idles.
    /// Any number of calls in one cycle produce a single display.
    pub fn set_needs_display(self: &Arc<Self>, layer: &Arc<AsyncLayer>) {
        layer.cancel_async_display();
        let scheduler: Weak<Self> = Arc::downgrade(self);
        self.coalescer
            .commit(Transaction::new(layer, DISPLAY_ACTION, move |layer| {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.display(&layer);
                }
            }));
    }

    /// Supersede in-flight work without requesting a new render.
    pub fn cancel(&self, layer: &AsyncLayer) {
        layer.cancel_async_display();
    }

    /// Render now, honoring the layer's asynchronous flag. Call on the control thread.
    pub fn display(&self, layer: &Arc<AsyncLayer>) {
        self.display_with(layer, layer.displays_asynchronously());
    }

    pub fn display_with(&self, layer: &Arc<AsyncLayer>, asynchronously: bool) {
        debug_assert!(
            self.main.is_control_thread(),
            "display must be called on the control thread"
        );
        let Some(delegate) = layer.delegate() else {
            debug!(layer = %layer.id(), "no delegate, display skipped");
            return;
        };
        let task = Arc::new(delegate.new_display_task());

        if !task.has_display() {
            self.display_empty(layer, &task);
        } else if asynchronously {
            self.display_async(layer, task);
        } else {
            self.display_sync(layer, &task);
        }
    }

    fn display_empty(&self, layer: &AsyncLayer, task: &DisplayTask) {
        let generation = layer.sentinel().advance();
        let tracker = layer.phase_tracker();
        tracker.begin(generation);
        task.will_display(layer);
        layer.set_contents(None);
        let _ = tracker.finish(generation, true);
        self.metrics.increment(metric_names::EMPTY_TASK);
        task.did_display(layer, true);
    }

    /// Zero-area layers: drop current contents off-thread and report finished.
    fn display_degenerate(&self, layer: &AsyncLayer, task: &DisplayTask, generation: u64) {
        if let Some(old) = layer.take_contents() {
            self.release.release(old);
        }
        let _ = layer.phase_tracker().finish(generation, true);
        self.metrics.increment(metric_names::DEGENERATE);
        debug!(layer = %layer.id(), generation, "degenerate bounds, contents cleared");
        task.did_display(layer, true);
    }

    fn display_async(&self, layer: &Arc<AsyncLayer>, task: Arc<DisplayTask>) {
        let generation = layer.sentinel().advance();
        let guard = layer.sentinel().guard_at(generation);
        let tracker = layer.phase_tracker();
        tracker.begin(generation);

        task.will_display(layer);
        let snapshot = RenderSnapshot::capture(layer, true, self.default_scale);

        if snapshot.size.is_degenerate() {
            self.display_degenerate(layer, &task, generation);
            return;
        }

        let ids = RenderIds::new(guard.my_generation());
        let span = debug_span!(
            "render",
            layer = %layer.id(),
            generation = ids.generation,
            trace_id = %ids.trace_id
        );
        let job = RenderJob {
            layer: Arc::downgrade(layer),
            task,
            guard,
            snapshot,
            canvas: Arc::clone(&self.canvas),
            main: self.main.clone(),
            metrics: Arc::clone(&self.metrics),
            total: self.metrics.span(metric_names::RENDER_DONE),
            span,
        };

        let _ = tracker.transition(generation, RenderPhase::Rendering);
        let queued = self.metrics.span(metric_names::QUEUE_WAIT);
        let queue = self.pool.submit(move || {
            queued.finish();
            job.run();
        });
        debug!(layer = %layer.id(), generation, queue, "render submitted");
    }

    fn display_sync(&self, layer: &AsyncLayer, task: &DisplayTask) {
        let timing = self.metrics.span(metric_names::SYNC_RENDER);
        let generation = layer.sentinel().advance();
        let tracker = layer.phase_tracker();
        tracker.begin(generation);

        task.will_display(layer);
        let snapshot = RenderSnapshot::capture(layer, false, self.default_scale);

        if snapshot.size.is_degenerate() {
            self.display_degenerate(layer, task, generation);
            return;
        }

        let _ = tracker.transition(generation, RenderPhase::Rendering);
        let Some(mut canvas) = self
            .canvas
            .begin(snapshot.size, snapshot.opaque, snapshot.scale)
        else {
            warn!(layer = %layer.id(), generation, "no canvas for synchronous render");
            self.metrics.increment(metric_names::MISSING_CANVAS);
            let _ = tracker.finish(generation, false);
            task.did_display(layer, false);
            return;
        };

        fill_background(&mut canvas, &snapshot);
        task.display(&mut canvas, snapshot.size, &NeverCancelled);
        layer.set_contents(Some(canvas.into_image()));

        let _ = tracker.finish(generation, true);
        timing.finish();
        self.metrics.increment(metric_names::COMPLETED);
        task.did_display(layer, true);
    }
}

/// One asynchronous render attempt, executed on a pool worker.
struct RenderJob {
    layer: Weak<AsyncLayer>,
    task: Arc<DisplayTask>,
    guard: GenerationGuard,
    snapshot: RenderSnapshot,
    canvas: Arc<dyn CanvasProvider>,
    main: MainHandle,
    metrics: Arc<MetricsRegistry>,
    /// Submission to apply; recorded only for renders that complete.
    total: TimingSpan,
    span: Span,
}

impl RenderJob {
    fn run(self) {
        let span = self.span.clone();
        let _entered = span.enter();

        if self.guard.is_cancelled() {
            debug!("cancelled before paint");
            return self.abandon(metric_names::CANCELLED);
        }

        let snapshot = self.snapshot;
        let Some(mut canvas) = self
            .canvas
            .begin(snapshot.size, snapshot.opaque, snapshot.scale)
        else {
            warn!("no canvas for render, attempt dropped");
            return self.abandon(metric_names::MISSING_CANVAS);
        };

        fill_background(&mut canvas, &snapshot);

        let paint = self.metrics.span(metric_names::PAINT);
        let painted = self.task.display(&mut canvas, snapshot.size, &self.guard);
        paint.finish();

        if self.guard.is_cancelled() {
            debug!(painted, "cancelled during paint");
            return self.abandon(metric_names::CANCELLED);
        }
        if !painted {
            debug!("paint callback gave up");
            return self.abandon(metric_names::PAINT_FAILED);
        }

        let image = canvas.into_image();
        if self.guard.is_cancelled() {
            debug!("cancelled after extraction");
            return self.abandon(metric_names::CANCELLED);
        }

        let handoff = self.metrics.span(metric_names::APPLY_WAIT);
        let main = self.main.clone();
        main.exec_async(move || {
            let _entered = self.span.enter();
            handoff.finish();
            let Some(layer) = self.layer.upgrade() else {
                return;
            };
            let generation = self.guard.my_generation();
            if self.guard.is_cancelled() {
                debug!("cancelled before apply");
                let _ = layer.phase_tracker().finish(generation, false);
                self.metrics.increment(metric_names::CANCELLED);
                self.task.did_display(&layer, false);
                return;
            }
            layer.set_contents(Some(image));
            let _ = layer.phase_tracker().finish(generation, true);
            self.total.finish();
            self.metrics.increment(metric_names::COMPLETED);
            self.task.did_display(&layer, true);
        });
    }

    /// Count the attempt under `outcome` and report it unfinished on the
    /// control thread; nothing is applied.
    fn abandon(self, outcome: &'static str) {
        self.metrics.increment(outcome);
        debug!(outcome, elapsed_us = self.total.elapsed_us(), "render abandoned");
        let main = self.main.clone();
        main.exec_async(move || {
            let _entered = self.span.enter();
            let Some(layer) = self.layer.upgrade() else {
                return;
            };
            let _ = layer
                .phase_tracker()
                .finish(self.guard.my_generation(), false);
            self.task.did_display(&layer, false);
        });
    }
}
