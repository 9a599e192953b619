//! The surface being rendered: geometry snapshot inputs, displayed contents,
//! the generation token that gates its renders, and a weak delegate that
//! supplies display tasks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cancellation::GenerationToken;
use crate::canvas::{Color, RenderedImage, Size};
use crate::display_task::DisplayTask;
use crate::state_machine::{PhaseTracker, RenderPhase};

/// Supplies a fresh display task whenever the layer needs rendering.
pub trait AsyncLayerDelegate: Send + Sync {
    fn new_display_task(&self) -> DisplayTask;
}

impl<F> AsyncLayerDelegate for F
where
    F: Fn() -> DisplayTask + Send + Sync,
{
    fn new_display_task(&self) -> DisplayTask {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LayerId(u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Properties captured into each render's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerProps {
    pub bounds: Size,
    pub opaque: bool,
    pub background_color: Option<Color>,
    pub contents_scale: f64,
    pub displays_asynchronously: bool,
}

impl Default for LayerProps {
    fn default() -> Self {
        Self {
            bounds: Size::ZERO,
            opaque: false,
            background_color: None,
            contents_scale: 1.0,
            displays_asynchronously: true,
        }
    }
}

pub struct AsyncLayer {
    id: LayerId,
    sentinel: Arc<GenerationToken>,
    props: RwLock<LayerProps>,
    contents: Mutex<Option<RenderedImage>>,
    delegate: RwLock<Option<Weak<dyn AsyncLayerDelegate>>>,
    phase: PhaseTracker,
}

impl fmt::Debug for AsyncLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLayer")
            .field("id", &self.id)
            .field("generation", &self.sentinel.snapshot())
            .field("props", &*self.props.read())
            .field("has_contents", &self.contents.lock().is_some())
            .field("phase", &self.phase.current())
            .finish()
    }
}

impl AsyncLayer {
    pub fn new(props: LayerProps) -> Arc<Self> {
        Arc::new(Self {
            id: LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed)),
            sentinel: Arc::new(GenerationToken::new()),
            props: RwLock::new(props),
            contents: Mutex::new(None),
            delegate: RwLock::new(None),
            phase: PhaseTracker::new(),
        })
    }

    pub fn with_delegate<D>(props: LayerProps, delegate: &Arc<D>) -> Arc<Self>
    where
        D: AsyncLayerDelegate + 'static,
    {
        let layer = Self::new(props);
        layer.set_delegate(delegate);
        layer
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    /// The delegate is held weakly; it usually owns the layer.
    pub fn set_delegate<D>(&self, delegate: &Arc<D>)
    where
        D: AsyncLayerDelegate + 'static,
    {
        let delegate: Arc<dyn AsyncLayerDelegate> = delegate.clone();
        *self.delegate.write() = Some(Arc::downgrade(&delegate));
    }

    pub fn clear_delegate(&self) {
        *self.delegate.write() = None;
    }

    pub fn delegate(&self) -> Option<Arc<dyn AsyncLayerDelegate>> {
        self.delegate.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn props(&self) -> LayerProps {
        self.props.read().clone()
    }

    pub fn bounds(&self) -> Size {
        self.props.read().bounds
    }

    pub fn set_bounds(&self, bounds: Size) {
        self.props.write().bounds = bounds;
    }

    pub fn is_opaque(&self) -> bool {
        self.props.read().opaque
    }

    pub fn set_opaque(&self, opaque: bool) {
        self.props.write().opaque = opaque;
    }

    pub fn background_color(&self) -> Option<Color> {
        self.props.read().background_color
    }

    pub fn set_background_color(&self, color: Option<Color>) {
        self.props.write().background_color = color;
    }

    pub fn contents_scale(&self) -> f64 {
        self.props.read().contents_scale
    }

    pub fn set_contents_scale(&self, scale: f64) {
        self.props.write().contents_scale = scale;
    }

    pub fn displays_asynchronously(&self) -> bool {
        self.props.read().displays_asynchronously
    }

    pub fn set_displays_asynchronously(&self, value: bool) {
        self.props.write().displays_asynchronously = value;
    }

    pub fn contents(&self) -> Option<RenderedImage> {
        self.contents.lock().clone()
    }

    /// Replace displayed contents, returning the previous image.
    pub fn set_contents(&self, contents: Option<RenderedImage>) -> Option<RenderedImage> {
        std::mem::replace(&mut *self.contents.lock(), contents)
    }

    pub fn take_contents(&self) -> Option<RenderedImage> {
        self.contents.lock().take()
    }

    pub fn sentinel(&self) -> &Arc<GenerationToken> {
        &self.sentinel
    }

    /// Supersede any in-flight render without starting a new one.
    pub fn cancel_async_display(&self) -> u64 {
        let generation = self.sentinel.advance();
        trace!(layer = %self.id, generation, "async display cancelled");
        generation
    }

    pub fn phase(&self) -> RenderPhase {
        self.phase.current()
    }

    pub(crate) fn phase_tracker(&self) -> &PhaseTracker {
        &self.phase
    }
}

impl Drop for AsyncLayer {
    fn drop(&mut self) {
        self.sentinel.advance();
    }
}
