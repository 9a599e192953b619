//! The unit of render work a layer's delegate hands the scheduler.

use std::fmt;

use crate::canvas::{Canvas, Size};
use crate::cancellation::CancelCheck;
use crate::layer::AsyncLayer;

/// Called on the control thread before any background work starts.
pub type WillDisplay = Box<dyn Fn(&AsyncLayer) + Send + Sync>;

/// Paints into `canvas`, polling `is_cancelled` as often as it likes.
/// Returning false abandons the attempt.
pub type Display = Box<dyn Fn(&mut Canvas, Size, &dyn CancelCheck) -> bool + Send + Sync>;

/// Called on the control thread once the attempt ends; `finished` is false
/// when it was superseded or abandoned.
pub type DidDisplay = Box<dyn Fn(&AsyncLayer, bool) + Send + Sync>;

#[derive(Default)]
pub struct DisplayTask {
    pub will_display: Option<WillDisplay>,
    pub display: Option<Display>,
    pub did_display: Option<DidDisplay>,
}

impl fmt::Debug for DisplayTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayTask")
            .field("will_display", &self.will_display.is_some())
            .field("display", &self.display.is_some())
            .field("did_display", &self.did_display.is_some())
            .finish()
    }
}

impl DisplayTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_will_display<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncLayer) + Send + Sync + 'static,
    {
        self.will_display = Some(Box::new(f));
        self
    }

    pub fn on_display<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Canvas, Size, &dyn CancelCheck) -> bool + Send + Sync + 'static,
    {
        self.display = Some(Box::new(f));
        self
    }

    pub fn on_did_display<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncLayer, bool) + Send + Sync + 'static,
    {
        self.did_display = Some(Box::new(f));
        self
    }

    pub fn has_display(&self) -> bool {
        self.display.is_some()
    }

    pub(crate) fn will_display(&self, layer: &AsyncLayer) {
        if let Some(f) = &self.will_display {
            f(layer);
        }
    }

    /// Returns false if there is no paint callback or it gave up.
    pub(crate) fn display(&self, canvas: &mut Canvas, size: Size, check: &dyn CancelCheck) -> bool {
        match &self.display {
            Some(f) => f(canvas, size, check),
            None => false,
        }
    }

    pub(crate) fn did_display(&self, layer: &AsyncLayer, finished: bool) {
        if let Some(f) = &self.did_display {
            f(layer, finished);
        }
    }
}
