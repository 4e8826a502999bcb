//! The stage contract shared by every pipeline component.
//!
//! A [`Stage`] consumes items pushed by its upstream and produces items into the
//! downstream stage it owns.  All calls are synchronous: `push` runs to completion
//! before it returns.  Flow control is expressed purely through the [`Flow`] value
//! returned from `push`/`poll_ready`: once a stage reports [`Flow::Paused`] the
//! producer must stop pushing until `poll_ready` reports [`Flow::Ready`] again.
//!
//! Terminal signals follow three rules, enforced by [`Lifecycle`]:
//!
//!  - `finish` flushes buffered state and finishes the downstream exactly once;
//!  - a stage that fails aborts its downstream exactly once and rejects any later
//!    `push` with [`PipelineError::Closed`];
//!  - `abort` on a stage that already finished or aborted is a no-op.

use std::{cell::RefCell, rc::Rc};

use crate::error::{PipelineError, Result};

/// Capacity hint returned by a stage after accepting an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// More items may be pushed immediately.
    Ready,
    /// The producer must stop pushing until the stage reports `Ready` again.
    Paused,
}

impl Flow {
    /// Combines two capacity hints: paused if either side is paused.
    #[must_use]
    pub fn and(self, other: Flow) -> Flow {
        match (self, other) {
            (Flow::Ready, Flow::Ready) => Flow::Ready,
            _ => Flow::Paused,
        }
    }

    pub fn is_paused(self) -> bool {
        self == Flow::Paused
    }
}

/// Listener invoked whenever a [`Valve`] changes between paused and ready.
pub type BackpressureCallback = Box<dyn FnMut(Flow)>;

/// A unit of composition: consumes `In` items and forwards its output downstream.
pub trait Stage<In> {
    /// Hands one item to the stage.  Ownership of the item moves into the stage.
    fn push(&mut self, item: In) -> Result<Flow>;

    /// Signals that no more input follows.
    fn finish(&mut self) -> Result<()>;

    /// Tears the stage (and everything after it) down because of `error`.
    fn abort(&mut self, error: &PipelineError);

    /// Lets a paused stage make progress and reports its current capacity.
    fn poll_ready(&mut self) -> Result<Flow> {
        Ok(Flow::Ready)
    }

    /// Registers a listener for pause/resume transitions of the sink at the end of
    /// this stage's chain.
    fn on_backpressure(&mut self, callback: BackpressureCallback) {
        drop(callback);
    }
}

impl<In, S: Stage<In> + ?Sized> Stage<In> for Box<S> {
    fn push(&mut self, item: In) -> Result<Flow> {
        (**self).push(item)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        (**self).abort(error)
    }

    fn poll_ready(&mut self) -> Result<Flow> {
        (**self).poll_ready()
    }

    fn on_backpressure(&mut self, callback: BackpressureCallback) {
        (**self).on_backpressure(callback)
    }
}

impl<In, S: Stage<In> + ?Sized> Stage<In> for &mut S {
    fn push(&mut self, item: In) -> Result<Flow> {
        (**self).push(item)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        (**self).abort(error)
    }

    fn poll_ready(&mut self) -> Result<Flow> {
        (**self).poll_ready()
    }

    fn on_backpressure(&mut self, callback: BackpressureCallback) {
        (**self).on_backpressure(callback)
    }
}

/// Where a stage is in its life: accepting input, or closed by finish or abort.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    #[default]
    Open,
    Finished,
    Aborted,
}

impl Lifecycle {
    /// Fails with [`PipelineError::Closed`] unless the stage still accepts input.
    pub fn check_open(&self) -> Result<()> {
        match self {
            Lifecycle::Open => Ok(()),
            _ => Err(PipelineError::Closed),
        }
    }

    /// Decides whether a `finish` call has work to do.
    ///
    /// Returns `Ok(true)` for an open stage, `Ok(false)` for a stage that already
    /// finished (repeat calls are harmless) and `Err(Closed)` after an abort.
    pub fn should_finish(&self) -> Result<bool> {
        match self {
            Lifecycle::Open => Ok(true),
            Lifecycle::Finished => Ok(false),
            Lifecycle::Aborted => Err(PipelineError::Closed),
        }
    }

    /// Marks the stage finished.
    pub fn close(&mut self) {
        if *self == Lifecycle::Open {
            *self = Lifecycle::Finished;
        }
    }

    /// Marks the stage aborted, returning true only on the first transition out of
    /// `Open`.
    pub fn begin_abort(&mut self) -> bool {
        if *self == Lifecycle::Open {
            *self = Lifecycle::Aborted;
            true
        } else {
            false
        }
    }
}

/// Passes `result` through, aborting `downstream` exactly once if it is an error.
pub fn guard<T, In>(
    lifecycle: &mut Lifecycle,
    downstream: &mut impl Stage<In>,
    result: Result<T>,
) -> Result<T> {
    if let Err(ref err) = result {
        if lifecycle.begin_abort() {
            log::debug!("stage failed, aborting downstream: {err}");
            downstream.abort(err);
        }
    }
    result
}

struct ValveState {
    paused: bool,
    listeners: Vec<BackpressureCallback>,
}

/// Shared pause/resume signal owned by a sink and observed by its producers.
#[derive(Clone)]
pub struct Valve {
    inner: Rc<RefCell<ValveState>>,
}

impl Default for Valve {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Valve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // listeners don't impl Debug
        f.debug_struct("Valve")
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Valve {
    pub fn new() -> Self {
        Valve {
            inner: Rc::new(RefCell::new(ValveState {
                paused: false,
                listeners: vec![],
            })),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.borrow().paused
    }

    pub fn flow(&self) -> Flow {
        if self.is_paused() {
            Flow::Paused
        } else {
            Flow::Ready
        }
    }

    pub fn pause(&self) {
        self.set(true);
    }

    pub fn resume(&self) {
        self.set(false);
    }

    pub fn subscribe(&self, callback: BackpressureCallback) {
        self.inner.borrow_mut().listeners.push(callback);
    }

    fn set(&self, paused: bool) {
        let mut listeners = {
            let mut state = self.inner.borrow_mut();
            if state.paused == paused {
                return;
            }
            state.paused = paused;
            std::mem::take(&mut state.listeners)
        };

        let flow = if paused { Flow::Paused } else { Flow::Ready };
        log::trace!("valve -> {flow:?}");
        for listener in listeners.iter_mut() {
            listener(flow);
        }

        // listeners may have subscribed more listeners while we were notifying
        let mut state = self.inner.borrow_mut();
        listeners.append(&mut state.listeners);
        state.listeners = listeners;
    }
}
