//! Catch-up lifecycle hooks.
//!
//! Hooks observe a projection's catch-up from the outside: cache flushing,
//! instrumentation, race tracking. They are invoked by the catch-up runner at
//! fixed points:
//!
//! ```text
//! on_before_catch_up
//!   ┌─ per batch (projection lock held) ───────────────────────┐
//!   │  per handled event:                                      │
//!   │    on_before_event -> Projection::apply -> on_after_event │
//!   │  on_before_batch_completed   (lock is about to be released)│
//!   └──────────────────────────────────────────────────────────┘
//! on_after_catch_up
//! ```
//!
//! Hooks cannot influence catch-up: nothing they return is consumed. A hook
//! that needs to report a problem logs it.

use escr_core::ProjectionId;

use crate::EventEnvelope;

/// Lifecycle callbacks around a projection's catch-up.
///
/// All methods default to no-ops so implementors only override what they need.
pub trait CatchUpHook: Send {
    fn on_before_catch_up(&mut self) {}

    fn on_before_event(&mut self, _envelope: &EventEnvelope) {}

    fn on_after_event(&mut self, _envelope: &EventEnvelope) {}

    /// Invoked once per batch, right before the projection lock is released.
    ///
    /// This also runs when a batch ends early because `apply` failed.
    fn on_before_batch_completed(&mut self) {}

    fn on_after_catch_up(&mut self) {}
}

/// A hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCatchUpHook;

impl CatchUpHook for NoopCatchUpHook {}

/// Builds a fresh hook for each catch-up run of a projection.
///
/// Hooks usually keep per-run state (e.g. "was the critical section entered in
/// this batch"), so they are not shared between runs.
pub trait CatchUpHookFactory: Send + Sync {
    fn build(&self, projection: &ProjectionId) -> Box<dyn CatchUpHook>;
}

impl<F> CatchUpHookFactory for F
where
    F: Fn(&ProjectionId) -> Box<dyn CatchUpHook> + Send + Sync,
{
    fn build(&self, projection: &ProjectionId) -> Box<dyn CatchUpHook> {
        self(projection)
    }
}

/// Several hooks invoked in registration order.
#[derive(Default)]
pub struct CatchUpHooks {
    hooks: Vec<Box<dyn CatchUpHook>>,
}

impl CatchUpHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Box<dyn CatchUpHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl FromIterator<Box<dyn CatchUpHook>> for CatchUpHooks {
    fn from_iter<I: IntoIterator<Item = Box<dyn CatchUpHook>>>(iter: I) -> Self {
        Self {
            hooks: iter.into_iter().collect(),
        }
    }
}

impl core::fmt::Debug for CatchUpHooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CatchUpHooks").field("len", &self.hooks.len()).finish()
    }
}

impl CatchUpHook for CatchUpHooks {
    fn on_before_catch_up(&mut self) {
        for hook in &mut self.hooks {
            hook.on_before_catch_up();
        }
    }

    fn on_before_event(&mut self, envelope: &EventEnvelope) {
        for hook in &mut self.hooks {
            hook.on_before_event(envelope);
        }
    }

    fn on_after_event(&mut self, envelope: &EventEnvelope) {
        for hook in &mut self.hooks {
            hook.on_after_event(envelope);
        }
    }

    fn on_before_batch_completed(&mut self) {
        for hook in &mut self.hooks {
            hook.on_before_batch_completed();
        }
    }

    fn on_after_catch_up(&mut self) {
        for hook in &mut self.hooks {
            hook.on_after_catch_up();
        }
    }
}
