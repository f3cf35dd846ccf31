use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use escr_core::ProjectionId;

use super::{ProjectionCatchUpTrigger, TriggerError};

/// Delegates to an asynchronous trigger, unless synchronous mode is on.
///
/// Synchronous mode is meant for batch jobs and tests that need every
/// command's projections applied before the next command runs. The switch is
/// shared by all threads using this trigger.
pub struct CatchUpTriggerWithSynchronousOption {
    asynchronous: Arc<dyn ProjectionCatchUpTrigger>,
    synchronous: Arc<dyn ProjectionCatchUpTrigger>,
    enabled: AtomicBool,
}

impl CatchUpTriggerWithSynchronousOption {
    pub fn new(
        asynchronous: Arc<dyn ProjectionCatchUpTrigger>,
        synchronous: Arc<dyn ProjectionCatchUpTrigger>,
    ) -> Self {
        Self {
            asynchronous,
            synchronous,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn enable_synchronous(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable_synchronous(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_synchronous(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Run `f` with synchronous mode on, restoring the previous mode afterwards
    /// (also when `f` panics).
    pub fn synchronously<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Restore<'a> {
            enabled: &'a AtomicBool,
            previous: bool,
        }

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.enabled.store(self.previous, Ordering::SeqCst);
            }
        }

        let _restore = Restore {
            enabled: &self.enabled,
            previous: self.enabled.swap(true, Ordering::SeqCst),
        };
        f()
    }
}

impl core::fmt::Debug for CatchUpTriggerWithSynchronousOption {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CatchUpTriggerWithSynchronousOption")
            .field("synchronous", &self.is_synchronous())
            .finish_non_exhaustive()
    }
}

impl ProjectionCatchUpTrigger for CatchUpTriggerWithSynchronousOption {
    fn trigger_catch_up(&self, projections: &[ProjectionId]) -> Result<(), TriggerError> {
        if self.is_synchronous() {
            debug!(count = projections.len(), "running catch-up synchronously");
            self.synchronous.trigger_catch_up(projections)
        } else {
            self.asynchronous.trigger_catch_up(projections)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Counting(Mutex<usize>);

    impl ProjectionCatchUpTrigger for Counting {
        fn trigger_catch_up(&self, _projections: &[ProjectionId]) -> Result<(), TriggerError> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn routes_by_mode_and_restores_it() {
        let asynchronous = Arc::new(Counting::default());
        let synchronous = Arc::new(Counting::default());
        let trigger = CatchUpTriggerWithSynchronousOption::new(asynchronous.clone(), synchronous.clone());
        let graph = [ProjectionId::new("graph").unwrap()];

        trigger.trigger_catch_up(&graph).unwrap();
        trigger.synchronously(|| trigger.trigger_catch_up(&graph)).unwrap();
        assert!(!trigger.is_synchronous());

        trigger.enable_synchronous();
        trigger.trigger_catch_up(&graph).unwrap();

        assert_eq!(*asynchronous.0.lock().unwrap(), 1);
        assert_eq!(*synchronous.0.lock().unwrap(), 2);
    }
}
