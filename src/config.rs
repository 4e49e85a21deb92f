//! Runtime configuration
//!
//! Policy hooks the integrator picks when building the kernel: what to do
//! on a [`Violation`] (halt, log and continue, reset) and whether to watch
//! scratch usage of coroutine tasks.
//!
//! Author: Moroya Sakamoto

use log::error;

use crate::error::Violation;
use crate::task::{ScratchUsage, Task};

/// Kernel policy hooks
#[derive(Clone, Copy)]
pub struct Config {
    /// Called outside the critical section when an operation is misused;
    /// the operation itself does nothing.
    pub on_violation: fn(Violation),
    /// Called whenever a task records a fresh scratch frame
    pub on_scratch: Option<fn(Task, ScratchUsage)>,
}

impl Config {
    /// Panic on violations, no scratch monitoring
    pub const fn new() -> Self {
        Self {
            on_violation: panic_on_violation,
            on_scratch: None,
        }
    }

    /// Replace the violation hook
    pub const fn on_violation(mut self, hook: fn(Violation)) -> Self {
        self.on_violation = hook;
        self
    }

    /// Install a scratch monitor
    pub const fn on_scratch(mut self, hook: fn(Task, ScratchUsage)) -> Self {
        self.on_scratch = Some(hook);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Fail fast
pub fn panic_on_violation(violation: Violation) {
    panic!("kernel violation: {violation}");
}

/// Log at error level and keep running
pub fn log_violation(violation: Violation) {
    error!("kernel violation: {violation}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch(_: Task, _: ScratchUsage) {}

    #[test]
    fn test_default_has_no_monitor() {
        let config = Config::default();
        assert!(config.on_scratch.is_none());
    }

    #[test]
    fn test_builder() {
        let config = Config::new().on_violation(log_violation).on_scratch(watch);
        assert!(config.on_scratch.is_some());
        (config.on_violation)(Violation::NotATask { index: 0 });
    }

    #[test]
    #[should_panic(expected = "kernel violation")]
    fn test_panic_hook() {
        panic_on_violation(Violation::TooManyRoutines { max: 32 });
    }
}
