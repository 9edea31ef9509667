// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The observer set (component C3).
//!
//! Observers are invoked, in registration order, on every message the
//! dispatcher drains and on every idle tick. None of them hold a reference
//! back into the dispatcher or into each other -- instead of a callback
//! captured at construction (which is how the reference implementation
//! wires `FailWatcher`/`HangWatcher` up to the pool manager), an observer
//! returns an [`ObserverAction`] that the dispatcher interprets once the
//! whole pass over the registered observers is done. This keeps "what an
//! observer decided" and "what the dispatcher does about it" as a single
//! well-typed seam rather than shared closures, which is awkward to express
//! soundly against an `&mut` event loop in Rust.

mod console;
mod fail_fast;
mod hang_detector;
mod log_sink;
mod statistics;

pub use console::ConsoleMultiplexer;
pub use fail_fast::FailFastTrigger;
pub use hang_detector::HangDetector;
pub use log_sink::LogSink;
pub use statistics::{FailedTask, StatisticsAggregator};

use crate::message::Envelope;
use std::time::Duration;

/// What an observer wants the dispatcher to do in response to a message or
/// an idle tick. At most one action is meaningful per call; if several
/// observers request actions in the same pass the dispatcher honors the
/// most severe one (`KillAll` over `TerminateAll` over `None`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObserverAction {
    None,
    /// Fail-fast fired: cooperatively signal every worker to stop.
    TerminateAll,
    /// The hang detector fired: forcefully kill every worker.
    KillAll,
}

impl ObserverAction {
    fn severity(self) -> u8 {
        match self {
            ObserverAction::None => 0,
            ObserverAction::TerminateAll => 1,
            ObserverAction::KillAll => 2,
        }
    }

    fn max(self, other: Self) -> Self {
        if self.severity() >= other.severity() {
            self
        } else {
            other
        }
    }
}

/// A controller-local consumer of messages, invoked on every dispatch and
/// idle tick. Observers must not block; anything heavier than in-memory
/// bookkeeping (like the post-run artifact copy) is deferred to the
/// dispatcher's shutdown step.
pub trait Observer: Send + std::any::Any {
    fn on_message(&mut self, envelope: &Envelope) -> ObserverAction {
        let _ = envelope;
        ObserverAction::None
    }

    /// Called once per poll period when the event loop had nothing to
    /// drain. `delta` is how much wall-clock time passed since the last
    /// call (normally the poll period, but can be larger after a slow
    /// iteration).
    fn on_idle(&mut self, delta: Duration) -> ObserverAction {
        let _ = delta;
        ObserverAction::None
    }

    /// Lets the dispatcher recover a concrete observer's final state (in
    /// practice, only the statistics aggregator) after the event loop
    /// exits, without threading a typed handle through the whole registry.
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// The fixed, ordered collection of observers the dispatcher drives.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn Observer>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Dispatches one message to every observer in registration order and
    /// returns the most severe action requested.
    pub fn dispatch_message(&mut self, envelope: &Envelope) -> ObserverAction {
        let mut action = ObserverAction::None;
        for observer in &mut self.observers {
            action = action.max(observer.on_message(envelope));
        }
        action
    }

    /// Delivers an idle tick to every observer and returns the most severe
    /// action requested.
    pub fn dispatch_idle(&mut self, delta: Duration) -> ObserverAction {
        let mut action = ObserverAction::None;
        for observer in &mut self.observers {
            action = action.max(observer.on_idle(delta));
        }
        action
    }

    /// Returns a clone of the registered statistics aggregator's current
    /// state, or `None` if none was registered (never happens in the
    /// dispatcher's own setup, but tests may build a bare `ObserverSet`).
    pub fn take_statistics(&self) -> StatisticsAggregator {
        self.observers
            .iter()
            .find_map(|o| o.as_any().downcast_ref::<StatisticsAggregator>())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysTerminate;
    impl Observer for AlwaysTerminate {
        fn on_message(&mut self, _: &Envelope) -> ObserverAction {
            ObserverAction::TerminateAll
        }
    }

    struct AlwaysKill;
    impl Observer for AlwaysKill {
        fn on_message(&mut self, _: &Envelope) -> ObserverAction {
            ObserverAction::KillAll
        }
    }

    struct Inert;
    impl Observer for Inert {}

    fn sample_envelope() -> Envelope {
        Envelope {
            worker_id: 1,
            worker_name: "01_box".to_string(),
            message: crate::message::Message::Done { synthesized: false },
        }
    }

    #[test]
    fn most_severe_action_wins_within_a_dispatch_pass() {
        let mut set = ObserverSet::new();
        set.register(Box::new(Inert));
        set.register(Box::new(AlwaysTerminate));
        set.register(Box::new(AlwaysKill));
        let action = set.dispatch_message(&sample_envelope());
        assert_eq!(action, ObserverAction::KillAll);
    }

    #[test]
    fn no_observers_means_no_action() {
        let mut set = ObserverSet::new();
        assert_eq!(set.dispatch_message(&sample_envelope()), ObserverAction::None);
        assert_eq!(set.dispatch_idle(Duration::from_secs(2)), ObserverAction::None);
    }
}
