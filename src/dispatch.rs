//! Table-driven routing of progress messages on the consumer side.
//!
//! A [`Dispatcher`] maps every [`MessageKind`] to at most one handler. Handlers
//! receive the consumer's own state `S` and the message by value; they never
//! see orchestrator state. Operator answers go back through a
//! [`ControlSender`](crate::messages::ControlSender) kept inside `S`.
//!
//! ```
//! use autopower::dispatch::Dispatcher;
//! use autopower::messages::{MessageKind, ProgressMessage};
//!
//! let mut lines: Vec<String> = Vec::new();
//! let mut dispatcher = Dispatcher::new().on(MessageKind::Status, |lines: &mut Vec<String>, msg| {
//!     if let ProgressMessage::Status(text) = msg {
//!         lines.push(text);
//!     }
//! });
//! assert!(dispatcher.dispatch(&mut lines, ProgressMessage::Status("ready".into())));
//! assert_eq!(lines, ["ready"]);
//! ```

use crate::messages::{MessageKind, ProgressMessage, ProgressReceiver, Received};
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

/// Handler for one message kind.
pub type Handler<S> = Box<dyn FnMut(&mut S, ProgressMessage) + Send>;

/// Outcome of waiting for and dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler ran for a message of this kind.
    Handled(MessageKind),
    /// A message arrived but no handler is registered for its kind.
    Unhandled(MessageKind),
    /// Nothing arrived in time.
    Idle,
    /// The orchestrator is gone and the channel is drained.
    Closed,
}

/// Summary of a non-blocking drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Drained {
    /// Messages taken off the channel.
    pub received: usize,
    /// Whether the channel is closed.
    pub closed: bool,
}

/// Kind → handler table.
pub struct Dispatcher<S> {
    handlers: HashMap<MessageKind, Handler<S>>,
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Dispatcher<S> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Builder form of [`Dispatcher::register`].
    pub fn on<F>(mut self, kind: MessageKind, handler: F) -> Self
    where
        F: FnMut(&mut S, ProgressMessage) + Send + 'static,
    {
        self.register(kind, handler);
        self
    }

    /// Installs the handler for `kind`, returning the one it replaces.
    pub fn register<F>(&mut self, kind: MessageKind, handler: F) -> Option<Handler<S>>
    where
        F: FnMut(&mut S, ProgressMessage) + Send + 'static,
    {
        self.handlers.insert(kind, Box::new(handler))
    }

    /// Whether a handler exists for `kind`.
    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Routes one message. Returns `false` if no handler was registered.
    pub fn dispatch(&mut self, state: &mut S, message: ProgressMessage) -> bool {
        let kind = message.kind();
        match self.handlers.get_mut(&kind) {
            Some(handler) => {
                handler(state, message);
                true
            }
            None => {
                trace!(?kind, "no handler registered; message dropped");
                false
            }
        }
    }

    /// Dispatches every message already queued, without waiting.
    pub fn drain(&mut self, state: &mut S, rx: &mut ProgressReceiver) -> Drained {
        let mut drained = Drained::default();
        loop {
            match rx.try_next() {
                Received::Message(message) => {
                    drained.received += 1;
                    self.dispatch(state, message);
                }
                Received::Empty => return drained,
                Received::Closed => {
                    drained.closed = true;
                    return drained;
                }
            }
        }
    }

    /// Waits up to `timeout` for one message and dispatches it.
    pub async fn dispatch_next(
        &mut self,
        state: &mut S,
        rx: &mut ProgressReceiver,
        timeout: Duration,
    ) -> Dispatched {
        match rx.next_within(timeout).await {
            Received::Message(message) => {
                let kind = message.kind();
                if self.dispatch(state, message) {
                    Dispatched::Handled(kind)
                } else {
                    Dispatched::Unhandled(kind)
                }
            }
            Received::Empty => Dispatched::Idle,
            Received::Closed => Dispatched::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{progress_channel, Phase};

    #[derive(Default)]
    struct Seen {
        statuses: Vec<String>,
        phases: Vec<Phase>,
    }

    fn table() -> Dispatcher<Seen> {
        Dispatcher::new()
            .on(MessageKind::Status, |seen: &mut Seen, msg| {
                if let ProgressMessage::Status(text) = msg {
                    seen.statuses.push(text);
                }
            })
            .on(MessageKind::PhaseChange, |seen: &mut Seen, msg| {
                if let ProgressMessage::PhaseChange(phase) = msg {
                    seen.phases.push(phase);
                }
            })
    }

    #[test]
    fn test_routes_each_kind_to_its_handler() {
        let mut dispatcher = table();
        let mut seen = Seen::default();

        assert!(dispatcher.dispatch(&mut seen, ProgressMessage::Status("a".into())));
        assert!(dispatcher.dispatch(&mut seen, ProgressMessage::PhaseChange(Phase::Measuring)));
        assert!(!dispatcher.dispatch(
            &mut seen,
            ProgressMessage::FatalError {
                model_id: None,
                message: "x".into()
            }
        ));

        assert_eq!(seen.statuses, ["a"]);
        assert_eq!(seen.phases, [Phase::Measuring]);
    }

    #[test]
    fn test_register_replaces_handler() {
        let mut dispatcher = table();
        assert!(dispatcher
            .register(MessageKind::Status, |_: &mut Seen, _| {})
            .is_some());
        let mut seen = Seen::default();
        dispatcher.dispatch(&mut seen, ProgressMessage::Status("ignored".into()));
        assert!(seen.statuses.is_empty());
    }

    #[tokio::test]
    async fn test_drain_and_wait() {
        let (tx, mut rx) = progress_channel();
        let mut dispatcher = table();
        let mut seen = Seen::default();

        tx.status("one");
        tx.status("two");
        let drained = dispatcher.drain(&mut seen, &mut rx);
        assert_eq!(drained, Drained { received: 2, closed: false });

        assert_eq!(
            dispatcher
                .dispatch_next(&mut seen, &mut rx, Duration::from_millis(5))
                .await,
            Dispatched::Idle
        );

        tx.emit(ProgressMessage::PhaseChange(Phase::Idle));
        drop(tx);
        assert_eq!(
            dispatcher
                .dispatch_next(&mut seen, &mut rx, Duration::from_millis(5))
                .await,
            Dispatched::Handled(MessageKind::PhaseChange)
        );
        assert_eq!(
            dispatcher
                .dispatch_next(&mut seen, &mut rx, Duration::from_millis(5))
                .await,
            Dispatched::Closed
        );
        assert_eq!(seen.statuses, ["one", "two"]);
    }
}
