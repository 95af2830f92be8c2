//! Group consumer lifecycle state machine.

use std::fmt;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle state of a group consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// Constructed, not running
    Created,
    /// Running, waiting for the first assignment
    Joining,
    /// Partitions assigned, no batch dispatched since
    Assigned,
    /// Dispatching polled batches
    Polling,
    /// Handling an assignment change
    Rebalancing,
    /// Draining and releasing resources
    Closing,
    /// Terminal
    Closed,
}

impl ConsumerState {
    /// Get the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Created => "created",
            ConsumerState::Joining => "joining",
            ConsumerState::Assigned => "assigned",
            ConsumerState::Polling => "polling",
            ConsumerState::Rebalancing => "rebalancing",
            ConsumerState::Closing => "closing",
            ConsumerState::Closed => "closed",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: ConsumerState) -> bool {
        use ConsumerState::*;
        matches!(
            (self, next),
            (Created, Joining)
                | (Joining, Assigned)
                | (Assigned, Polling)
                | (Assigned, Rebalancing)
                | (Polling, Rebalancing)
                | (Rebalancing, Assigned)
                | (Created | Joining | Assigned | Polling | Rebalancing, Closing)
                | (Closing, Closed)
        )
    }

    /// Whether the consumer has finished.
    pub fn is_terminal(self) -> bool {
        self == ConsumerState::Closed
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable holder of the current [`ConsumerState`].
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ConsumerState>,
}

impl StateMachine {
    /// Start in `Created`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConsumerState::Created);
        Self { tx }
    }

    /// Current state.
    pub fn current(&self) -> ConsumerState {
        *self.tx.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Same-state transitions are no-ops; illegal ones are
    /// logged and refused.
    pub fn transition(&self, next: ConsumerState) -> bool {
        let mut outcome = false;
        self.tx.send_if_modified(|current| {
            let from = *current;
            if from == next {
                outcome = true;
                return false;
            }
            if !from.can_transition_to(next) {
                warn!(from = %from, to = %next, "Illegal consumer state transition refused");
                return false;
            }
            info!(from = %from, to = %next, "Consumer state transition");
            *current = next;
            outcome = true;
            true
        });
        outcome
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConsumerState::*;

    #[test]
    fn test_happy_path() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), Created);
        for next in [Joining, Assigned, Polling, Rebalancing, Assigned, Polling, Closing, Closed] {
            assert!(sm.transition(next), "transition to {} refused", next);
        }
        assert!(sm.current().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_refused() {
        let sm = StateMachine::new();
        assert!(!sm.transition(Polling));
        assert_eq!(sm.current(), Created);

        sm.transition(Joining);
        assert!(!sm.transition(Rebalancing));
        assert!(!sm.transition(Closed));
        assert_eq!(sm.current(), Joining);
    }

    #[test]
    fn test_same_state_is_noop() {
        let sm = StateMachine::new();
        let rx = sm.subscribe();
        assert!(sm.transition(Created));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_closing_reachable_from_running_states() {
        for from in [Created, Joining, Assigned, Polling, Rebalancing] {
            assert!(from.can_transition_to(Closing));
        }
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Closing.can_transition_to(Polling));
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let sm = StateMachine::new();
        let mut rx = sm.subscribe();
        sm.transition(Joining);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Joining);
    }
}
