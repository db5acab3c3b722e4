//! Table-driven finite state machine runner.
//!
//! Each agent describes itself as a static transition table:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  &'static [Transition]                                       │
//! │  ┌──────────────────┬──────────────┬──────────────────────┐  │
//! │  │ from             │ on           │ action               │  │
//! │  ├──────────────────┼──────────────┼──────────────────────┤  │
//! │  │ Is(Ready)        │ ReceivedJob  │ fn(ctx, ev) -> State │  │
//! │  │ OneOf(&[..])     │ RequestBlock │ fn(ctx, ev) -> State │  │
//! │  │ Any              │ Suspend      │ fn(ctx, ev) -> State │  │
//! │  └──────────────────┴──────────────┴──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Runner::dispatch`] finds the first row whose `from` matches the
//! current state and whose `on` equals the event kind, runs its action
//! and moves to the state the action returns.  Rows are scanned in
//! order, so state-specific rows must precede `Any` rows for the same
//! event.  An event with no matching row is logged and dropped; dropping
//! it returns any pooled buffer it carried.
//!
//! The runner does no retries.  Retry policy lives in the actions.

use core::fmt::Debug;
use core::time::Duration;

use log::{debug, info};

use crate::events::{Event, EventQueue};

// ---------------------------------------------------------------------------
// Table rows
// ---------------------------------------------------------------------------

/// Which states a row applies to.
pub enum StateMatch<S: 'static> {
    Any,
    Is(S),
    OneOf(&'static [S]),
}

impl<S: PartialEq> StateMatch<S> {
    pub fn matches(&self, state: &S) -> bool {
        match self {
            Self::Any => true,
            Self::Is(s) => s == state,
            Self::OneOf(set) => set.contains(state),
        }
    }
}

/// Signature of a transition action.  Consumes the event and returns the
/// next state.
pub type ActionFn<S, K, C> = fn(&mut C, Event<K>) -> S;

/// One row of a transition table.
pub struct Transition<S: 'static, K, C> {
    pub from: StateMatch<S>,
    pub on: K,
    pub action: ActionFn<S, K, C>,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct Runner<S: 'static, K: 'static, C: 'static> {
    name: &'static str,
    table: &'static [Transition<S, K, C>],
    current: S,
    handled: u64,
}

impl<S, K, C> Runner<S, K, C>
where
    S: Copy + PartialEq + Debug,
    K: Copy + PartialEq + Debug,
{
    pub fn new(name: &'static str, table: &'static [Transition<S, K, C>], initial: S) -> Self {
        info!("{}: starting in {:?}", name, initial);
        Self {
            name,
            table,
            current: initial,
            handled: 0,
        }
    }

    pub fn state(&self) -> S {
        self.current
    }

    /// Events that matched a row since construction.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Run one event through the table.  Returns `false` if it was ignored.
    pub fn dispatch(&mut self, ctx: &mut C, event: Event<K>) -> bool {
        let current = self.current;
        let Some(row) = self
            .table
            .iter()
            .find(|t| t.on == event.kind && t.from.matches(&current))
        else {
            info!("{}: ignoring {:?} in {:?}", self.name, event.kind, current);
            return false;
        };

        let kind = event.kind;
        let next = (row.action)(ctx, event);
        self.handled += 1;

        if next == current {
            debug!("{}: {:?} handled in {:?}", self.name, kind, current);
        } else {
            info!("{}: {:?} -> {:?}", self.name, current, next);
        }
        self.current = next;
        true
    }

    /// Wait up to `timeout` for one event and dispatch it.
    /// Returns `false` on timeout or if the event was ignored.
    pub fn step<const N: usize>(
        &mut self,
        ctx: &mut C,
        queue: &EventQueue<K, N>,
        timeout: Duration,
    ) -> bool {
        match queue.receive(timeout) {
            Some(event) => self.dispatch(ctx, event),
            None => false,
        }
    }

    /// Dispatch everything already queued without waiting.
    /// Returns the number of events taken off the queue.
    pub fn drain<const N: usize>(&mut self, ctx: &mut C, queue: &EventQueue<K, N>) -> usize {
        let mut n = 0;
        while let Some(event) = queue.receive(Duration::ZERO) {
            self.dispatch(ctx, event);
            n += 1;
        }
        n
    }
}
