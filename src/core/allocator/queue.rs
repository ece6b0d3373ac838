//! FIFO turn queue
//!
//! Serializes multi-step allocator work. Callers take a numbered ticket and
//! are served strictly in ticket order. A holder that keeps its turn past the
//! timeout is force-released by the next waiter, so a stuck caller cannot
//! stall the allocator. When the queue drains, the registered idle hooks run.

use crate::timewheel::deadline_after;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Callback invoked when the queue drains
pub type IdleHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct QueueState {
    /// Ticket handed to the next caller
    next_ticket: u64,
    /// Ticket currently holding the turn
    serving: u64,
    /// When the current holder's turn expires
    deadline: Option<Instant>,
}

pub struct TurnQueue {
    state: Mutex<QueueState>,
    turn_over: Condvar,
    idle_hooks: Mutex<Vec<IdleHook>>,
    forced_releases: AtomicU64,
}

impl TurnQueue {
    pub fn new() -> Self {
        TurnQueue {
            state: Mutex::new(QueueState {
                next_ticket: 0,
                serving: 0,
                deadline: None,
            }),
            turn_over: Condvar::new(),
            idle_hooks: Mutex::new(Vec::new()),
            forced_releases: AtomicU64::new(0),
        }
    }

    /// Wait for a turn; it is force-released if held longer than `timeout`
    pub fn new_turn(&self, timeout: Duration) -> Turn<'_> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        loop {
            if state.serving == ticket {
                state.deadline = Some(deadline_after(Instant::now(), timeout));
                trace!("Turn {} started", ticket);
                return Turn {
                    queue: self,
                    ticket,
                    released: false,
                };
            }

            match state.deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    warn!(
                        "Turn {} held past its timeout, force-releasing for turn {}",
                        state.serving, ticket
                    );
                    state.serving += 1;
                    state.deadline = None;
                    self.forced_releases.fetch_add(1, Ordering::Relaxed);
                    self.turn_over.notify_all();
                }
                Some(deadline) => {
                    self.turn_over.wait_until(&mut state, deadline);
                }
                None => {
                    self.turn_over.wait(&mut state);
                }
            }
        }
    }

    fn release(&self, ticket: u64) -> bool {
        let drained = {
            let mut state = self.state.lock();
            if state.serving != ticket {
                debug!("Turn {} already force-released, ignoring end", ticket);
                return false;
            }
            state.serving += 1;
            state.deadline = None;
            self.turn_over.notify_all();
            state.serving == state.next_ticket
        };

        trace!("Turn {} ended", ticket);
        if drained {
            self.fire_idle();
        }
        true
    }

    fn fire_idle(&self) {
        let hooks: Vec<IdleHook> = self.idle_hooks.lock().clone();
        for hook in hooks {
            hook();
        }
    }

    /// Register a hook to run each time the queue drains
    ///
    /// Hooks run on the thread that ended the last turn, after the turn is
    /// released. A hook must not take a turn itself.
    pub fn on_idle<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.idle_hooks.lock().push(Arc::new(hook));
    }

    /// No turn held and nobody waiting
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.serving == state.next_ticket
    }

    /// Holder plus waiters
    pub fn pending(&self) -> u64 {
        let state = self.state.lock();
        state.next_ticket - state.serving
    }

    /// Turns that were released by timeout rather than by their holder
    pub fn forced_releases(&self) -> u64 {
        self.forced_releases.load(Ordering::Relaxed)
    }
}

impl Default for TurnQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// An exclusive turn on a [`TurnQueue`]; released by `end` or on drop
pub struct Turn<'a> {
    queue: &'a TurnQueue,
    ticket: u64,
    released: bool,
}

impl<'a> Turn<'a> {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Whether this turn still holds the queue (false once force-released)
    pub fn is_current(&self) -> bool {
        !self.released && self.queue.state.lock().serving == self.ticket
    }

    /// Release the turn
    ///
    /// Returns false when the turn had already been force-released.
    pub fn end(mut self) -> bool {
        self.released = true;
        self.queue.release(self.ticket)
    }
}

impl<'a> Drop for Turn<'a> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.queue.release(self.ticket);
        }
    }
}
