use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StateTransitionError;

type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Cell<T: 'static> {
    state: T,
    listeners: Vec<Listener<T>>,
    transitioning: bool,
}

/// Typed state-change channel shared by every TU machine.
///
/// Listeners fire synchronously, after the state is updated. The
/// one-transition-at-a-time guard makes re-entrant callbacks safe: a
/// transition triggered from within a listener of the same emitter fails
/// with [`StateTransitionError::LoopDetected`] and leaves the state alone.
pub struct StateEmitter<T: Copy + PartialEq + 'static> {
    cell: Mutex<Cell<T>>,
}

impl<T: Copy + PartialEq + 'static> StateEmitter<T> {
    pub fn new(initial: T) -> Self {
        Self {
            cell: Mutex::new(Cell {
                state: initial,
                listeners: Vec::new(),
                transitioning: false,
            }),
        }
    }

    pub fn state(&self) -> T {
        self.cell.lock().state
    }

    pub fn on_change(&self, listener: impl Fn(T) + Send + Sync + 'static) {
        self.cell.lock().listeners.push(Arc::new(listener));
    }

    /// Moves to `next`, notifying listeners. A same-state transition is a
    /// no-op so duplicate dispose/terminate paths stay idempotent.
    pub fn transition(&self, next: T) -> Result<(), StateTransitionError> {
        let listeners = {
            let mut cell = self.cell.lock();
            if cell.transitioning {
                return Err(StateTransitionError::LoopDetected);
            }
            if cell.state == next {
                return Ok(());
            }
            cell.transitioning = true;
            cell.state = next;
            cell.listeners.clone()
        };
        for listener in &listeners {
            listener(next);
        }
        self.cell.lock().transitioning = false;
        Ok(())
    }
}
