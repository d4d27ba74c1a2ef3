//! Edge-triggered alert policy.
//!
//! # State Machine
//!
//! Each tracked item is either `Inside` or `Outside` a fence. The first
//! observation of an item behaves as if its previous state were `Outside`:
//!
//! ```text
//! Entry: Outside --> Inside          fires
//! Exit:  Inside  --> Outside         fires
//! Both:  any change                  fires
//! ```
//!
//! One-shot queries (initial population) have no previous state and instead
//! fire on the raw state: Entry on Inside, Exit on Outside, Both always.

use crate::fence::Trigger;

/// Containment state of an item relative to a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Inside,
    Outside,
}

impl TriggerState {
    /// Map a containment flag to its state.
    pub fn from_inside(inside: bool) -> Self {
        if inside {
            TriggerState::Inside
        } else {
            TriggerState::Outside
        }
    }

    /// Whether this is `Inside`.
    pub fn is_inside(self) -> bool {
        matches!(self, TriggerState::Inside)
    }
}

/// State assumed for an item never observed before.
pub const INITIAL_STATE: TriggerState = TriggerState::Outside;

/// Whether a transition fires an alert.
///
/// `previous` is `None` for one-shot queries and `Some` on the edge-triggered
/// path, where a never-seen item must be passed as [`INITIAL_STATE`].
pub fn should_fire(trigger: Trigger, current: TriggerState, previous: Option<TriggerState>) -> bool {
    match previous {
        Some(previous) => match trigger {
            Trigger::Entry => current == TriggerState::Inside && previous == TriggerState::Outside,
            Trigger::Exit => current == TriggerState::Outside && previous == TriggerState::Inside,
            Trigger::Both => current != previous,
        },
        None => match trigger {
            Trigger::Entry => current == TriggerState::Inside,
            Trigger::Exit => current == TriggerState::Outside,
            Trigger::Both => true,
        },
    }
}
