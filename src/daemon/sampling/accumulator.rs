use std::sync::atomic::{AtomicU32, Ordering};

use crate::system_api::InputEvent;

/// Per-tick counters for input activity. Incremented from the observer's
/// OS thread, drained by the sampling tick. The swap in [drain] is the
/// atomic read-and-clear that attributes late events to the next tick
/// instead of losing or double counting them.
#[derive(Default)]
pub struct InputAccumulator {
    keystrokes: AtomicU32,
    pointer: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputCounts {
    pub keystrokes: u32,
    pub pointer: u32,
}

impl InputCounts {
    pub fn is_empty(&self) -> bool {
        self.keystrokes == 0 && self.pointer == 0
    }
}

impl InputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: InputEvent) {
        match event {
            InputEvent::KeyDown => {
                self.keystrokes.fetch_add(1, Ordering::Relaxed);
            }
            InputEvent::MouseDown | InputEvent::MouseMove | InputEvent::Wheel => {
                self.pointer.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn drain(&self) -> InputCounts {
        InputCounts {
            keystrokes: self.keystrokes.swap(0, Ordering::AcqRel),
            pointer: self.pointer.swap(0, Ordering::AcqRel),
        }
    }
}
