use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Playback position source of the attached media element.
pub trait MediaClock: Send + Sync + Debug {
    /// Current playback position in seconds
    fn current_time(&self) -> f64;
}

/// Media clock updated by the host on every time update or seek.
#[derive(Debug, Default)]
pub struct SharedMediaClock {
    bits: AtomicU64,
}

impl SharedMediaClock {
    pub fn new(position: f64) -> Self {
        Self {
            bits: AtomicU64::new(position.to_bits()),
        }
    }

    pub fn set(&self, position: f64) {
        self.bits.store(position.to_bits(), Ordering::Release);
    }
}

impl MediaClock for SharedMediaClock {
    fn current_time(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}
