use std::cell::Cell;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Time source for the tables. `now_ms` is monotonic and drives interest
/// lifetimes; `wall_ms` is wall-clock and drives content-object expiry.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn wall_ms(&self) -> u64;
}

pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { anchor: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    fn wall_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

/// Hand-cranked clock for unit tests. Monotonic and wall time advance
/// together.
pub struct ManualClock {
    now: Cell<u64>,
    wall: Cell<u64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: Cell::new(0), wall: Cell::new(1_000_000) }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
        self.wall.set(self.wall.get() + ms);
    }

    pub fn set_wall(&self, wall_ms: u64) {
        self.wall.set(wall_ms);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn wall_ms(&self) -> u64 {
        self.wall.get()
    }
}
