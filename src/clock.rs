use chrono::{DateTime, Duration as WallDuration, Local};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// Longest uninterrupted sleep: bounds how late a shutdown request is noticed.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Time source for every wait in the harness. The gate, the sampler and the
/// retry loop only ever sleep through a `Clock`, so a shutdown request is seen
/// wherever the harness happens to be waiting.
pub trait Clock {
    /// Monotonic time since the clock was created.
    fn elapsed(&self) -> Duration;

    /// Wall-clock time, used to timestamp samples.
    fn wall(&self) -> DateTime<Local>;

    /// Sleep for `duration`, returning early if the run is cancelled.
    fn sleep(&self, duration: Duration);

    fn cancelled(&self) -> bool {
        false
    }
}

/// Real time, cancelled through the process-wide shutdown flag.
pub struct SystemClock<'a> {
    origin: Instant,
    shutdown: &'a AtomicBool,
}

impl<'a> SystemClock<'a> {
    pub fn new(shutdown: &'a AtomicBool) -> Self {
        Self {
            origin: Instant::now(),
            shutdown,
        }
    }
}

impl Clock for SystemClock<'_> {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Virtual time: `sleep` advances the clock instantly. Lets the sampler and
/// thermal gate be driven through hours of schedule without waiting.
pub struct ManualClock {
    origin: DateTime<Local>,
    now: Cell<Duration>,
    cancel_at: Cell<Option<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Local::now(),
            now: Cell::new(Duration::ZERO),
            cancel_at: Cell::new(None),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }

    /// Report the run as cancelled once virtual time reaches `at`.
    pub fn cancel_at(&self, at: Duration) {
        self.cancel_at.set(Some(at));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.now.get()
    }

    fn wall(&self) -> DateTime<Local> {
        // Sub-second precision is irrelevant to the harness; fall back to the
        // origin rather than fail if the offset somehow overflows.
        WallDuration::from_std(self.now.get())
            .map(|offset| self.origin + offset)
            .unwrap_or(self.origin)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn cancelled(&self) -> bool {
        matches!(self.cancel_at.get(), Some(at) if self.now.get() >= at)
    }
}
