//! Sliding window counter rate limiter.
//!
//! Tracks two adjacent fixed windows and interpolates between them to
//! estimate the trailing-window count in O(1) memory. The approximation
//! bounds worst-case burst near a window boundary to roughly twice the
//! nominal limit.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{local_window, Window, WindowFactory};
use crate::error::{Error, Result};

struct Inner {
    limit: i64,
    curr: Box<dyn Window>,
    prev: Box<dyn Window>,
}

/// Per-domain admission limiter. All state transitions for one instance are
/// serialized under a single lock.
pub struct SlidingWindow {
    size_ns: u64,
    inner: Mutex<Inner>,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

impl SlidingWindow {
    /// Create a limiter with the given window duration and limit.
    ///
    /// A zero window duration is a configuration fault and fails before any
    /// limiter is installed. The previous window is always local state; the
    /// factory only creates the current window.
    pub fn new(size: Duration, limit: i64, factory: WindowFactory) -> Result<Self> {
        if size.is_zero() {
            return Err(Error::Config(
                "rate window duration must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            size_ns: size.as_nanos() as u64,
            inner: Mutex::new(Inner {
                limit,
                curr: factory(),
                prev: local_window(),
            }),
        })
    }

    /// Window duration.
    pub fn size(&self) -> Duration {
        Duration::from_nanos(self.size_ns)
    }

    /// Maximum events permitted during one window.
    pub fn limit(&self) -> i64 {
        self.lock().limit
    }

    pub fn set_limit(&self, limit: i64) {
        self.lock().limit = limit;
    }

    /// Shorthand for `grant_n(now, 1)`.
    pub fn grant(&self) -> bool {
        self.grant_n(now_nanos(), 1)
    }

    /// Report whether `n` events may happen at time `now` (nanoseconds since
    /// the Unix epoch), and record them if so.
    pub fn grant_n(&self, now: u64, n: i64) -> bool {
        let mut inner = self.lock();
        self.advance(&mut inner, now);

        let elapsed = now.saturating_sub(inner.curr.start());
        let weight = self.size_ns.saturating_sub(elapsed) as f64 / self.size_ns as f64;
        let estimated = (weight * inner.prev.count() as f64) as i64 + inner.curr.count();

        if estimated + n > inner.limit {
            return false;
        }
        inner.curr.add_count(n);
        true
    }

    /// Slide the window pair forward to cover `now`.
    ///
    /// The new previous window inherits the old current count only on an
    /// exact one-window advance; a larger gap invalidates carried history.
    fn advance(&self, inner: &mut Inner, now: u64) {
        let new_start = now - now % self.size_ns;
        if new_start <= inner.curr.start() {
            return;
        }
        let diff = (new_start - inner.curr.start()) / self.size_ns;
        if diff >= 1 {
            let carried = if diff == 1 { inner.curr.count() } else { 0 };
            inner.prev.reset(new_start - self.size_ns, carried);
            inner.curr.reset(new_start, 0);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
