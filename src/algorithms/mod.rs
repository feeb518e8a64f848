//! Admission-control algorithms.
//!
//! The limiter is written against the small [`Window`] capability interface
//! so alternative window backends can be injected through a factory without
//! runtime type inspection.

pub mod sliding_window;

pub use sliding_window::SlidingWindow;

/// A fixed window of event counts starting at a point in time.
///
/// Timestamps are nanoseconds since the Unix epoch.
pub trait Window: Send {
    /// Start boundary of the window.
    fn start(&self) -> u64;

    /// Accumulated event count.
    fn count(&self) -> i64;

    /// Increment the accumulated count by `n`.
    fn add_count(&mut self, n: i64);

    /// Replace the window state wholesale.
    fn reset(&mut self, start: u64, count: i64);
}

/// Factory injected into a limiter to create its current window.
pub type WindowFactory = fn() -> Box<dyn Window>;

/// In-process window state.
#[derive(Debug, Default)]
pub struct LocalWindow {
    start: u64,
    count: i64,
}

/// The default [`WindowFactory`].
pub fn local_window() -> Box<dyn Window> {
    Box::<LocalWindow>::default()
}

impl Window for LocalWindow {
    fn start(&self) -> u64 {
        self.start
    }

    fn count(&self) -> i64 {
        self.count
    }

    fn add_count(&mut self, n: i64) {
        self.count += n;
    }

    fn reset(&mut self, start: u64, count: i64) {
        self.start = start;
        self.count = count;
    }
}
