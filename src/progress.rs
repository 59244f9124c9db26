//! Load progress, reported to whoever drives the load.

use futures::channel::mpsc::UnboundedSender;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How many of the requested files have been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub current: usize,
    pub total: usize,
}

impl LoadProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.current as f32 / self.total as f32
    }

    pub fn percent(&self) -> u32 {
        (self.fraction() * 100.0).floor() as u32
    }

    pub fn label(&self) -> String {
        format!("Image: {}/{}", self.current, self.total)
    }
}

/// Receives progress ticks from the decode pool. Ticks may arrive from any
/// worker thread and slightly out of order.
pub trait ProgressSink: Sync {
    fn report(&self, progress: LoadProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(LoadProgress) + Sync,
{
    fn report(&self, progress: LoadProgress) {
        self(progress)
    }
}

impl ProgressSink for UnboundedSender<LoadProgress> {
    fn report(&self, progress: LoadProgress) {
        // a dropped receiver only means nobody is watching any more
        let _ = self.unbounded_send(progress);
    }
}

/// Discards all progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: LoadProgress) {}
}

pub(crate) struct ProgressCounter<'a> {
    sink: &'a dyn ProgressSink,
    current: AtomicUsize,
    total: usize,
}

impl<'a> ProgressCounter<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink, total: usize) -> Self {
        sink.report(LoadProgress { current: 0, total });
        Self {
            sink,
            current: AtomicUsize::new(0),
            total,
        }
    }

    pub(crate) fn tick(&self) {
        let current = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        if current <= self.total {
            self.sink.report(LoadProgress {
                current,
                total: self.total,
            });
        }
    }
}
