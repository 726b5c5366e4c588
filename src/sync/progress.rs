//! Progress aggregation for drain cycles.
//!
//! Converts discrete attachment/bundle completion events, arriving from
//! concurrent upload tasks, into a single monotone 0-100 stream for a
//! caller-supplied sink. No persisted state; a fresh tracker per drain.

use std::sync::Arc;

use parking_lot::Mutex;

/// Caller-supplied observer for aggregate upload progress.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, percent: u8, message: &str);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _percent: u8, _message: &str) {}
}

#[derive(Debug, Default)]
struct Counters {
    attachments_done: usize,
    bundles_done: usize,
}

/// Shared per-drain progress state.
///
/// The whole increment-recompute-emit sequence runs under one lock so
/// concurrent tasks can never interleave into a regressing percentage.
pub struct ProgressTracker {
    total_bundles: usize,
    total_attachments: usize,
    counters: Mutex<Counters>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressTracker {
    pub fn new(total_bundles: usize, total_attachments: usize, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            total_bundles,
            total_attachments,
            counters: Mutex::new(Counters::default()),
            sink,
        }
    }

    /// One attachment finished uploading.
    pub fn attachment_done(&self, filename: &str) {
        let mut counters = self.counters.lock();
        counters.attachments_done += 1;
        let done = counters.attachments_done;
        let percent = percent_of(done, self.total_attachments);
        self.sink.on_progress(
            percent,
            &format!(
                "Uploading: {} ({}/{} attachments)",
                filename, done, self.total_attachments
            ),
        );
    }

    /// One bundle finished, successfully or not.
    pub fn bundle_done(&self, succeeded: bool) {
        let mut counters = self.counters.lock();
        counters.bundles_done += 1;
        let done = counters.bundles_done;
        let percent = percent_of(done, self.total_bundles);
        let message = if succeeded {
            format!("Completed {}/{} bundles", done, self.total_bundles)
        } else {
            format!("Failed {}/{} bundles", done, self.total_bundles)
        };
        self.sink.on_progress(percent, &message);
    }
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done * 100) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collecting(Mutex<Vec<(u8, String)>>);

    impl Collecting {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }
    }

    impl ProgressSink for Collecting {
        fn on_progress(&self, percent: u8, message: &str) {
            self.0.lock().push((percent, message.to_string()));
        }
    }

    #[test]
    fn test_attachment_percent_floor_and_clamp() {
        let sink = Collecting::new();
        let tracker = ProgressTracker::new(1, 3, sink.clone());

        tracker.attachment_done("a.jpg");
        tracker.attachment_done("b.jpg");
        tracker.attachment_done("c.jpg");
        // Over-reporting must still clamp at 100.
        tracker.attachment_done("d.jpg");

        let percents: Vec<u8> = sink.0.lock().iter().map(|(p, _)| *p).collect();
        assert_eq!(percents, vec![33, 66, 100, 100]);
    }

    #[test]
    fn test_bundle_messages() {
        let sink = Collecting::new();
        let tracker = ProgressTracker::new(2, 0, sink.clone());

        tracker.bundle_done(true);
        tracker.bundle_done(false);

        let events = sink.0.lock();
        assert_eq!(events[0], (50, "Completed 1/2 bundles".to_string()));
        assert_eq!(events[1], (100, "Failed 2/2 bundles".to_string()));
    }

    #[test]
    fn test_zero_totals_never_divide() {
        let sink = Collecting::new();
        let tracker = ProgressTracker::new(0, 0, sink.clone());
        tracker.attachment_done("a.jpg");
        tracker.bundle_done(true);
        assert!(sink.0.lock().iter().all(|(p, _)| *p == 0));
    }
}
