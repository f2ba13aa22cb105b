//! Leader failure detection.
//!
//! A [`FailureDetector`] tracks one deadline: the election timer. Updates
//! from a live leader, granted votes, and lost elections push it forward
//! ("snooze"). A [`FailureMonitor`] task samples the detector at
//! randomized intervals and reports expiration to consensus, which starts
//! an election unless elections are currently withheld.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// The single-timer failure detector.
#[derive(Debug)]
pub struct FailureDetector {
    inner: Mutex<DetectorInner>,
}

#[derive(Debug)]
struct DetectorInner {
    enabled: bool,
    deadline: Instant,
}

impl FailureDetector {
    /// Creates a disabled detector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DetectorInner {
                enabled: false,
                deadline: Instant::now(),
            }),
        }
    }

    /// Enables the detector with an initial timeout of `delta` from now.
    pub fn enable(&self, delta: Duration) {
        let mut inner = self.lock();
        inner.enabled = true;
        inner.deadline = Instant::now() + delta;
        debug!(?delta, "failure detector enabled");
    }

    /// Disables the detector (leaders do not monitor themselves).
    pub fn disable(&self) {
        self.lock().enabled = false;
        debug!("failure detector disabled");
    }

    /// Whether the detector is currently enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Pushes the deadline to at least `delta` from now. Never pulls it
    /// backward.
    pub fn snooze(&self, delta: Duration) {
        let mut inner = self.lock();
        let proposed = Instant::now() + delta;
        if proposed > inner.deadline {
            inner.deadline = proposed;
        }
        trace!(?delta, "failure detector snoozed");
    }

    /// True if the detector is enabled and the deadline has passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        let inner = self.lock();
        inner.enabled && Instant::now() >= inner.deadline
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DetectorInner> {
        self.inner.lock().expect("failure detector lock poisoned")
    }
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Samples a detector at randomized intervals and reports expirations.
pub struct FailureMonitor {
    handle: JoinHandle<()>,
}

impl FailureMonitor {
    /// Spawns the monitor task. `on_failure` runs (from the monitor task)
    /// every time a sample observes the detector expired; the callee is
    /// expected to snooze the detector when it handles the report.
    #[must_use]
    pub fn spawn<F>(
        detector: Arc<FailureDetector>,
        mean: Duration,
        stddev: Duration,
        on_failure: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(sample_interval(mean, stddev)).await;
                if detector.expired() {
                    debug!("election timer expired");
                    on_failure();
                }
            }
        });
        Self { handle }
    }

    /// Stops the monitor task.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for FailureMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Approximately normal sampling interval: mean ± stddev, from the sum of
/// three uniform draws (unit standard deviation), clamped at a quarter of
/// the mean.
fn sample_interval(mean: Duration, stddev: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let unit: f64 = (0..3).map(|_| rng.gen_range(-1.0f64..=1.0)).sum();
    let offset = stddev.as_secs_f64() * unit;
    let secs = (mean.as_secs_f64() + offset).max(mean.as_secs_f64() / 4.0);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_snooze_never_regresses() {
        let detector = FailureDetector::new();
        detector.enable(Duration::from_secs(60));
        assert!(!detector.expired());

        detector.snooze(Duration::from_millis(1));
        // The 60s deadline still stands.
        assert!(!detector.expired());
    }

    #[test]
    fn test_disabled_detector_never_expires() {
        let detector = FailureDetector::new();
        detector.enable(Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(detector.expired());

        detector.disable();
        assert!(!detector.expired());
    }

    #[test]
    fn test_sample_interval_is_positive_and_near_mean() {
        let mean = Duration::from_millis(100);
        let stddev = Duration::from_millis(20);
        for _ in 0..1_000 {
            let interval = sample_interval(mean, stddev);
            assert!(interval >= Duration::from_millis(25));
            assert!(interval < Duration::from_millis(500));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_monitor_reports_expiration() {
        let detector = Arc::new(FailureDetector::new());
        detector.enable(Duration::from_millis(1));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let monitor = FailureMonitor::spawn(
            Arc::clone(&detector),
            Duration::from_millis(20),
            Duration::from_millis(5),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);
        monitor.shutdown();
    }
}
