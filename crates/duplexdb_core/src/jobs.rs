//! Job notification.

use crate::types::JobNumber;
use parking_lot::Mutex;
use tracing::debug;

/// Receives notice that a job's transaction finished during recovery.
pub trait JobNotifier: Send + Sync {
    /// Marks `job` done.
    fn mark_job_done(&self, job: JobNumber);
}

/// A notifier that only logs.
#[derive(Debug, Default)]
pub struct NullJobNotifier;

impl JobNotifier for NullJobNotifier {
    fn mark_job_done(&self, job: JobNumber) {
        debug!(%job, "job done");
    }
}

/// A notifier that remembers every call.
#[derive(Debug, Default)]
pub struct RecordingJobNotifier {
    done: Mutex<Vec<JobNumber>>,
}

impl RecordingJobNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every job marked done, in call order.
    #[must_use]
    pub fn done(&self) -> Vec<JobNumber> {
        self.done.lock().clone()
    }

    /// Returns how many times `job` was marked done.
    #[must_use]
    pub fn count_for(&self, job: JobNumber) -> usize {
        self.done.lock().iter().filter(|j| **j == job).count()
    }
}

impl JobNotifier for RecordingJobNotifier {
    fn mark_job_done(&self, job: JobNumber) {
        self.done.lock().push(job);
    }
}
