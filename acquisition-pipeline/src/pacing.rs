use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

/// Inserts a fixed delay between consecutive paced operations, across every
/// task sharing the pacer.
///
/// The delay is measured from the later of the previous operation's start and
/// its end, so a slow download or keyword never eats into the gap.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last_release: Mutex<Option<Instant>>,
}

/// Held for the duration of a paced operation. Dropping it marks the operation
/// finished.
#[must_use = "the pacing gap starts when the slot is dropped"]
#[derive(Debug)]
pub struct PaceSlot<'a> {
    pacer: &'a Pacer,
}

impl Drop for PaceSlot<'_> {
    fn drop(&mut self) {
        self.pacer.mark();
    }
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_release: Mutex::new(None),
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Waits until `interval` has passed since the previous operation started
    /// or finished, whichever is later. The first call returns immediately.
    pub async fn wait(&self) -> PaceSlot<'_> {
        loop {
            let deadline = {
                let mut last = self.last();
                match (*last).and_then(|previous| previous.checked_add(self.interval)) {
                    Some(deadline) if deadline > Instant::now() => deadline,
                    _ => {
                        *last = Some(Instant::now());
                        return PaceSlot { pacer: self };
                    }
                }
            };
            tokio::time::sleep_until(deadline).await;
        }
    }

    fn mark(&self) {
        *self.last() = Some(Instant::now());
    }

    fn last(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
