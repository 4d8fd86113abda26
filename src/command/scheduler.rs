//! Periodic job scheduler
//!
//! One timer task per job name. Scheduling a name that already has a timer
//! replaces it; a non-periodic frequency removes it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use udpu_shared::Frequency;

pub struct JobScheduler {
    token: CancellationToken,
    tracker: TaskTracker,
    entries: Mutex<HashMap<String, CancellationToken>>,
}

impl JobScheduler {
    pub fn new(token: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            token,
            tracker,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Run `task` every period of `frequency` until shutdown.
    ///
    /// Returns false (and drops any previous timer for `name`) when the
    /// frequency is not one of the periodic cadences.
    pub fn schedule<F, Fut>(&self, name: &str, frequency: &Frequency, mut task: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(period) = frequency.period() else {
            self.unschedule(name);
            return false;
        };

        let timer = self.token.child_token();
        if let Some(previous) = self.lock().insert(name.to_string(), timer.clone()) {
            debug!("Replacing schedule of job {}", name);
            previous.cancel();
        }

        info!("Scheduled job {} every {} min", name, frequency);
        let job = name.to_string();
        let first = Instant::now() + period;
        self.tracker.spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("Scheduled run of job {}", job);
                        task().await;
                    }
                }
            }
        });
        true
    }

    /// Stop the timer for `name`, if any
    pub fn unschedule(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
