//! Named periodic tasks owned by the component that starts them.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// A spawned periodic task. Cancelling or dropping the handle aborts it.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
    cancelled: bool,
}

impl ScheduledTask {
    /// Runs `on_tick` every `period`, first after one full period.
    ///
    /// The task ends on its own once `on_tick` returns `false`, which callers use
    /// when the receiving side of their channel is gone.
    pub fn every<F>(name: &'static str, period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!(task = name, "tick");
                if !on_tick() {
                    debug!(task = name, "scheduled task stopped, receiver gone");
                    break;
                }
            }
        });
        debug!(task = name, ?period, "scheduled task started");
        Self {
            name,
            handle,
            cancelled: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.handle.abort();
            debug!(task = self.name, "scheduled task cancelled");
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancelled && !self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Counts the live tasks among a component's optional slots.
pub(crate) fn count_active<'a>(tasks: impl IntoIterator<Item = &'a Option<ScheduledTask>>) -> usize {
    tasks
        .into_iter()
        .filter(|slot| slot.as_ref().is_some_and(ScheduledTask::is_active))
        .count()
}
