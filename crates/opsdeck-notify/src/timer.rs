use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// One cancellable timer task that posts events back into the actor queue.
///
/// Re-arming or cancelling aborts the previous task synchronously. A task
/// that already queued its event is neutralised by the generation carried in
/// that event, not by this slot.
#[derive(Default)]
pub(crate) struct TimerSlot {
    task: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub(crate) fn arm_once<E: Send + 'static>(
        &mut self,
        delay: Duration,
        tx: mpsc::UnboundedSender<E>,
        event: E,
    ) {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(event);
        }));
    }

    /// Fires every `period`, first tick one period from now.
    pub(crate) fn arm_every<E, F>(&mut self, period: Duration, tx: mpsc::UnboundedSender<E>, make: F)
    where
        E: Send + 'static,
        F: Fn() -> E + Send + 'static,
    {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            // A period past the clock's range never ticks.
            let Some(first) = Instant::now().checked_add(period) else {
                return;
            };
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make()).is_err() {
                    break;
                }
            }
        }));
    }

    /// Tracks an arbitrary task (e.g. an in-flight connect) for cancellation.
    pub(crate) fn track(&mut self, task: JoinHandle<()>) {
        self.cancel();
        self.task = Some(task);
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::default();
        slot.arm_once(Duration::from_secs(5), tx, 7u32);
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        let mut slot = TimerSlot::default();
        slot.arm_once(Duration::from_secs(5), tx.clone(), 1);
        slot.cancel();
        assert!(!slot.is_armed());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::default();
        slot.arm_once(Duration::from_secs(5), tx.clone(), "first");
        slot.arm_once(Duration::from_secs(1), tx, "second");
        assert_eq!(rx.recv().await, Some("second"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn every_ticks_until_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::default();
        let start = Instant::now();
        slot.arm_every(Duration::from_secs(30), tx, || ());
        rx.recv().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        rx.recv().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        slot.cancel();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
