//! Owned timer queue
//!
//! A single task keeps deadlines ordered and emits keys when they fall due.
//! Rescheduling a key replaces its deadline. The task exits as soon as the
//! owning `TimerQueue` is dropped, so timers never outlive their component.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum TimerCommand<K> {
    Schedule(K, Instant),
    Cancel(K),
}

pub struct TimerQueue<K> {
    commands: mpsc::UnboundedSender<TimerCommand<K>>,
    task: JoinHandle<()>,
}

impl<K> TimerQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Returns the queue and the channel on which due keys are delivered
    pub fn new() -> (Self, mpsc::UnboundedReceiver<K>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_timers(rx, due_tx));
        (Self { commands, task }, due_rx)
    }

    pub fn schedule(&self, key: K, at: Instant) {
        let _ = self.commands.send(TimerCommand::Schedule(key, at));
    }

    pub fn cancel(&self, key: K) {
        let _ = self.commands.send(TimerCommand::Cancel(key));
    }
}

impl<K> Drop for TimerQueue<K> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_timers<K>(
    mut commands: mpsc::UnboundedReceiver<TimerCommand<K>>,
    due: mpsc::UnboundedSender<K>,
) where
    K: Clone + Eq + Hash + Send + 'static,
{
    let mut deadlines: BTreeMap<(Instant, u64), K> = BTreeMap::new();
    let mut by_key: HashMap<K, (Instant, u64)> = HashMap::new();
    let mut next_id = 0u64;

    loop {
        let next = deadlines.keys().next().map(|(at, _)| *at);

        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(TimerCommand::Schedule(key, at)) => {
                    if let Some(old) = by_key.remove(&key) {
                        deadlines.remove(&old);
                    }
                    next_id += 1;
                    deadlines.insert((at, next_id), key.clone());
                    by_key.insert(key, (at, next_id));
                }
                Some(TimerCommand::Cancel(key)) => {
                    if let Some(old) = by_key.remove(&key) {
                        deadlines.remove(&old);
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let now = Instant::now();
                while let Some(entry) = deadlines.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let key = entry.remove();
                    by_key.remove(&key);
                    if due.send(key).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let (timers, mut due) = TimerQueue::new();
        let now = Instant::now();
        timers.schedule("b", now + Duration::from_millis(200));
        timers.schedule("a", now + Duration::from_millis(100));

        assert_eq!(due.recv().await, Some("a"));
        assert_eq!(due.recv().await, Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_reschedule() {
        let (timers, mut due) = TimerQueue::new();
        let now = Instant::now();
        timers.schedule("x", now + Duration::from_millis(100));
        timers.schedule("y", now + Duration::from_millis(150));
        timers.cancel("x");
        timers.schedule("y", now + Duration::from_millis(300));
        timers.schedule("z", now + Duration::from_millis(200));

        assert_eq!(due.recv().await, Some("z"));
        assert_eq!(due.recv().await, Some("y"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_ends_with_owner() {
        let (timers, mut due) = TimerQueue::<u32>::new();
        timers.schedule(1, Instant::now() + Duration::from_secs(60));
        drop(timers);
        assert_eq!(due.recv().await, None);
    }
}
