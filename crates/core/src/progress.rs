use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::task::{Direction, TransferTask};

/// Queued events per subscriber before progress updates start to coalesce.
pub const DEFAULT_SUBSCRIBER_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferEventKind {
    Progress,
    StateChanged,
    Removed,
}

/// A task snapshot taken at the moment of the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub task: TransferTask,
}

impl TransferEvent {
    pub fn progress(task: &TransferTask) -> Self {
        Self {
            kind: TransferEventKind::Progress,
            task: task.clone(),
        }
    }

    pub fn state_changed(task: &TransferTask) -> Self {
        Self {
            kind: TransferEventKind::StateChanged,
            task: task.clone(),
        }
    }

    pub fn removed(task: &TransferTask) -> Self {
        Self {
            kind: TransferEventKind::Removed,
            task: task.clone(),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: TransferEvent);
}

struct Slot {
    filter: Option<Direction>,
    queue: Mutex<VecDeque<TransferEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Slot {
    fn queue(&self) -> MutexGuard<'_, VecDeque<TransferEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Past the backlog, any newer event for a task supersedes its pending
    /// progress. The newer event is appended, so it never overtakes a state
    /// change queued before it, and the queue holds at most one progress
    /// event per task beyond the backlog.
    fn push(&self, event: TransferEvent, backlog: usize) {
        let mut q = self.queue();
        if q.len() >= backlog {
            q.retain(|e| !(e.kind == TransferEventKind::Progress && e.task.id == event.task.id));
        }
        q.push_back(event);
    }
}

struct BusInner {
    subscribers: Mutex<Vec<Weak<Slot>>>,
    closed: AtomicBool,
    backlog: usize,
}

/// Fan-out of transfer events to any number of observers.
///
/// `publish` never waits on a subscriber. A slow subscriber only ever loses
/// progress updates that a later event for the same task supersedes; state
/// changes and removals are always delivered in order.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::with_backlog(DEFAULT_SUBSCRIBER_BACKLOG)
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backlog(backlog: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                backlog: backlog.max(1),
            }),
        }
    }

    /// Events for one direction, or all of them when `filter` is `None`.
    pub fn subscribe(&self, filter: Option<Direction>) -> Subscription {
        let slot = Arc::new(Slot {
            filter,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(self.inner.closed.load(Ordering::Acquire)),
        });
        self.subscribers().push(Arc::downgrade(&slot));
        Subscription { slot }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers();
        subs.retain(|w| w.strong_count() > 0);
        subs.len()
    }

    /// Ends every subscription once its queue drains.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for slot in self.subscribers().iter().filter_map(Weak::upgrade) {
            slot.closed.store(true, Ordering::Release);
            slot.notify.notify_one();
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Weak<Slot>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressSink for ProgressBus {
    fn publish(&self, event: TransferEvent) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let mut subs = self.subscribers();
        subs.retain(|weak| match weak.upgrade() {
            Some(slot) => {
                if slot.filter.is_none_or(|d| d == event.task.direction) {
                    slot.push(event.clone(), self.inner.backlog);
                    slot.notify.notify_one();
                }
                true
            }
            None => false,
        });
    }
}

/// Receiving end of [`ProgressBus::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    /// Next event, or `None` after the bus is closed and the queue is empty.
    pub async fn recv(&mut self) -> Option<TransferEvent> {
        loop {
            if let Some(event) = self.slot.queue().pop_front() {
                return Some(event);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<TransferEvent> {
        self.slot.queue().pop_front()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.slot.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTransfer, TransferStatus};

    fn task(direction: Direction) -> TransferTask {
        let req = match direction {
            Direction::Upload => NewTransfer::upload("/tmp/up.bin"),
            Direction::Download => NewTransfer::download("obj", "/tmp/down.bin"),
        };
        TransferTask::new(req.with_file_name("f").with_file_size(100), 1)
    }

    #[tokio::test]
    async fn subscribers_only_see_their_direction() {
        let bus = ProgressBus::new();
        let mut uploads = bus.subscribe(Some(Direction::Upload));
        let mut all = bus.subscribe(None);

        bus.publish(TransferEvent::state_changed(&task(Direction::Download)));
        bus.publish(TransferEvent::state_changed(&task(Direction::Upload)));

        let ev = uploads.recv().await.unwrap();
        assert_eq!(ev.task.direction, Direction::Upload);
        assert!(uploads.try_recv().is_none());

        assert_eq!(all.recv().await.unwrap().task.direction, Direction::Download);
        assert_eq!(all.recv().await.unwrap().task.direction, Direction::Upload);
    }

    #[tokio::test]
    async fn backlog_coalesces_progress_but_keeps_state_changes() {
        let bus = ProgressBus::with_backlog(2);
        let mut sub = bus.subscribe(None);
        let mut t = task(Direction::Upload);

        bus.publish(TransferEvent::state_changed(&t));
        for p in [10, 20, 30, 40] {
            t.progress = p;
            bus.publish(TransferEvent::progress(&t));
        }
        bus.publish(TransferEvent::state_changed(&t));
        bus.close();

        let mut got = Vec::new();
        while let Some(ev) = sub.recv().await {
            got.push((ev.kind, ev.task.progress));
        }
        // The final state snapshot already carries progress 40.
        assert_eq!(
            got,
            [
                (TransferEventKind::StateChanged, 0),
                (TransferEventKind::StateChanged, 40),
            ]
        );
    }

    #[tokio::test]
    async fn coalesced_progress_stays_behind_earlier_state_changes() {
        let bus = ProgressBus::with_backlog(2);
        let mut sub = bus.subscribe(None);
        let mut t = task(Direction::Download);

        t.status = TransferStatus::Running;
        t.progress = 10;
        bus.publish(TransferEvent::progress(&t));
        t.status = TransferStatus::Failed;
        bus.publish(TransferEvent::state_changed(&t));
        t.status = TransferStatus::Waiting;
        bus.publish(TransferEvent::state_changed(&t));
        t.status = TransferStatus::Running;
        t.progress = 20;
        bus.publish(TransferEvent::progress(&t));
        bus.close();

        let mut got = Vec::new();
        while let Some(ev) = sub.recv().await {
            got.push((ev.kind, ev.task.status, ev.task.progress));
        }
        assert_eq!(
            got,
            [
                (TransferEventKind::StateChanged, TransferStatus::Failed, 10),
                (TransferEventKind::StateChanged, TransferStatus::Waiting, 10),
                (TransferEventKind::Progress, TransferStatus::Running, 20),
            ]
        );
    }

    #[tokio::test]
    async fn unread_queue_stays_within_backlog_under_progress_floods() {
        let bus = ProgressBus::with_backlog(4);
        let mut sub = bus.subscribe(None);
        let mut tasks: Vec<TransferTask> = (0..3).map(|_| task(Direction::Upload)).collect();

        for p in 1..=1000 {
            for t in &mut tasks {
                t.progress = p;
                bus.publish(TransferEvent::progress(t));
            }
            assert!(sub.slot.queue().len() <= 4);
        }
        bus.close();

        let mut last = std::collections::HashMap::new();
        while let Some(ev) = sub.recv().await {
            assert_eq!(ev.kind, TransferEventKind::Progress);
            last.insert(ev.task.id.clone(), ev.task.progress);
        }
        assert_eq!(last.len(), 3);
        assert!(last.values().all(|&p| p == 1000));
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(TransferEvent::progress(&task(Direction::Upload)));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish_from_another_task() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe(Some(Direction::Download));
        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(TransferEvent::removed(&task(Direction::Download)));
        });
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.kind, TransferEventKind::Removed);
        handle.await.unwrap();
    }
}
