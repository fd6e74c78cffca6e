//! Bounded FIFO queue with an end-of-stream sentinel.
//!
//! A thin layer over `tokio::sync::mpsc` that adds the terminal marker the
//! pipeline stages use to tell downstream "no more items", plus a depth gauge
//! the heartbeat can read without touching the queue itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};

enum Slot<T> {
    Item(T),
    End,
}

impl<T> Slot<T> {
    fn into_item(self) -> T {
        match self {
            Slot::Item(item) => item,
            Slot::End => unreachable!("the sentinel is never handed back to a producer"),
        }
    }
}

/// Shared, read-only view of a queue's occupancy.
#[derive(Debug, Clone)]
pub struct QueueGauge {
    name: &'static str,
    capacity: usize,
    depth: Arc<AtomicUsize>,
    space: Arc<Notify>,
}

impl QueueGauge {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Claim one slot if the queue is below capacity.
    fn claim(&self) -> bool {
        self.depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                (d < self.capacity).then_some(d + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
        self.space.notify_one();
    }
}

/// The consumer is gone, or this sender already sent the sentinel.
/// Carries the rejected item back.
#[derive(Debug, PartialEq, Eq)]
pub struct PushError<T>(pub T);

pub struct QueueSender<T> {
    tx: mpsc::Sender<Slot<T>>,
    gauge: QueueGauge,
    finished: bool,
}

pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<Slot<T>>,
    gauge: QueueGauge,
    ended: bool,
}

/// Create a queue holding at most `capacity` items. The sentinel gets a slot
/// of its own so `finish` never waits behind a full queue.
///
/// Senders may be cloned; there is always exactly one consumer.
pub fn bounded<T>(name: &'static str, capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity + 1);
    let gauge = QueueGauge {
        name,
        capacity,
        depth: Arc::new(AtomicUsize::new(0)),
        space: Arc::new(Notify::new()),
    };
    (
        QueueSender {
            tx,
            gauge: gauge.clone(),
            finished: false,
        },
        QueueReceiver {
            rx,
            gauge,
            ended: false,
        },
    )
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            gauge: self.gauge.clone(),
            finished: self.finished,
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue, waiting while the queue is full.
    pub async fn push(&mut self, item: T) -> Result<(), PushError<T>> {
        if self.finished {
            return Err(PushError(item));
        }
        loop {
            let space = self.gauge.space.notified();
            if self.gauge.claim() {
                break;
            }
            tokio::select! {
                _ = space => {}
                _ = self.tx.closed() => return Err(PushError(item)),
            }
        }
        // A claimed slot always has room in the channel.
        match self.tx.send(Slot::Item(item)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(slot)) => {
                self.gauge.release();
                Err(PushError(slot.into_item()))
            }
        }
    }

    /// Send the end-of-stream sentinel. Idempotent per sender; the consumer
    /// stops at the first sentinel from any clone.
    pub async fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let _ = self.tx.send(Slot::End).await;
    }

    pub fn gauge(&self) -> QueueGauge {
        self.gauge.clone()
    }
}

impl<T> QueueReceiver<T> {
    /// Next item, or `None` once the sentinel was read or the producer vanished.
    /// After returning `None` it never yields another item.
    pub async fn pop(&mut self) -> Option<T> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(Slot::Item(item)) => {
                self.taken();
                Some(item)
            }
            Some(Slot::End) | None => {
                self.end();
                None
            }
        }
    }

    pub fn gauge(&self) -> QueueGauge {
        self.gauge.clone()
    }

    fn taken(&self) {
        self.gauge.release();
    }

    fn end(&mut self) {
        self.ended = true;
        self.rx.close();
    }
}
