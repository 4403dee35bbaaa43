//! Bounded line queue between the serial reader and the dispatcher worker
//!
//! `Block` is a tokio mpsc channel; the reader thread parks in
//! `blocking_send` until the dispatcher catches up. `DropOldest` keeps lines in
//! a crossbeam `ArrayQueue` (`force_push` evicts the oldest line) and rings a
//! one-slot mpsc doorbell so the async consumer wakes up.

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// What happens to a new line when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// The producer waits for space
    #[default]
    Block,
    /// The oldest queued line is discarded
    DropOldest,
}

#[derive(Debug)]
struct Ring {
    lines: ArrayQueue<String>,
    dropped: AtomicU64,
}

#[derive(Clone, Debug)]
enum Feed {
    Block(mpsc::Sender<String>),
    DropOldest {
        ring: Arc<Ring>,
        doorbell: mpsc::Sender<()>,
    },
}

#[derive(Debug)]
enum Drain {
    Block(mpsc::Receiver<String>),
    DropOldest {
        ring: Arc<Ring>,
        doorbell: mpsc::Receiver<()>,
    },
}

/// Producer half, held by the serial reader and by status queries
#[derive(Clone, Debug)]
pub struct LineSender {
    feed: Feed,
}

/// Consumer half, owned by the dispatcher worker
#[derive(Debug)]
pub struct LineReceiver {
    drain: Drain,
}

/// Creates a queue holding at most `capacity` lines
pub fn line_queue(capacity: usize, policy: OverflowPolicy) -> (LineSender, LineReceiver) {
    let capacity = capacity.max(1);
    match policy {
        OverflowPolicy::Block => {
            let (tx, rx) = mpsc::channel(capacity);
            (
                LineSender {
                    feed: Feed::Block(tx),
                },
                LineReceiver {
                    drain: Drain::Block(rx),
                },
            )
        }
        OverflowPolicy::DropOldest => {
            let ring = Arc::new(Ring {
                lines: ArrayQueue::new(capacity),
                dropped: AtomicU64::new(0),
            });
            let (doorbell_tx, doorbell_rx) = mpsc::channel(1);
            (
                LineSender {
                    feed: Feed::DropOldest {
                        ring: ring.clone(),
                        doorbell: doorbell_tx,
                    },
                },
                LineReceiver {
                    drain: Drain::DropOldest {
                        ring,
                        doorbell: doorbell_rx,
                    },
                },
            )
        }
    }
}

impl LineSender {
    /// Enqueues a line; false once the receiver is closed or gone
    ///
    /// Under `Block` this parks the calling thread, so it must not run on an
    /// async worker thread.
    pub fn push(&self, line: String) -> bool {
        match &self.feed {
            Feed::Block(tx) => tx.blocking_send(line).is_ok(),
            Feed::DropOldest { ring, doorbell } => {
                if doorbell.is_closed() {
                    return false;
                }
                if let Some(evicted) = ring.lines.force_push(line) {
                    ring.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Line queue full, dropping oldest line: {}", evicted);
                }
                match doorbell.try_send(()) {
                    Ok(()) | Err(TrySendError::Full(())) => true,
                    Err(TrySendError::Closed(())) => false,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.feed {
            Feed::Block(tx) => tx.max_capacity() - tx.capacity(),
            Feed::DropOldest { ring, .. } => ring.lines.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines discarded by the `DropOldest` policy so far
    pub fn dropped(&self) -> u64 {
        match &self.feed {
            Feed::Block(_) => 0,
            Feed::DropOldest { ring, .. } => ring.dropped.load(Ordering::Relaxed),
        }
    }
}

impl LineReceiver {
    /// Next line, or `None` once every sender is gone and the queue is drained
    ///
    /// Cancel safe: a dropped call never loses a line.
    pub async fn recv(&mut self) -> Option<String> {
        match &mut self.drain {
            Drain::Block(rx) => rx.recv().await,
            Drain::DropOldest { ring, doorbell } => loop {
                if let Some(line) = ring.lines.pop() {
                    return Some(line);
                }
                if doorbell.recv().await.is_none() {
                    return ring.lines.pop();
                }
            },
        }
    }

    /// Refuses new lines; queued lines can still be received
    pub fn close(&mut self) {
        match &mut self.drain {
            Drain::Block(rx) => rx.close(),
            Drain::DropOldest { doorbell, .. } => doorbell.close(),
        }
    }
}
