// SPDX-License-Identifier: MIT OR Apache-2.0
//! The outbound frame queue: an unbounded FIFO whose head is only removed
//! after a successful send.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::frame::ClientFrame;

/// Pending outbound frames.
///
/// Producers push from any task; a single consumer peeks the head, writes it
/// to the socket, and commits only on success. A frame that fails mid-send
/// therefore stays at the head and is retried on the next connection:
/// never lost, never duplicated by this queue.
#[derive(Default)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<ClientFrame>>,
    notify: Notify,
}

impl OutboundQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame.
    pub fn push(&self, frame: ClientFrame) {
        self.items.lock().unwrap().push_back(frame);
        self.notify.notify_one();
    }

    /// Wait until the queue is non-empty and clone the head frame without
    /// removing it.
    pub async fn peek(&self) -> ClientFrame {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.items.lock().unwrap().front().cloned() {
                return frame;
            }
            notified.await;
        }
    }

    /// Remove the head frame after it was sent.
    pub fn commit(&self) {
        self.items.lock().unwrap().pop_front();
    }

    /// Drop every pending frame.
    pub fn clear(&self) {
        self.items.lock().unwrap().clear();
    }

    /// Number of pending frames.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Returns `true` when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
