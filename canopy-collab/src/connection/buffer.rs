//! Outbound buffer for sends issued while not connected.

use std::collections::VecDeque;

use crate::protocol::MessageKind;

/// Frames waiting for the next successful open.
///
/// Replayed in FIFO order. The buffer is bounded; once full, new frames
/// are rejected so the frames already queued keep their order.
pub struct OutboundBuffer {
    queue: VecDeque<QueuedFrame>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    kind: MessageKind,
    text: String,
}

impl OutboundBuffer {
    /// Create a new buffer with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded frame for later replay.
    pub fn enqueue(&mut self, kind: MessageKind, text: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Buffer full
        }
        self.queue.push_back(QueuedFrame { kind, text });
        true
    }

    /// Drain all queued frames, oldest first.
    pub fn drain(&mut self) -> Vec<(MessageKind, String)> {
        self.queue.drain(..).map(|f| (f.kind, f.text)).collect()
    }

    /// Put frames back at the front, preserving their order.
    ///
    /// Used when a flush could not hand frames to the transport.
    pub fn requeue_front(&mut self, frames: Vec<(MessageKind, String)>) {
        for (kind, text) in frames.into_iter().rev() {
            self.queue.push_front(QueuedFrame { kind, text });
        }
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}
