// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thread-safe batching of encoded messages.
//!
//! Messages accumulate until either:
//! - The batch holds `max_count` messages (count-based drain)
//! - The batch holds `max_bytes` bytes or more (size-based drain)
//! - An explicit flush request (`None`) arrives (timer or shutdown)
//!
//! A drained batch is moved out to the caller; delivery never runs while
//! the batcher lock is held.

use crossbeam::channel::{SendError, Sender};
use parking_lot::RwLock;
use std::fmt;

/// One encoded record, as it will be sent to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: String,
}

impl Message {
    /// Wrap an encoded payload.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Borrow the encoded payload.
    pub fn as_str(&self) -> &str {
        &self.payload
    }

    /// Take the encoded payload.
    pub fn into_string(self) -> String {
        self.payload
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload)
    }
}

impl From<String> for Message {
    fn from(payload: String) -> Self {
        Self::new(payload)
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Self::new(payload)
    }
}

/// Ordered group of messages for one delivery attempt.
///
/// `size_bytes` always equals the sum of the message lengths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    messages: Vec<Message>,
    size_bytes: usize,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, message: Message) {
        self.size_bytes += message.len();
        self.messages.push(message);
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the batch holds no messages and no bytes.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.size_bytes == 0
    }

    /// Total payload bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Messages in enqueue order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Iterate over messages in enqueue order.
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Consume the batch, returning its messages.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl FromIterator<Message> for Batch {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        let mut batch = Batch::new();
        for message in iter {
            batch.push(message);
        }
        batch
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

/// Accumulates messages and decides when the current batch must be drained.
pub struct Batcher {
    current: RwLock<Batch>,
    max_count: usize,
    max_bytes: usize,
}

impl Batcher {
    /// Create a new batcher.
    ///
    /// # Arguments
    /// - `max_count` - Message count at which the batch is drained
    /// - `max_bytes` - Accumulated payload size at which the batch is drained
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            current: RwLock::new(Batch::new()),
            max_count,
            max_bytes,
        }
    }

    /// Add a message, or request a flush with `None`.
    ///
    /// Returns `Some(batch)` when the batch was drained: on a flush request
    /// (even if nothing was buffered), or when either threshold is reached.
    /// Returns `None` if there is still room.
    pub fn enqueue(&self, message: Option<Message>) -> Option<Batch> {
        let mut current = self.current.write();

        let flush_requested = match message {
            Some(message) => {
                current.push(message);
                false
            }
            None => true,
        };

        let count_met = current.len() >= self.max_count;
        let bytes_met = current.size_bytes() >= self.max_bytes;

        if flush_requested || count_met || bytes_met {
            Some(std::mem::take(&mut *current))
        } else {
            None
        }
    }

    /// Like [`enqueue`](Self::enqueue), but hands a drained batch to `sink`.
    ///
    /// Returns `Ok(true)` if a batch was forwarded. If the receiving side is
    /// gone the drained batch comes back inside the error.
    pub fn enqueue_and_forward(
        &self,
        message: Option<Message>,
        sink: &Sender<Batch>,
    ) -> Result<bool, SendError<Batch>> {
        match self.enqueue(message) {
            Some(batch) => sink.send(batch).map(|()| true),
            None => Ok(false),
        }
    }

    /// Discard everything buffered.
    pub fn clear(&self) {
        *self.current.write() = Batch::new();
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    /// Buffered payload bytes.
    pub fn size_bytes(&self) -> usize {
        self.current.read().size_bytes()
    }

    /// Count threshold.
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Byte threshold.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

impl fmt::Debug for Batcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current.read();
        f.debug_struct("Batcher")
            .field("len", &current.len())
            .field("size_bytes", &current.size_bytes())
            .field("max_count", &self.max_count)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}
