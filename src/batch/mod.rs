//! Outbound message batching.
//!
//! High-volume stream types (terminal output, trace events) are coalesced
//! into batch envelopes per connection. The batcher itself is synchronous
//! state owned by a connection's writer task; the task supplies the timer
//! (flush after `batch_interval_ms` even when the caps are not met) and
//! writes whatever frames `push`/`flush` hand back, in order.
//!
//! Anything outside the batchable set flushes the pending buffer first and
//! then goes out singly, so per-connection ordering survives batching.

use std::sync::Arc;

use crate::config::BatchConfig;
use crate::protocol::{encode_batch, MessageType};

pub struct Batcher {
    config: BatchConfig,
    buf: Vec<Arc<str>>,
    buf_bytes: usize,
}

impl Batcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            buf: Vec::new(),
            buf_bytes: 0,
        }
    }

    /// Offer one outbound message. Returns the frames that must be written
    /// to the socket now, in order; an empty vec means the message was
    /// buffered.
    pub fn push(&mut self, kind: MessageType, json: Arc<str>) -> Vec<String> {
        if kind.is_batchable() {
            self.buf_bytes += json.len();
            self.buf.push(json);
            if self.buf.len() >= self.config.max_batch_size
                || self.buf_bytes >= self.config.max_batch_bytes
            {
                return self.flush().into_iter().collect();
            }
            return Vec::new();
        }

        // Priority / control message: drain the buffer first so it cannot
        // overtake stream messages queued before it.
        let mut frames = Vec::with_capacity(2);
        if let Some(batch) = self.flush() {
            frames.push(batch);
        }
        frames.push(json.to_string());
        frames
    }

    /// Flush the pending buffer. A single buffered message goes out bare;
    /// two or more become a batch envelope.
    pub fn flush(&mut self) -> Option<String> {
        let frame = match self.buf.len() {
            0 => None,
            1 => Some(self.buf[0].to_string()),
            _ => Some(encode_batch(&self.buf)),
        };
        self.buf.clear();
        self.buf_bytes = 0;
        frame
    }

    /// `true` when a timer flush is worth scheduling.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.batch_interval_ms)
    }
}
